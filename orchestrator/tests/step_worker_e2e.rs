//! End-to-end: the supervisor spawns the real `step-worker` binary, probes it
//! over HTTP and stops it with SIGTERM.

use std::{net::IpAddr, path::PathBuf, sync::Arc, time::Duration};

use orchestrator::{
    ports::{AllocatorConfig, PortAllocator, PortProbe, TcpBindProbe},
    readiness::{HttpLiveness, ProbeConfig, ReadinessProbe},
    workers::{launch::LaunchTemplate, SupervisorConfig, WorkerPlatform, WorkerSupervisor},
};
use shared_types::{StartOutcome, TenantContext};

const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind((LOCALHOST, 0))
        .await
        .expect("Failed to bind ephemeral port");
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_spawn_probe_and_stop_real_worker() {
    let port = free_port().await;
    let probe = Arc::new(TcpBindProbe::new(LOCALHOST));

    let allocator = PortAllocator::open(
        AllocatorConfig {
            range_start: port,
            range_end: port,
            preferences_file: None,
            stale_grace: Duration::from_secs(10),
        },
        probe.clone(),
    )
    .await
    .expect("Failed to open allocator");

    let liveness = HttpLiveness::new(LOCALHOST, "/health", Duration::from_millis(500))
        .expect("Failed to build HTTP client");
    let readiness = ReadinessProbe::new(
        ProbeConfig {
            interval: Duration::from_millis(50),
            startup_timeout: Duration::from_secs(20),
            sweep_timeout: Duration::from_secs(2),
        },
        Arc::new(liveness),
    );

    let supervisor = WorkerSupervisor::new(
        SupervisorConfig {
            launch: LaunchTemplate {
                program: PathBuf::from(env!("CARGO_BIN_EXE_step-worker")),
                ..LaunchTemplate::default()
            },
            stop_grace: Duration::from_secs(5),
            idle_timeout: None,
            metrics_window: 10,
        },
        allocator,
        readiness,
        WorkerPlatform::system(),
    );

    let tenant = TenantContext::new("acme").with_domain("retail");
    let endpoint = supervisor
        .ensure_running("Checkout", &tenant)
        .await
        .expect("worker should start");
    assert_eq!(endpoint.outcome, StartOutcome::Started);
    assert_eq!(endpoint.port, port);

    let client = reqwest::Client::new();
    let health: serde_json::Value = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await
        .expect("health request failed")
        .json()
        .await
        .expect("health body is not JSON");
    assert_eq!(health["identity"], "CheckoutService@acme");
    assert_eq!(health["tenant_id"], "acme");
    assert_eq!(health["domain"], "retail");

    let echo: serde_json::Value = client
        .post(format!("http://127.0.0.1:{port}/step"))
        .json(&serde_json::json!({ "order": 7 }))
        .send()
        .await
        .expect("step request failed")
        .json()
        .await
        .expect("step body is not JSON");
    assert_eq!(echo["echo"]["order"], 7);

    let reused = supervisor.ensure_running("Checkout", &tenant).await.unwrap();
    assert_eq!(reused.outcome, StartOutcome::Reused);

    assert!(supervisor.stop(&endpoint.identity).await);

    let mut freed = false;
    for _ in 0..50 {
        if probe.is_available(port).await {
            freed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(freed, "worker port {port} still bound after stop");
    assert!(supervisor.status().is_empty());
}
