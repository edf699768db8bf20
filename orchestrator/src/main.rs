use std::sync::Arc;

use orchestrator::{
    api,
    config::{Config, ProbeKind},
    ports::{PortAllocator, TcpBindProbe},
    readiness::{HttpLiveness, LivenessCheck, ReadinessProbe, TcpLiveness},
    workers::{WorkerPlatform, WorkerSupervisor},
    AppState,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orchestrator=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        port = config.port,
        worker_ports = %format!("{}-{}", config.worker_port_start, config.worker_port_end),
        worker_binary = %config.worker_binary,
        "orchestrator starting"
    );

    // Port allocator: preferred ports are reloaded from disk.
    let allocator = PortAllocator::open(
        config.allocator(),
        Arc::new(TcpBindProbe::new(config.worker_host)),
    )
    .await?;

    let liveness: Arc<dyn LivenessCheck> = match &config.health_probe {
        ProbeKind::Http { path } => Arc::new(HttpLiveness::new(
            config.worker_host,
            path.clone(),
            config.health_probe_timeout,
        )?),
        ProbeKind::Tcp => Arc::new(TcpLiveness::new(config.worker_host)),
    };
    let probe = ReadinessProbe::new(config.probe(), liveness);

    let supervisor = WorkerSupervisor::new(
        config.supervisor(),
        Arc::clone(&allocator),
        probe,
        WorkerPlatform::system(),
    );

    // Workers left running by a previous orchestrator hold ports we know nothing about.
    supervisor.cleanup_orphans().await;

    // Spawn health monitor + stale port sweeper
    tokio::spawn(Arc::clone(&supervisor).run_health_monitor(config.health_sweep_interval));
    tokio::spawn(Arc::clone(&allocator).run_stale_sweeper(config.stale_sweep_interval));

    let state = Arc::new(AppState {
        allocator,
        supervisor: Arc::clone(&supervisor),
    });
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, stopping all workers");
    supervisor.stop_all().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
