//! Minimal journey step worker.
//!
//! Launched by the orchestrator with its port and identity in the environment.
//! Answers `GET /health` for readiness probes and echoes `POST /step` bodies
//! back tagged with the worker identity.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone)]
struct WorkerInfo {
    identity: String,
    instance_id: String,
    task: String,
    tenant_id: String,
    domain: Option<String>,
    category: Option<String>,
    started_at: DateTime<Utc>,
}

impl WorkerInfo {
    fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            identity: var("WORKER_IDENTITY").unwrap_or_else(|| "UnnamedService@default".into()),
            instance_id: var("WORKER_INSTANCE_ID").unwrap_or_default(),
            task: var("WORKER_TASK").unwrap_or_default(),
            tenant_id: var("TENANT_ID").unwrap_or_else(|| "default".into()),
            domain: var("TENANT_DOMAIN"),
            category: var("TENANT_CATEGORY"),
            started_at: Utc::now(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "step_worker=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let port: u16 = std::env::var("PORT")
        .map_err(|_| anyhow::anyhow!("PORT must be set"))?
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid PORT: {e}"))?;
    let host: IpAddr = match std::env::var("WORKER_BIND_HOST") {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid WORKER_BIND_HOST '{raw}': {e}"))?,
        Err(_) => IpAddr::from([127, 0, 0, 1]),
    };

    let info = Arc::new(WorkerInfo::from_env());
    let app = Router::new()
        .route("/health", get(health))
        .route("/step", post(step))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&info));

    let addr = SocketAddr::new(host, port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(identity = %info.identity, tenant_id = %info.tenant_id, %addr, "step worker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(identity = %info.identity, "step worker stopped");
    Ok(())
}

async fn health(State(info): State<Arc<WorkerInfo>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "identity": info.identity,
        "instance_id": info.instance_id,
        "task": info.task,
        "tenant_id": info.tenant_id,
        "domain": info.domain,
        "category": info.category,
        "uptime_secs": (Utc::now() - info.started_at).num_seconds(),
    }))
}

async fn step(
    State(info): State<Arc<WorkerInfo>>,
    Json(payload): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "identity": info.identity,
        "tenant_id": info.tenant_id,
        "echo": payload,
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
