//! Bounded-time liveness polling shared by worker start-up and health sweeps.

use std::{net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{net::TcpStream, time::sleep};
use tracing::debug;

/// One liveness attempt against a worker port.
#[async_trait]
pub trait LivenessCheck: Send + Sync {
    async fn is_live(&self, port: u16) -> bool;
}

/// Live when a TCP connection to the port succeeds.
#[derive(Debug, Clone)]
pub struct TcpLiveness {
    host: IpAddr,
}

impl TcpLiveness {
    pub fn new(host: IpAddr) -> Self {
        Self { host }
    }
}

#[async_trait]
impl LivenessCheck for TcpLiveness {
    async fn is_live(&self, port: u16) -> bool {
        TcpStream::connect((self.host, port)).await.is_ok()
    }
}

/// Live when `GET http://host:port<path>` returns a 2xx.
#[derive(Debug, Clone)]
pub struct HttpLiveness {
    client: reqwest::Client,
    host: IpAddr,
    path: String,
}

impl HttpLiveness {
    pub fn new(host: IpAddr, path: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            host,
            path: path.into(),
        })
    }
}

#[async_trait]
impl LivenessCheck for HttpLiveness {
    async fn is_live(&self, port: u16) -> bool {
        let url = format!("http://{}:{port}{}", self.host, self.path);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(%url, "liveness request failed: {e}");
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Delay between attempts.
    pub interval: Duration,
    /// Budget for a freshly spawned worker to come up.
    pub startup_timeout: Duration,
    /// Budget for a running worker during a health sweep.
    pub sweep_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            startup_timeout: Duration::from_secs(15),
            sweep_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct ReadinessProbe {
    config: ProbeConfig,
    check: Arc<dyn LivenessCheck>,
}

impl ReadinessProbe {
    pub fn new(config: ProbeConfig, check: Arc<dyn LivenessCheck>) -> Self {
        Self { config, check }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Poll until the worker answers or the start-up budget is spent.
    pub async fn wait_until_ready(&self, port: u16) -> bool {
        self.poll(port, self.config.startup_timeout).await
    }

    /// Poll with the shorter health-sweep budget.
    pub async fn check_health(&self, port: u16) -> bool {
        self.poll(port, self.config.sweep_timeout).await
    }

    /// A single attempt with no retry.
    pub async fn check_once(&self, port: u16) -> bool {
        self.check.is_live(port).await
    }

    async fn poll(&self, port: u16, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let attempt = tokio::time::timeout_at(deadline, self.check.is_live(port)).await;
            if matches!(attempt, Ok(true)) {
                return true;
            }
            if tokio::time::Instant::now() + self.config.interval >= deadline {
                return false;
            }
            sleep(self.config.interval).await;
        }
    }
}
