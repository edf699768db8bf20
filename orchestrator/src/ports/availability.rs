use std::net::IpAddr;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::debug;

/// Ground-truth answer to "could a worker bind this port right now?".
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_available(&self, port: u16) -> bool;
}

/// Attempts a real bind on `host:port` and drops the listener immediately.
#[derive(Debug, Clone)]
pub struct TcpBindProbe {
    host: IpAddr,
}

impl TcpBindProbe {
    pub fn new(host: IpAddr) -> Self {
        Self { host }
    }
}

impl Default for TcpBindProbe {
    fn default() -> Self {
        Self::new(IpAddr::from([127, 0, 0, 1]))
    }
}

#[async_trait]
impl PortProbe for TcpBindProbe {
    async fn is_available(&self, port: u16) -> bool {
        match TcpListener::bind((self.host, port)).await {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(e) => {
                debug!(port, "port bind check failed: {e}");
                false
            }
        }
    }
}
