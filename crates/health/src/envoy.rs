//! Envoy sub-machine and the `/ready` check that feeds it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

pub const DEFAULT_READY_PORT: u16 = 8002;
pub const READY_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// `AMBASSADOR_READY_PORT` if it parses to 1..=32767, else 8002.
pub fn ready_port() -> u16 { parse_ready_port(std::env::var("AMBASSADOR_READY_PORT").ok().as_deref()) }

pub fn parse_ready_port(raw: Option<&str>) -> u16 {
    raw.and_then(|s| s.trim().parse::<u16>().ok())
        .filter(|p| (1..=32767).contains(p))
        .unwrap_or(DEFAULT_READY_PORT)
}

/// Asks envoy whether it is ready.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnvoyProbe: Send + Sync {
    async fn ready(&self) -> bool;
}

/// GET `http://localhost:<port>/ready`; 200 is ready, anything else is not.
#[derive(Debug, Clone)]
pub struct HttpEnvoyProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpEnvoyProbe {
    pub fn new(port: u16) -> Self { Self::with_url(format!("http://localhost:{}/ready", port)) }

    pub fn from_env() -> Self { Self::new(ready_port()) }

    pub fn with_url(url: String) -> Self {
        let client = reqwest::Client::builder().timeout(READY_CHECK_TIMEOUT).build().unwrap_or_default();
        Self { client, url }
    }

    pub fn url(&self) -> &str { &self.url }
}

#[async_trait]
impl EnvoyProbe for HttpEnvoyProbe {
    async fn ready(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(url = %self.url, error = %e, "health: envoy ready check failed");
                false
            }
        }
    }
}

/// Alive and ready both mean "the last check succeeded".
#[derive(Debug, Default)]
pub struct EnvoyMachine {
    ready: AtomicBool,
}

impl EnvoyMachine {
    pub fn set_ready(&self, ready: bool) { self.ready.store(ready, Ordering::Release); }

    pub fn is_alive(&self) -> bool { self.is_ready() }

    pub fn is_ready(&self) -> bool { self.ready.load(Ordering::Acquire) }
}
