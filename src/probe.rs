//! Connectivity probe.
//!
//! Answers "is the remote reachable right now?" without ever failing. The
//! façade asks before every operation; nothing is cached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tracing::debug;

use crate::config::{ProbeConfig, RemoteConfig};

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// GETs a liveness endpoint with a short timeout.
pub struct HttpProbe {
    http: Option<HttpClient>,
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(remote: &RemoteConfig, probe: &ProbeConfig) -> Self {
        let timeout = Duration::from_millis(probe.timeout_ms);
        let http = HttpClient::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| debug!("probe client unavailable: {}", e))
            .ok();

        Self {
            http,
            url: format!(
                "{}/{}",
                remote.base_url.trim_end_matches('/'),
                probe.health_path.trim_start_matches('/')
            ),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn is_online(&self) -> bool {
        let Some(http) = &self.http else {
            return false;
        };

        // The client timeout covers the request; this also bounds DNS stalls
        match tokio::time::timeout(self.timeout, http.get(&self.url).send()).await {
            Ok(Ok(resp)) if resp.status().is_success() => true,
            Ok(Ok(resp)) => {
                debug!("probe {} answered {}", self.url, resp.status());
                false
            }
            Ok(Err(e)) => {
                debug!("probe {} failed: {}", self.url, e);
                false
            }
            Err(_) => {
                debug!("probe {} timed out after {:?}", self.url, self.timeout);
                false
            }
        }
    }
}

/// Probe with a fixed answer, switchable at runtime. Used for `--offline`.
#[derive(Debug)]
pub struct FixedProbe {
    online: AtomicBool,
}

impl FixedProbe {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for FixedProbe {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
