//! Readiness polling - Waiting for the service's HTTP endpoint to answer

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::SetupError;
use super::provision::ProgressFn;

/// One readiness check against the local service
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// HTTP status code of `GET /`, or a description of why none arrived
    async fn check(&self, port: u16) -> Result<u16, String>;
}

/// [`ReadinessProbe`] issuing real HTTP requests
pub struct HttpProbe {
    client: reqwest::Client,
    host: String,
}

impl HttpProbe {
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        // Each poll opens a fresh connection
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self {
            client,
            host: "localhost".to_string(),
        })
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn check(&self, port: u16) -> Result<u16, String> {
        let url = format!("http://{}:{}/", self.host, port);
        self.client
            .get(&url)
            .send()
            .await
            .map(|response| response.status().as_u16())
            .map_err(|e| e.to_string())
    }
}

pub struct ReadinessPoller {
    probe: Arc<dyn ReadinessProbe>,
}

impl ReadinessPoller {
    pub fn new(probe: Arc<dyn ReadinessProbe>) -> Self {
        Self { probe }
    }

    /// Poll until a 200 arrives; returns the number of polls made.
    ///
    /// The first poll is immediate, then one per `interval`. The whole wait
    /// is bounded by `max_attempts * interval` regardless of how long single
    /// requests take.
    pub async fn wait_until_ready(
        &self,
        port: u16,
        max_attempts: u32,
        interval: Duration,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<u32, SetupError> {
        let max_attempts = max_attempts.max(1);
        let deadline = Instant::now() + interval * max_attempts;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut attempts = 0;
        while attempts < max_attempts {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SetupError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => break,
                _ = ticker.tick() => {}
            }

            attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SetupError::Cancelled),
                outcome = tokio::time::timeout_at(deadline, self.probe.check(port)) => outcome,
            };
            progress(attempts as f64 / max_attempts as f64);

            match outcome {
                Ok(Ok(200)) => {
                    info!("Service on port {} ready after {} poll(s)", port, attempts);
                    return Ok(attempts);
                }
                Ok(Ok(code)) => debug!("Readiness poll {}/{}: HTTP {}", attempts, max_attempts, code),
                Ok(Err(e)) => debug!("Readiness poll {}/{}: {}", attempts, max_attempts, e),
                Err(_) => {
                    debug!("Readiness poll {}/{} hit the overall deadline", attempts, max_attempts);
                    break;
                }
            }
        }

        error!(
            "Service on port {} not ready after {} poll(s)",
            port, attempts
        );
        Err(SetupError::ContainerNotReady { attempts })
    }
}
