//! Loopback metrics client.
//!
//! Registers instantly and reports one successful scrape shortly after
//! construction. This stands in for a real remote-registration client in
//! local runs; the harness only cares about the readiness semantics of the
//! `MetricsClient` trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use swarmlog_api::{MetricsClient, MetricsConfig, MetricsError};

/// Delay before the loopback scrape is reported.
const LOOPBACK_SCRAPE_DELAY: Duration = Duration::from_millis(25);

/// Always-successful in-process metrics client.
pub struct LoopbackMetricsClient {
    alias: String,
    served: watch::Receiver<bool>,
    closed: AtomicBool,
}

impl LoopbackMetricsClient {
    /// Register the client. The first scrape is reported after a short
    /// delay so gating on it is actually exercised.
    pub fn new(config: MetricsConfig) -> Self {
        let (tx, served) = watch::channel(false);
        debug!(
            alias = %config.alias,
            service = %config.service_name,
            scraper = %config.scraper.fmt_short(),
            "registering metrics client (loopback)"
        );
        tokio::spawn(async move {
            tokio::time::sleep(LOOPBACK_SCRAPE_DELAY).await;
            let _ = tx.send(true);
        });
        Self { alias: config.alias, served, closed: AtomicBool::new(false) }
    }
}

#[async_trait]
impl MetricsClient for LoopbackMetricsClient {
    async fn ready(&self) -> Result<(), MetricsError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MetricsError::Closed);
        }
        Ok(())
    }

    async fn served(&self) -> Result<(), MetricsError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MetricsError::Closed);
        }
        let mut served = self.served.clone();
        loop {
            if *served.borrow_and_update() {
                return Ok(());
            }
            if served.changed().await.is_err() {
                return Err(MetricsError::Closed);
            }
        }
    }

    async fn close(&self) -> Result<(), MetricsError> {
        self.closed.store(true, Ordering::Release);
        debug!(alias = %self.alias, "metrics client closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use swarmlog_api::{PublicKey, SecretKey};

    use super::*;

    fn config() -> MetricsConfig {
        MetricsConfig {
            service_name: "swarmlog-e2e-tests".to_string(),
            alias: "test-alias".to_string(),
            secret: SecretKey::from_bytes([1u8; 32]),
            scraper: PublicKey::from_bytes([2u8; 32]),
        }
    }

    #[tokio::test]
    async fn ready_then_served_resolves() {
        let client = LoopbackMetricsClient::new(config());
        client.ready().await.unwrap();
        client.served().await.unwrap();
    }

    #[tokio::test]
    async fn closed_client_errors() {
        let client = LoopbackMetricsClient::new(config());
        client.close().await.unwrap();
        assert!(client.ready().await.is_err());
    }
}
