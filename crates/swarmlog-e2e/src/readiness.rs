//! Workload start gating.
//!
//! When monitoring is configured, the timed workload must not start until
//! the scraper has actually observed this process once, so experiment
//! numbers are never skewed by unobserved startup work. A client can be
//! registered without ever having been scraped, which is why the gate
//! waits for both signals. Without monitoring the gate is a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use swarmlog_api::{MetricsClient, MetricsError};

/// Capability deciding when the substantive workload may begin.
///
/// Selected once at construction, so role drivers never branch on whether
/// monitoring is present.
#[async_trait]
pub trait Readiness: Send + Sync {
    /// Resolves once the workload may begin.
    async fn wait_observed(&self) -> Result<(), MetricsError>;
}

/// Gate used when no monitoring is configured: never delays the workload.
pub struct NoopReadiness;

#[async_trait]
impl Readiness for NoopReadiness {
    async fn wait_observed(&self) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// Gate deferring the workload until the metrics client is registered and
/// has served metrics at least once, in either arrival order.
pub struct MetricsReadiness {
    client: Arc<dyn MetricsClient>,
}

impl MetricsReadiness {
    /// Gate on `client`.
    pub fn new(client: Arc<dyn MetricsClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Readiness for MetricsReadiness {
    async fn wait_observed(&self) -> Result<(), MetricsError> {
        tokio::try_join!(self.client.ready(), self.client.served())?;
        info!("instrumentation ready");
        Ok(())
    }
}

/// Pick the gate matching the configured monitoring mode.
pub fn readiness_for(metrics: Option<&Arc<dyn MetricsClient>>) -> Arc<dyn Readiness> {
    match metrics {
        Some(client) => Arc::new(MetricsReadiness::new(Arc::clone(client))),
        None => Arc::new(NoopReadiness),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::watch;

    use super::*;

    struct ScriptedMetricsClient {
        ready: watch::Receiver<bool>,
        served: watch::Receiver<bool>,
    }

    struct Script {
        ready: watch::Sender<bool>,
        served: watch::Sender<bool>,
    }

    fn scripted() -> (Script, Arc<dyn MetricsClient>) {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (served_tx, served_rx) = watch::channel(false);
        (
            Script { ready: ready_tx, served: served_tx },
            Arc::new(ScriptedMetricsClient { ready: ready_rx, served: served_rx }),
        )
    }

    async fn wait_true(rx: &watch::Receiver<bool>) -> Result<(), MetricsError> {
        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(MetricsError::Closed);
            }
        }
    }

    #[async_trait]
    impl MetricsClient for ScriptedMetricsClient {
        async fn ready(&self) -> Result<(), MetricsError> {
            wait_true(&self.ready).await
        }

        async fn served(&self) -> Result<(), MetricsError> {
            wait_true(&self.served).await
        }

        async fn close(&self) -> Result<(), MetricsError> {
            Ok(())
        }
    }

    async fn assert_pending(handle: &tokio::task::JoinHandle<Result<(), MetricsError>>) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished(), "gate resolved before both signals fired");
    }

    #[tokio::test]
    async fn gate_waits_for_ready_then_served() {
        let (script, client) = scripted();
        let gate = MetricsReadiness::new(client);
        let handle = tokio::spawn(async move { gate.wait_observed().await });

        assert_pending(&handle).await;
        script.ready.send(true).unwrap();
        assert_pending(&handle).await;
        script.served.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn gate_waits_for_served_then_ready() {
        let (script, client) = scripted();
        let gate = MetricsReadiness::new(client);
        let handle = tokio::spawn(async move { gate.wait_observed().await });

        assert_pending(&handle).await;
        script.served.send(true).unwrap();
        assert_pending(&handle).await;
        script.ready.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn gate_propagates_client_failure() {
        let (script, client) = scripted();
        let gate = MetricsReadiness::new(client);
        drop(script.served);
        script.ready.send(true).unwrap();
        assert!(gate.wait_observed().await.is_err());
    }

    #[tokio::test]
    async fn noop_gate_resolves_immediately() {
        NoopReadiness.wait_observed().await.unwrap();
    }

    #[tokio::test]
    async fn selection_follows_configuration() {
        let (_script, client) = scripted();
        let _metrics_gate = readiness_for(Some(&client));
        let _noop_gate = readiness_for(None);
    }
}
