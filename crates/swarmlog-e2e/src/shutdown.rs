//! Deterministic, failure-tolerant teardown.
//!
//! Roles register each resource as they acquire it; the coordinator runs
//! the release actions exactly once, in reverse registration order, so
//! registering in acquisition order yields dependency-respecting teardown
//! (metrics client, then swarm, then store, then ephemeral storage). A
//! failing step is logged and captured but never stops the steps after it.
//!
//! Registration happens before any blocking operation, so a termination
//! signal during setup still releases whatever subset of resources exists
//! by then.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::HarnessError;
use crate::state::{HarnessState, Phase};

type StepAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), HarnessError>> + Send>;

struct Step {
    name: &'static str,
    action: StepAction,
}

/// One failed teardown step, kept for diagnostics.
#[derive(Debug)]
pub struct StepFailure {
    /// The step that failed.
    pub step: &'static str,
    /// What went wrong.
    pub error: HarnessError,
}

/// Coordinates the release of every resource a role acquired.
pub struct ShutdownCoordinator {
    steps: Mutex<Vec<Step>>,
    ran: AtomicBool,
    cancel: CancellationToken,
    state: Arc<HarnessState>,
}

impl ShutdownCoordinator {
    /// Coordinator triggered through `cancel`.
    pub fn new(state: Arc<HarnessState>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(Vec::new()),
            ran: AtomicBool::new(false),
            cancel,
            state,
        })
    }

    /// The token that observes (and triggers) termination.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request termination. Idempotent.
    pub fn trigger(&self) {
        self.cancel.cancel();
    }

    /// Register a release action. Steps run in reverse registration
    /// order, so register resources in acquisition order.
    pub fn register<F, Fut>(&self, name: &'static str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HarnessError>> + Send + 'static,
    {
        let step = Step { name, action: Box::new(move || Box::pin(action())) };
        match self.steps.lock() {
            Ok(mut steps) => steps.push(step),
            Err(poisoned) => poisoned.into_inner().push(step),
        }
    }

    /// Trigger termination on SIGINT/SIGTERM.
    pub fn spawn_signal_listener(&self) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if wait_for_signal(&cancel).await {
                info!("termination signal received");
                cancel.cancel();
            }
        })
    }

    /// Trigger termination once the absolute process deadline passes.
    pub fn spawn_deadline(&self, deadline: Duration) -> JoinHandle<()> {
        info!(seconds = deadline.as_secs(), "process will shut down after deadline");
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    info!("process timeout limit reached");
                    cancel.cancel();
                }
            }
        })
    }

    /// Run every registered step. Only the first call does anything; the
    /// collected failures are returned for diagnostics.
    pub async fn run(&self) -> Vec<StepFailure> {
        if self.ran.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        self.state.advance(Phase::ShuttingDown);
        info!("shutting down");

        let steps: Vec<Step> = {
            match self.steps.lock() {
                Ok(mut steps) => std::mem::take(&mut *steps),
                Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
            }
        };

        let mut failures = Vec::new();
        for step in steps.into_iter().rev() {
            match (step.action)().await {
                Ok(()) => info!(step = step.name, "shut down"),
                Err(error) => {
                    error!(step = step.name, %error, "error while shutting down step");
                    failures.push(StepFailure { step: step.name, error });
                }
            }
        }

        self.state.advance(Phase::Terminated);
        if failures.is_empty() {
            info!("successfully shut down");
        } else {
            warn!(failed_steps = failures.len(), "shut down with step failures");
        }
        failures
    }
}

#[cfg(unix)]
async fn wait_for_signal(cancel: &CancellationToken) -> bool {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(error) => {
            warn!(%error, "failed to install SIGTERM handler");
            return false;
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::signal::ctrl_c() => true,
        _ = terminate.recv() => true,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::signal::ctrl_c() => true,
    }
}

#[cfg(test)]
mod tests {
    use swarmlog_api::LogError;

    use super::*;

    fn coordinator() -> Arc<ShutdownCoordinator> {
        ShutdownCoordinator::new(Arc::new(HarnessState::new()), CancellationToken::new())
    }

    #[tokio::test]
    async fn steps_run_in_reverse_registration_order() {
        let shutdown = coordinator();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["store", "swarm", "metrics client"] {
            let order = Arc::clone(&order);
            shutdown.register(name, move || async move {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }
        let failures = shutdown.run().await;
        assert!(failures.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["metrics client", "swarm", "store"]);
    }

    #[tokio::test]
    async fn failing_step_does_not_stop_later_steps() {
        let shutdown = coordinator();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = Arc::clone(&order);
            shutdown.register("ephemeral store dir", move || async move {
                order.lock().unwrap().push("ephemeral store dir");
                Ok(())
            });
        }
        {
            let order = Arc::clone(&order);
            shutdown.register("store", move || async move {
                order.lock().unwrap().push("store");
                Ok(())
            });
        }
        {
            let order = Arc::clone(&order);
            shutdown.register("swarm", move || async move {
                order.lock().unwrap().push("swarm");
                Err(HarnessError::Log(LogError::Storage("boom".into())))
            });
        }

        let failures = shutdown.run().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].step, "swarm");
        assert_eq!(
            *order.lock().unwrap(),
            vec!["swarm", "store", "ephemeral store dir"]
        );
    }

    #[tokio::test]
    async fn teardown_runs_exactly_once() {
        let shutdown = coordinator();
        let runs = Arc::new(Mutex::new(0u32));
        {
            let runs = Arc::clone(&runs);
            shutdown.register("store", move || async move {
                *runs.lock().unwrap() += 1;
                Ok(())
            });
        }
        shutdown.run().await;
        shutdown.run().await;
        assert_eq!(*runs.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn run_covers_only_resources_registered_so_far() {
        let shutdown = coordinator();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = Arc::clone(&order);
            shutdown.register("store", move || async move {
                order.lock().unwrap().push("store");
                Ok(())
            });
        }
        shutdown.run().await;
        assert_eq!(*order.lock().unwrap(), vec!["store"]);
        // Late registration after teardown never runs.
        shutdown.register("swarm", move || async move { Ok(()) });
        shutdown.run().await;
        assert_eq!(*order.lock().unwrap(), vec!["store"]);
    }

    #[tokio::test]
    async fn phases_end_terminated() {
        let state = Arc::new(HarnessState::new());
        let shutdown = ShutdownCoordinator::new(Arc::clone(&state), CancellationToken::new());
        shutdown.run().await;
        assert_eq!(state.phase(), Phase::Terminated);
    }
}
