//! The reconcile loop
//!
//! One loop owns everything stateful: it polls the registry, diffs the
//! snapshot against the last committed state, applies the plan, and commits
//! the snapshot wholesale. Ticks never overlap, and the committed state is
//! swapped between ticks rather than mutated, so a crash mid-tick can never
//! leave it half-updated.
//!
//! Failure contract: registry errors skip the tick and leave the committed
//! state untouched (a registry outage degrades to "stop updating", never to
//! "wipe deployments"); apply and remove failures are logged per model and
//! stop neither the other models nor the tick. Nothing in the polling path
//! can end the loop; only cancellation does, and cancellation always drains:
//! every identity still committed gets one removal attempt before `run`
//! returns.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deploy::DeploymentBackend;
use crate::diff::{diff, Plan};
use crate::registry::{DeploymentId, DesiredDeployment, SnapshotReader};

/// Consecutive all-failed ticks before the backend is called out as down
const BACKEND_UNAVAILABLE_STREAK: u32 = 3;

/// Upper bound on how long the drain waits for removals to finish
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Mapping from identity to the last committed desired deployment
///
/// Held only in memory for the lifetime of one loop run and rebuilt from the
/// registry on restart.
pub type ReconciliationState = BTreeMap<DeploymentId, DesiredDeployment>;

/// Outcome of one tick
#[derive(Debug, PartialEq, Eq)]
enum Tick {
    /// The snapshot was applied and committed
    Completed,
    /// The registry failed; previous state stands
    Skipped,
    /// Cancellation observed; the loop must drain and stop
    Cancelled,
}

/// Counts of backend calls attempted and failed within one tick
#[derive(Debug, Default, Clone, Copy)]
struct TickStats {
    attempted: usize,
    failed: usize,
}

/// Drives the poll/diff/apply/commit cycle until cancelled
pub struct Reconciler {
    reader: Arc<dyn SnapshotReader>,
    backend: Arc<dyn DeploymentBackend>,
    interval: Duration,
    state: ReconciliationState,
    publisher: watch::Sender<Arc<ReconciliationState>>,
    failed_ticks: u32,
}

impl Reconciler {
    /// Create a loop over the given reader and backend
    ///
    /// Every committed state is also published on `publisher`, giving
    /// concurrent readers (the status surface) a consistent snapshot
    /// without locking.
    pub fn new(
        reader: Arc<dyn SnapshotReader>,
        backend: Arc<dyn DeploymentBackend>,
        interval: Duration,
        publisher: watch::Sender<Arc<ReconciliationState>>,
    ) -> Self {
        Self {
            reader,
            backend,
            interval,
            state: ReconciliationState::new(),
            publisher,
            failed_ticks: 0,
        }
    }

    /// Run ticks until `cancel` fires, then drain and return
    ///
    /// Cancellation is observed during the poll, during the apply phase and
    /// during the inter-tick sleep, so draining starts promptly wherever the
    /// loop happens to be suspended. The drain removes every deployment in
    /// the committed state, regardless of individual removal failures.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "reconcile loop started");

        loop {
            match self.tick(&cancel).await {
                Tick::Cancelled => break,
                Tick::Completed | Tick::Skipped => {
                    if !self.idle(&cancel).await {
                        break;
                    }
                }
            }
        }

        self.drain().await;
        info!("reconcile loop stopped");
    }

    /// One poll/diff/apply/commit cycle
    ///
    /// Both awaits poll cancellation first, so a termination request wins
    /// over work that happens to be ready at the same moment.
    async fn tick(&mut self, cancel: &CancellationToken) -> Tick {
        let snapshot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Tick::Cancelled,
            result = self.reader.read() => match result {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    warn!(%error, "registry poll failed; keeping previous state");
                    return Tick::Skipped;
                }
            },
        };

        let plan = diff(&self.state, &snapshot);
        if plan.is_empty() {
            debug!(tracked = self.state.len(), "registry unchanged");
        } else {
            info!(
                apply = plan.to_apply.len(),
                remove = plan.to_remove.len(),
                "applying registry changes"
            );
        }

        let stats = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("cancelled mid-tick; abandoning uncommitted work");
                return Tick::Cancelled;
            }
            stats = self.apply_plan(&plan) => stats,
        };

        self.commit(snapshot);
        self.note_backend_health(stats);
        Tick::Completed
    }

    /// Execute the plan, applies and removes running concurrently
    ///
    /// All calls for one tick complete before the state is committed.
    /// Failures are logged with the deployment identity and counted, never
    /// propagated.
    async fn apply_plan(&self, plan: &Plan) -> TickStats {
        let applies = plan.to_apply.iter().map(|desired| {
            let backend = Arc::clone(&self.backend);
            async move {
                match backend.apply(desired).await {
                    Ok(()) => {
                        info!(deployment = %desired.id, version = %desired.version, "deployment applied");
                        true
                    }
                    Err(error) => {
                        warn!(deployment = %desired.id, version = %desired.version, %error,
                            "apply failed; version stays recorded until the registry moves again");
                        false
                    }
                }
            }
        });

        let removes = plan.to_remove.iter().map(|id| {
            let backend = Arc::clone(&self.backend);
            // Removals only target identities from the committed state
            let namespace = self
                .state
                .get(id)
                .map(|d| d.namespace.clone())
                .unwrap_or_default();
            async move {
                match backend.remove(id, &namespace).await {
                    Ok(()) => {
                        info!(deployment = %id, "deployment removed");
                        true
                    }
                    Err(error) => {
                        warn!(deployment = %id, %error,
                            "remove failed; dropping from tracking, the deployment may linger");
                        false
                    }
                }
            }
        });

        let (apply_results, remove_results) = tokio::join!(join_all(applies), join_all(removes));

        let attempted = apply_results.len() + remove_results.len();
        let failed = apply_results
            .iter()
            .chain(remove_results.iter())
            .filter(|ok| !**ok)
            .count();
        TickStats { attempted, failed }
    }

    /// Replace the committed state wholesale and publish it
    ///
    /// Entries whose apply failed are committed at their new version anyway,
    /// and identities whose remove failed are dropped. Both choices bound
    /// retries to one attempt per registry change instead of one per tick.
    fn commit(&mut self, snapshot: Vec<DesiredDeployment>) {
        self.state = snapshot.into_iter().map(|d| (d.id.clone(), d)).collect();
        self.publisher.send_replace(Arc::new(self.state.clone()));
    }

    /// Track consecutive ticks in which every backend call failed
    fn note_backend_health(&mut self, stats: TickStats) {
        if stats.attempted == 0 {
            return;
        }
        if stats.failed == stats.attempted {
            self.failed_ticks = self.failed_ticks.saturating_add(1);
            if self.failed_ticks >= BACKEND_UNAVAILABLE_STREAK {
                warn!(
                    consecutive_ticks = self.failed_ticks,
                    "every apply and remove failed; deployment backend appears unavailable"
                );
            }
        } else {
            self.failed_ticks = 0;
        }
    }

    /// Sleep the inter-tick delay; false when cancellation ended the wait
    async fn idle(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.interval) => true,
        }
    }

    /// Tear down every deployment still committed
    ///
    /// Every identity gets one removal attempt; failures are logged and do
    /// not stop the others. The whole drain is bounded by [`DRAIN_GRACE`] so
    /// a hung backend cannot hold the process open indefinitely.
    async fn drain(&mut self) {
        if self.state.is_empty() {
            debug!("nothing tracked, drain is a no-op");
            return;
        }

        info!(count = self.state.len(), "draining tracked deployments");
        let state = std::mem::take(&mut self.state);

        let removals = state.values().map(|desired| {
            let backend = Arc::clone(&self.backend);
            async move {
                if let Err(error) = backend.remove(&desired.id, &desired.namespace).await {
                    warn!(deployment = %desired.id, %error,
                        "drain removal failed; the deployment may be left behind");
                }
            }
        });
        if tokio::time::timeout(DRAIN_GRACE, join_all(removals))
            .await
            .is_err()
        {
            warn!("drain grace period elapsed; remaining deployments may be left behind");
        }

        self.publisher.send_replace(Arc::new(ReconciliationState::new()));
        info!("drain complete");
    }
}
