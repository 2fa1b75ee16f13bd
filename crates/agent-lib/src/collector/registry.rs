//! Registry of trackers keyed by container id

use super::{ContainerRuntime, Tracker};
use crate::models::ContainerDescriptor;
use crate::observability::{AgentMetrics, StructuredLogger};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of applying one discovery update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
}

/// Owns one [`Tracker`] per discovered container.
///
/// Trackers are created for new ids and have their descriptor refreshed for
/// known ids. A container missing from a later update keeps its tracker; it
/// simply stops producing data once its streams end. Every tracker task is
/// cancelled when the registry shuts down.
pub struct TrackerRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    trackers: Mutex<HashMap<String, Arc<Tracker>>>,
    since: i64,
    cancel: CancellationToken,
    metrics: AgentMetrics,
    logger: Option<StructuredLogger>,
}

impl TrackerRegistry {
    /// Create a registry whose trackers request logs from now on
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            trackers: Mutex::new(HashMap::new()),
            since: Utc::now().timestamp(),
            cancel: CancellationToken::new(),
            metrics: AgentMetrics::new(),
            logger: None,
        }
    }

    /// Request logs from `since` (unix seconds) instead of the creation time
    pub fn with_since(mut self, since: i64) -> Self {
        self.since = since;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn since(&self) -> i64 {
        self.since
    }

    /// Apply a full discovery update
    pub async fn reconcile(&self, update: Vec<ContainerDescriptor>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let mut trackers = self.trackers.lock().await;

        for container in update {
            if let Some(tracker) = trackers.get(&container.id) {
                tracker.set_container(container).await;
                summary.updated += 1;
                continue;
            }

            if let Some(logger) = &self.logger {
                logger.log_tracker_started(&container.id, container.primary_name());
            }
            let id = container.id.clone();
            let tracker = Tracker::spawn(
                Arc::clone(&self.runtime),
                container,
                self.since,
                self.cancel.child_token(),
                self.metrics.clone(),
            );
            trackers.insert(id, tracker);
            summary.created += 1;
        }

        self.metrics.set_trackers(trackers.len());
        debug!(
            created = summary.created,
            updated = summary.updated,
            total = trackers.len(),
            "Reconciled trackers"
        );
        summary
    }

    /// Lock the tracker map.
    ///
    /// The upload loop holds this for a whole tick so a batch is assembled
    /// from a consistent set of trackers.
    pub async fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Tracker>>> {
        self.trackers.lock().await
    }

    pub async fn get(&self, container_id: &str) -> Option<Arc<Tracker>> {
        self.trackers.lock().await.get(container_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.trackers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.trackers.lock().await.is_empty()
    }

    /// Cancel every tracker's background tasks
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Apply discovery updates until the channel closes or shutdown is
    /// signalled.
    ///
    /// Only a shutdown cancels the trackers. When discovery stops, existing
    /// trackers keep following their containers until their streams end.
    pub async fn run(
        self: Arc<Self>,
        mut updates: mpsc::Receiver<Vec<ContainerDescriptor>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Tracker registry shutting down");
                    self.shutdown();
                    return;
                }
                update = updates.recv() => match update {
                    Some(update) => {
                        self.reconcile(update).await;
                    }
                    None => {
                        let trackers = self.len().await;
                        warn!(
                            trackers = trackers,
                            "Discovery channel closed, keeping existing trackers"
                        );
                        return;
                    }
                },
            }
        }
    }
}
