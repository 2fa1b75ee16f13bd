//! Per-container tracking state
//!
//! A [`Tracker`] owns the log buffer and the latest stats snapshot of one
//! container. Two background tasks feed it: one follows the container's log
//! stream and normalizes every line, the other keeps the stats snapshot
//! current. The upload loop drains the buffer and reads the snapshot.

use super::normalizer::LogNormalizer;
use super::ContainerRuntime;
use crate::error::RuntimeError;
use crate::models::{labels, ContainerDescriptor, LogRecord, RawStatsSample};
use crate::observability::AgentMetrics;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Tracker {
    id: String,
    container: RwLock<Arc<ContainerDescriptor>>,
    stats: RwLock<Arc<RawStatsSample>>,
    logs: Mutex<Vec<LogRecord>>,
    cancel: CancellationToken,
}

impl Tracker {
    /// Create a tracker and start its log and stats tasks.
    ///
    /// Log lines are requested from `since` (unix seconds). Both tasks stop
    /// when `cancel` (or a parent of it) is cancelled, or when their stream
    /// ends.
    pub fn spawn(
        runtime: Arc<dyn ContainerRuntime>,
        container: ContainerDescriptor,
        since: i64,
        cancel: CancellationToken,
        metrics: AgentMetrics,
    ) -> Arc<Self> {
        let tracker = Arc::new(Self::new(container, cancel));

        tokio::spawn(Arc::clone(&tracker).follow_logs(Arc::clone(&runtime), since, metrics));
        tokio::spawn(Arc::clone(&tracker).follow_stats(runtime));

        tracker
    }

    /// Create a tracker without background tasks
    pub(crate) fn new(container: ContainerDescriptor, cancel: CancellationToken) -> Self {
        Self {
            id: container.id.clone(),
            container: RwLock::new(Arc::new(container)),
            stats: RwLock::new(Arc::default()),
            logs: Mutex::new(Vec::new()),
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current descriptor of the tracked container
    pub async fn container(&self) -> Arc<ContainerDescriptor> {
        Arc::clone(&*self.container.read().await)
    }

    /// Replace the descriptor, e.g. after labels changed
    pub async fn set_container(&self, container: ContainerDescriptor) {
        *self.container.write().await = Arc::new(container);
    }

    /// Take all buffered log records, leaving the buffer empty
    pub async fn drain_logs(&self) -> Vec<LogRecord> {
        std::mem::take(&mut *self.logs.lock().await)
    }

    /// Latest stats sample, zero-valued if none was received
    pub async fn current_stats(&self) -> Arc<RawStatsSample> {
        Arc::clone(&*self.stats.read().await)
    }

    pub(crate) async fn push_log(&self, record: LogRecord) {
        self.logs.lock().await.push(record);
    }

    pub(crate) async fn set_stats(&self, sample: RawStatsSample) {
        *self.stats.write().await = Arc::new(sample);
    }

    /// Stop both background tasks
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn follow_logs(
        self: Arc<Self>,
        runtime: Arc<dyn ContainerRuntime>,
        since: i64,
        metrics: AgentMetrics,
    ) {
        let mut lines = match runtime.logs(&self.id, since).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!(container_id = %self.id, error = %e, "Failed to open log stream");
                return;
            }
        };

        let mut normalizer = LogNormalizer::new();

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(container_id = %self.id, "Log task cancelled");
                    break;
                }
                next = lines.next() => next,
            };

            match next {
                Some(Ok(line)) => {
                    let container = self.container().await;
                    let pattern = container.non_empty_label(labels::FORMAT_REGEX);
                    let (record, fallback) = normalizer.normalize_traced(&line, pattern);
                    metrics.record_log_record(fallback);
                    self.push_log(record).await;
                }
                Some(Err(e)) => {
                    warn!(container_id = %self.id, error = %e, "Log stream failed");
                    break;
                }
                None => {
                    info!(container_id = %self.id, "Log stream ended");
                    break;
                }
            }
        }
    }

    async fn follow_stats(self: Arc<Self>, runtime: Arc<dyn ContainerRuntime>) {
        match runtime.stats(&self.id).await {
            Ok(mut samples) => loop {
                let next = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!(container_id = %self.id, "Stats task cancelled");
                        break;
                    }
                    next = samples.next() => next,
                };

                match next {
                    Some(Ok(sample)) => self.set_stats(sample).await,
                    Some(Err(RuntimeError::Decode(e))) => {
                        debug!(container_id = %self.id, error = %e, "Skipping undecodable stats sample");
                    }
                    Some(Err(e)) => {
                        warn!(container_id = %self.id, error = %e, "Stats stream failed");
                        break;
                    }
                    None => {
                        info!(container_id = %self.id, "Stats stream ended");
                        break;
                    }
                }
            },
            Err(e) => {
                warn!(container_id = %self.id, error = %e, "Failed to open stats stream");
            }
        }

        self.set_stats(RawStatsSample::default()).await;
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("id", &self.id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
