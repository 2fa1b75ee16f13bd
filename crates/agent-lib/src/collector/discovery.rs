//! Container discovery
//!
//! Lists the running containers at startup and again on every container
//! event reported by the runtime, publishing the set of containers that
//! should be tracked.

use super::{ContainerRuntime, RuntimeEvent};
use crate::error::RuntimeError;
use crate::health::{components, HealthRegistry};
use crate::models::{labels, ContainerDescriptor};
use anyhow::{Context, Result};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Drop containers that opted out of tracking with `funk.log=false`
pub fn filter_tracked(containers: Vec<ContainerDescriptor>) -> Vec<ContainerDescriptor> {
    containers
        .into_iter()
        .filter(|c| !c.is_disabled(labels::TRACK))
        .collect()
}

/// Watches the container runtime and publishes discovery updates
pub struct DiscoveryWatcher {
    runtime: Arc<dyn ContainerRuntime>,
    updates_tx: mpsc::Sender<Vec<ContainerDescriptor>>,
    health: Option<HealthRegistry>,
}

impl DiscoveryWatcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        updates_tx: mpsc::Sender<Vec<ContainerDescriptor>>,
    ) -> Self {
        Self {
            runtime,
            updates_tx,
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Running containers that should be tracked
    pub async fn list_tracked(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError> {
        let containers = self.runtime.list_containers().await?;
        Ok(filter_tracked(containers))
    }

    /// List containers and publish them; returns false once the receiver
    /// is gone
    pub async fn publish(&self) -> bool {
        match self.list_tracked().await {
            Ok(containers) => {
                debug!(count = containers.len(), "Publishing discovery update");
                self.updates_tx.send(containers).await.is_ok()
            }
            Err(e) => {
                warn!(error = %e, "Container listing failed, keeping current trackers");
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::DISCOVERY, format!("Listing failed: {}", e))
                        .await;
                }
                !self.updates_tx.is_closed()
            }
        }
    }

    /// Publish the initial container set and start watching for events.
    ///
    /// Returns a handle whose task stops when the event stream ends, the
    /// update receiver is dropped, or shutdown is signalled.
    pub async fn start(self, mut shutdown: broadcast::Receiver<()>) -> Result<WatcherHandle> {
        let mut events = self
            .runtime
            .events()
            .await
            .context("Failed to subscribe to container events")?;

        if !self.publish().await {
            anyhow::bail!("Discovery update receiver dropped");
        }
        if let Some(health) = &self.health {
            health.set_healthy(components::DISCOVERY).await;
        }
        info!("Watching container events");

        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("Discovery watcher shutting down");
                        break;
                    }
                    event = events.next() => event,
                };

                match event {
                    Some(Ok(RuntimeEvent::Container { action })) => {
                        debug!(action = %action, "Container event");
                        if !self.publish().await {
                            debug!("Discovery update receiver dropped");
                            break;
                        }
                    }
                    Some(Ok(RuntimeEvent::Other)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Error reading container events");
                    }
                    None => {
                        warn!("Container event stream closed");
                        if let Some(health) = &self.health {
                            health
                                .set_unhealthy(components::DISCOVERY, "Container event stream closed")
                                .await;
                        }
                        break;
                    }
                }
            }
        });

        Ok(WatcherHandle { task: handle })
    }
}

/// Handle to a running watcher
/// Stops watching when dropped
pub struct WatcherHandle {
    task: tokio::task::JoinHandle<()>,
}

impl WatcherHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
