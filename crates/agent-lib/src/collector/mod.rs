//! Container tracking
//!
//! This module owns everything between the container runtime and the upload
//! loop: the runtime capability set, discovery, one [`Tracker`] per
//! container with its log and stats tasks, the registry that reconciles
//! discovery updates, and the pure transforms applied to collected data.

mod cumulator;
mod discovery;
mod docker;
mod normalizer;
mod registry;
mod tracker;

#[cfg(test)]
pub(crate) mod tests;

pub use cumulator::{cumulate, NETWORK_INTERFACE};
pub use discovery::{filter_tracked, DiscoveryWatcher, WatcherHandle};
pub use docker::DockerRuntime;
pub use normalizer::{is_json_object, LogNormalizer};
pub use registry::{ReconcileSummary, TrackerRegistry};
pub use tracker::Tracker;

use crate::error::RuntimeError;
use crate::models::{ContainerDescriptor, RawStatsSample};
use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::warn;

/// Host identity used when the runtime does not report one
pub const DEFAULT_HOST: &str = "localhost";

/// Live log lines of one container, oldest first
pub type LogStream = BoxStream<'static, Result<String, RuntimeError>>;

/// Decoded stats samples of one container
pub type StatsStream = BoxStream<'static, Result<RawStatsSample, RuntimeError>>;

/// Runtime events that may change the set of running containers
pub type EventStream = BoxStream<'static, Result<RuntimeEvent, RuntimeError>>;

/// An event reported by the container runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// A container was created, started, stopped, removed, ...
    Container { action: String },
    /// Any non-container event (network, volume, image, ...)
    Other,
}

/// Capabilities the agent needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List currently running containers
    async fn list_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError>;

    /// Follow a container's stdout and stderr from `since` (unix seconds),
    /// with each line prefixed by its timestamp
    async fn logs(&self, container_id: &str, since: i64) -> Result<LogStream, RuntimeError>;

    /// Open a continuous stats stream for a container
    async fn stats(&self, container_id: &str) -> Result<StatsStream, RuntimeError>;

    /// Subscribe to runtime events
    async fn events(&self) -> Result<EventStream, RuntimeError>;

    /// Name of the host the runtime is running on
    async fn host_name(&self) -> Result<String, RuntimeError>;
}

/// Host name reported by `runtime`, or [`DEFAULT_HOST`] when it has none
pub async fn resolve_host(runtime: &dyn ContainerRuntime) -> String {
    match runtime.host_name().await {
        Ok(host) => host,
        Err(e) => {
            warn!(error = %e, "Could not resolve host name, using {}", DEFAULT_HOST);
            DEFAULT_HOST.to_string()
        }
    }
}
