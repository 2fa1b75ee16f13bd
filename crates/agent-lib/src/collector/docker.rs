//! Docker Engine implementation of the runtime capability set

use super::{ContainerRuntime, EventStream, LogStream, RuntimeEvent, StatsStream};
use crate::error::RuntimeError;
use crate::models::{ContainerDescriptor, RawStatsSample};
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, LogsOptions, StatsOptions};
use bollard::models::{ContainerSummary, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::{future, stream, StreamExt};
use tracing::info;

/// Container runtime backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform's default socket
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        info!("Using local Docker daemon");
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::List(e.to_string()))?;

        Ok(containers.into_iter().map(descriptor_from_summary).collect())
    }

    async fn logs(&self, container_id: &str, since: i64) -> Result<LogStream, RuntimeError> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: true,
            since,
            tail: "all".to_string(),
            ..Default::default()
        };

        let chunks = self.docker.logs(container_id, Some(options));

        // Frames end neither on line nor on character boundaries: the daemon
        // splits long lines, and TTY containers write arbitrary chunks.
        let lines = chunks
            .scan(Vec::new(), |pending, chunk| {
                let batch: Vec<Result<String, RuntimeError>> = match chunk {
                    Ok(output) => {
                        pending.extend_from_slice(&output.into_bytes());
                        split_complete_lines(pending).into_iter().map(Ok).collect()
                    }
                    Err(e) => vec![Err(RuntimeError::from(e))],
                };
                future::ready(Some(stream::iter(batch)))
            })
            .flatten()
            .boxed();

        Ok(lines)
    }

    async fn stats(&self, container_id: &str) -> Result<StatsStream, RuntimeError> {
        let options = StatsOptions {
            stream: true,
            one_shot: false,
        };

        let samples = self
            .docker
            .stats(container_id, Some(options))
            .map(|item| {
                let stats = item?;
                let value = serde_json::to_value(stats)?;
                Ok::<RawStatsSample, RuntimeError>(serde_json::from_value(value)?)
            })
            .boxed();

        Ok(samples)
    }

    async fn events(&self) -> Result<EventStream, RuntimeError> {
        let events = self
            .docker
            .events(Some(EventsOptions::<String>::default()))
            .map(|item| {
                let event = item.map_err(|e| RuntimeError::Events(e.to_string()))?;
                Ok(match event.typ {
                    Some(EventMessageTypeEnum::CONTAINER) => RuntimeEvent::Container {
                        action: event.action.unwrap_or_default(),
                    },
                    _ => RuntimeEvent::Other,
                })
            })
            .boxed();

        Ok(events)
    }

    async fn host_name(&self) -> Result<String, RuntimeError> {
        let info = self
            .docker
            .info()
            .await
            .map_err(|e| RuntimeError::Info(e.to_string()))?;
        info.name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| RuntimeError::Info("daemon reported no host name".to_string()))
    }
}

fn descriptor_from_summary(summary: ContainerSummary) -> ContainerDescriptor {
    ContainerDescriptor {
        id: summary.id.unwrap_or_default(),
        names: summary.names.unwrap_or_default(),
        labels: summary.labels.unwrap_or_default(),
        image_id: summary.image_id.unwrap_or_default(),
    }
}

/// Remove every complete line from `pending` and decode it, leaving a
/// trailing partial line as raw bytes
fn split_complete_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let rest = pending.split_off(pos + 1);
        let mut line = std::mem::replace(pending, rest);
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).into_owned());
    }
    lines
}
