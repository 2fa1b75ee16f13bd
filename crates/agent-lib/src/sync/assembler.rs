//! Builds outbound messages from tracker state
//!
//! Each tick the assembler turns every tracker into zero, one or two
//! [`Message`]s, applying the container's labels and the agent-wide stats
//! and swarm settings.

use crate::collector::{cumulate, Tracker};
use crate::error::GeoError;
use crate::geo::GeoLookup;
use crate::models::{
    labels, Attributes, ContainerDescriptor, LogRecord, Message, MessageType, StatsMode,
};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const LOGS_INDEX_SUFFIX: &str = "_logs";
pub const CUMULATED_STATS_INDEX_SUFFIX: &str = "_stats_cumulated";
pub const RAW_STATS_INDEX_SUFFIX: &str = "_stats";

/// Static content used when a container has none, or an invalid one
pub const EMPTY_STATIC_CONTENT: &str = "{}";

/// Which message kinds a tick produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emit {
    pub logs: bool,
    pub stats: bool,
}

impl Emit {
    pub const ALL: Emit = Emit {
        logs: true,
        stats: true,
    };
    pub const LOGS: Emit = Emit {
        logs: true,
        stats: false,
    };
    pub const STATS: Emit = Emit {
        logs: false,
        stats: true,
    };
}

/// Agent-wide assembly settings
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub stats_mode: StatsMode,
    pub swarm_mode: bool,
    /// Host identity attached to every message
    pub host: String,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            stats_mode: StatsMode::default(),
            swarm_mode: false,
            host: "localhost".to_string(),
        }
    }
}

pub struct MessageAssembler {
    config: AssemblerConfig,
    geo: Option<Arc<dyn GeoLookup>>,
}

impl MessageAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self { config, geo: None }
    }

    /// Enable geo enrichment of log records
    pub fn with_geo(mut self, geo: Arc<dyn GeoLookup>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Messages for one tracker in this tick
    pub async fn assemble(&self, tracker: &Tracker, emit: Emit) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if emit.logs {
            messages.extend(self.log_message(tracker).await);
        }
        if emit.stats {
            messages.extend(self.stats_message(tracker).await);
        }
        messages
    }

    /// Drain the tracker's logs into a log message.
    ///
    /// Logs of a container with `funk.log.logs=false` are drained and
    /// discarded so the buffer does not grow.
    pub async fn log_message(&self, tracker: &Tracker) -> Option<Message> {
        let container = tracker.container().await;
        let records = tracker.drain_logs().await;

        if records.is_empty() || container.is_disabled(labels::LOGS) {
            return None;
        }

        let geo_field = container.non_empty_label(labels::GEO_DATA_FROM_IP);
        let data = records
            .into_iter()
            .map(|record| match (&self.geo, geo_field) {
                (Some(geo), Some(field)) => enrich_record(geo.as_ref(), record, field),
                _ => record.into_string(),
            })
            .collect();

        Some(self.message(
            &container,
            MessageType::Log,
            data,
            format!("{}{}", container.search_index(), LOGS_INDEX_SUFFIX),
        ))
    }

    /// Snapshot the tracker's stats into a stats message
    pub async fn stats_message(&self, tracker: &Tracker) -> Option<Message> {
        if !self.config.stats_mode.is_enabled() {
            return None;
        }

        let container = tracker.container().await;
        if container.is_disabled(labels::STATS) {
            return None;
        }

        let sample = tracker.current_stats().await;
        let (payload, suffix) = match self.config.stats_mode {
            StatsMode::Cumulated => (
                serde_json::to_string(&cumulate(&sample)),
                CUMULATED_STATS_INDEX_SUFFIX,
            ),
            StatsMode::All => (serde_json::to_string(&*sample), RAW_STATS_INDEX_SUFFIX),
            StatsMode::No => return None,
        };

        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                warn!(container_id = %container.id, error = %e, "Failed to encode stats");
                return None;
            }
        };

        Some(self.message(
            &container,
            MessageType::Stats,
            vec![payload],
            format!("{}{}", container.search_index(), suffix),
        ))
    }

    /// Routing attributes for a container
    pub fn attributes(&self, container: &ContainerDescriptor) -> Attributes {
        let mut attributes = Attributes {
            containername: container.primary_name().to_string(),
            host: self.config.host.clone(),
            container_id: container.image_id.clone(),
            ..Default::default()
        };

        if self.config.swarm_mode {
            if let Some(task) = container.non_empty_label(labels::SWARM_TASK_NAME) {
                attributes.containername = task.to_string();
            }
            attributes.servicename = container
                .label(labels::SWARM_SERVICE_NAME)
                .unwrap_or_default()
                .to_string();
            attributes.namespace = container
                .label(labels::STACK_NAMESPACE)
                .unwrap_or_default()
                .to_string();
        }

        attributes
    }

    fn message(
        &self,
        container: &ContainerDescriptor,
        kind: MessageType,
        data: Vec<String>,
        search_index: String,
    ) -> Message {
        Message {
            time: Utc::now(),
            kind,
            data,
            attributes: self.attributes(container),
            search_index,
            static_content: Some(static_content(container)),
        }
    }
}

/// Validated static content of a container, compactly re-serialized
pub fn static_content(container: &ContainerDescriptor) -> String {
    let Some(raw) = container.non_empty_label(labels::STATIC_CONTENT) else {
        return EMPTY_STATIC_CONTENT.to_string();
    };

    match serde_json::from_str::<Value>(raw) {
        Ok(value) => value.to_string(),
        Err(e) => {
            error!(
                container_id = %container.id,
                error = %e,
                "Static content is not valid JSON, sending empty object"
            );
            EMPTY_STATIC_CONTENT.to_string()
        }
    }
}

/// Add geo fields for the IP held in `field`, or return the record
/// unchanged
fn enrich_record(geo: &dyn GeoLookup, record: LogRecord, field: &str) -> String {
    match try_enrich(geo, record.as_str(), field) {
        Ok(enriched) => enriched,
        Err(e) => {
            debug!(field = %field, error = %e, "Geo enrichment skipped");
            record.into_string()
        }
    }
}

fn try_enrich(geo: &dyn GeoLookup, record: &str, field: &str) -> Result<String, GeoError> {
    let mut values: Map<String, Value> =
        serde_json::from_str(record).map_err(|_| GeoError::InvalidRecord)?;

    let key = field.strip_prefix('.').unwrap_or(field);
    let ip = values
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| GeoError::FieldMissing(key.to_string()))?;

    let location = geo.lookup(ip)?;

    values.insert(
        "funkgeoip.location".to_string(),
        Value::String(format!("{},{}", location.latitude, location.longitude)),
    );
    values.insert(
        "funkgeoip.location_timezone".to_string(),
        Value::String(location.time_zone),
    );
    values.insert(
        "funkgeoip.city_name".to_string(),
        Value::String(location.city_name),
    );
    values.insert(
        "funkgeoip.postal_code".to_string(),
        Value::String(location.postal_code),
    );
    values.insert(
        "funkgeoip.accuracy_radius".to_string(),
        Value::from(location.accuracy_radius),
    );

    Ok(Value::Object(values).to_string())
}
