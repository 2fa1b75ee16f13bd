//! Core data models for the funk agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Container label keys understood by the agent
pub mod labels {
    /// `"false"` excludes a container from tracking entirely
    pub const TRACK: &str = "funk.log";
    /// `"false"` suppresses log messages for the container
    pub const LOGS: &str = "funk.log.logs";
    /// `"false"` suppresses stats messages for the container
    pub const STATS: &str = "funk.log.stats";
    /// Regular expression with named groups used to structure log lines
    pub const FORMAT_REGEX: &str = "funk.log.formatRegex";
    /// Names the JSON field holding an IP address for geo enrichment
    pub const GEO_DATA_FROM_IP: &str = "funk.log.geodatafromip";
    /// Opaque JSON attached to every message of the container
    pub const STATIC_CONTENT: &str = "funk.log.staticcontent";
    /// Overrides the search index
    pub const SEARCH_INDEX: &str = "funk.searchindex";

    pub const SWARM_TASK_NAME: &str = "com.docker.swarm.task.name";
    pub const SWARM_SERVICE_NAME: &str = "com.docker.swarm.service.name";
    pub const STACK_NAMESPACE: &str = "com.docker.stack.namespace";
}

/// Search index used when a container does not set `funk.searchindex`
pub const DEFAULT_SEARCH_INDEX: &str = "default";

/// Snapshot of a running container as reported by discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub id: String,
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
    pub image_id: String,
}

impl ContainerDescriptor {
    /// Primary display name, empty when the runtime reported none
    pub fn primary_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or_default()
    }

    /// Label value, `None` when absent
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Label value treating an empty string as absent
    pub fn non_empty_label(&self, key: &str) -> Option<&str> {
        self.label(key).filter(|v| !v.is_empty())
    }

    /// True when the label is explicitly set to `"false"`
    pub fn is_disabled(&self, key: &str) -> bool {
        self.label(key) == Some("false")
    }

    /// Routing index from `funk.searchindex`, falling back to `default`
    pub fn search_index(&self) -> &str {
        self.non_empty_label(labels::SEARCH_INDEX)
            .unwrap_or(DEFAULT_SEARCH_INDEX)
    }
}

/// One decoded sample of the container stats stream.
///
/// Field names follow the Docker stats JSON so a sample can be decoded
/// straight from the stream and shipped verbatim in `all` mode. The
/// `precpu_stats` block is the previous reading supplied by the source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawStatsSample {
    #[serde(deserialize_with = "nullable")]
    pub read: String,
    #[serde(deserialize_with = "nullable")]
    pub preread: String,
    #[serde(deserialize_with = "nullable")]
    pub id: String,
    #[serde(deserialize_with = "nullable")]
    pub pids_stats: PidsStats,
    #[serde(deserialize_with = "nullable")]
    pub num_procs: u64,
    #[serde(deserialize_with = "nullable")]
    pub cpu_stats: CpuStats,
    #[serde(deserialize_with = "nullable")]
    pub precpu_stats: CpuStats,
    #[serde(deserialize_with = "nullable")]
    pub memory_stats: MemoryStats,
    #[serde(deserialize_with = "nullable")]
    pub networks: BTreeMap<String, NetworkStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidsStats {
    #[serde(deserialize_with = "nullable")]
    pub current: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuStats {
    #[serde(deserialize_with = "nullable")]
    pub cpu_usage: CpuUsage,
    #[serde(deserialize_with = "nullable")]
    pub system_cpu_usage: u64,
    #[serde(deserialize_with = "nullable")]
    pub online_cpus: u64,
    #[serde(deserialize_with = "nullable")]
    pub throttling_data: ThrottlingData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuUsage {
    #[serde(deserialize_with = "nullable")]
    pub total_usage: u64,
    #[serde(deserialize_with = "nullable")]
    pub percpu_usage: Vec<u64>,
    #[serde(deserialize_with = "nullable")]
    pub usage_in_kernelmode: u64,
    #[serde(deserialize_with = "nullable")]
    pub usage_in_usermode: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlingData {
    #[serde(deserialize_with = "nullable")]
    pub periods: u64,
    #[serde(deserialize_with = "nullable")]
    pub throttled_periods: u64,
    #[serde(deserialize_with = "nullable")]
    pub throttled_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    #[serde(deserialize_with = "nullable")]
    pub usage: u64,
    #[serde(deserialize_with = "nullable")]
    pub max_usage: u64,
    #[serde(deserialize_with = "nullable")]
    pub stats: BTreeMap<String, serde_json::Value>,
    #[serde(deserialize_with = "nullable")]
    pub limit: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkStats {
    #[serde(deserialize_with = "nullable")]
    pub rx_bytes: u64,
    #[serde(deserialize_with = "nullable")]
    pub rx_packets: u64,
    #[serde(deserialize_with = "nullable")]
    pub rx_errors: u64,
    #[serde(deserialize_with = "nullable")]
    pub rx_dropped: u64,
    #[serde(deserialize_with = "nullable")]
    pub tx_bytes: u64,
    #[serde(deserialize_with = "nullable")]
    pub tx_packets: u64,
    #[serde(deserialize_with = "nullable")]
    pub tx_errors: u64,
    #[serde(deserialize_with = "nullable")]
    pub tx_dropped: u64,
}

/// Treats an explicit JSON `null` as the field's zero value
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

/// Percentages and rates derived from one raw sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CumulativeStats {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cpu_usage_percent: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ram_usage_percent: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ram_usage_mb: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ram_limit_mb: f64,
    #[serde(default, skip_serializing_if = "is_zero", rename = "net_io_usage_mb")]
    pub net_io_receive_mb: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub net_io_transmit_mb: f64,
}

/// One normalized log entry, always a serialized JSON object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogRecord(String);

impl LogRecord {
    /// Wrap text that is already known to be a JSON object
    pub(crate) fn from_json(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How container stats are shipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsMode {
    /// Raw samples as decoded from the stream
    All,
    /// Derived percentages and rates only
    #[default]
    Cumulated,
    /// No stats messages at all
    No,
}

impl StatsMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, StatsMode::No)
    }
}

impl FromStr for StatsMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(StatsMode::All),
            "cumulated" => Ok(StatsMode::Cumulated),
            "no" => Ok(StatsMode::No),
            other => Err(anyhow::anyhow!(
                "logstats has no valid parameter {:?} (expected all, cumulated or no)",
                other
            )),
        }
    }
}

/// Kind of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "LOG")]
    Log,
    #[serde(rename = "STATS")]
    Stats,
}

/// Routing attributes attached to each message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub containername: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub servicename: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub host: String,
    pub container_id: String,
}

/// Outbound envelope sent to the collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: Vec<String>,
    pub attributes: Attributes,
    pub search_index: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_content: Option<String>,
}
