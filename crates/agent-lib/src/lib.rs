//! Agent library for container telemetry shipping
//!
//! This crate provides the core functionality for:
//! - Container discovery and per-container log / stats collection
//! - Log normalization and stats cumulation
//! - Message assembly and batched upload to the collector
//! - Optional GeoIP enrichment of log records
//! - Health checks and observability

pub mod collector;
pub mod error;
pub mod geo;
pub mod health;
pub mod models;
pub mod observability;
pub mod sync;

pub use error::{GeoError, NormalizeError, RuntimeError, TransportError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
