//! Delivery to the collector
//!
//! This module provides:
//! - Message assembly from tracker state and container labels
//! - The transport seam and its websocket implementation
//! - The upload loop with at-most-once delivery and reconnect handling

mod assembler;
mod transport;
mod uploader;


pub use assembler::{
    static_content, AssemblerConfig, Emit, MessageAssembler, CUMULATED_STATS_INDEX_SUFFIX,
    EMPTY_STATIC_CONTENT, LOGS_INDEX_SUFFIX, RAW_STATS_INDEX_SUFFIX,
};
pub use transport::{
    Transport, TransportConfig, WebSocketTransport, CONNECTION_HEADER, SUBSCRIBE_PATH,
};
pub use uploader::{
    collect_batch, ConnectionState, TickOutcome, UploadConfig, UploadLoop, UploadStats,
};
