//! Periodic batch upload to the collector
//!
//! The upload loop owns the transport. On each log tick it drains every
//! tracker's logs, and on each stats tick it snapshots every tracker's
//! stats, then sends the combined batch. A failed send is followed by a
//! single reconnect attempt and the batch is dropped: delivery is at most
//! once.

use super::assembler::{Emit, MessageAssembler};
use super::transport::Transport;
use crate::collector::TrackerRegistry;
use crate::health::{components, HealthRegistry};
use crate::models::Message;
use crate::observability::{AgentMetrics, StructuredLogger};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Upload loop schedule
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Interval of log ticks
    pub log_interval: Duration,
    /// Interval of stats ticks; `None` disables stats ticks
    pub stats_interval: Option<Duration>,
    /// Fixed delay between initial connection attempts
    pub reconnect_delay: Duration,
    /// Label used for the collector in log events
    pub server: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            log_interval: Duration::from_secs(5),
            stats_interval: Some(Duration::from_secs(15)),
            reconnect_delay: Duration::from_secs(5),
            server: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Counters describing upload activity
#[derive(Debug, Clone, Default)]
pub struct UploadStats {
    pub batches_sent: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub reconnect_attempts: u64,
    pub dropped_messages: u64,
    pub last_error: Option<String>,
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to send
    Idle,
    /// Batch delivered
    Sent { messages: usize },
    /// Batch lost; `reconnected` tells whether the follow-up reconnect
    /// succeeded
    Dropped { messages: usize, reconnected: bool },
}

pub struct UploadLoop<T: Transport> {
    transport: T,
    registry: Arc<TrackerRegistry>,
    assembler: MessageAssembler,
    config: UploadConfig,
    state: ConnectionState,
    stats: Arc<RwLock<UploadStats>>,
    metrics: AgentMetrics,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
}

impl<T: Transport> UploadLoop<T> {
    pub fn new(
        transport: T,
        registry: Arc<TrackerRegistry>,
        assembler: MessageAssembler,
        config: UploadConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            assembler,
            config,
            state: ConnectionState::Disconnected,
            stats: Arc::new(RwLock::new(UploadStats::default())),
            metrics: AgentMetrics::new(),
            health: None,
            logger: None,
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Shared handle to the upload counters
    pub fn stats_handle(&self) -> Arc<RwLock<UploadStats>> {
        Arc::clone(&self.stats)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Try to connect once, updating state, health and counters
    pub async fn connect(&mut self) -> bool {
        self.metrics.inc_reconnect_attempts();
        self.stats.write().await.reconnect_attempts += 1;

        match self.transport.connect().await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                if let Some(logger) = &self.logger {
                    logger.log_connection(true, &self.config.server);
                }
                if let Some(health) = &self.health {
                    health.set_healthy(components::TRANSPORT).await;
                    health.set_ready(true).await;
                }
                true
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                warn!(error = %e, "Connection to collector failed");
                self.stats.write().await.last_error = Some(e.to_string());
                if let Some(health) = &self.health {
                    health
                        .set_unhealthy(components::TRANSPORT, format!("Not connected: {}", e))
                        .await;
                }
                false
            }
        }
    }

    /// Retry connecting with a fixed delay until it succeeds.
    ///
    /// Returns false if shutdown was signalled first.
    pub async fn connect_until_ready(&mut self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        loop {
            if self.connect().await {
                return true;
            }

            info!(
                delay_secs = self.config.reconnect_delay.as_secs(),
                "Retrying collector connection"
            );
            tokio::select! {
                _ = shutdown.recv() => return false,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    /// Run one tick: assemble, send, and reconnect once on failure
    pub async fn tick(&mut self, emit: Emit) -> TickOutcome {
        let batch = collect_batch(&self.registry, &self.assembler, emit).await;
        if batch.is_empty() {
            debug!("Nothing to upload");
            return TickOutcome::Idle;
        }

        let messages = batch.len();
        let started = Instant::now();

        match self.transport.send(&batch).await {
            Ok(()) => {
                self.metrics
                    .record_batch_sent(messages, started.elapsed().as_secs_f64());
                let mut stats = self.stats.write().await;
                stats.batches_sent += 1;
                stats.messages_sent += messages as u64;
                debug!(messages, "Uploaded batch");
                TickOutcome::Sent { messages }
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                self.metrics.inc_send_failures();
                self.metrics.add_dropped_messages(messages);
                {
                    let mut stats = self.stats.write().await;
                    stats.send_failures += 1;
                    stats.dropped_messages += messages as u64;
                    stats.last_error = Some(e.to_string());
                }
                if let Some(logger) = &self.logger {
                    logger.log_connection(false, &self.config.server);
                }
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::TRANSPORT, format!("Send failed: {}", e))
                        .await;
                }

                let reconnected = self.connect().await;
                if let Some(logger) = &self.logger {
                    logger.log_batch_dropped(messages, reconnected, &e.to_string());
                }
                TickOutcome::Dropped {
                    messages,
                    reconnected,
                }
            }
        }
    }

    /// Tick until shutdown is signalled
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut log_ticker = ticker(self.config.log_interval);
        let mut stats_ticker = self.config.stats_interval.map(ticker);

        if let Some(health) = &self.health {
            health.set_healthy(components::UPLOADER).await;
        }
        info!(
            log_interval_secs = self.config.log_interval.as_secs(),
            stats_interval_secs = ?self.config.stats_interval.map(|d| d.as_secs()),
            "Upload loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Upload loop shutting down");
                    break;
                }
                _ = log_ticker.tick() => {
                    self.tick(Emit::LOGS).await;
                }
                _ = next_tick(&mut stats_ticker) => {
                    self.tick(Emit::STATS).await;
                }
            }
        }

        if let Some(health) = &self.health {
            health
                .set_unhealthy(components::UPLOADER, "Upload loop stopped")
                .await;
        }
    }
}

/// Assemble the batch for one tick while holding the registry lock
pub async fn collect_batch(
    registry: &TrackerRegistry,
    assembler: &MessageAssembler,
    emit: Emit,
) -> Vec<Message> {
    let trackers = registry.lock().await;
    let mut batch = Vec::new();
    for tracker in trackers.values() {
        batch.extend(assembler.assemble(tracker, emit).await);
    }
    batch
}

/// Interval whose first tick is one period from now
fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Next tick of an optional interval; never completes when absent
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
