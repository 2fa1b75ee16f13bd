//! Reloads the geo database when the file on disk is replaced
//!
//! The agent never downloads the database. Placing a current MaxMind City
//! file at the configured path is left to the operator; the updater picks
//! up a replaced file on its next check.

use super::{GeoIpService, GeoLookup, MaxMindDatabase};
use crate::error::GeoError;
use crate::health::{components, HealthRegistry};
use crate::observability::StructuredLogger;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Opens a database file into a lookup source
pub type DatabaseLoader =
    Arc<dyn Fn(&Path) -> Result<Arc<dyn GeoLookup>, GeoError> + Send + Sync>;

/// Keeps a [`GeoIpService`] in sync with a database file.
///
/// The file's modification time is checked on every tick; a newer file is
/// opened and swapped in. If opening fails the previous database stays
/// active.
pub struct GeoDbUpdater {
    path: PathBuf,
    interval: Duration,
    service: Arc<GeoIpService>,
    loader: DatabaseLoader,
    loaded_modified: Option<SystemTime>,
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
}

impl GeoDbUpdater {
    pub fn new(path: impl Into<PathBuf>, interval: Duration, service: Arc<GeoIpService>) -> Self {
        Self {
            path: path.into(),
            interval,
            service,
            loader: Arc::new(|path: &Path| {
                let database = MaxMindDatabase::open(path)?;
                Ok(Arc::new(database) as Arc<dyn GeoLookup>)
            }),
            loaded_modified: None,
            health: None,
            logger: None,
        }
    }

    /// Use a custom loader instead of the MaxMind reader
    pub fn with_loader(mut self, loader: DatabaseLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Check whether the file is newer than the loaded database
    async fn check_modified(&self) -> Result<Option<SystemTime>, GeoError> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| self.open_error(e))?;
        let modified = metadata.modified().map_err(|e| self.open_error(e))?;

        match self.loaded_modified {
            Some(loaded) if modified <= loaded => Ok(None),
            _ => Ok(Some(modified)),
        }
    }

    /// Reload the database if the file changed; returns whether a new
    /// database was installed
    pub async fn refresh(&mut self) -> Result<bool, GeoError> {
        let Some(modified) = self.check_modified().await? else {
            debug!(path = %self.path.display(), "GeoIP database unchanged");
            return Ok(false);
        };

        let loader = Arc::clone(&self.loader);
        let path = self.path.clone();
        let source = tokio::task::spawn_blocking(move || loader(&path))
            .await
            .map_err(|e| self.open_error(e))??;

        self.service.replace(source);
        self.loaded_modified = Some(modified);
        info!(path = %self.path.display(), "Installed GeoIP database");
        Ok(true)
    }

    /// Refresh once and report the outcome to health and the event log
    async fn refresh_and_report(&mut self) {
        let path = self.path.display().to_string();
        match self.refresh().await {
            Ok(true) => {
                if let Some(logger) = &self.logger {
                    logger.log_geo_database(&path, true);
                }
                if let Some(health) = &self.health {
                    health.set_healthy(components::GEOIP).await;
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(path = %path, error = %e, "GeoIP database reload failed");
                if let Some(logger) = &self.logger {
                    logger.log_geo_database(&path, false);
                }
                if let Some(health) = &self.health {
                    let message = if self.service.is_loaded() {
                        format!("Reload failed, using previous database: {}", e)
                    } else {
                        format!("No database loaded: {}", e)
                    };
                    health.set_degraded(components::GEOIP, message).await;
                }
            }
        }
    }

    /// Load immediately, then re-check every interval until shutdown
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        self.refresh_and_report().await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("GeoIP updater shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.refresh_and_report().await;
                }
            }
        }
    }

    fn open_error(&self, e: impl std::fmt::Display) -> GeoError {
        GeoError::Open {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }
}
