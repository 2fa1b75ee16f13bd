//! IP geolocation for log enrichment
//!
//! [`GeoIpService`] is the handle shared with the message assembler. It
//! wraps whichever database is currently loaded and lets the
//! [`GeoDbUpdater`] replace it while lookups continue.

mod maxmind;
mod updater;

pub use maxmind::MaxMindDatabase;
pub use updater::{DatabaseLoader, GeoDbUpdater};

use crate::error::GeoError;
use std::sync::{Arc, PoisonError, RwLock};

/// Location attributes resolved for one IP address
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub time_zone: String,
    pub city_name: String,
    pub postal_code: String,
    pub accuracy_radius: u16,
}

/// Resolve an IP address string to a location
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, ip: &str) -> Result<GeoLocation, GeoError>;
}

/// Swappable geo lookup source.
///
/// Lookups fail with [`GeoError::NotLoaded`] until a database has been
/// installed with [`replace`](Self::replace).
#[derive(Default)]
pub struct GeoIpService {
    source: RwLock<Option<Arc<dyn GeoLookup>>>,
}

impl GeoIpService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new lookup source, dropping the previous one once no
    /// in-flight lookup holds it
    pub fn replace(&self, source: Arc<dyn GeoLookup>) {
        let mut current = self.source.write().unwrap_or_else(PoisonError::into_inner);
        *current = Some(source);
    }

    pub fn is_loaded(&self) -> bool {
        self.source
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn current(&self) -> Option<Arc<dyn GeoLookup>> {
        self.source
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl GeoLookup for GeoIpService {
    fn lookup(&self, ip: &str) -> Result<GeoLocation, GeoError> {
        let source = self.current().ok_or(GeoError::NotLoaded)?;
        source.lookup(ip)
    }
}

impl std::fmt::Debug for GeoIpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoIpService")
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
