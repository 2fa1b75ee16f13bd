//! MaxMind GeoLite2 / GeoIP2 City database reader

use super::{GeoLocation, GeoLookup};
use crate::error::GeoError;
use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;

pub struct MaxMindDatabase {
    reader: Reader<Vec<u8>>,
}

impl MaxMindDatabase {
    /// Read a City database into memory
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GeoError> {
        let path = path.as_ref();
        let reader = Reader::open_readfile(path).map_err(|e| GeoError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { reader })
    }

    pub fn database_type(&self) -> &str {
        &self.reader.metadata.database_type
    }
}

impl GeoLookup for MaxMindDatabase {
    fn lookup(&self, ip: &str) -> Result<GeoLocation, GeoError> {
        let address: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| GeoError::InvalidIp(ip.to_string()))?;

        let city: geoip2::City = self
            .reader
            .lookup(address)
            .map_err(|e| GeoError::Lookup(e.to_string()))?;

        let mut location = GeoLocation::default();
        if let Some(loc) = city.location {
            location.latitude = loc.latitude.unwrap_or_default();
            location.longitude = loc.longitude.unwrap_or_default();
            location.time_zone = loc.time_zone.unwrap_or_default().to_string();
            location.accuracy_radius = loc.accuracy_radius.unwrap_or_default();
        }
        if let Some(name) = city
            .city
            .and_then(|c| c.names)
            .and_then(|names| names.get("en").copied())
        {
            location.city_name = name.to_string();
        }
        if let Some(code) = city.postal.and_then(|p| p.code) {
            location.postal_code = code.to_string();
        }

        Ok(location)
    }
}

impl std::fmt::Debug for MaxMindDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaxMindDatabase")
            .field("database_type", &self.database_type())
            .finish()
    }
}
