//! Agent configuration

use anyhow::{bail, Context, Result};
use funk_agent_lib::sync::{AssemblerConfig, TransportConfig, UploadConfig};
use funk_agent_lib::StatsMode;
use serde::Deserialize;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "FUNK_AGENT_CONFIG";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Collector base URL
    pub funk_server: String,

    /// Token sent in the connection handshake
    pub connection_key: String,

    /// Accept invalid TLS certificates
    pub insecure_skip_verify: bool,

    /// Resolve attributes from swarm labels
    pub swarm_mode: bool,

    /// Stats mode: all, cumulated or no
    pub log_stats: String,

    /// Log filter used when RUST_LOG is not set
    pub log_level: String,

    pub enable_geo_ip_inject: bool,

    pub geoip_database_path: String,

    pub geoip_reload_interval_secs: u64,

    /// Seconds between stats ticks
    pub statsintervall: u64,

    /// Seconds between log ticks
    pub log_interval_secs: u64,

    /// Seconds between initial connection attempts
    pub reconnect_delay_secs: u64,

    /// API server port for health/metrics
    pub api_port: u16,
}

impl AgentConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok();
        Self::load_from(file.as_deref(), config::Environment::default())
    }

    /// Load configuration from an explicit file and environment source
    pub fn load_from(file: Option<&str>, environment: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("funk_server", "ws://localhost:3000")?
            .set_default("connection_key", "changeMe04cf242924f6b5f96")?
            .set_default("insecure_skip_verify", false)?
            .set_default("swarm_mode", false)?
            .set_default("log_stats", "cumulated")?
            .set_default("log_level", "info")?
            .set_default("enable_geo_ip_inject", false)?
            .set_default(
                "geoip_database_path",
                "./tmpassets/geoip/GeoLite2-City.mmdb",
            )?
            .set_default("geoip_reload_interval_secs", 3600)?
            .set_default("statsintervall", 15)?
            .set_default("log_interval_secs", 5)?
            .set_default("reconnect_delay_secs", 5)?
            .set_default("api_port", 8080)?;

        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let config: AgentConfig = builder
            .add_source(environment.try_parsing(true))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        self.stats_mode()?;

        for (name, value) in [
            ("statsintervall", self.statsintervall),
            ("log_interval_secs", self.log_interval_secs),
            ("reconnect_delay_secs", self.reconnect_delay_secs),
            ("geoip_reload_interval_secs", self.geoip_reload_interval_secs),
        ] {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }

        if self.funk_server.is_empty() {
            bail!("funk_server must not be empty");
        }

        Ok(())
    }

    pub fn stats_mode(&self) -> Result<StatsMode> {
        self.log_stats.parse()
    }

    /// Stats tick interval, absent when stats are disabled
    pub fn stats_interval(&self) -> Option<Duration> {
        match self.stats_mode() {
            Ok(mode) if mode.is_enabled() => Some(Duration::from_secs(self.statsintervall)),
            _ => None,
        }
    }

    pub fn geoip_reload_interval(&self) -> Duration {
        Duration::from_secs(self.geoip_reload_interval_secs)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            server_url: self.funk_server.clone(),
            connection_key: self.connection_key.clone(),
            insecure_skip_verify: self.insecure_skip_verify,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            log_interval: Duration::from_secs(self.log_interval_secs),
            stats_interval: self.stats_interval(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            server: self.funk_server.clone(),
        }
    }

    pub fn assembler_config(&self, host: &str) -> Result<AssemblerConfig> {
        Ok(AssemblerConfig {
            stats_mode: self.stats_mode()?,
            swarm_mode: self.swarm_mode,
            host: host.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn environment(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::default().source(Some(map))
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::load_from(None, environment(&[])).unwrap();
        assert_eq!(config.funk_server, "ws://localhost:3000");
        assert_eq!(config.connection_key, "changeMe04cf242924f6b5f96");
        assert_eq!(config.stats_mode().unwrap(), StatsMode::Cumulated);
        assert_eq!(config.stats_interval(), Some(Duration::from_secs(15)));
        assert_eq!(config.upload_config().log_interval, Duration::from_secs(5));
        assert_eq!(config.api_port, 8080);
        assert!(!config.enable_geo_ip_inject);
    }

    #[test]
    fn test_environment_overrides() {
        let config = AgentConfig::load_from(
            None,
            environment(&[
                ("FUNK_SERVER", "wss://collector:3000"),
                ("SWARM_MODE", "true"),
                ("LOG_STATS", "no"),
                ("STATSINTERVALL", "30"),
            ]),
        )
        .unwrap();

        assert_eq!(config.funk_server, "wss://collector:3000");
        assert!(config.swarm_mode);
        assert_eq!(config.stats_mode().unwrap(), StatsMode::No);
        assert_eq!(config.stats_interval(), None);
        assert_eq!(
            config.transport_config().subscribe_url(),
            "wss://collector:3000/data/subscribe"
        );
    }

    #[test]
    fn test_invalid_stats_mode_fails() {
        let err = AgentConfig::load_from(None, environment(&[("LOG_STATS", "sometimes")]))
            .unwrap_err();
        assert!(err.to_string().contains("logstats"));
    }

    #[test]
    fn test_zero_interval_fails() {
        assert!(AgentConfig::load_from(None, environment(&[("LOG_INTERVAL_SECS", "0")])).is_err());
    }

    #[test]
    fn test_file_source_below_environment() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "connection_key = \"from-file\"").unwrap();
        writeln!(file, "api_port = 9100").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config =
            AgentConfig::load_from(Some(&path), environment(&[("API_PORT", "9200")])).unwrap();
        assert_eq!(config.connection_key, "from-file");
        assert_eq!(config.api_port, 9200);
    }

    #[test]
    fn test_missing_file_fails() {
        assert!(AgentConfig::load_from(Some("/nonexistent/agent.toml"), environment(&[])).is_err());
    }
}
