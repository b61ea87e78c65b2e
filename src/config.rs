use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Connection settings of one polling hub, one per configured station.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Unit id of the product/station device.
    pub station_unit: u8,
    /// Poll the second socket (units 1 and 2 instead of unit 1 only).
    pub read_socket_2: bool,
    /// Poll cycle period in seconds.
    pub scan_interval: u64,
    /// Per-request transport timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: "alfen".to_owned(),
            host: "localhost".to_owned(),
            port: 502,
            station_unit: 200,
            read_socket_2: false,
            scan_interval: 10,
            request_timeout_ms: 3_000,
        }
    }
}

impl HubConfig {
    pub fn from_toml(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !host_valid(&self.host) {
            return Err(Error::Config(format!("invalid host {:?}", self.host)));
        }
        if self.port == 0 {
            return Err(Error::Config("port must be non-zero".to_owned()));
        }
        if self.scan_interval == 0 {
            return Err(Error::Config("scan_interval must be non-zero".to_owned()));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Config("request_timeout_ms must be non-zero".to_owned()));
        }
        Ok(())
    }

    /// Socket unit ids to poll, in declared order.
    pub fn socket_units(&self) -> Vec<u8> {
        if self.read_socket_2 {
            vec![1, 2]
        } else {
            vec![1]
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Accept an IP address or a hostname made of alphanumeric/hyphen labels.
fn host_valid(host: &str) -> bool {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_station() {
        let config = HubConfig::default();
        assert_eq!(config.port, 502);
        assert_eq!(config.station_unit, 200);
        assert_eq!(config.socket_units(), vec![1]);
        config.validate().unwrap();
    }

    #[test]
    fn toml_overrides_defaults() {
        let config: HubConfig = toml::from_str(
            r#"
            host = "192.168.1.30"
            read_socket_2 = true
            scan_interval = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.host, "192.168.1.30");
        assert_eq!(config.socket_units(), vec![1, 2]);
        assert_eq!(config.scan_interval(), Duration::from_secs(5));
    }

    #[test]
    fn config_loads_and_validates_from_a_file() {
        let path = std::env::temp_dir().join("alfen-modbus-hub-config.toml");
        std::fs::write(&path, "host = \"charger.local\"\nread_socket_2 = true\n").unwrap();
        let config = HubConfig::from_toml(&path).unwrap();
        assert_eq!(config.host, "charger.local");
        assert_eq!(config.socket_units(), vec![1, 2]);

        std::fs::write(&path, "host = \"not a host\"\n").unwrap();
        assert!(HubConfig::from_toml(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn bad_hosts_are_rejected() {
        for host in ["", "under_score", "white space", "exa mple.com"] {
            let config = HubConfig {
                host: host.to_owned(),
                ..HubConfig::default()
            };
            assert!(config.validate().is_err(), "accepted {host:?}");
        }
        for host in ["192.168.1.30", "charger.local", "my-station"] {
            let config = HubConfig {
                host: host.to_owned(),
                ..HubConfig::default()
            };
            assert!(config.validate().is_ok(), "rejected {host:?}");
        }
    }
}
