use serde::{Deserialize, Serialize};

use crate::event::PublicKey;

/// Engine-level configuration, loadable from TOML exactly like the
/// teacher's `MoarConfig`: every field that isn't mandatory carries a
/// `#[serde(default = "fn")]` so a consumer only specifies what it wants
/// to override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the LMDB environment files.
    pub data_dir: String,

    /// Hex pubkeys whose deletion events are honored against any author's
    /// events (§4.5's `configured_admin_pubkeys`).
    #[serde(default)]
    pub admin_pubkeys: Vec<String>,

    /// How many serials to lease from the store per allocator round-trip.
    #[serde(default = "default_serial_lease_size")]
    pub serial_lease_size: u64,

    /// Cadence, in seconds, of the expiration sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// LMDB map-size ceiling, in bytes.
    #[serde(default = "default_map_size_bytes")]
    pub map_size_bytes: usize,
}

fn default_serial_lease_size() -> u64 {
    1000
}

fn default_sweep_interval_secs() -> u64 {
    600
}

fn default_map_size_bytes() -> usize {
    10 * 1024 * 1024 * 1024
}

impl EngineConfig {
    pub fn for_data_dir(data_dir: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            admin_pubkeys: Vec::new(),
            serial_lease_size: default_serial_lease_size(),
            sweep_interval_secs: default_sweep_interval_secs(),
            map_size_bytes: default_map_size_bytes(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn admin_pubkey_set(&self) -> Vec<PublicKey> {
        self.admin_pubkeys
            .iter()
            .filter_map(|s| PublicKey::from_hex(s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_omitted() {
        let toml_str = r#"data_dir = "/tmp/relay""#;
        let cfg = EngineConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(cfg.serial_lease_size, 1000);
        assert_eq!(cfg.sweep_interval_secs, 600);
        assert_eq!(cfg.map_size_bytes, 10 * 1024 * 1024 * 1024);
        assert!(cfg.admin_pubkeys.is_empty());
    }

    #[test]
    fn overrides_are_honored() {
        let toml_str = r#"
            data_dir = "/var/relay"
            admin_pubkeys = ["aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"]
            serial_lease_size = 50
        "#;
        let cfg = EngineConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(cfg.serial_lease_size, 50);
        assert_eq!(cfg.admin_pubkey_set().len(), 1);
    }
}
