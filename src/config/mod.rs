mod file;

use std::io::Result;

use crate::zserv;

/// Parse a TOML config file and return a BridgeConfig
pub fn from_file(path: &str) -> Result<BridgeConfig> {
    let spec = file::BridgeConfigSpec::from_file(path)?;
    Ok(BridgeConfig::from_spec(spec))
}

/// Resolved bridge settings
///   Has missing BridgeConfigSpec items defaulted
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// RIB daemon endpoint as scheme:address (e.g. "unix:/var/run/zserv.api")
    pub url: String,
    /// Protocols to import from the RIB daemon
    pub redistribute: Vec<String>,
    pub version: u8,
    /// Track nexthop reachability through the RIB daemon
    pub nht: bool,
    /// Base damping delay, in seconds
    pub nht_delay: u8,
}

impl BridgeConfig {
    fn from_spec(spec: file::BridgeConfigSpec) -> Self {
        Self {
            url: spec.url,
            redistribute: spec.redistribute,
            version: spec.version,
            nht: spec.nht,
            nht_delay: spec.nht_delay,
        }
    }

    /// Parse bridge settings from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(Self::from_spec(file::BridgeConfigSpec::from_str(contents)?))
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "unix:/var/run/zserv.api".to_string(),
            redistribute: Vec::new(),
            version: zserv::DEFAULT_VERSION,
            nht: true,
            nht_delay: 5,
        }
    }
}
