use std::fs::File;
use std::io::{self, Read};

use serde::Deserialize;

use crate::zserv;

struct Defaults {}

impl Defaults {
    fn redistribute() -> Vec<String> {
        Vec::new()
    }

    fn version() -> u8 {
        zserv::DEFAULT_VERSION
    }

    fn nht() -> bool {
        true
    }

    fn nht_delay() -> u8 {
        5
    }
}

/// Config (toml) representation of the bridge settings
#[derive(Clone, Debug, Deserialize)]
pub(super) struct BridgeConfigSpec {
    // RIB daemon endpoint, scheme:address
    pub(super) url: String,

    // Protocols redistributed into BGP
    #[serde(default = "Defaults::redistribute")]
    pub(super) redistribute: Vec<String>,

    // Message version offered during session open
    #[serde(default = "Defaults::version")]
    pub(super) version: u8,

    // Enable nexthop reachability tracking
    #[serde(default = "Defaults::nht")]
    pub(super) nht: bool,

    // Base delay before damped path updates reach the engine
    #[serde(default = "Defaults::nht_delay")]
    pub(super) nht_delay: u8,
}

impl BridgeConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Self::from_str(&contents)
    }

    pub(super) fn from_str(contents: &str) -> io::Result<Self> {
        toml::from_str(contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
    }
}
