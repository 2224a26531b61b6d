pub mod family;

pub use family::Family;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use bgp_rs::{ASPath, Origin, Segment};
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;

use crate::utils::format_age;

/// A batch of paths as exchanged with the nexthop tracker. Batches
/// scheduled for tracking share a single nexthop; ordering within a
/// batch carries no meaning.
pub type PathList = Vec<Arc<Path>>;

/// Community marking a route as a backup-region path. The peer side
/// blackholes these, so they are flagged REJECT towards the RIB daemon.
pub const BACKUP_REGION_COMMUNITY: u32 = 0xffff_029a;

/// Route distinguisher in two-part "admin:assigned" form
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RouteDistinguisher {
    pub admin: u32,
    pub assigned: u32,
}

impl RouteDistinguisher {
    pub fn new(admin: u32, assigned: u32) -> Self {
        Self { admin, assigned }
    }
}

impl fmt::Display for RouteDistinguisher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.admin, self.assigned)
    }
}

impl FromStr for RouteDistinguisher {
    type Err = std::io::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid route distinguisher: '{}'", value),
            )
        };
        let chunks: Vec<&str> = value.split(':').collect();
        if chunks.len() != 2 {
            return Err(invalid());
        }
        let admin = chunks[0].parse().map_err(|_| invalid())?;
        let assigned = chunks[1].parse().map_err(|_| invalid())?;
        Ok(Self { admin, assigned })
    }
}

/// Network-layer reachability info: the prefix plus the qualifiers
/// that scope it (route distinguisher for VPN families, path ids)
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Nlri {
    pub rd: Option<RouteDistinguisher>,
    pub prefix: IpNetwork,
    /// Path identifier announced by the peer
    pub path_id: u32,
    /// Identifier assigned by the local speaker
    pub local_id: u32,
}

impl Nlri {
    pub fn new(prefix: IpNetwork) -> Self {
        Self {
            rd: None,
            prefix,
            path_id: 0,
            local_id: 0,
        }
    }

    pub fn with_rd(prefix: IpNetwork, rd: RouteDistinguisher) -> Self {
        Self {
            rd: Some(rd),
            prefix,
            path_id: 0,
            local_id: 0,
        }
    }

    pub fn is_default(&self) -> bool {
        self.prefix.prefix() == 0
    }
}

impl fmt::Display for Nlri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.rd {
            Some(rd) => write!(f, "{}:{}", rd, self.prefix),
            None => write!(f, "{}", self.prefix),
        }
    }
}

/// Source attributes of the peer a path was learned from
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PeerInfo {
    pub asn: u32,
    pub local_asn: u32,
    pub multihop_ttl: u8,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Community {
    Standard(u32),
    Extended(u64),
}

impl fmt::Display for Community {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Community::Standard(value) => {
                write!(f, "{}:{}", value >> 16, value & 0xffff)
            }
            Community::Extended(value) => write!(f, "{:#018x}", value),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommunityList(pub Vec<Community>);

impl CommunityList {
    pub fn iter(&self) -> std::slice::Iter<Community> {
        self.0.iter()
    }

    pub fn standard(&self) -> Vec<u32> {
        self.0
            .iter()
            .filter_map(|c| {
                if let Community::Standard(comm) = c {
                    Some(*comm)
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn contains_standard(&self, value: u32) -> bool {
        self.0.iter().any(|c| *c == Community::Standard(value))
    }
}

impl fmt::Display for CommunityList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let communities = self
            .0
            .iter()
            .map(std::string::ToString::to_string)
            .collect::<Vec<String>>()
            .join(" ");
        write!(f, "{}", communities)
    }
}

/// A single BGP path as seen by the bridge. Paths handed over by the
/// engine are shared references; any change (nexthop invalidation, MED
/// rewrite) goes through clone-and-mutate so the engine keeps the
/// original.
#[derive(Clone, Debug)]
pub struct Path {
    pub nlri: Nlri,
    pub family: Family,
    pub nexthop: IpAddr,
    pub is_withdraw: bool,
    pub is_nexthop_invalid: bool,
    pub med: Option<u32>,
    /// MED was copied from a nexthop reachability update rather than
    /// learned from the peer
    pub med_from_nexthop: bool,
    pub origin: Origin,
    pub as_path: ASPath,
    pub communities: CommunityList,
    pub source: PeerInfo,
    /// Originated by the local speaker
    pub local: bool,
    /// Imported from the RIB daemon rather than learned over BGP
    pub from_external: bool,
    pub timestamp: DateTime<Utc>,
}

impl Path {
    pub fn new(nlri: Nlri, family: Family, nexthop: IpAddr) -> Self {
        Self {
            nlri,
            family,
            nexthop,
            is_withdraw: false,
            is_nexthop_invalid: false,
            med: None,
            med_from_nexthop: false,
            origin: Origin::INCOMPLETE,
            as_path: ASPath { segments: vec![] },
            communities: CommunityList::default(),
            source: PeerInfo::default(),
            local: false,
            from_external: false,
            timestamp: Utc::now(),
        }
    }

    /// Number of ASNs across all AS_PATH segments
    pub fn as_path_len(&self) -> usize {
        self.as_path
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::AS_SEQUENCE(seq) => seq.len(),
                Segment::AS_SET(set) => set.len(),
            })
            .sum()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Path {} via {} age={}>",
            self.nlri,
            self.nexthop,
            format_age(self.timestamp),
        )
    }
}
