use std::fmt;

use bgp_rs::{AFI, SAFI};

/// AFI/SAFI pair identifying a route family carried across the bridge.
/// Only the four bridged families (v4/v6 unicast and labeled-VPN) ever
/// reach the RIB daemon; anything else is dropped at translation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Family {
    pub afi: AFI,
    pub safi: SAFI,
}

impl Family {
    pub fn new(afi: AFI, safi: SAFI) -> Self {
        Self { afi, safi }
    }

    pub fn ipv4_unicast() -> Self {
        Self::new(AFI::IPV4, SAFI::Unicast)
    }

    pub fn ipv6_unicast() -> Self {
        Self::new(AFI::IPV6, SAFI::Unicast)
    }

    pub fn ipv4_vpn() -> Self {
        Self::new(AFI::IPV4, SAFI::MplsVpn)
    }

    pub fn ipv6_vpn() -> Self {
        Self::new(AFI::IPV6, SAFI::MplsVpn)
    }

    /// Is this one of the labeled-VPN families
    pub fn is_vpn(&self) -> bool {
        self.safi == SAFI::MplsVpn
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let afi = match self.afi {
            AFI::IPV4 => "ipv4",
            AFI::IPV6 => "ipv6",
            _ => "other",
        };
        let safi = match self.safi {
            SAFI::Unicast => "unicast",
            SAFI::MplsVpn => "vpn",
            _ => "other",
        };
        write!(f, "{}-{}", afi, safi)
    }
}
