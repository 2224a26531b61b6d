//! Pure conversions between engine paths and RIB daemon message bodies.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use bgp_rs::{Origin, PathAttribute, AFI, SAFI};
use ipnetwork::IpNetwork;
use log::{debug, error, warn};

use crate::nht::Nht;
use crate::path::{
    Family, Nlri, Path, PathList, BACKUP_REGION_COMMUNITY,
};
use crate::zserv::{
    Command, Header, MessageFlags, NexthopRegisterBody, NexthopUpdateBody, RegisteredNexthop,
    RouteBody, RouteFlags, RouteType, AF_INET, AF_INET6, SAFI_UNICAST,
};

fn filter_out_external(paths: &[Arc<Path>]) -> Vec<&Arc<Path>> {
    paths.iter().filter(|path| !path.from_external).collect()
}

fn unspecified(afi: AFI) -> IpAddr {
    match afi {
        AFI::IPV4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        _ => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Build the route message for a batch of paths sharing a prefix.
/// Returns the body and the representative path's withdraw flag, or
/// None when nothing should be sent for this batch.
pub fn route_body(dst: &[Arc<Path>], self_route_withdraw: bool) -> Option<(RouteBody, bool)> {
    let paths = filter_out_external(dst);
    let path = *paths.first()?;

    let (prefix, nexthops) = match (path.family.afi, path.family.safi) {
        (AFI::IPV4, SAFI::Unicast) | (AFI::IPV4, SAFI::MplsVpn) => {
            let prefix = match path.nlri.prefix {
                IpNetwork::V4(network) => IpAddr::V4(network.network()),
                IpNetwork::V6(_) => return None,
            };
            let mut nexthops = Vec::with_capacity(paths.len());
            for p in &paths {
                if self_route_withdraw {
                    // Local speaker withdrawing its own route
                    nexthops.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
                } else if p.nexthop.is_ipv4() {
                    nexthops.push(p.nexthop);
                }
            }
            (prefix, nexthops)
        }
        (AFI::IPV6, SAFI::Unicast) | (AFI::IPV6, SAFI::MplsVpn) => {
            let prefix = match path.nlri.prefix {
                IpNetwork::V6(network) => IpAddr::V6(network.network()),
                IpNetwork::V4(_) => return None,
            };
            let mut nexthops = Vec::with_capacity(paths.len());
            for p in &paths {
                if self_route_withdraw {
                    nexthops.push(IpAddr::V6(Ipv6Addr::LOCALHOST));
                } else if p.nexthop.is_ipv6() {
                    nexthops.push(p.nexthop);
                }
            }
            (prefix, nexthops)
        }
        _ => return None,
    };
    let prefix_len = path.nlri.prefix.prefix();

    let mut message = MessageFlags::default();
    if !nexthops.is_empty() {
        message |= MessageFlags::NEXTHOP;
    }
    let metric = match path.med {
        Some(med) => {
            message |= MessageFlags::METRIC;
            med
        }
        None => 0,
    };

    let mut flags = RouteFlags::default();
    if path.source.asn == path.source.local_asn {
        flags |= RouteFlags::IBGP | RouteFlags::INTERNAL;
    } else if path.source.multihop_ttl > 0 {
        flags |= RouteFlags::INTERNAL;
    }
    if path.communities.contains_standard(BACKUP_REGION_COMMUNITY) {
        // Backup-region paths are blackholed on the peer side
        flags |= RouteFlags::REJECT;
    }

    let mut aspath = Vec::new();
    if path.as_path_len() > 0 {
        let mut encoded: Vec<u8> = Vec::new();
        if PathAttribute::AS_PATH(path.as_path.clone())
            .encode(&mut encoded)
            .is_ok()
            && encoded.len() > 3
        {
            // Strip the attribute envelope (flags, type, length)
            aspath = encoded[3..].to_vec();
            message |= MessageFlags::ASPATH;
        }
    }

    let mut path_id = 0;
    if prefix_len == 0 {
        path_id = path.nlri.local_id;
        if path_id == 0 {
            warn!("Skipping default route without a local path id: {}", path);
            return None;
        }
        message |= MessageFlags::PATH_ID;
    }

    Some((
        RouteBody {
            route_type: RouteType::Bgp,
            flags,
            message,
            safi: SAFI_UNICAST,
            prefix,
            prefix_len,
            nexthops,
            metric,
            aspath,
            path_id,
        },
        path.is_withdraw,
    ))
}

/// Import a redistributed route message as an externally-sourced path.
/// Only IPv4/IPv6 unicast arrive on this edge.
pub fn path_from_route(header: &Header, body: &RouteBody) -> Option<Path> {
    if body.safi != SAFI_UNICAST {
        error!(
            "Unsupported SAFI {} on redistributed route {}",
            body.safi, body.prefix
        );
        return None;
    }
    let is_withdraw = matches!(
        header.command,
        Command::Ipv4RouteDelete | Command::Ipv6RouteDelete
    );
    let family = match body.prefix {
        IpAddr::V4(_) => Family::ipv4_unicast(),
        IpAddr::V6(_) => Family::ipv6_unicast(),
    };
    let prefix = match IpNetwork::new(body.prefix, body.prefix_len) {
        Ok(network) => network,
        Err(err) => {
            error!(
                "Invalid redistributed prefix {}/{}: {}",
                body.prefix, body.prefix_len, err
            );
            return None;
        }
    };
    debug!(
        "Creating path from route message: {} metric {} [{}]",
        prefix, body.metric, header.command
    );
    let nexthop = body
        .nexthops
        .first()
        .copied()
        .unwrap_or_else(|| unspecified(family.afi));
    let mut path = Path::new(Nlri::new(prefix), family, nexthop);
    path.origin = Origin::IGP;
    path.med = Some(body.metric);
    path.is_withdraw = is_withdraw;
    path.from_external = true;
    Some(path)
}

/// Build the nexthop registration body for a batch. The second return
/// is the representative's withdraw flag: a withdrawing batch produces
/// no body since unregistration only happens on reachability loss.
pub fn nexthop_register_body(
    dst: &[Arc<Path>],
    nht: Option<&Nht>,
) -> (Option<NexthopRegisterBody>, bool) {
    let nht = match nht {
        Some(nht) => nht,
        None => return (None, false),
    };
    if let Some(first) = dst.first() {
        if first.is_withdraw {
            return (None, true);
        }
    }
    let paths = nht.filter_paths_to_register(dst);
    let path = match paths.first() {
        Some(path) => path,
        None => return (None, false),
    };

    let wire_family = match (path.family.afi, path.family.safi) {
        (AFI::IPV4, SAFI::Unicast) | (AFI::IPV4, SAFI::MplsVpn) => AF_INET,
        (AFI::IPV6, SAFI::Unicast) | (AFI::IPV6, SAFI::MplsVpn) => AF_INET6,
        _ => return (None, false),
    };
    let mut nexthops = Vec::with_capacity(paths.len());
    for p in &paths {
        let matches_family = match wire_family {
            AF_INET => p.nexthop.is_ipv4(),
            _ => p.nexthop.is_ipv6(),
        };
        if !matches_family {
            continue;
        }
        nexthops.push(RegisteredNexthop {
            family: wire_family,
            prefix: p.nexthop,
        });
        nht.register(p.nexthop);
    }
    if nexthops.is_empty() {
        return (None, false);
    }
    (Some(NexthopRegisterBody { nexthops }), false)
}

/// Route families affected by a nexthop update for the given wire
/// address family.
pub fn families_for_af(family: u16) -> Vec<Family> {
    match family {
        AF_INET => vec![Family::ipv4_unicast(), Family::ipv4_vpn()],
        AF_INET6 => vec![Family::ipv6_unicast(), Family::ipv6_vpn()],
        _ => vec![],
    }
}

/// Apply a nexthop reachability update to the paths bound to it.
/// Returns updated clones for the engine and, when nothing is bound
/// anymore, the unregister body to send back.
pub fn paths_from_nexthop_update(
    body: &NexthopUpdateBody,
    bound: PathList,
    nht: &Nht,
) -> (PathList, Option<NexthopRegisterBody>) {
    let nexthop_invalid = body.nexthops.is_empty();

    let mut unregister = None;
    if bound.is_empty() {
        unregister = Some(NexthopRegisterBody {
            nexthops: vec![RegisteredNexthop {
                family: body.family,
                prefix: body.prefix,
            }],
        });
        nht.unregister(&body.prefix);
    }

    let updated = bound
        .iter()
        .map(|path| {
            let mut clone = (**path).clone();
            if nexthop_invalid {
                clone.is_nexthop_invalid = true;
            } else {
                clone.is_nexthop_invalid = false;
                clone.med = Some(body.metric);
                clone.med_from_nexthop = true;
            }
            Arc::new(clone)
        })
        .collect();
    (updated, unregister)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{Community, CommunityList, PeerInfo, RouteDistinguisher};
    use bgp_rs::{ASPath, Segment};

    fn unicast_path(prefix: &str, nexthop: &str) -> Path {
        let prefix: IpNetwork = prefix.parse().unwrap();
        let family = match prefix {
            IpNetwork::V4(_) => Family::ipv4_unicast(),
            IpNetwork::V6(_) => Family::ipv6_unicast(),
        };
        let mut path = Path::new(Nlri::new(prefix), family, nexthop.parse().unwrap());
        path.source = PeerInfo {
            asn: 65001,
            local_asn: 65000,
            multihop_ttl: 0,
        };
        path
    }

    #[test]
    fn test_route_body_ipv4() {
        let batch = vec![Arc::new(unicast_path("10.0.0.0/24", "192.0.2.1"))];
        let (body, is_withdraw) = route_body(&batch, false).unwrap();
        assert!(!is_withdraw);
        assert_eq!(body.route_type, RouteType::Bgp);
        assert_eq!(body.prefix, "10.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(body.prefix_len, 24);
        assert_eq!(body.nexthops, vec!["192.0.2.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(body.flags, RouteFlags::default());
        assert_eq!(body.message, MessageFlags::NEXTHOP);
    }

    #[test]
    fn test_route_body_pure() {
        let batch = vec![Arc::new(unicast_path("10.0.0.0/24", "192.0.2.1"))];
        assert_eq!(route_body(&batch, false), route_body(&batch, false));
    }

    #[test]
    fn test_route_body_unsupported_family() {
        let mut path = unicast_path("10.0.0.0/24", "192.0.2.1");
        path.family = Family::new(AFI::IPV4, SAFI::Flowspec);
        assert!(route_body(&[Arc::new(path)], false).is_none());
    }

    #[test]
    fn test_route_body_elides_external_batch() {
        let mut path = unicast_path("10.0.0.0/24", "192.0.2.1");
        path.from_external = true;
        assert!(route_body(&[Arc::new(path)], false).is_none());
    }

    #[test]
    fn test_route_body_self_withdraw() {
        let batch = vec![Arc::new(unicast_path("10.0.0.0/24", "192.0.2.1"))];
        let (body, _) = route_body(&batch, true).unwrap();
        assert_eq!(body.nexthops, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);

        let batch = vec![Arc::new(unicast_path("2001:db8::/64", "2001:db8::1"))];
        let (body, _) = route_body(&batch, true).unwrap();
        assert_eq!(body.nexthops, vec!["::1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_route_body_ibgp_flags() {
        let mut path = unicast_path("10.0.0.0/24", "192.0.2.1");
        path.source.asn = 65000;
        path.source.local_asn = 65000;
        let (body, _) = route_body(&[Arc::new(path)], false).unwrap();
        assert!(body.flags.contains(RouteFlags::IBGP));
        assert!(body.flags.contains(RouteFlags::INTERNAL));

        let mut path = unicast_path("10.0.0.0/24", "192.0.2.1");
        path.source.multihop_ttl = 2;
        let (body, _) = route_body(&[Arc::new(path)], false).unwrap();
        assert!(!body.flags.contains(RouteFlags::IBGP));
        assert!(body.flags.contains(RouteFlags::INTERNAL));
    }

    #[test]
    fn test_route_body_backup_region_rejected() {
        let mut path = unicast_path("10.0.0.0/24", "192.0.2.1");
        path.communities = CommunityList(vec![Community::Standard(BACKUP_REGION_COMMUNITY)]);
        let (body, _) = route_body(&[Arc::new(path)], false).unwrap();
        assert!(body.flags.contains(RouteFlags::REJECT));
    }

    #[test]
    fn test_route_body_aspath_envelope_stripped() {
        let mut path = unicast_path("10.0.0.0/24", "192.0.2.1");
        path.as_path = ASPath {
            segments: vec![Segment::AS_SEQUENCE(vec![65001, 65010])],
        };
        let (body, _) = route_body(&[Arc::new(path.clone())], false).unwrap();
        assert!(body.message.contains(MessageFlags::ASPATH));
        let mut encoded: Vec<u8> = Vec::new();
        PathAttribute::AS_PATH(path.as_path)
            .encode(&mut encoded)
            .unwrap();
        assert_eq!(body.aspath, encoded[3..].to_vec());
    }

    #[test]
    fn test_route_body_default_route_needs_path_id() {
        let mut path = unicast_path("0.0.0.0/0", "192.0.2.1");
        assert!(route_body(&[Arc::new(path.clone())], false).is_none());

        path.nlri.local_id = 12;
        let (body, _) = route_body(&[Arc::new(path)], false).unwrap();
        assert!(body.message.contains(MessageFlags::PATH_ID));
        assert_eq!(body.path_id, 12);
    }

    #[test]
    fn test_route_body_metric_from_med() {
        let mut path = unicast_path("10.0.0.0/24", "192.0.2.1");
        path.med = Some(200);
        let (body, _) = route_body(&[Arc::new(path)], false).unwrap();
        assert!(body.message.contains(MessageFlags::METRIC));
        assert_eq!(body.metric, 200);
    }

    #[test]
    fn test_route_body_vpn_prefix() {
        let mut path = unicast_path("10.1.0.0/16", "192.0.2.1");
        path.family = Family::ipv4_vpn();
        path.nlri = Nlri::with_rd(
            "10.1.0.0/16".parse().unwrap(),
            RouteDistinguisher::new(100, 1),
        );
        let (body, _) = route_body(&[Arc::new(path)], false).unwrap();
        assert_eq!(body.prefix, "10.1.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(body.prefix_len, 16);
    }

    #[test]
    fn test_path_from_route() {
        let body = RouteBody {
            route_type: RouteType::Kernel,
            flags: RouteFlags::default(),
            message: MessageFlags::NEXTHOP | MessageFlags::METRIC,
            safi: SAFI_UNICAST,
            prefix: "172.16.0.0".parse().unwrap(),
            prefix_len: 12,
            nexthops: vec!["10.0.0.1".parse().unwrap()],
            metric: 20,
            aspath: vec![],
            path_id: 0,
        };
        let header = Header::new(3, 0, Command::Ipv4RouteAdd);
        let path = path_from_route(&header, &body).unwrap();
        assert_eq!(path.nlri.prefix, "172.16.0.0/12".parse::<IpNetwork>().unwrap());
        assert_eq!(path.nexthop, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(path.med, Some(20));
        assert!(matches!(path.origin, Origin::IGP));
        assert!(path.from_external);
        assert!(!path.is_withdraw);

        let header = Header::new(3, 0, Command::Ipv4RouteDelete);
        let path = path_from_route(&header, &body).unwrap();
        assert!(path.is_withdraw);
    }

    #[test]
    fn test_path_from_route_rejects_other_safi() {
        let body = RouteBody {
            route_type: RouteType::Kernel,
            flags: RouteFlags::default(),
            message: MessageFlags::default(),
            safi: 2,
            prefix: "10.0.0.0".parse().unwrap(),
            prefix_len: 8,
            nexthops: vec![],
            metric: 0,
            aspath: vec![],
            path_id: 0,
        };
        let header = Header::new(3, 0, Command::Ipv4RouteAdd);
        assert!(path_from_route(&header, &body).is_none());
    }

    #[test]
    fn test_nexthop_register_body() {
        let (nht, _rx) = crate::nht::test_handle();
        let batch = vec![Arc::new(unicast_path("10.0.0.0/24", "192.0.2.1"))];

        // Disabled tracking yields no body
        let (body, is_withdraw) = nexthop_register_body(&batch, None);
        assert!(body.is_none());
        assert!(!is_withdraw);

        let (body, is_withdraw) = nexthop_register_body(&batch, Some(&nht));
        let body = body.unwrap();
        assert!(!is_withdraw);
        assert_eq!(body.nexthops.len(), 1);
        assert_eq!(body.nexthops[0].family, AF_INET);
        assert_eq!(
            body.nexthops[0].prefix,
            "192.0.2.1".parse::<IpAddr>().unwrap()
        );
        assert!(nht.is_registered(&"192.0.2.1".parse().unwrap()));

        // Second pass for the same nexthop has nothing left to register
        let (body, _) = nexthop_register_body(&batch, Some(&nht));
        assert!(body.is_none());
    }

    #[test]
    fn test_nexthop_register_body_withdraw() {
        let (nht, _rx) = crate::nht::test_handle();
        let mut path = unicast_path("10.0.0.0/24", "192.0.2.1");
        path.is_withdraw = true;
        let (body, is_withdraw) = nexthop_register_body(&[Arc::new(path)], Some(&nht));
        assert!(body.is_none());
        assert!(is_withdraw);
    }

    #[test]
    fn test_families_for_af() {
        assert_eq!(
            families_for_af(AF_INET),
            vec![Family::ipv4_unicast(), Family::ipv4_vpn()]
        );
        assert_eq!(
            families_for_af(AF_INET6),
            vec![Family::ipv6_unicast(), Family::ipv6_vpn()]
        );
        assert!(families_for_af(99).is_empty());
    }

    #[test]
    fn test_nexthop_update_invalidates_paths() {
        let (nht, _rx) = crate::nht::test_handle();
        let bound: PathList = vec![
            Arc::new(unicast_path("10.0.0.0/24", "192.0.2.1")),
            Arc::new(unicast_path("10.0.1.0/24", "192.0.2.1")),
        ];
        let update = NexthopUpdateBody {
            family: AF_INET,
            prefix: "192.0.2.1".parse().unwrap(),
            metric: 0,
            nexthops: vec![],
        };
        let (updated, unregister) = paths_from_nexthop_update(&update, bound.clone(), &nht);
        assert_eq!(updated.len(), 2);
        assert!(updated.iter().all(|p| p.is_nexthop_invalid));
        // Paths are still bound, so no unregister goes out
        assert!(unregister.is_none());

        // The inverse update restores the flag and copies the metric
        let update = NexthopUpdateBody {
            family: AF_INET,
            prefix: "192.0.2.1".parse().unwrap(),
            metric: 15,
            nexthops: vec!["10.255.0.1".parse().unwrap()],
        };
        let (updated, unregister) = paths_from_nexthop_update(&update, updated, &nht);
        assert!(updated.iter().all(|p| !p.is_nexthop_invalid));
        assert!(updated.iter().all(|p| p.med == Some(15) && p.med_from_nexthop));
        assert!(unregister.is_none());
    }

    #[test]
    fn test_nexthop_update_unregisters_unbound() {
        let (nht, _rx) = crate::nht::test_handle();
        let nexthop: IpAddr = "192.0.2.1".parse().unwrap();
        nht.register(nexthop);

        let update = NexthopUpdateBody {
            family: AF_INET,
            prefix: nexthop,
            metric: 0,
            nexthops: vec![],
        };
        let (updated, unregister) = paths_from_nexthop_update(&update, vec![], &nht);
        assert!(updated.is_empty());
        let unregister = unregister.unwrap();
        assert_eq!(unregister.nexthops.len(), 1);
        assert_eq!(unregister.nexthops[0].prefix, nexthop);
        assert!(!nht.is_registered(&nexthop));
    }

    #[test]
    fn test_route_message_roundtrip_attributes() {
        // Ingress a route, then run the resulting path back out
        let inbound = RouteBody {
            route_type: RouteType::Static,
            flags: RouteFlags::default(),
            message: MessageFlags::NEXTHOP | MessageFlags::METRIC,
            safi: SAFI_UNICAST,
            prefix: "198.51.100.0".parse().unwrap(),
            prefix_len: 24,
            nexthops: vec!["10.0.0.1".parse().unwrap()],
            metric: 5,
            aspath: vec![],
            path_id: 0,
        };
        let header = Header::new(3, 0, Command::Ipv4RouteAdd);
        let mut path = path_from_route(&header, &inbound).unwrap();
        // Externally-sourced paths never go back out; locally re-learn it
        path.from_external = false;
        let (outbound, _) = route_body(&[Arc::new(path)], false).unwrap();
        assert_eq!(outbound.prefix, inbound.prefix);
        assert_eq!(outbound.prefix_len, inbound.prefix_len);
        assert_eq!(outbound.nexthops.first(), inbound.nexthops.first());
    }
}
