pub mod client;
pub mod codec;

pub use client::ZservClient;
pub use codec::ZservCodec;

use std::fmt;
use std::io::{self, Cursor};
use std::net::IpAddr;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use bgp_rs::AFI;
use byteorder::{NetworkEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};

use crate::utils::{bytes_to_ipv4, bytes_to_ipv6};

/// Protocol version spoken when the config doesn't pin one
pub const DEFAULT_VERSION: u8 = 3;

pub const HEADER_MARKER: u8 = 255;
// length(2) + marker(1) + version(1) + vrf_id(2) + command(2)
pub const HEADER_SIZE: usize = 8;

/// Address family constants as carried in nexthop registration entries
pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

pub const VRF_DEFAULT: u16 = 0;
pub const SAFI_UNICAST: u8 = 1;

/// Commands understood on the RIB daemon link
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    InterfaceAdd,
    Ipv4RouteAdd,
    Ipv4RouteDelete,
    Ipv6RouteAdd,
    Ipv6RouteDelete,
    RedistributeAdd,
    RouterIdAdd,
    Hello,
    NexthopRegister,
    NexthopUnregister,
    NexthopUpdate,
    VrfRegister,
    VrfUnregister,
    Unknown(u16),
}

impl Command {
    pub fn code(self) -> u16 {
        use Command::*;
        match self {
            InterfaceAdd => 1,
            Ipv4RouteAdd => 7,
            Ipv4RouteDelete => 8,
            Ipv6RouteAdd => 9,
            Ipv6RouteDelete => 10,
            RedistributeAdd => 11,
            RouterIdAdd => 20,
            Hello => 23,
            NexthopRegister => 27,
            NexthopUnregister => 28,
            NexthopUpdate => 29,
            VrfRegister => 30,
            VrfUnregister => 31,
            Unknown(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Command {
        use Command::*;
        match code {
            1 => InterfaceAdd,
            7 => Ipv4RouteAdd,
            8 => Ipv4RouteDelete,
            9 => Ipv6RouteAdd,
            10 => Ipv6RouteDelete,
            11 => RedistributeAdd,
            20 => RouterIdAdd,
            23 => Hello,
            27 => NexthopRegister,
            28 => NexthopUnregister,
            29 => NexthopUpdate,
            30 => VrfRegister,
            31 => VrfUnregister,
            other => Unknown(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Protocol types accepted in redistribute subscriptions
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteType {
    System,
    Kernel,
    Connect,
    Static,
    Rip,
    Ripng,
    Ospf,
    Ospf6,
    Isis,
    Bgp,
}

impl RouteType {
    pub fn code(self) -> u8 {
        use RouteType::*;
        match self {
            System => 0,
            Kernel => 1,
            Connect => 2,
            Static => 3,
            Rip => 4,
            Ripng => 5,
            Ospf => 6,
            Ospf6 => 7,
            Isis => 8,
            Bgp => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<RouteType> {
        use RouteType::*;
        match code {
            0 => Some(System),
            1 => Some(Kernel),
            2 => Some(Connect),
            3 => Some(Static),
            4 => Some(Rip),
            5 => Some(Ripng),
            6 => Some(Ospf),
            7 => Some(Ospf6),
            8 => Some(Isis),
            9 => Some(Bgp),
            _ => None,
        }
    }
}

impl FromStr for RouteType {
    type Err = io::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        use RouteType::*;
        match value.to_lowercase().as_str() {
            "system" => Ok(System),
            "kernel" => Ok(Kernel),
            "connect" => Ok(Connect),
            "static" => Ok(Static),
            "rip" => Ok(Rip),
            "ripng" => Ok(Ripng),
            "ospf" => Ok(Ospf),
            "ospf6" => Ok(Ospf6),
            "isis" => Ok(Isis),
            "bgp" => Ok(Bgp),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Unknown route type: '{}'", value),
            )),
        }
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = format!("{:?}", self).to_lowercase();
        write!(f, "{}", name)
    }
}

/// Bitset describing which optional fields a route message carries
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NEXTHOP: MessageFlags = MessageFlags(0x01);
    pub const IFINDEX: MessageFlags = MessageFlags(0x02);
    pub const DISTANCE: MessageFlags = MessageFlags(0x04);
    pub const METRIC: MessageFlags = MessageFlags(0x08);
    pub const ASPATH: MessageFlags = MessageFlags(0x10);
    pub const PATH_ID: MessageFlags = MessageFlags(0x20);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for MessageFlags {
    fn bitor_assign(&mut self, rhs: MessageFlags) {
        self.0 |= rhs.0;
    }
}

/// Route flag bitset mirroring the RIB daemon's route properties
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RouteFlags(u8);

impl RouteFlags {
    pub const INTERNAL: RouteFlags = RouteFlags(0x01);
    pub const SELFROUTE: RouteFlags = RouteFlags(0x02);
    pub const BLACKHOLE: RouteFlags = RouteFlags(0x04);
    pub const IBGP: RouteFlags = RouteFlags(0x08);
    pub const REJECT: RouteFlags = RouteFlags(0x80);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn contains(self, other: RouteFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RouteFlags {
    type Output = RouteFlags;

    fn bitor(self, rhs: RouteFlags) -> RouteFlags {
        RouteFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for RouteFlags {
    fn bitor_assign(&mut self, rhs: RouteFlags) {
        self.0 |= rhs.0;
    }
}

/// Route message body exchanged with the RIB daemon
#[derive(Clone, Debug, PartialEq)]
pub struct RouteBody {
    pub route_type: RouteType,
    pub flags: RouteFlags,
    pub message: MessageFlags,
    pub safi: u8,
    pub prefix: IpAddr,
    pub prefix_len: u8,
    pub nexthops: Vec<IpAddr>,
    pub metric: u32,
    /// AS_PATH attribute value with the attribute envelope stripped
    pub aspath: Vec<u8>,
    pub path_id: u32,
}

fn put_addr(buf: &mut BytesMut, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => buf.put_slice(&v4.octets()),
        IpAddr::V6(v6) => buf.put_slice(&v6.octets()),
    }
}

fn read_addr(cursor: &mut Cursor<&[u8]>, afi: AFI, len: usize) -> io::Result<IpAddr> {
    let mut bytes = vec![0; len];
    std::io::Read::read_exact(cursor, &mut bytes)?;
    Ok(match afi {
        AFI::IPV4 => bytes_to_ipv4(&bytes),
        _ => bytes_to_ipv6(&bytes),
    })
}

fn addr_width(afi: AFI) -> usize {
    match afi {
        AFI::IPV4 => 4,
        _ => 16,
    }
}

impl RouteBody {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.route_type.code());
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.message.bits());
        buf.put_u8(self.safi);
        buf.put_u8(self.prefix_len);
        // The prefix is truncated to its mask length on the wire
        let plen_bytes = ((self.prefix_len as usize) + 7) / 8;
        match self.prefix {
            IpAddr::V4(v4) => buf.put_slice(&v4.octets()[..plen_bytes]),
            IpAddr::V6(v6) => buf.put_slice(&v6.octets()[..plen_bytes]),
        }
        if self.message.contains(MessageFlags::NEXTHOP) {
            buf.put_u8(self.nexthops.len() as u8);
            for nexthop in &self.nexthops {
                put_addr(buf, nexthop);
            }
        }
        if self.message.contains(MessageFlags::METRIC) {
            buf.put_u32(self.metric);
        }
        if self.message.contains(MessageFlags::ASPATH) {
            buf.put_u16(self.aspath.len() as u16);
            buf.put_slice(&self.aspath);
        }
        if self.message.contains(MessageFlags::PATH_ID) {
            buf.put_u32(self.path_id);
        }
    }

    pub fn decode(data: &[u8], afi: AFI) -> io::Result<RouteBody> {
        let mut cursor = Cursor::new(data);
        let route_type_code = cursor.read_u8()?;
        let flags = RouteFlags::from_bits(cursor.read_u8()?);
        let message = MessageFlags::from_bits(cursor.read_u8()?);
        let safi = cursor.read_u8()?;
        let prefix_len = cursor.read_u8()?;
        let prefix = read_addr(&mut cursor, afi, ((prefix_len as usize) + 7) / 8)?;

        let mut nexthops = Vec::new();
        if message.contains(MessageFlags::NEXTHOP) {
            let count = cursor.read_u8()?;
            for _ in 0..count {
                nexthops.push(read_addr(&mut cursor, afi, addr_width(afi))?);
            }
        }
        let metric = if message.contains(MessageFlags::METRIC) {
            cursor.read_u32::<NetworkEndian>()?
        } else {
            0
        };
        let aspath = if message.contains(MessageFlags::ASPATH) {
            let len = cursor.read_u16::<NetworkEndian>()? as usize;
            let mut bytes = vec![0; len];
            std::io::Read::read_exact(&mut cursor, &mut bytes)?;
            bytes
        } else {
            Vec::new()
        };
        let path_id = if message.contains(MessageFlags::PATH_ID) {
            cursor.read_u32::<NetworkEndian>()?
        } else {
            0
        };

        let route_type =
            RouteType::from_code(route_type_code).unwrap_or(RouteType::System);
        Ok(RouteBody {
            route_type,
            flags,
            message,
            safi,
            prefix,
            prefix_len,
            nexthops,
            metric,
            aspath,
            path_id,
        })
    }
}

/// A single nexthop registration entry
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegisteredNexthop {
    pub family: u16,
    pub prefix: IpAddr,
}

/// Body of NEXTHOP_REGISTER / NEXTHOP_UNREGISTER messages
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NexthopRegisterBody {
    pub nexthops: Vec<RegisteredNexthop>,
}

impl NexthopRegisterBody {
    pub fn encode(&self, buf: &mut BytesMut) {
        for entry in &self.nexthops {
            buf.put_u16(entry.family);
            match entry.prefix {
                IpAddr::V4(_) => buf.put_u8(32),
                IpAddr::V6(_) => buf.put_u8(128),
            }
            put_addr(buf, &entry.prefix);
        }
    }

    pub fn decode(data: &[u8]) -> io::Result<NexthopRegisterBody> {
        let mut cursor = Cursor::new(data);
        let mut nexthops = Vec::new();
        while (cursor.position() as usize) < data.len() {
            let family = cursor.read_u16::<NetworkEndian>()?;
            let _prefix_len = cursor.read_u8()?;
            let afi = family_to_afi(family)?;
            let prefix = read_addr(&mut cursor, afi, addr_width(afi))?;
            nexthops.push(RegisteredNexthop { family, prefix });
        }
        Ok(NexthopRegisterBody { nexthops })
    }
}

/// Body of NEXTHOP_UPDATE messages from the RIB daemon
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NexthopUpdateBody {
    pub family: u16,
    /// The registered nexthop address this update is about
    pub prefix: IpAddr,
    pub metric: u32,
    /// Resolved nexthops; empty means the address became unreachable
    pub nexthops: Vec<IpAddr>,
}

impl NexthopUpdateBody {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.family);
        match self.prefix {
            IpAddr::V4(_) => buf.put_u8(32),
            IpAddr::V6(_) => buf.put_u8(128),
        }
        put_addr(buf, &self.prefix);
        buf.put_u32(self.metric);
        buf.put_u8(self.nexthops.len() as u8);
        for nexthop in &self.nexthops {
            put_addr(buf, nexthop);
        }
    }

    pub fn decode(data: &[u8]) -> io::Result<NexthopUpdateBody> {
        let mut cursor = Cursor::new(data);
        let family = cursor.read_u16::<NetworkEndian>()?;
        let _prefix_len = cursor.read_u8()?;
        let afi = family_to_afi(family)?;
        let prefix = read_addr(&mut cursor, afi, addr_width(afi))?;
        let metric = cursor.read_u32::<NetworkEndian>()?;
        let count = cursor.read_u8()?;
        let mut nexthops = Vec::with_capacity(count as usize);
        for _ in 0..count {
            nexthops.push(read_addr(&mut cursor, afi, addr_width(afi))?);
        }
        Ok(NexthopUpdateBody {
            family,
            prefix,
            metric,
            nexthops,
        })
    }
}

fn family_to_afi(family: u16) -> io::Result<AFI> {
    match family {
        AF_INET => Ok(AFI::IPV4),
        AF_INET6 => Ok(AFI::IPV6),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Unsupported address family on wire: {}", other),
        )),
    }
}

/// Message bodies, tagged by the command in the header
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Route(RouteBody),
    NexthopRegister(NexthopRegisterBody),
    NexthopUpdate(NexthopUpdateBody),
    RouteType(RouteType),
    Unknown(Vec<u8>),
    Empty,
}

impl Body {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Body::Route(body) => body.encode(buf),
            Body::NexthopRegister(body) => body.encode(buf),
            Body::NexthopUpdate(body) => body.encode(buf),
            Body::RouteType(route_type) => buf.put_u8(route_type.code()),
            Body::Unknown(data) => buf.put_slice(data),
            Body::Empty => (),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub length: u16,
    pub marker: u8,
    pub version: u8,
    pub vrf_id: u16,
    pub command: Command,
}

impl Header {
    pub fn new(version: u8, vrf_id: u16, command: Command) -> Self {
        Self {
            // Filled in by the codec once the body size is known
            length: 0,
            marker: HEADER_MARKER,
            version,
            vrf_id,
            command,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

impl Message {
    pub fn new(version: u8, vrf_id: u16, command: Command, body: Body) -> Self {
        Self {
            header: Header::new(version, vrf_id, command),
            body,
        }
    }
}
