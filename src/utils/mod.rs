use std::net::IpAddr;

use chrono::{DateTime, Utc};

/// Convert the first 4 bytes of a buffer to an IPv4 address.
/// Shorter buffers are zero-padded (prefixes arrive truncated to
/// their mask length on the wire).
pub fn bytes_to_ipv4(bytes: &[u8]) -> IpAddr {
    let mut buffer: [u8; 4] = [0; 4];
    let len = bytes.len().min(4);
    buffer[..len].clone_from_slice(&bytes[..len]);
    IpAddr::from(buffer)
}

/// Convert the first 16 bytes of a buffer to an IPv6 address.
pub fn bytes_to_ipv6(bytes: &[u8]) -> IpAddr {
    let mut buffer: [u8; 16] = [0; 16];
    let len = bytes.len().min(16);
    buffer[..len].clone_from_slice(&bytes[..len]);
    IpAddr::from(buffer)
}

/// Age of a timestamp, rendered as "hh:mm:ss". Clock skew into the
/// future reads as zero.
pub fn format_age(since: DateTime<Utc>) -> String {
    let seconds = Utc::now()
        .signed_duration_since(since)
        .num_seconds()
        .max(0);
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}
