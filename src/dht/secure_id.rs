//! BEP-42 node identifiers derived from the external address.
//!
//! The top 21 bits of a secure id are taken from CRC32C of the masked IP
//! combined with a 3-bit random `r`, and the last byte carries `r`. Nodes on
//! private or loopback networks are exempt.
//!
//! [BEP-42]: http://bittorrent.org/beps/bep_0042.html

use super::id::Id;
use crate::constants::{BEP42_IPV4_MASK, BEP42_IPV6_MASK, ID_LEN};
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const PREFIX_MASK: u32 = 0xffff_f800;

/// An identifier valid for `ip`; random for local addresses.
pub fn generate_secure_node_id(ip: IpAddr) -> Id {
    if is_local_network(&ip) {
        return Id::generate();
    }

    let r: u8 = rand::rng().random::<u8>() & 0x07;
    let crc = ip_crc(ip, r);

    let mut id = [0u8; ID_LEN];
    rand::rng().fill(&mut id);
    id[0] = (crc >> 24) as u8;
    id[1] = (crc >> 16) as u8;
    id[2] = (id[2] & 0x07) | ((crc >> 8) as u8 & 0xf8);
    id[ID_LEN - 1] = r;

    Id::from(id)
}

/// Whether `id` could have been generated for `ip`.
pub fn validate_node_id(id: &Id, ip: IpAddr) -> bool {
    if is_local_network(&ip) {
        return true;
    }
    let Ok(wire) = id.to_wire() else {
        return false;
    };

    let r = wire[ID_LEN - 1] & 0x07;
    let actual =
        (u32::from(wire[0]) << 24) | (u32::from(wire[1]) << 16) | (u32::from(wire[2]) << 8);
    actual & PREFIX_MASK == ip_crc(ip, r) & PREFIX_MASK
}

fn ip_crc(ip: IpAddr, r: u8) -> u32 {
    match ip {
        IpAddr::V4(ipv4) => {
            let masked = (u32::from(ipv4) & BEP42_IPV4_MASK) | (u32::from(r) << 29);
            crc32c::crc32c(&masked.to_be_bytes())
        }
        IpAddr::V6(ipv6) => {
            let mut high = [0u8; 8];
            high.copy_from_slice(&ipv6.octets()[..8]);
            let masked = (u64::from_be_bytes(high) & BEP42_IPV6_MASK) | (u64::from(r) << 61);
            crc32c::crc32c(&masked.to_be_bytes())
        }
    }
}

/// Private, link-local and loopback ranges of either family.
pub fn is_local_network(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => is_local_ipv4(ipv4),
        IpAddr::V6(ipv6) => is_local_ipv6(ipv6),
    }
}

fn is_local_ipv4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    a == 10
        || (a == 172 && (16..=31).contains(&b))
        || (a == 192 && b == 168)
        || (a == 169 && b == 254)
        || a == 127
}

fn is_local_ipv6(ip: &Ipv6Addr) -> bool {
    let head = ip.segments()[0];
    ip.is_loopback() || head & 0xffc0 == 0xfe80 || head & 0xfe00 == 0xfc00
}
