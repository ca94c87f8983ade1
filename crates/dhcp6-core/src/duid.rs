//! DUID handling: server identity generation and link-layer address
//! extraction from client identifiers.

use std::net::Ipv6Addr;

use rand::Rng;

pub const DUID_LLT: u16 = 1;
pub const DUID_EN: u16 = 2;
pub const DUID_LL: u16 = 3;
pub const DUID_UUID: u16 = 4;

const HTYPE_ETHER: u16 = 1;

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z, the DUID-LLT time base.
const DUID_TIME_EPOCH: u64 = 946_684_800;

/// DUID-LLT: type(2) + hw type(2) + time(4) + MAC(6).
pub fn duid_llt(mac: [u8; 6], unix_now: u64) -> Vec<u8> {
    let time = unix_now.saturating_sub(DUID_TIME_EPOCH) as u32;
    let mut duid = Vec::with_capacity(14);
    duid.extend_from_slice(&DUID_LLT.to_be_bytes());
    duid.extend_from_slice(&HTYPE_ETHER.to_be_bytes());
    duid.extend_from_slice(&time.to_be_bytes());
    duid.extend_from_slice(&mac);
    duid
}

/// DUID-UUID with random content, for hosts without a usable MAC.
pub fn duid_uuid_random() -> Vec<u8> {
    let mut rng = rand::rng();
    let mut uuid: [u8; 16] = rng.random();
    // RFC 4122 version 4, variant 1
    uuid[6] = (uuid[6] & 0x0f) | 0x40;
    uuid[8] = (uuid[8] & 0x3f) | 0x80;
    let mut duid = Vec::with_capacity(18);
    duid.extend_from_slice(&DUID_UUID.to_be_bytes());
    duid.extend_from_slice(&uuid);
    duid
}

/// Server DUID for a fresh installation: DUID-LLT from the first interface
/// with a readable MAC, otherwise a random DUID-UUID.
pub fn generate_server_duid(interfaces: &[String], unix_now: u64) -> Vec<u8> {
    interfaces
        .iter()
        .find_map(|name| read_interface_mac(name))
        .map(|mac| duid_llt(mac, unix_now))
        .unwrap_or_else(duid_uuid_random)
}

/// Extract the Ethernet address from a DHCPv6 DUID.
/// DUID-LLT (type 1) and DUID-LL (type 3) embed one; other types do not.
pub fn hardware_from_duid(duid: &[u8]) -> Option<[u8; 6]> {
    if duid.len() < 4 {
        return None;
    }
    let duid_type = u16::from_be_bytes([duid[0], duid[1]]);
    let hw_type = u16::from_be_bytes([duid[2], duid[3]]);
    if hw_type != HTYPE_ETHER {
        return None;
    }

    let mac = match duid_type {
        DUID_LLT if duid.len() >= 14 => &duid[8..14],
        DUID_LL if duid.len() >= 10 => &duid[4..10],
        _ => return None,
    };
    mac.try_into().ok()
}

/// Extract the MAC address from an EUI-64 link-local address.
pub fn hardware_from_link_local(addr: &Ipv6Addr) -> Option<[u8; 6]> {
    let octets = addr.octets();
    if octets[0] != 0xfe || (octets[1] & 0xc0) != 0x80 {
        return None;
    }
    // EUI-64 carries ff:fe in the middle
    if octets[11] != 0xff || octets[12] != 0xfe {
        return None;
    }
    Some([octets[8] ^ 0x02, octets[9], octets[10], octets[13], octets[14], octets[15]])
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = s.trim().split([':', '-']).collect();
    if parts.len() != 6 {
        return None;
    }
    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(mac)
}

pub fn read_interface_mac(interface: &str) -> Option<[u8; 6]> {
    let path = format!("/sys/class/net/{}/address", interface);
    let content = std::fs::read_to_string(path).ok()?;
    let mac = parse_mac(&content)?;
    (mac != [0; 6]).then_some(mac)
}
