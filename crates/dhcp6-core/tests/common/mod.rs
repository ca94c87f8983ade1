#![allow(dead_code)]

use std::net::{Ipv6Addr, SocketAddrV6};

use bytes::Bytes;

use dhcp6_core::config::Config;
use dhcp6_core::hooks::RecordingHooks;
use dhcp6_core::leasefile::{LeaseStore, LoadedLeases, MemoryLeaseStore};
use dhcp6_core::wire::{
    parse_status, ClientMessage, IaAddress, IaKind, IaPrefix, IaRequest, Message, OptionWriter, Options,
    RelayMessage, MSG_RELAY_FORW, OPT_CLIENTID, OPT_IAADDR, OPT_IAPREFIX, OPT_ORO, OPT_RELAY_MSG, OPT_SERVERID,
    OPT_STATUS_CODE,
};
use dhcp6_core::{Dhcp6Server, Inbound, Outbound};

pub const NOW: u64 = 1_700_000_000;

pub const SERVER_DUID: [u8; 10] = [0, 3, 0, 1, 0x02, 0, 0, 0, 0, 0x01];
pub const CLIENT_A: [u8; 10] = [0, 3, 0, 1, 0x52, 0x54, 0, 0, 0, 0xa1];
pub const CLIENT_B: [u8; 10] = [0, 3, 0, 1, 0x52, 0x54, 0, 0, 0, 0xb2];
pub const PRINTER: [u8; 10] = [0, 3, 0, 1, 0x52, 0x54, 0, 0, 0, 0x10];
pub const ROUTER: [u8; 10] = [0, 3, 0, 1, 0x52, 0x54, 0, 0, 0, 0x20];

/// Two shared networks: "office" on eth0 with address, temporary and /56
/// prefix pools, and "branch" reached through a relay. Two reservations.
pub fn office_config() -> Config {
    let json = format!(
        r#"{{
            "server": {{ "interfaces": ["eth0"], "server_duid": "{server}" }},
            "options": {{
                "default_lease_time": 3600,
                "preferred_lifetime": 1800,
                "renewal_time": 900,
                "rebinding_time": 1440,
                "dns_servers": ["2001:db8:1::53"],
                "domain_search": ["example.com"]
            }},
            "shared_networks": [
                {{
                    "name": "office",
                    "interfaces": ["eth0"],
                    "subnets": ["2001:db8:1::/64"],
                    "ponds": [{{ "pools": [
                        {{ "type": "na", "network": "2001:db8:1::/80" }},
                        {{ "type": "ta", "network": "2001:db8:1:0:ffff::/80" }},
                        {{ "type": "pd", "network": "2001:db8:100::/40", "prefix_len": 56 }}
                    ] }}]
                }},
                {{
                    "name": "branch",
                    "subnets": ["2001:db8:2::/64"],
                    "options": {{ "preference": 200 }},
                    "ponds": [{{ "pools": [
                        {{ "type": "na", "network": "2001:db8:2::/64" }}
                    ] }}]
                }}
            ],
            "hosts": [
                {{ "name": "printer", "duid": "{printer}", "fixed_address": "2001:db8:1::10" }},
                {{ "name": "router", "duid": "{router}", "fixed_prefixes": ["2001:db8:ff00::/48"] }}
            ]
        }}"#,
        server = hex::encode(SERVER_DUID),
        printer = hex::encode(PRINTER),
        router = hex::encode(ROUTER),
    );
    Config::parse(&json).unwrap()
}

pub struct Harness {
    pub server: Dhcp6Server,
    pub leases: MemoryLeaseStore,
    pub hooks: RecordingHooks,
}

impl Harness {
    pub fn new(config: &Config) -> Self {
        Self::with_leases(config, LoadedLeases::default())
    }

    pub fn with_leases(config: &Config, loaded: LoadedLeases) -> Self {
        let leases = MemoryLeaseStore::new();
        let hooks = RecordingHooks::new();
        let store: Box<dyn LeaseStore> = Box::new(leases.clone());
        let server = Dhcp6Server::new(config, loaded, store, Box::new(hooks.clone())).unwrap();
        Self { server, leases, hooks }
    }

    /// Send `payload` from a directly attached client on eth0.
    pub fn send(&mut self, payload: &[u8], now: u64) -> Option<Outbound> {
        let inbound = Inbound {
            payload,
            source: SocketAddrV6::new("fe80::5054:ff:fe00:a1".parse().unwrap(), 546, 0, 2),
            interface: "eth0",
            unicast: false,
        };
        self.server.dispatch(&inbound, now)
    }

    pub fn exchange(&mut self, packet: &Packet) -> Option<ClientMessage> {
        self.exchange_at(packet, NOW)
    }

    pub fn exchange_at(&mut self, packet: &Packet, now: u64) -> Option<ClientMessage> {
        let out = self.send(&packet.encode(), now)?;
        assert_eq!(out.destination.port(), 546);
        Some(client_message(&out.payload))
    }

    pub fn hook_tags(&self) -> Vec<&'static str> {
        self.hooks.events().into_iter().map(|(tag, _)| tag).collect()
    }
}

pub fn client_message(data: &[u8]) -> ClientMessage {
    match Message::parse(data).unwrap() {
        Message::Client(msg) => msg,
        Message::Relay(relay) => panic!("expected a client message, got relay type {}", relay.msg_type),
    }
}

pub fn relay_message(data: &[u8]) -> RelayMessage {
    match Message::parse(data).unwrap() {
        Message::Relay(relay) => relay,
        Message::Client(msg) => panic!("expected a relay message, got type {}", msg.msg_type),
    }
}

// ── Client packet builder ───────────────────────────────────────────────────

pub struct Packet {
    pub msg_type: u8,
    pub xid: [u8; 3],
    pub options: Vec<(u16, Vec<u8>)>,
}

impl Packet {
    pub fn new(msg_type: u8) -> Self {
        Self {
            msg_type,
            xid: [0x12, 0x34, 0x56],
            options: Vec::new(),
        }
    }

    /// A client message with the client identifier set.
    pub fn from_client(msg_type: u8, duid: &[u8]) -> Self {
        Self::new(msg_type).option(OPT_CLIENTID, duid)
    }

    pub fn option(mut self, code: u16, data: &[u8]) -> Self {
        self.options.push((code, data.to_vec()));
        self
    }

    pub fn server_id(self) -> Self {
        self.option(OPT_SERVERID, &SERVER_DUID)
    }

    pub fn oro(self, codes: &[u16]) -> Self {
        let data: Vec<u8> = codes.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.option(OPT_ORO, &data)
    }

    pub fn ia(self, kind: IaKind, iaid: u32, sub: &[(u16, Bytes)]) -> Self {
        let data = ia_body(kind, iaid, sub);
        self.option(kind.option_code(), &data)
    }

    pub fn ia_na(self, iaid: u32, addrs: &[&str]) -> Self {
        let sub: Vec<(u16, Bytes)> = addrs.iter().map(|a| (OPT_IAADDR, iaaddr(a, 0, 0))).collect();
        self.ia(IaKind::Na, iaid, &sub)
    }

    pub fn ia_ta(self, iaid: u32, addrs: &[&str]) -> Self {
        let sub: Vec<(u16, Bytes)> = addrs.iter().map(|a| (OPT_IAADDR, iaaddr(a, 0, 0))).collect();
        self.ia(IaKind::Ta, iaid, &sub)
    }

    /// IA_PD with `(prefix, length)` hints; `"::"` states only a length.
    pub fn ia_pd(self, iaid: u32, prefixes: &[(&str, u8)]) -> Self {
        let sub: Vec<(u16, Bytes)> = prefixes
            .iter()
            .map(|(p, len)| (OPT_IAPREFIX, iaprefix(p, *len, 0, 0)))
            .collect();
        self.ia(IaKind::Pd, iaid, &sub)
    }

    pub fn encode(&self) -> Bytes {
        let mut w = OptionWriter::client_message(self.msg_type, self.xid, 65535).unwrap();
        for (code, data) in &self.options {
            w.put_option(*code, data).unwrap();
        }
        w.freeze()
    }
}

pub fn iaaddr(addr: &str, preferred: u32, valid: u32) -> Bytes {
    IaAddress {
        address: addr.parse().unwrap(),
        preferred,
        valid,
    }
    .encode()
}

pub fn iaprefix(prefix: &str, prefix_len: u8, preferred: u32, valid: u32) -> Bytes {
    IaPrefix {
        preferred,
        valid,
        prefix_len,
        prefix: prefix.parse().unwrap(),
    }
    .encode()
}

pub fn ia_body(kind: IaKind, iaid: u32, sub: &[(u16, Bytes)]) -> Bytes {
    let mut w = OptionWriter::new(65535);
    w.put_u32(iaid).unwrap();
    if kind != IaKind::Ta {
        w.put_u32(0).unwrap();
        w.put_u32(0).unwrap();
    }
    for (code, data) in sub {
        w.put_option(*code, data).unwrap();
    }
    w.freeze()
}

/// Relay-forward around `inner`.
pub fn relay_forward(link: &str, peer: &str, inner: &[u8], extra: &[(u16, &[u8])]) -> Bytes {
    let link: Ipv6Addr = link.parse().unwrap();
    let peer: Ipv6Addr = peer.parse().unwrap();
    let mut w = OptionWriter::relay_message(MSG_RELAY_FORW, 0, link, peer, 65535).unwrap();
    for (code, data) in extra {
        w.put_option(*code, data).unwrap();
    }
    w.put_option(OPT_RELAY_MSG, inner).unwrap();
    w.freeze()
}

// ── Reply inspection ────────────────────────────────────────────────────────

pub fn ias(msg: &ClientMessage, kind: IaKind) -> Vec<IaRequest> {
    IaRequest::all(kind, &msg.options).unwrap()
}

pub fn status(options: &Options) -> Option<(u16, String)> {
    options.get(OPT_STATUS_CODE).and_then(|data| parse_status(data))
}

pub fn addresses(ia: &IaRequest) -> Vec<Ipv6Addr> {
    ia.addresses().iter().map(|a| a.address).collect()
}

/// The one address of the first IA_NA.
pub fn leased_address(msg: &ClientMessage) -> IaAddress {
    let ia = &ias(msg, IaKind::Na)[0];
    let addrs = ia.addresses();
    assert_eq!(addrs.len(), 1, "expected one address in {:?}", ia);
    addrs[0]
}

pub fn option_codes(msg: &ClientMessage) -> Vec<u16> {
    msg.options.iter().map(|o| o.code).collect()
}
