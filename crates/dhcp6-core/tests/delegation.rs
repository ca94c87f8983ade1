mod common;

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;

use common::*;
use dhcp6_core::config::{HostConfig, Permit};
use dhcp6_core::policy::PrefixLengthMode;
use dhcp6_core::store::IaKey;
use dhcp6_core::wire::{IaKind, IaPrefix, StatusCode, MSG_REBIND, MSG_RENEW, MSG_REQUEST, MSG_SOLICIT};

fn delegated(reply: &dhcp6_core::wire::ClientMessage) -> Vec<IaPrefix> {
    ias(reply, IaKind::Pd)[0].prefixes()
}

fn pd_pool() -> Ipv6Net {
    "2001:db8:100::/40".parse().unwrap()
}

// ── Prefix delegation ───────────────────────────────────────────────────────

#[test]
fn test_solicit_gets_prefix_from_pool() {
    let mut h = Harness::new(&office_config());
    let advertise = h
        .exchange(&Packet::from_client(MSG_SOLICIT, &CLIENT_A).ia_pd(7, &[("::", 56)]))
        .unwrap();
    let prefixes = delegated(&advertise);
    assert_eq!(prefixes.len(), 1);
    assert_eq!(prefixes[0].prefix_len, 56);
    assert!(pd_pool().contains(&prefixes[0].prefix));
    assert_eq!((prefixes[0].preferred, prefixes[0].valid), (1800, 3600));

    let ia = &ias(&advertise, IaKind::Pd)[0];
    assert_eq!((ia.iaid, ia.t1, ia.t2), (7, 900, 1440));
}

#[test]
fn test_request_commits_prefix() {
    let mut h = Harness::new(&office_config());
    let offered = delegated(
        &h.exchange(&Packet::from_client(MSG_SOLICIT, &CLIENT_A).ia_pd(7, &[])).unwrap(),
    )[0];

    let reply = h
        .exchange(
            &Packet::from_client(MSG_REQUEST, &CLIENT_A)
                .server_id()
                .ia_pd(7, &[(offered.prefix.to_string().as_str(), 56)]),
        )
        .unwrap();
    assert_eq!(delegated(&reply)[0].prefix, offered.prefix);

    let records = h.leases.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, IaKind::Pd);
    assert_eq!(records[0].bindings[0].prefix_len, 56);
    assert!(h.server.store().ia(&IaKey::new(IaKind::Pd, 7, &CLIENT_A)).is_some());

    // Renew of a prefix the router does not hold
    let renew = h
        .exchange(
            &Packet::from_client(MSG_RENEW, &CLIENT_A)
                .server_id()
                .ia_pd(7, &[("2001:db8:1ff::", 56)]),
        )
        .unwrap();
    let ia = &ias(&renew, IaKind::Pd)[0];
    assert!(ia.prefixes().is_empty());
    assert_eq!(status(&ia.options).unwrap().0, StatusCode::NoBinding.code());
}

#[test]
fn test_exact_length_mode_refuses_other_lengths() {
    let mut h = Harness::new(&office_config());
    let advertise = h
        .exchange(&Packet::from_client(MSG_SOLICIT, &CLIENT_A).ia_pd(7, &[("::", 60)]))
        .unwrap();
    let ia = &ias(&advertise, IaKind::Pd)[0];
    assert!(ia.prefixes().is_empty());
    assert_eq!(status(&ia.options).unwrap().0, StatusCode::NoPrefixAvail.code());
}

#[test]
fn test_prefix_length_modes() {
    let cases = [
        (PrefixLengthMode::Prefer, 60, true),
        (PrefixLengthMode::Ignore, 64, true),
        (PrefixLengthMode::Minimum, 48, true),
        (PrefixLengthMode::Minimum, 60, false),
        (PrefixLengthMode::Maximum, 60, true),
        (PrefixLengthMode::Maximum, 48, false),
    ];
    for (mode, hint, granted) in cases {
        let mut config = office_config();
        config.options.prefix_length_mode = Some(mode);
        let mut h = Harness::new(&config);
        let advertise = h
            .exchange(&Packet::from_client(MSG_SOLICIT, &CLIENT_A).ia_pd(7, &[("::", hint)]))
            .unwrap();
        let prefixes = delegated(&advertise);
        assert_eq!(!prefixes.is_empty(), granted, "{:?} with /{}", mode, hint);
        if granted {
            assert_eq!(prefixes[0].prefix_len, 56);
        }
    }
}

#[test]
fn test_rebind_prefix_from_elsewhere_is_zeroed() {
    let mut h = Harness::new(&office_config());
    let reply = h
        .exchange(&Packet::from_client(MSG_REBIND, &CLIENT_A).ia_pd(7, &[("2001:db9:100::", 56)]))
        .unwrap();
    let prefixes = delegated(&reply);
    let foreign = prefixes
        .iter()
        .find(|p| p.prefix == "2001:db9:100::".parse::<Ipv6Addr>().unwrap())
        .unwrap();
    assert_eq!((foreign.preferred, foreign.valid), (0, 0));
}

// ── Host reservations ───────────────────────────────────────────────────────

#[test]
fn test_reserved_address() {
    let mut h = Harness::new(&office_config());
    let fixed: Ipv6Addr = "2001:db8:1::10".parse().unwrap();

    let advertise = h.exchange(&Packet::from_client(MSG_SOLICIT, &PRINTER).ia_na(1, &[])).unwrap();
    assert_eq!(leased_address(&advertise).address, fixed);

    // a hint other than the reservation is ignored
    let reply = h
        .exchange(
            &Packet::from_client(MSG_REQUEST, &PRINTER)
                .server_id()
                .ia_na(1, &["2001:db8:1::77"]),
        )
        .unwrap();
    let ia = &ias(&reply, IaKind::Na)[0];
    assert_eq!(addresses(ia), [fixed]);
    assert!(status(&ia.options).is_none());

    // reservations are not written to the lease file, but the hook hears of them
    assert!(h.leases.records().is_empty());
    let events = h.hooks.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "commit");
    assert!(events[0].1.fixed);
    assert_eq!(events[0].1.address, fixed);
}

#[test]
fn test_reserved_address_is_not_leased_to_others() {
    let mut h = Harness::new(&office_config());
    let advertise = h
        .exchange(&Packet::from_client(MSG_SOLICIT, &CLIENT_A).ia_na(1, &["2001:db8:1::10"]))
        .unwrap();
    assert_ne!(leased_address(&advertise).address, "2001:db8:1::10".parse::<Ipv6Addr>().unwrap());
}

#[test]
fn test_renew_of_address_besides_reservation() {
    let mut h = Harness::new(&office_config());
    let reply = h
        .exchange(
            &Packet::from_client(MSG_RENEW, &PRINTER)
                .server_id()
                .ia_na(1, &["2001:db8:1::77"]),
        )
        .unwrap();
    let ia = &ias(&reply, IaKind::Na)[0];
    assert!(ia.addresses().is_empty());
    assert_eq!(status(&ia.options).unwrap().0, StatusCode::NoBinding.code());
}

#[test]
fn test_reserved_prefix() {
    let mut h = Harness::new(&office_config());
    let reply = h
        .exchange(&Packet::from_client(MSG_REQUEST, &ROUTER).server_id().ia_pd(3, &[]))
        .unwrap();
    let prefixes = delegated(&reply);
    assert_eq!(prefixes.len(), 1);
    assert_eq!(prefixes[0].prefix, "2001:db8:ff00::".parse::<Ipv6Addr>().unwrap());
    assert_eq!(prefixes[0].prefix_len, 48);

    let events = h.hooks.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].1.fixed);
    assert_eq!(events[0].1.prefix_len, 48);
    assert!(h.leases.records().is_empty());
}

// ── Temporary addresses ─────────────────────────────────────────────────────

#[test]
fn test_temporary_address() {
    let mut h = Harness::new(&office_config());
    let pool: Ipv6Net = "2001:db8:1:0:ffff::/80".parse().unwrap();

    let reply = h
        .exchange(&Packet::from_client(MSG_REQUEST, &CLIENT_A).server_id().ia_ta(4, &[]))
        .unwrap();
    let ta = ias(&reply, IaKind::Ta);
    assert_eq!(ta.len(), 1);
    assert_eq!(ta[0].iaid, 4);
    let addrs = addresses(&ta[0]);
    assert_eq!(addrs.len(), 1);
    assert!(pool.contains(&addrs[0]));

    let records = h.leases.records();
    assert_eq!(records[0].kind, IaKind::Ta);
    assert_eq!(records[0].bindings[0].address, addrs[0]);
}

#[test]
fn test_temporary_hint_off_link_voids_the_list() {
    let mut h = Harness::new(&office_config());
    let advertise = h
        .exchange(
            &Packet::from_client(MSG_SOLICIT, &CLIENT_A)
                .ia_ta(4, &["2001:db8:1:0:ffff::99", "2001:db9::1"]),
        )
        .unwrap();
    let addrs = addresses(&ias(&advertise, IaKind::Ta)[0]);
    // a fresh address replaces everything the client listed
    assert_eq!(addrs.len(), 1);
    assert_ne!(addrs[0], "2001:db8:1:0:ffff::99".parse::<Ipv6Addr>().unwrap());
}

// ── Pond permits ────────────────────────────────────────────────────────────

#[test]
fn test_pond_for_known_clients_only() {
    let mut config = office_config();
    config.shared_networks[0].ponds[0].permit = vec![Permit::KnownClients];
    let laptop: HostConfig =
        serde_json::from_str(&format!(r#"{{ "name": "laptop", "duid": "{}" }}"#, hex::encode(CLIENT_B))).unwrap();
    config.hosts.push(laptop);
    let mut h = Harness::new(&config);

    let stranger = h.exchange(&Packet::from_client(MSG_SOLICIT, &CLIENT_A).ia_na(1, &[])).unwrap();
    let ia = &ias(&stranger, IaKind::Na)[0];
    assert_eq!(status(&ia.options).unwrap().0, StatusCode::NoAddrsAvail.code());

    let known = h.exchange(&Packet::from_client(MSG_SOLICIT, &CLIENT_B).ia_na(1, &[])).unwrap();
    let pool: Ipv6Net = "2001:db8:1::/80".parse().unwrap();
    assert!(pool.contains(&leased_address(&known).address));
}
