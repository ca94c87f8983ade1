//! Address and prefix selection.
//!
//! Candidates are derived by hashing the client's identity into the pool
//! range instead of scanning it, so even /64 pools are cheap to allocate
//! from. A collision rehashes with the colliding candidate appended to the
//! seed, up to a number of attempts scaled to the pool. Small delegation
//! pools are swept in order once hashing gives up.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::AllocError;
use crate::policy::PrefixLengthMode;
use crate::store::{BindingStore, IaKey, LeaseId};
use crate::topology::{is_masked, Pond, Pool, Requester, SharedNetworkId, Topology};
use crate::wire::IaKind;

const ADDRESS_ATTEMPTS: u32 = 100;
const PREFIX_ATTEMPTS: u32 = 10;

/// Who is asking for a binding, and on which shared network.
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest<'a> {
    pub key: &'a IaKey,
    pub shared: SharedNetworkId,
    pub requester: Requester<'a>,
}

// ── Candidate derivation ────────────────────────────────────────────────────

fn digest(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn host_mask(prefix_len: u8) -> u128 {
    if prefix_len >= 128 { 0 } else { u128::MAX >> prefix_len }
}

fn combine(network: &Ipv6Net, random: &[u8; 32]) -> u128 {
    let mut low = [0u8; 16];
    low.copy_from_slice(&random[..16]);
    let mask = host_mask(network.prefix_len());
    (u128::from(network.network()) & !mask) | (u128::from_be_bytes(low) & mask)
}

/// Address inside `network` derived from `seed`.
pub fn build_address(network: &Ipv6Net, seed: &[u8]) -> Ipv6Addr {
    let mut octets = combine(network, &digest(&[seed])).to_be_bytes();
    // a derived interface identifier is never universal
    if network.prefix_len() == 64 {
        octets[8] &= !0x02;
    }
    Ipv6Addr::from(octets)
}

/// Temporary address (RFC 4941 style): the hash also covers a history value
/// that moves on with every derivation.
pub fn build_temporary(network: &Ipv6Net, seed: &[u8], history: &mut [u8; 8]) -> Ipv6Addr {
    let random = digest(&[seed, history.as_slice()]);
    let mut octets = combine(network, &random).to_be_bytes();
    if network.prefix_len() <= 64 {
        octets[8] &= !0x02;
    }
    history.copy_from_slice(&random[16..24]);
    Ipv6Addr::from(octets)
}

/// Prefix of length `prefix_len` inside `network` derived from `seed`.
pub fn build_prefix(network: &Ipv6Net, prefix_len: u8, seed: &[u8]) -> Ipv6Addr {
    let value = combine(network, &digest(&[seed])) & !host_mask(prefix_len);
    Ipv6Addr::from(value)
}

/// Subnet-router anycast (all-zero interface identifier) and the RFC 2526
/// reserved anycast identifiers.
pub fn reserved_iid(addr: &Ipv6Addr) -> bool {
    let o = addr.octets();
    if o[8..].iter().all(|b| *b == 0) {
        return true;
    }
    o[8..15] == [0xfd, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff] && (o[15] & 0x80) == 0x80
}

// ── Pool probing ────────────────────────────────────────────────────────────

/// Derive candidates in `pool` until one is free. Returns the binding and
/// the number of attempts it took.
fn create_lease(
    store: &mut BindingStore,
    pool: &Pool,
    owner: &IaKey,
    mut seed: Vec<u8>,
    now: u64,
) -> Result<(LeaseId, u32), AllocError> {
    let limit = attempt_limit(pool);
    for attempt in 1..=limit {
        let candidate = match pool.kind {
            IaKind::Na => build_address(&pool.network, &seed),
            IaKind::Ta => build_temporary(&pool.network, &seed, store.temporary_history_mut()),
            IaKind::Pd => build_prefix(&pool.network, pool.prefix_len, &seed),
        };
        if pool.kind == IaKind::Pd || !reserved_iid(&candidate) {
            match store.claimable(pool.id, &candidate, owner) {
                Ok(Some(id)) => return Ok((id, attempt)),
                Ok(None) => {
                    let id = store.add_lease(pool.kind, candidate, pool.prefix_len, pool.id, owner, now);
                    return Ok((id, attempt));
                }
                Err(_) => {}
            }
        }
        seed.extend_from_slice(&candidate.octets());
    }
    if pool.kind == IaKind::Pd {
        if let Some(id) = sweep_prefixes(store, pool, owner, now) {
            return Ok((id, limit + 1));
        }
    }
    debug!("Pool {} looks full after {} attempts", pool.network, limit);
    Err(AllocError::NoResources)
}

/// Number of prefixes `pool` delegates, or `None` when it does not fit a u32.
fn prefix_count(pool: &Pool) -> Option<u32> {
    let bits = pool.prefix_len.saturating_sub(pool.network.prefix_len());
    1u32.checked_shl(u32::from(bits))
}

/// How many hashed candidates to derive before giving up on `pool`.
fn attempt_limit(pool: &Pool) -> u32 {
    match pool.kind {
        IaKind::Na | IaKind::Ta => ADDRESS_ATTEMPTS,
        IaKind::Pd => prefix_count(pool)
            .map_or(ADDRESS_ATTEMPTS, |n| n.saturating_mul(2))
            .clamp(PREFIX_ATTEMPTS, ADDRESS_ATTEMPTS),
    }
}

/// Walk every prefix of a small delegation pool in order. Hashing alone can
/// miss the last free prefixes of a nearly full pool.
fn sweep_prefixes(store: &mut BindingStore, pool: &Pool, owner: &IaKey, now: u64) -> Option<LeaseId> {
    let count = prefix_count(pool).filter(|n| *n <= ADDRESS_ATTEMPTS)?;
    let base = u128::from(pool.network.network());
    let shift = 128 - u32::from(pool.prefix_len);
    for i in 0..count {
        let candidate = Ipv6Addr::from(base | u128::from(i).checked_shl(shift).unwrap_or(0));
        match store.claimable(pool.id, &candidate, owner) {
            Ok(Some(id)) => return Some(id),
            Ok(None) => {
                return Some(store.add_lease(pool.kind, candidate, pool.prefix_len, pool.id, owner, now));
            }
            Err(_) => {}
        }
    }
    None
}

fn permitted_ponds<'t>(topology: &'t Topology, req: &AllocRequest<'_>) -> Vec<&'t Pond> {
    topology
        .network(req.shared)
        .ponds
        .iter()
        .map(|id| topology.pond(*id))
        .filter(|pond| pond.permits(&req.requester))
        .collect()
}

/// Pick a fresh non-temporary address for the IA. Pools of each permitted
/// pond are probed in rotation from where the last allocation left off.
pub fn pick_address(
    topology: &Topology,
    store: &mut BindingStore,
    req: &AllocRequest<'_>,
    now: u64,
) -> Result<LeaseId, AllocError> {
    if !topology.has_pool(req.shared, IaKind::Na) {
        debug!("Unable to pick client address: no IPv6 pools on this shared network");
        return Err(AllocError::NoResources);
    }
    let seed = req.key.iaid_duid();

    for pond in permitted_ponds(topology, req) {
        let count = pond.pools.len();
        if count == 0 {
            continue;
        }
        let start = store.pond_cursor(pond.id) % count;
        let mut i = start;
        loop {
            let pool = topology.pool(pond.pools[i]);
            if pool.kind == IaKind::Na {
                if let Ok((id, attempts)) = create_lease(store, pool, req.key, seed.clone(), now) {
                    // a collision moves the next allocation on to the next pool
                    let next = if attempts > 1 { (i + 1) % count } else { i };
                    store.set_pond_cursor(pond.id, next);
                    return Ok(id);
                }
            }
            i = (i + 1) % count;
            if i == start {
                break;
            }
        }
    }

    warn!("Unable to pick client address for {}: no addresses available", req.key);
    Err(AllocError::NoResources)
}

/// Pick a fresh prefix, honoring the client's preferred length according
/// to `mode`.
pub fn pick_prefix(
    topology: &Topology,
    store: &mut BindingStore,
    req: &AllocRequest<'_>,
    preferred_len: Option<u8>,
    mode: PrefixLengthMode,
    now: u64,
) -> Result<LeaseId, AllocError> {
    if !topology.has_pool(req.shared, IaKind::Pd) {
        debug!("Unable to pick client prefix: no IPv6 prefix pools on this shared network");
        return Err(AllocError::NoResources);
    }
    let seed = req.key.iaid_duid();

    for filter in mode.passes(preferred_len) {
        for pond in permitted_ponds(topology, req) {
            for pool in topology.pond_pools(pond.id, IaKind::Pd) {
                if !filter.accepts(pool.prefix_len) {
                    continue;
                }
                if let Ok((id, _)) = create_lease(store, pool, req.key, seed.clone(), now) {
                    return Ok(id);
                }
            }
        }
    }

    warn!("Unable to pick client prefix for {}: no prefixes available", req.key);
    Err(AllocError::NoResources)
}

/// One fresh temporary address per permitted temporary pool.
pub fn pick_temporaries(
    topology: &Topology,
    store: &mut BindingStore,
    req: &AllocRequest<'_>,
    now: u64,
) -> Result<Vec<LeaseId>, AllocError> {
    if !topology.has_pool(req.shared, IaKind::Ta) {
        debug!("Unable to get client addresses: no IPv6 temporary pools on this shared network");
        return Err(AllocError::NoResources);
    }

    let mut picked = Vec::new();
    'ponds: for pond in permitted_ponds(topology, req) {
        for pool in topology.pond_pools(pond.id, IaKind::Ta) {
            match create_lease(store, pool, req.key, req.key.duid.clone(), now) {
                Ok((id, _)) => picked.push(id),
                Err(_) => {
                    debug!("Unable to get a temporary address from {}", pool.network);
                    break 'ponds;
                }
            }
        }
    }

    if picked.is_empty() {
        Err(AllocError::NoResources)
    } else {
        Ok(picked)
    }
}

/// Claim the specific address a client asked for.
pub fn try_address(
    topology: &Topology,
    store: &mut BindingStore,
    req: &AllocRequest<'_>,
    kind: IaKind,
    addr: &Ipv6Addr,
    now: u64,
) -> Result<LeaseId, AllocError> {
    if reserved_iid(addr) {
        return Err(AllocError::NotAvailable);
    }
    for pond in permitted_ponds(topology, req) {
        for pool in topology.pond_pools(pond.id, kind) {
            if !pool.contains(addr) {
                continue;
            }
            return match store.claimable(pool.id, addr, req.key)? {
                Some(id) => Ok(id),
                None => Ok(store.add_lease(kind, *addr, pool.prefix_len, pool.id, req.key, now)),
            };
        }
    }
    Err(AllocError::NotAvailable)
}

/// Claim the specific prefix a client asked for. It has to match a pool's
/// delegated length exactly.
pub fn try_prefix(
    topology: &Topology,
    store: &mut BindingStore,
    req: &AllocRequest<'_>,
    prefix: &Ipv6Addr,
    prefix_len: u8,
    now: u64,
) -> Result<LeaseId, AllocError> {
    if !(3..=128).contains(&prefix_len) || !is_masked(prefix, prefix_len) {
        return Err(AllocError::NotAvailable);
    }
    for pond in permitted_ponds(topology, req) {
        for pool in topology.pond_pools(pond.id, IaKind::Pd) {
            if !pool.covers_prefix(prefix, prefix_len) {
                continue;
            }
            return match store.claimable(pool.id, prefix, req.key)? {
                Some(id) => Ok(id),
                None => Ok(store.add_lease(IaKind::Pd, *prefix, prefix_len, pool.id, req.key, now)),
            };
        }
    }
    Err(AllocError::NotAvailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::PoolEntry;
    use crate::topology::{PondId, PoolId};

    fn topology(json: &str) -> Topology {
        Topology::from_config(&Config::parse(json).unwrap()).unwrap()
    }

    fn net(s: &str) -> Ipv6Net {
        s.parse::<Ipv6Net>().unwrap()
    }

    fn request(key: &IaKey) -> AllocRequest<'_> {
        AllocRequest {
            key,
            shared: SharedNetworkId(0),
            requester: Requester { known: false, classes: &[] },
        }
    }

    const OFFICE: &str = r#"{"shared_networks": [{
        "name": "office", "subnets": ["2001:db8::/64"],
        "ponds": [{ "pools": [
            { "type": "na", "network": "2001:db8::/65" },
            { "type": "ta", "network": "2001:db8::8000:0:0:0/65" },
            { "type": "pd", "network": "2001:db8:100::/48", "prefix_len": 60 }
        ] }]
    }]}"#;

    #[test]
    fn test_build_address_stays_in_network() {
        let n = net("2001:db8::/64");
        let a = build_address(&n, b"seed");
        assert!(n.contains(&a));
        assert_eq!(a.octets()[8] & 0x02, 0);
        assert_eq!(a, build_address(&n, b"seed"));
        assert_ne!(a, build_address(&n, b"other"));

        let small = net("2001:db8::1:0/112");
        assert!(small.contains(&build_address(&small, b"seed")));
    }

    #[test]
    fn test_build_prefix_is_masked() {
        let n = net("2001:db8:100::/48");
        let p = build_prefix(&n, 60, b"seed");
        assert!(n.contains(&p));
        assert!(is_masked(&p, 60));
    }

    #[test]
    fn test_build_temporary_moves_history() {
        let n = net("2001:db8::/64");
        let mut history = [0u8; 8];
        let first = build_temporary(&n, b"duid", &mut history);
        let second = build_temporary(&n, b"duid", &mut history);
        assert!(n.contains(&first) && n.contains(&second));
        assert_ne!(first, second);
    }

    #[test]
    fn test_reserved_iids() {
        assert!(reserved_iid(&"2001:db8::".parse().unwrap()));
        assert!(reserved_iid(&"2001:db8::fdff:ffff:ffff:ff80".parse().unwrap()));
        assert!(!reserved_iid(&"2001:db8::fdff:ffff:ffff:ff7f".parse().unwrap()));
        assert!(!reserved_iid(&"2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_pick_address_never_double_allocates() {
        let topo = topology(
            r#"{"shared_networks": [{
                "name": "tiny", "subnets": ["2001:db8::/64"],
                "ponds": [{ "pools": [{ "type": "na", "network": "2001:db8::/126" }] }]
            }]}"#,
        );
        let mut store = BindingStore::new();
        let mut seen = Vec::new();
        for iaid in 0..3 {
            let key = IaKey::new(IaKind::Na, iaid, &[0, 1]);
            let id = pick_address(&topo, &mut store, &request(&key), 1000).unwrap();
            let addr = store.lease(id).unwrap().address;
            assert!(!seen.contains(&addr));
            seen.push(addr);
        }
        // ::0 is subnet-router anycast, the other three are taken
        let key = IaKey::new(IaKind::Na, 99, &[0, 1]);
        assert_eq!(pick_address(&topo, &mut store, &request(&key), 1000), Err(AllocError::NoResources));
    }

    #[test]
    fn test_pick_address_reuses_own_offer() {
        let topo = topology(OFFICE);
        let mut store = BindingStore::new();
        let key = IaKey::new(IaKind::Na, 1, &[0, 1, 0, 1]);
        let first = pick_address(&topo, &mut store, &request(&key), 1000).unwrap();
        let again = pick_address(&topo, &mut store, &request(&key), 1001).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_pick_address_moves_to_next_pool() {
        let topo = topology(
            r#"{"shared_networks": [{
                "name": "two", "subnets": ["2001:db8::/64"],
                "ponds": [{ "pools": [
                    { "type": "na", "network": "2001:db8::/127" },
                    { "type": "na", "network": "2001:db8::1:0/112" }
                ] }]
            }]}"#,
        );
        let mut store = BindingStore::new();
        let a = IaKey::new(IaKind::Na, 1, &[1]);
        let b = IaKey::new(IaKind::Na, 2, &[2]);
        let first = pick_address(&topo, &mut store, &request(&a), 0).unwrap();
        assert_eq!(store.lease(first).unwrap().address, "2001:db8::1".parse::<Ipv6Addr>().unwrap());
        let second = pick_address(&topo, &mut store, &request(&b), 0).unwrap();
        assert!(net("2001:db8::1:0/112").contains(&store.lease(second).unwrap().address));
    }

    #[test]
    fn test_pond_prohibit_blocks_allocation() {
        let topo = topology(
            r#"{"shared_networks": [{
                "name": "staff", "subnets": ["2001:db8::/64"],
                "ponds": [{ "prohibit": ["unknown-clients"],
                            "pools": [{ "type": "na", "network": "2001:db8::/64" }] }]
            }]}"#,
        );
        let mut store = BindingStore::new();
        let key = IaKey::new(IaKind::Na, 1, &[1]);
        assert_eq!(pick_address(&topo, &mut store, &request(&key), 0), Err(AllocError::NoResources));

        let known = AllocRequest {
            requester: Requester { known: true, classes: &[] },
            ..request(&key)
        };
        assert!(pick_address(&topo, &mut store, &known, 0).is_ok());
    }

    #[test]
    fn test_pick_prefix_length_modes() {
        let topo = topology(OFFICE);
        let mut store = BindingStore::new();
        let key = IaKey::new(IaKind::Pd, 1, &[1]);

        assert_eq!(
            pick_prefix(&topo, &mut store, &request(&key), Some(56), PrefixLengthMode::Exact, 0),
            Err(AllocError::NoResources)
        );
        let id = pick_prefix(&topo, &mut store, &request(&key), Some(56), PrefixLengthMode::Prefer, 0).unwrap();
        let lease = store.lease(id).unwrap();
        assert_eq!(lease.prefix_len, 60);
        assert!(net("2001:db8:100::/48").contains(&lease.address));
        assert!(pick_prefix(&topo, &mut store, &request(&key), Some(56), PrefixLengthMode::Minimum, 0).is_ok());
        assert!(pick_prefix(&topo, &mut store, &request(&key), Some(56), PrefixLengthMode::Maximum, 0).is_err());
    }

    #[test]
    fn test_small_prefix_pool_fills_completely() {
        let topo = topology(
            r#"{"shared_networks": [{
                "name": "lab", "subnets": ["2001:db8::/64"],
                "ponds": [{ "pools": [
                    { "type": "pd", "network": "2001:db8:100::/56", "prefix_len": 60 }
                ] }]
            }]}"#,
        );
        let mut store = BindingStore::new();
        let mut seen = Vec::new();
        for iaid in 0..16 {
            let key = IaKey::new(IaKind::Pd, iaid, &[7]);
            let id = pick_prefix(&topo, &mut store, &request(&key), None, PrefixLengthMode::Ignore, 0).unwrap();
            let prefix = store.lease(id).unwrap().address;
            assert!(net("2001:db8:100::/56").contains(&prefix));
            assert!(!seen.contains(&prefix));
            seen.push(prefix);
        }
        let key = IaKey::new(IaKind::Pd, 99, &[7]);
        assert_eq!(
            pick_prefix(&topo, &mut store, &request(&key), None, PrefixLengthMode::Ignore, 0),
            Err(AllocError::NoResources)
        );
    }

    #[test]
    fn test_prefix_attempts_scale_with_pool() {
        let pool = |network: &str, prefix_len| Pool {
            id: PoolId(0),
            kind: IaKind::Pd,
            network: net(network),
            prefix_len,
            pond: PondId(0),
            shared_network: SharedNetworkId(0),
        };
        assert_eq!(attempt_limit(&pool("2001:db8::/62", 64)), PREFIX_ATTEMPTS);
        assert_eq!(attempt_limit(&pool("2001:db8::/56", 60)), 32);
        assert_eq!(attempt_limit(&pool("2001:db8::/40", 56)), ADDRESS_ATTEMPTS);
        assert_eq!(attempt_limit(&pool("2001:db8::/16", 64)), ADDRESS_ATTEMPTS);
    }

    #[test]
    fn test_try_address_and_prefix() {
        let topo = topology(OFFICE);
        let mut store = BindingStore::new();
        let a = IaKey::new(IaKind::Na, 1, &[1]);
        let b = IaKey::new(IaKind::Na, 1, &[2]);
        let wanted: Ipv6Addr = "2001:db8::77".parse().unwrap();

        let id = try_address(&topo, &mut store, &request(&a), IaKind::Na, &wanted, 0).unwrap();
        assert_eq!(store.entry(topo.pools()[0].id, &wanted), Some(PoolEntry::Lease(id)));
        assert_eq!(try_address(&topo, &mut store, &request(&a), IaKind::Na, &wanted, 0), Ok(id));
        assert_eq!(
            try_address(&topo, &mut store, &request(&b), IaKind::Na, &wanted, 0),
            Err(AllocError::InUse)
        );
        assert_eq!(
            try_address(&topo, &mut store, &request(&b), IaKind::Na, &"2001:db9::1".parse().unwrap(), 0),
            Err(AllocError::NotAvailable)
        );

        let pd = IaKey::new(IaKind::Pd, 1, &[1]);
        let prefix: Ipv6Addr = "2001:db8:100:20::".parse().unwrap();
        assert!(try_prefix(&topo, &mut store, &request(&pd), &prefix, 60, 0).is_ok());
        assert_eq!(
            try_prefix(&topo, &mut store, &request(&pd), &prefix, 56, 0),
            Err(AllocError::NotAvailable)
        );
        assert_eq!(
            try_prefix(&topo, &mut store, &request(&pd), &"2001:db8:100:21::".parse().unwrap(), 60, 0),
            Err(AllocError::NotAvailable)
        );
    }

    #[test]
    fn test_pick_temporaries() {
        let topo = topology(OFFICE);
        let mut store = BindingStore::new();
        let key = IaKey::new(IaKind::Ta, 1, &[1]);
        let ids = pick_temporaries(&topo, &mut store, &request(&key), 0).unwrap();
        assert_eq!(ids.len(), 1);
        assert!(net("2001:db8::8000:0:0:0/65").contains(&store.lease(ids[0]).unwrap().address));
    }
}
