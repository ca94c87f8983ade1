//! Binding store.
//!
//! Leases live in an arena addressed by [`LeaseId`]. Identity associations
//! are kept in one table per IA kind and list the leases they own; every
//! pool has an index from address (or prefix) to the lease holding it, or
//! to a host reservation. Pools and ponds are referred to by id only.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv6Addr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::AllocError;
use crate::host::HostDb;
use crate::topology::{PondId, PoolId, Topology};
use crate::wire::IaKind;

/// Lifetime of a provisional binding that was offered but not committed.
pub const SOFT_LEASE_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Active,
    Expired,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IaKey {
    pub kind: IaKind,
    pub iaid: u32,
    pub duid: Vec<u8>,
}

impl IaKey {
    pub fn new(kind: IaKind, iaid: u32, duid: &[u8]) -> Self {
        Self {
            kind,
            iaid,
            duid: duid.to_vec(),
        }
    }

    /// IAID in network order followed by the DUID.
    pub fn iaid_duid(&self) -> Vec<u8> {
        let mut seed = Vec::with_capacity(4 + self.duid.len());
        seed.extend_from_slice(&self.iaid.to_be_bytes());
        seed.extend_from_slice(&self.duid);
        seed
    }
}

impl fmt::Display for IaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} iaid {} duid {}", self.kind, self.iaid, hex::encode(&self.duid))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub kind: IaKind,
    pub address: Ipv6Addr,
    /// 128 for addresses.
    pub prefix_len: u8,
    /// `None` once a reload removed the pool this lease came from.
    pub pool: Option<PoolId>,
    pub state: LeaseState,
    pub owner: IaKey,
    /// Set once a Reply committed the lease.
    pub committed: bool,
    pub hard_end: u64,
    /// End time promised in the last Reply, becomes `hard_end` on commit.
    pub soft_end: Option<u64>,
    pub preferred: u32,
    pub valid: u32,
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            IaKind::Pd => write!(f, "{}/{}", self.address, self.prefix_len),
            IaKind::Na | IaKind::Ta => write!(f, "{}", self.address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ia {
    pub key: IaKey,
    pub leases: Vec<LeaseId>,
    /// Client last transaction time.
    pub cltt: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEntry {
    Lease(LeaseId),
    Reserved,
}

/// A committed binding read back from the lease file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredLease {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    pub state: LeaseState,
    pub preferred: u32,
    pub valid: u32,
    pub hard_end: u64,
}

#[derive(Debug)]
pub struct BindingStore {
    leases: HashMap<LeaseId, Lease>,
    next_lease: u64,
    ia_na: HashMap<IaKey, Ia>,
    ia_ta: HashMap<IaKey, Ia>,
    ia_pd: HashMap<IaKey, Ia>,
    pool_index: HashMap<PoolId, HashMap<Ipv6Addr, PoolEntry>>,
    pond_cursor: HashMap<PondId, usize>,
    temporary_history: [u8; 8],
}

impl Default for BindingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BindingStore {
    pub fn new() -> Self {
        Self {
            leases: HashMap::new(),
            next_lease: 1,
            ia_na: HashMap::new(),
            ia_ta: HashMap::new(),
            ia_pd: HashMap::new(),
            pool_index: HashMap::new(),
            pond_cursor: HashMap::new(),
            temporary_history: rand::rng().random(),
        }
    }

    fn table(&self, kind: IaKind) -> &HashMap<IaKey, Ia> {
        match kind {
            IaKind::Na => &self.ia_na,
            IaKind::Ta => &self.ia_ta,
            IaKind::Pd => &self.ia_pd,
        }
    }

    fn table_mut(&mut self, kind: IaKind) -> &mut HashMap<IaKey, Ia> {
        match kind {
            IaKind::Na => &mut self.ia_na,
            IaKind::Ta => &mut self.ia_ta,
            IaKind::Pd => &mut self.ia_pd,
        }
    }

    // ── Lookups ─────────────────────────────────────────────────────────────

    pub fn ia(&self, key: &IaKey) -> Option<&Ia> {
        self.table(key.kind).get(key)
    }

    pub fn ias(&self) -> impl Iterator<Item = &Ia> {
        self.ia_na.values().chain(self.ia_ta.values()).chain(self.ia_pd.values())
    }

    pub fn ia_count(&self) -> usize {
        self.ia_na.len() + self.ia_ta.len() + self.ia_pd.len()
    }

    pub fn lease(&self, id: LeaseId) -> Option<&Lease> {
        self.leases.get(&id)
    }

    pub fn leases(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }

    /// Leases of an IA, in the IA's order.
    pub fn ia_leases<'a>(&'a self, ia: &'a Ia) -> impl Iterator<Item = &'a Lease> + 'a {
        ia.leases.iter().filter_map(|id| self.leases.get(id))
    }

    pub fn entry(&self, pool: PoolId, addr: &Ipv6Addr) -> Option<PoolEntry> {
        self.pool_index.get(&pool).and_then(|idx| idx.get(addr)).copied()
    }

    /// Whether `owner` may take `addr` from `pool`. A provisional lease the
    /// same IA was offered earlier is handed back instead of a new one.
    pub fn claimable(&self, pool: PoolId, addr: &Ipv6Addr, owner: &IaKey) -> Result<Option<LeaseId>, AllocError> {
        match self.entry(pool, addr) {
            None => Ok(None),
            Some(PoolEntry::Reserved) => Err(AllocError::InUse),
            Some(PoolEntry::Lease(id)) => match self.leases.get(&id) {
                Some(lease) if !lease.committed && lease.owner == *owner => Ok(Some(id)),
                _ => Err(AllocError::InUse),
            },
        }
    }

    /// A lease is usable while it is not expired and its pool index still
    /// points at it.
    pub fn lease_usable(&self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.get(&id) else {
            return false;
        };
        if lease.state == LeaseState::Expired {
            return false;
        }
        match lease.pool {
            Some(pool) => self.entry(pool, &lease.address) == Some(PoolEntry::Lease(id)),
            None => false,
        }
    }

    // ── Allocator state ─────────────────────────────────────────────────────

    pub fn pond_cursor(&self, pond: PondId) -> usize {
        self.pond_cursor.get(&pond).copied().unwrap_or(0)
    }

    pub fn set_pond_cursor(&mut self, pond: PondId, index: usize) {
        self.pond_cursor.insert(pond, index);
    }

    pub fn temporary_history_mut(&mut self) -> &mut [u8; 8] {
        &mut self.temporary_history
    }

    // ── Binding lifecycle ───────────────────────────────────────────────────

    /// Create a provisional binding and register it in its pool's index.
    pub fn add_lease(
        &mut self,
        kind: IaKind,
        address: Ipv6Addr,
        prefix_len: u8,
        pool: PoolId,
        owner: &IaKey,
        now: u64,
    ) -> LeaseId {
        let id = LeaseId(self.next_lease);
        self.next_lease += 1;
        self.leases.insert(
            id,
            Lease {
                id,
                kind,
                address,
                prefix_len,
                pool: Some(pool),
                state: LeaseState::Active,
                owner: owner.clone(),
                committed: false,
                hard_end: now + SOFT_LEASE_SECS,
                soft_end: None,
                preferred: 0,
                valid: 0,
            },
        );
        self.pool_index
            .entry(pool)
            .or_default()
            .insert(address, PoolEntry::Lease(id));
        id
    }

    /// Record the lifetimes sent for a lease. `soft_end` is only set when the
    /// reply is a Reply.
    pub fn set_lifetimes(&mut self, id: LeaseId, preferred: u32, valid: u32, soft_end: Option<u64>) {
        if let Some(lease) = self.leases.get_mut(&id) {
            lease.preferred = preferred;
            lease.valid = valid;
            if soft_end.is_some() {
                lease.soft_end = soft_end;
            }
        }
    }

    /// Commit a binding: the promised end time becomes the hard one.
    pub fn renew_lease(&mut self, id: LeaseId, now: u64) {
        let Some(lease) = self.leases.get_mut(&id) else {
            return;
        };
        if lease.state == LeaseState::Abandoned {
            info!("Reclaiming previously abandoned address {}", lease);
        }
        lease.state = LeaseState::Active;
        lease.committed = true;
        lease.hard_end = lease
            .soft_end
            .take()
            .unwrap_or(now + u64::from(lease.valid));
        if let Some(pool) = lease.pool {
            self.pool_index
                .entry(pool)
                .or_default()
                .insert(lease.address, PoolEntry::Lease(id));
        }
    }

    /// Install `leases` as the IA's binding set, replacing the previous IA.
    /// Expired bindings the new set leaves out are forgotten; abandoned ones
    /// stay with the IA so they are persisted and never handed out again.
    pub fn replace_ia(&mut self, key: IaKey, mut leases: Vec<LeaseId>, now: u64) {
        let left_out: Vec<LeaseId> = self
            .ia(&key)
            .map(|old| old.leases.iter().copied().filter(|id| !leases.contains(id)).collect())
            .unwrap_or_default();
        for id in left_out {
            match self.leases.get(&id).map(|l| l.state) {
                Some(LeaseState::Expired) => {
                    self.leases.remove(&id);
                }
                Some(LeaseState::Abandoned) => leases.push(id),
                _ => {}
            }
        }
        for id in &leases {
            if let Some(lease) = self.leases.get_mut(id) {
                lease.owner = key.clone();
            }
        }
        let ia = Ia {
            key: key.clone(),
            leases,
            cltt: now,
        };
        self.table_mut(key.kind).insert(key, ia);
    }

    /// Record client activity on an IA without changing its bindings.
    pub fn touch_ia(&mut self, key: &IaKey, now: u64) {
        if let Some(ia) = self.table_mut(key.kind).get_mut(key) {
            ia.cltt = now;
        }
    }

    fn unindex(&mut self, id: LeaseId) {
        let Some(lease) = self.leases.get(&id) else {
            return;
        };
        let Some(pool) = lease.pool else {
            return;
        };
        if let Some(idx) = self.pool_index.get_mut(&pool) {
            if idx.get(&lease.address) == Some(&PoolEntry::Lease(id)) {
                idx.remove(&lease.address);
            }
        }
    }

    fn detach(&mut self, id: LeaseId) -> Option<Lease> {
        let lease = self.leases.remove(&id)?;
        let table = self.table_mut(lease.kind);
        if let Some(ia) = table.get_mut(&lease.owner) {
            ia.leases.retain(|l| *l != id);
            if ia.leases.is_empty() {
                table.remove(&lease.owner);
            }
        }
        Some(lease)
    }

    /// Give a binding back to its pool. Abandoned bindings stay put.
    pub fn release_lease(&mut self, id: LeaseId) -> Option<Lease> {
        if self.leases.get(&id)?.state == LeaseState::Abandoned {
            return None;
        }
        self.unindex(id);
        self.detach(id)
    }

    /// Mark a binding unusable for good.
    pub fn decline_lease(&mut self, id: LeaseId) {
        let Some(lease) = self.leases.get_mut(&id) else {
            return;
        };
        lease.state = LeaseState::Abandoned;
        lease.committed = true;
        lease.hard_end = u64::MAX;
        lease.soft_end = None;
        lease.preferred = 0;
        lease.valid = 0;
        if let Some(pool) = lease.pool {
            self.pool_index
                .entry(pool)
                .or_default()
                .insert(lease.address, PoolEntry::Lease(id));
        }
    }

    fn in_owner_ia(&self, lease: &Lease) -> bool {
        self.ia(&lease.owner).is_some_and(|ia| ia.leases.contains(&lease.id))
    }

    /// Expire every active binding whose end time has passed. Provisional
    /// and orphaned bindings are dropped outright; committed ones stay in
    /// their IA as Expired. Returns the committed bindings that expired.
    pub fn expire_leases(&mut self, now: u64) -> Vec<Lease> {
        let mut due: Vec<LeaseId> = self
            .leases
            .values()
            .filter(|l| l.state == LeaseState::Active && l.hard_end < now)
            .map(|l| l.id)
            .collect();
        due.sort();

        let mut expired = Vec::new();
        for id in due {
            self.unindex(id);
            let Some(lease) = self.leases.get(&id) else {
                continue;
            };
            let committed = lease.committed;
            if !committed || !self.in_owner_ia(lease) {
                if let Some(mut lease) = self.detach(id) {
                    debug!("Dropping {} binding {} for {}", if committed { "orphaned" } else { "provisional" }, lease, lease.owner);
                    if committed {
                        lease.state = LeaseState::Expired;
                        expired.push(lease);
                    }
                }
                continue;
            }
            if let Some(lease) = self.leases.get_mut(&id) {
                lease.state = LeaseState::Expired;
                expired.push(lease.clone());
            }
        }
        expired
    }

    /// Keep `addr` in `pool` away from dynamic allocation. Fails when a
    /// binding already holds it.
    pub fn reserve(&mut self, pool: PoolId, addr: Ipv6Addr) -> bool {
        let idx = self.pool_index.entry(pool).or_default();
        match idx.get(&addr) {
            Some(PoolEntry::Lease(_)) => false,
            _ => {
                idx.insert(addr, PoolEntry::Reserved);
                true
            }
        }
    }

    /// Insert an IA read back from the lease file, replacing any IA with the
    /// same key. Pool membership is resolved by [`reattach`](Self::reattach).
    pub fn restore_ia(&mut self, key: IaKey, cltt: u64, leases: Vec<RestoredLease>) {
        if let Some(old) = self.table_mut(key.kind).remove(&key) {
            for id in old.leases {
                self.unindex(id);
                self.leases.remove(&id);
            }
        }
        let mut ids = Vec::with_capacity(leases.len());
        for restored in leases {
            let id = LeaseId(self.next_lease);
            self.next_lease += 1;
            self.leases.insert(
                id,
                Lease {
                    id,
                    kind: key.kind,
                    address: restored.address,
                    prefix_len: restored.prefix_len,
                    pool: None,
                    state: restored.state,
                    owner: key.clone(),
                    committed: true,
                    hard_end: restored.hard_end,
                    soft_end: None,
                    preferred: restored.preferred,
                    valid: restored.valid,
                },
            );
            ids.push(id);
        }
        if !ids.is_empty() {
            self.replace_ia(key, ids, cltt);
        }
    }

    /// Rebuild every pool index against a (new) topology and re-apply host
    /// reservations.
    pub fn reattach(&mut self, topology: &Topology, hosts: &HostDb) {
        self.pool_index.clear();
        self.pond_cursor.clear();

        let mut ids: Vec<LeaseId> = self.leases.keys().copied().collect();
        ids.sort();
        let mut detached = 0usize;
        for id in ids {
            let Some(lease) = self.leases.get_mut(&id) else {
                continue;
            };
            lease.pool = topology.pool_for(lease.kind, &lease.address, lease.prefix_len);
            let Some(pool) = lease.pool else {
                if lease.state != LeaseState::Expired {
                    warn!("Binding {} for {} no longer belongs to any pool", lease, lease.owner);
                    detached += 1;
                }
                continue;
            };
            if lease.state == LeaseState::Expired {
                continue;
            }
            let idx = self.pool_index.entry(pool).or_default();
            if idx.contains_key(&lease.address) {
                warn!("Binding {} for {} duplicates an earlier binding", lease, lease.owner);
                continue;
            }
            idx.insert(lease.address, PoolEntry::Lease(id));
        }

        for host in hosts.iter() {
            if let Some(addr) = host.fixed_address {
                let pool = topology
                    .pool_for(IaKind::Na, &addr, 128)
                    .or_else(|| topology.pool_for(IaKind::Ta, &addr, 128));
                if let Some(pool) = pool {
                    if !self.reserve(pool, addr) {
                        warn!("Fixed address {} of host {} is already leased", addr, host.name);
                    }
                }
            }
            for prefix in &host.fixed_prefixes {
                if let Some(pool) = topology.pool_for(IaKind::Pd, &prefix.network(), prefix.prefix_len()) {
                    if !self.reserve(pool, prefix.network()) {
                        warn!("Fixed prefix {} of host {} is already delegated", prefix, host.name);
                    }
                }
            }
        }

        info!(
            "Attached {} bindings in {} IAs ({} without a pool)",
            self.leases.len(),
            self.ia_count(),
            detached
        );
    }
}
