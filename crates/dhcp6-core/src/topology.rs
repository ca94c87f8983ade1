//! Shared networks, ponds and pools.
//!
//! Built once from configuration and then read-only; all mutable lease
//! state lives in [`crate::store::BindingStore`], which refers to pools and
//! ponds by id.

use std::net::Ipv6Addr;

use anyhow::{bail, Result};
use ipnet::Ipv6Net;

use crate::config::{Config, Permit};
use crate::policy::PolicyValues;
use crate::wire::IaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PondId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SharedNetworkId(pub usize);

#[derive(Debug, Clone)]
pub struct Pool {
    pub id: PoolId,
    pub kind: IaKind,
    pub network: Ipv6Net,
    /// 128 for address pools, the delegated length for prefix pools.
    pub prefix_len: u8,
    pub pond: PondId,
    pub shared_network: SharedNetworkId,
}

impl Pool {
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        self.network.contains(addr)
    }

    /// Whether `prefix/len` is a prefix this pool delegates.
    pub fn covers_prefix(&self, prefix: &Ipv6Addr, len: u8) -> bool {
        len == self.prefix_len && self.network.contains(prefix) && is_masked(prefix, len)
    }
}

/// No bits set beyond the prefix length.
pub fn is_masked(addr: &Ipv6Addr, len: u8) -> bool {
    Ipv6Net::new(*addr, len).map(|n| n.network() == *addr).unwrap_or(false)
}

/// What pond permit/prohibit lists are evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct Requester<'a> {
    pub known: bool,
    pub classes: &'a [String],
}

impl Requester<'_> {
    fn matches(&self, permit: &Permit) -> bool {
        match permit {
            Permit::KnownClients => self.known,
            Permit::UnknownClients => !self.known,
            Permit::AllClients => true,
            Permit::MembersOf(class) => self.classes.iter().any(|c| c == class),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pond {
    pub id: PondId,
    pub shared_network: SharedNetworkId,
    pub pools: Vec<PoolId>,
    pub permit: Vec<Permit>,
    pub prohibit: Vec<Permit>,
    pub policy: PolicyValues,
}

impl Pond {
    pub fn permits(&self, requester: &Requester<'_>) -> bool {
        if self.prohibit.iter().any(|p| requester.matches(p)) {
            return false;
        }
        self.permit.is_empty() || self.permit.iter().any(|p| requester.matches(p))
    }
}

#[derive(Debug, Clone)]
pub struct SharedNetwork {
    pub id: SharedNetworkId,
    pub name: String,
    pub interfaces: Vec<String>,
    pub subnets: Vec<Ipv6Net>,
    pub ponds: Vec<PondId>,
    pub policy: PolicyValues,
}

#[derive(Debug, Clone, Default)]
pub struct Topology {
    networks: Vec<SharedNetwork>,
    ponds: Vec<Pond>,
    pools: Vec<Pool>,
}

impl Topology {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut topo = Topology::default();

        for net_cfg in &config.shared_networks {
            if topo.networks.iter().any(|n| n.name == net_cfg.name) {
                bail!("Duplicate shared network name: {}", net_cfg.name);
            }
            for subnet in &net_cfg.subnets {
                if let Some(other) = topo
                    .networks
                    .iter()
                    .find(|n| n.subnets.iter().any(|s| overlaps(s, subnet)))
                {
                    bail!(
                        "Subnet {} of shared network {} overlaps shared network {}",
                        subnet,
                        net_cfg.name,
                        other.name
                    );
                }
            }

            let net_id = SharedNetworkId(topo.networks.len());
            let mut pond_ids = Vec::with_capacity(net_cfg.ponds.len());

            for pond_cfg in &net_cfg.ponds {
                let pond_id = PondId(topo.ponds.len());
                let mut pool_ids = Vec::with_capacity(pond_cfg.pools.len());

                for pool_cfg in &pond_cfg.pools {
                    let network = pool_cfg.network.trunc();
                    let prefix_len = match pool_cfg.kind {
                        IaKind::Na | IaKind::Ta => {
                            if !net_cfg.subnets.iter().any(|s| s.contains(&network)) {
                                bail!(
                                    "{} pool {} is outside the subnets of shared network {}",
                                    pool_cfg.kind,
                                    network,
                                    net_cfg.name
                                );
                            }
                            128
                        }
                        IaKind::Pd => {
                            let Some(len) = pool_cfg.prefix_len else {
                                bail!("Prefix pool {} in {} needs prefix_len", network, net_cfg.name);
                            };
                            if len < network.prefix_len() || len > 128 {
                                bail!(
                                    "Prefix pool {} in {}: prefix_len {} must be between {} and 128",
                                    network,
                                    net_cfg.name,
                                    len,
                                    network.prefix_len()
                                );
                            }
                            len
                        }
                    };
                    if let Some(other) = topo.pools.iter().find(|p| overlaps(&p.network, &network)) {
                        bail!("Pool {} overlaps pool {}", network, other.network);
                    }

                    let id = PoolId(topo.pools.len());
                    topo.pools.push(Pool {
                        id,
                        kind: pool_cfg.kind,
                        network,
                        prefix_len,
                        pond: pond_id,
                        shared_network: net_id,
                    });
                    pool_ids.push(id);
                }

                topo.ponds.push(Pond {
                    id: pond_id,
                    shared_network: net_id,
                    pools: pool_ids,
                    permit: pond_cfg.permit.clone(),
                    prohibit: pond_cfg.prohibit.clone(),
                    policy: pond_cfg.options.clone(),
                });
                pond_ids.push(pond_id);
            }

            topo.networks.push(SharedNetwork {
                id: net_id,
                name: net_cfg.name.clone(),
                interfaces: net_cfg.interfaces.clone(),
                subnets: net_cfg.subnets.iter().map(|s| s.trunc()).collect(),
                ponds: pond_ids,
                policy: net_cfg.options.clone(),
            });
        }

        Ok(topo)
    }

    pub fn network(&self, id: SharedNetworkId) -> &SharedNetwork {
        &self.networks[id.0]
    }

    pub fn pond(&self, id: PondId) -> &Pond {
        &self.ponds[id.0]
    }

    pub fn pool(&self, id: PoolId) -> &Pool {
        &self.pools[id.0]
    }

    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    pub fn networks(&self) -> &[SharedNetwork] {
        &self.networks
    }

    /// Shared network owning the subnet `addr` falls in.
    pub fn network_for_address(&self, addr: &Ipv6Addr) -> Option<SharedNetworkId> {
        self.networks
            .iter()
            .find(|n| n.subnets.iter().any(|s| s.contains(addr)))
            .map(|n| n.id)
    }

    pub fn network_for_interface(&self, interface: &str) -> Option<SharedNetworkId> {
        self.networks
            .iter()
            .find(|n| n.interfaces.iter().any(|i| i == interface))
            .map(|n| n.id)
    }

    /// The only shared network, when exactly one is configured.
    pub fn sole_network(&self) -> Option<SharedNetworkId> {
        match self.networks.as_slice() {
            [only] => Some(only.id),
            _ => None,
        }
    }

    pub fn on_link(&self, net: SharedNetworkId, addr: &Ipv6Addr) -> bool {
        self.network(net).subnets.iter().any(|s| s.contains(addr))
    }

    pub fn has_pool(&self, net: SharedNetworkId, kind: IaKind) -> bool {
        self.network(net)
            .ponds
            .iter()
            .any(|pond| self.pond(*pond).pools.iter().any(|p| self.pool(*p).kind == kind))
    }

    /// Pools of `kind` in a pond, in configuration order.
    pub fn pond_pools(&self, pond: PondId, kind: IaKind) -> impl Iterator<Item = &Pool> + '_ {
        self.pond(pond)
            .pools
            .iter()
            .map(|id| self.pool(*id))
            .filter(move |p| p.kind == kind)
    }

    /// Pool that `addr` (or `addr/len` for prefixes) belongs to.
    pub fn pool_for(&self, kind: IaKind, addr: &Ipv6Addr, len: u8) -> Option<PoolId> {
        self.pools
            .iter()
            .find(|p| {
                p.kind == kind
                    && match kind {
                        IaKind::Pd => p.covers_prefix(addr, len),
                        IaKind::Na | IaKind::Ta => p.contains(addr),
                    }
            })
            .map(|p| p.id)
    }
}

fn overlaps(a: &Ipv6Net, b: &Ipv6Net) -> bool {
    a.contains(b) || b.contains(a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn office_config() -> Config {
        Config::parse(
            r#"{
            "shared_networks": [{
                "name": "office",
                "interfaces": ["lan0"],
                "subnets": ["2001:db8::/64", "2001:db8:0:1::/64"],
                "ponds": [
                    { "prohibit": ["unknown-clients"],
                      "pools": [{ "type": "na", "network": "2001:db8::/80" }] },
                    { "pools": [
                        { "type": "na", "network": "2001:db8:0:1::/64" },
                        { "type": "pd", "network": "2001:db8:100::/48", "prefix_len": 60 }
                    ] }
                ]
            }, {
                "name": "lab",
                "subnets": ["2001:db8:9::/64"]
            }]
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_build_and_lookup() {
        let topo = Topology::from_config(&office_config()).unwrap();
        assert_eq!(topo.networks().len(), 2);
        assert_eq!(topo.pools().len(), 3);

        let office = topo.network_for_interface("lan0").unwrap();
        let addr: Ipv6Addr = "2001:db8:0:1::5".parse().unwrap();
        assert_eq!(topo.network_for_address(&addr), Some(office));
        assert!(topo.on_link(office, &addr));
        assert!(!topo.on_link(office, &"2001:db8:9::1".parse().unwrap()));
        assert!(topo.has_pool(office, IaKind::Pd));
        assert!(!topo.has_pool(office, IaKind::Ta));
        assert!(topo.sole_network().is_none());

        let pd = topo.pool_for(IaKind::Pd, &"2001:db8:100:10::".parse().unwrap(), 60).unwrap();
        assert_eq!(topo.pool(pd).prefix_len, 60);
        assert!(topo.pool_for(IaKind::Pd, &"2001:db8:100:10::".parse().unwrap(), 56).is_none());
        assert!(topo.pool_for(IaKind::Pd, &"2001:db8:100:11::".parse().unwrap(), 60).is_none());
    }

    #[test]
    fn test_pond_permits() {
        let topo = Topology::from_config(&office_config()).unwrap();
        let restricted = topo.pond(PondId(0));
        let open = topo.pond(PondId(1));

        let unknown = Requester { known: false, classes: &[] };
        let known = Requester { known: true, classes: &[] };
        assert!(!restricted.permits(&unknown));
        assert!(restricted.permits(&known));
        assert!(open.permits(&unknown));

        let pond = Pond {
            permit: vec![Permit::MembersOf("phones".into())],
            ..open.clone()
        };
        let phones = ["phones".to_string()];
        assert!(pond.permits(&Requester { known: false, classes: &phones }));
        assert!(!pond.permits(&known));
    }

    #[test]
    fn test_rejects_pool_outside_subnets() {
        let config = Config::parse(
            r#"{"shared_networks": [{
                "name": "x", "subnets": ["2001:db8::/64"],
                "ponds": [{ "pools": [{ "type": "na", "network": "2001:db9::/64" }] }]
            }]}"#,
        )
        .unwrap();
        let err = Topology::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("outside the subnets"));
    }

    #[test]
    fn test_rejects_bad_prefix_pool() {
        let config = Config::parse(
            r#"{"shared_networks": [{
                "name": "x", "subnets": ["2001:db8::/64"],
                "ponds": [{ "pools": [{ "type": "pd", "network": "2001:db8:100::/48", "prefix_len": 40 }] }]
            }]}"#,
        )
        .unwrap();
        assert!(Topology::from_config(&config).is_err());

        let config = Config::parse(
            r#"{"shared_networks": [{
                "name": "x", "subnets": ["2001:db8::/64"],
                "ponds": [{ "pools": [{ "type": "pd", "network": "2001:db8:100::/48" }] }]
            }]}"#,
        )
        .unwrap();
        assert!(Topology::from_config(&config).is_err());
    }

    #[test]
    fn test_rejects_overlapping_subnets_and_pools() {
        let config = Config::parse(
            r#"{"shared_networks": [
                { "name": "a", "subnets": ["2001:db8::/48"] },
                { "name": "b", "subnets": ["2001:db8:0:1::/64"] }
            ]}"#,
        )
        .unwrap();
        assert!(Topology::from_config(&config).is_err());

        let config = Config::parse(
            r#"{"shared_networks": [{
                "name": "a", "subnets": ["2001:db8::/64"],
                "ponds": [{ "pools": [
                    { "type": "na", "network": "2001:db8::/64" },
                    { "type": "ta", "network": "2001:db8::/96" }
                ] }]
            }]}"#,
        )
        .unwrap();
        assert!(Topology::from_config(&config).is_err());
    }

    #[test]
    fn test_is_masked() {
        assert!(is_masked(&"2001:db8:100::".parse().unwrap(), 48));
        assert!(!is_masked(&"2001:db8:100::1".parse().unwrap(), 48));
        assert!(!is_masked(&"::".parse().unwrap(), 129));
    }
}
