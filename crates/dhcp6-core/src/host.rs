//! Host reservations.

use std::net::Ipv6Addr;

use anyhow::{bail, Context, Result};
use ipnet::Ipv6Net;
use tracing::debug;

use crate::config::{parse_hex, HostConfig};
use crate::duid::{format_mac, hardware_from_duid, parse_mac};
use crate::policy::PolicyValues;
use crate::topology::{SharedNetworkId, Topology};
use crate::wire::{Options, RelayMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostId(pub usize);

#[derive(Debug, Clone)]
pub struct HostRecord {
    pub name: String,
    pub duid: Option<Vec<u8>>,
    pub hardware: Option<[u8; 6]>,
    /// Option code and raw payload identifying the client.
    pub identifier: Option<(u16, Vec<u8>)>,
    pub fixed_address: Option<Ipv6Addr>,
    pub fixed_prefixes: Vec<Ipv6Net>,
    pub policy: PolicyValues,
}

impl HostRecord {
    fn identified_by(&self, options: &Options, relays: &[RelayMessage]) -> bool {
        let Some((code, value)) = &self.identifier else {
            return false;
        };
        std::iter::once(options)
            .chain(relays.iter().map(|r| &r.options))
            .any(|opts| opts.get_all(*code).any(|data| data.as_ref() == value.as_slice()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostDb {
    hosts: Vec<HostRecord>,
}

impl HostDb {
    pub fn from_config(configs: &[HostConfig]) -> Result<Self> {
        let mut hosts = Vec::with_capacity(configs.len());
        for c in configs {
            if hosts.iter().any(|h: &HostRecord| h.name == c.name) {
                bail!("Duplicate host name: {}", c.name);
            }
            let duid = c
                .duid
                .as_deref()
                .map(parse_hex)
                .transpose()
                .with_context(|| format!("Invalid duid for host {}", c.name))?;
            let hardware = match c.hardware.as_deref() {
                Some(mac) => Some(
                    parse_mac(mac).with_context(|| format!("Invalid hardware address for host {}", c.name))?,
                ),
                None => None,
            };
            let identifier = match &c.identifier {
                Some(id) => Some((
                    id.option,
                    parse_hex(&id.value).with_context(|| format!("Invalid identifier for host {}", c.name))?,
                )),
                None => None,
            };
            if duid.is_none() && hardware.is_none() && identifier.is_none() {
                bail!("Host {} has no duid, hardware or identifier", c.name);
            }
            let fixed_prefixes: Vec<Ipv6Net> = c.fixed_prefixes.iter().map(|p| p.trunc()).collect();
            if let Some(bad) = fixed_prefixes.iter().find(|p| p.prefix_len() < 3) {
                bail!("Host {}: fixed prefix {} is too short", c.name, bad);
            }
            hosts.push(HostRecord {
                name: c.name.clone(),
                duid,
                hardware,
                identifier,
                fixed_address: c.fixed_address,
                fixed_prefixes,
                policy: c.options.clone(),
            });
        }
        Ok(Self { hosts })
    }

    pub fn get(&self, id: HostId) -> &HostRecord {
        &self.hosts[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostRecord> {
        self.hosts.iter()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Find the host record for a client: by DUID, then by option
    /// identifier, then by the hardware address embedded in the DUID.
    /// Each step only yields a record usable on `shared`.
    pub fn lookup(
        &self,
        duid: &[u8],
        options: &Options,
        relays: &[RelayMessage],
        topology: &Topology,
        shared: SharedNetworkId,
    ) -> Option<HostId> {
        let by_duid = self.seek_shared(|h| h.duid.as_deref() == Some(duid), topology, shared);
        if by_duid.is_some() {
            return by_duid;
        }

        let by_identifier = self.seek_shared(|h| h.identified_by(options, relays), topology, shared);
        if by_identifier.is_some() {
            return by_identifier;
        }

        let mac = hardware_from_duid(duid)?;
        let found = self.seek_shared(|h| h.hardware == Some(mac), topology, shared);
        if found.is_some() {
            debug!("Host matched by hardware address {}", format_mac(&mac));
        }
        found
    }

    /// Every record naming this client, on any network: those matching by
    /// DUID, failing that by option identifier, failing that by hardware
    /// address.
    pub fn client_hosts(&self, duid: &[u8], options: &Options, relays: &[RelayMessage]) -> Vec<&HostRecord> {
        let by_duid = self.matching(|h| h.duid.as_deref() == Some(duid));
        if !by_duid.is_empty() {
            return by_duid;
        }
        let by_identifier = self.matching(|h| h.identified_by(options, relays));
        if !by_identifier.is_empty() {
            return by_identifier;
        }
        match hardware_from_duid(duid) {
            Some(mac) => self.matching(|h| h.hardware == Some(mac)),
            None => Vec::new(),
        }
    }

    fn matching(&self, matches: impl Fn(&HostRecord) -> bool) -> Vec<&HostRecord> {
        self.hosts.iter().filter(|h| matches(h)).collect()
    }

    /// First candidate whose fixed address is on the shared network, else
    /// the first candidate without a fixed address.
    fn seek_shared(
        &self,
        matches: impl Fn(&HostRecord) -> bool,
        topology: &Topology,
        shared: SharedNetworkId,
    ) -> Option<HostId> {
        let mut unaddressed = None;
        for (i, host) in self.hosts.iter().enumerate().filter(|(_, h)| matches(h)) {
            match host.fixed_address {
                Some(addr) if topology.on_link(shared, &addr) => return Some(HostId(i)),
                Some(_) => {}
                None => {
                    unaddressed.get_or_insert(HostId(i));
                }
            }
        }
        unaddressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, HostIdentifierConfig};
    use crate::wire::OPT_VENDOR_CLASS;

    fn topology() -> Topology {
        let config = Config::parse(
            r#"{"shared_networks": [
                { "name": "office", "subnets": ["2001:db8::/64"] },
                { "name": "lab", "subnets": ["2001:db8:9::/64"] }
            ]}"#,
        )
        .unwrap();
        Topology::from_config(&config).unwrap()
    }

    fn host(name: &str) -> HostConfig {
        HostConfig {
            name: name.to_string(),
            duid: None,
            hardware: None,
            identifier: None,
            fixed_address: None,
            fixed_prefixes: Vec::new(),
            options: PolicyValues::default(),
        }
    }

    const DUID: [u8; 10] = [0, 3, 0, 1, 0x52, 0x54, 0, 0, 0, 0xaa];

    #[test]
    fn test_lookup_prefers_host_on_shared_network() {
        let topo = topology();
        let office = SharedNetworkId(0);
        let db = HostDb::from_config(&[
            HostConfig {
                duid: Some(hex::encode(DUID)),
                fixed_address: Some("2001:db8:9::10".parse().unwrap()),
                ..host("lab-printer")
            },
            HostConfig {
                duid: Some(hex::encode(DUID)),
                fixed_address: Some("2001:db8::10".parse().unwrap()),
                ..host("office-printer")
            },
        ])
        .unwrap();

        let id = db.lookup(&DUID, &Options::new(), &[], &topo, office).unwrap();
        assert_eq!(db.get(id).name, "office-printer");
        let id = db.lookup(&DUID, &Options::new(), &[], &topo, SharedNetworkId(1)).unwrap();
        assert_eq!(db.get(id).name, "lab-printer");
    }

    #[test]
    fn test_lookup_skips_off_link_reservation() {
        let topo = topology();
        let db = HostDb::from_config(&[HostConfig {
            duid: Some(hex::encode(DUID)),
            fixed_address: Some("2001:db8:9::10".parse().unwrap()),
            ..host("lab-only")
        }])
        .unwrap();
        assert!(db.lookup(&DUID, &Options::new(), &[], &topo, SharedNetworkId(0)).is_none());
    }

    #[test]
    fn test_lookup_by_identifier_then_hardware() {
        let topo = topology();
        let db = HostDb::from_config(&[
            HostConfig {
                hardware: Some("52:54:00:00:00:aa".into()),
                ..host("by-mac")
            },
            HostConfig {
                identifier: Some(HostIdentifierConfig {
                    option: OPT_VENDOR_CLASS,
                    value: "00000009".into(),
                }),
                ..host("by-option")
            },
        ])
        .unwrap();

        let mut options = Options::new();
        options.push(OPT_VENDOR_CLASS, vec![0, 0, 0, 9]);
        let id = db.lookup(&DUID, &options, &[], &topo, SharedNetworkId(0)).unwrap();
        assert_eq!(db.get(id).name, "by-option");

        let id = db.lookup(&DUID, &Options::new(), &[], &topo, SharedNetworkId(0)).unwrap();
        assert_eq!(db.get(id).name, "by-mac");

        assert!(db.lookup(&[0, 2, 0, 0, 0, 9, 1], &Options::new(), &[], &topo, SharedNetworkId(0)).is_none());
    }

    #[test]
    fn test_client_hosts_ignore_network() {
        let db = HostDb::from_config(&[
            HostConfig {
                duid: Some(hex::encode(DUID)),
                fixed_address: Some("2001:db8:9::10".parse().unwrap()),
                ..host("lab-printer")
            },
            HostConfig {
                duid: Some(hex::encode(DUID)),
                fixed_address: Some("2001:db8::10".parse().unwrap()),
                ..host("office-printer")
            },
            HostConfig {
                hardware: Some("52:54:00:00:00:aa".into()),
                ..host("by-mac")
            },
        ])
        .unwrap();

        let names: Vec<&str> = db
            .client_hosts(&DUID, &Options::new(), &[])
            .iter()
            .map(|h| h.name.as_str())
            .collect();
        assert_eq!(names, ["lab-printer", "office-printer"]);

        // same MAC under another DUID falls back to the hardware match
        let other = [0, 3, 0, 1, 0x52, 0x54, 0, 0, 0, 0xaa, 0xbb];
        let hosts = db.client_hosts(&other, &Options::new(), &[]);
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name, "by-mac");

        assert!(db.client_hosts(&[0, 2, 0, 0, 0, 9, 1], &Options::new(), &[]).is_empty());
    }

    #[test]
    fn test_host_needs_an_identity() {
        assert!(HostDb::from_config(&[host("anonymous")]).is_err());
        let bad = HostConfig {
            duid: Some("not hex".into()),
            ..host("broken")
        };
        assert!(HostDb::from_config(&[bad]).is_err());
    }
}
