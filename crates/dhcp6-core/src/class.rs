//! Client classification.

use anyhow::{Context, Result};
use ipnet::Ipv6Net;

use crate::config::{parse_hex, ClassConfig};
use crate::policy::PolicyValues;
use crate::wire::{Options, RelayMessage, OPT_INTERFACE_ID, OPT_USER_CLASS, OPT_VENDOR_CLASS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub usize);

#[derive(Debug, Clone)]
pub struct ClientClass {
    pub name: String,
    pub policy: PolicyValues,
    duid_prefix: Option<Vec<u8>>,
    vendor_enterprise: Option<u32>,
    user_class: Option<String>,
    interface_id: Option<String>,
    relay_link: Option<Ipv6Net>,
}

impl ClientClass {
    fn has_rules(&self) -> bool {
        self.duid_prefix.is_some()
            || self.vendor_enterprise.is_some()
            || self.user_class.is_some()
            || self.interface_id.is_some()
            || self.relay_link.is_some()
    }

    /// All configured rules must hold. A class without rules never matches.
    fn matches(&self, duid: &[u8], options: &Options, relays: &[RelayMessage]) -> bool {
        if !self.has_rules() {
            return false;
        }
        if let Some(prefix) = &self.duid_prefix {
            if !duid.starts_with(prefix) {
                return false;
            }
        }
        if let Some(enterprise) = self.vendor_enterprise {
            let found = options.get_all(OPT_VENDOR_CLASS).any(|data| {
                data.len() >= 4 && u32::from_be_bytes([data[0], data[1], data[2], data[3]]) == enterprise
            });
            if !found {
                return false;
            }
        }
        if let Some(needle) = &self.user_class {
            let found = options
                .get_all(OPT_USER_CLASS)
                .any(|data| user_class_items(data).any(|item| contains(item, needle.as_bytes())));
            if !found {
                return false;
            }
        }
        if let Some(ifid) = &self.interface_id {
            let found = relays
                .iter()
                .filter_map(|r| r.options.get(OPT_INTERFACE_ID))
                .any(|data| data.as_ref() == ifid.as_bytes());
            if !found {
                return false;
            }
        }
        if let Some(net) = &self.relay_link {
            if !relays.iter().any(|r| net.contains(&r.link_address)) {
                return false;
            }
        }
        true
    }
}

/// Length-prefixed opaque items of a USER_CLASS option.
fn user_class_items(mut data: &[u8]) -> impl Iterator<Item = &[u8]> {
    std::iter::from_fn(move || {
        if data.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let end = (2 + len).min(data.len());
        let (item, rest) = data.split_at(end);
        data = rest;
        Some(&item[2..])
    })
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

#[derive(Debug, Clone, Default)]
pub struct ClassSet {
    classes: Vec<ClientClass>,
}

impl ClassSet {
    pub fn from_config(configs: &[ClassConfig]) -> Result<Self> {
        let mut classes = Vec::with_capacity(configs.len());
        for c in configs {
            if classes.iter().any(|existing: &ClientClass| existing.name == c.name) {
                anyhow::bail!("Duplicate class name: {}", c.name);
            }
            let duid_prefix = c
                .rule
                .duid_prefix
                .as_deref()
                .map(parse_hex)
                .transpose()
                .with_context(|| format!("Invalid duid_prefix in class {}", c.name))?;
            classes.push(ClientClass {
                name: c.name.clone(),
                policy: c.options.clone(),
                duid_prefix,
                vendor_enterprise: c.rule.vendor_enterprise,
                user_class: c.rule.user_class.clone(),
                interface_id: c.rule.interface_id.clone(),
                relay_link: c.rule.relay_link,
            });
        }
        Ok(Self { classes })
    }

    pub fn get(&self, id: ClassId) -> &ClientClass {
        &self.classes[id.0]
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.iter().any(|c| c.name == name)
    }

    /// Classes matching this client, in configuration order.
    pub fn classify(&self, duid: &[u8], options: &Options, relays: &[RelayMessage]) -> Vec<ClassId> {
        self.classes
            .iter()
            .enumerate()
            .filter(|(_, c)| c.matches(duid, options, relays))
            .map(|(i, _)| ClassId(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassMatchConfig;
    use std::net::Ipv6Addr;

    fn class(name: &str, rule: ClassMatchConfig) -> ClassConfig {
        ClassConfig {
            name: name.to_string(),
            rule,
            options: PolicyValues::default(),
        }
    }

    #[test]
    fn test_classify_by_duid_and_vendor() {
        let set = ClassSet::from_config(&[
            class(
                "lab",
                ClassMatchConfig {
                    duid_prefix: Some("00:03".into()),
                    ..Default::default()
                },
            ),
            class(
                "phones",
                ClassMatchConfig {
                    vendor_enterprise: Some(9),
                    ..Default::default()
                },
            ),
            class("empty", ClassMatchConfig::default()),
        ])
        .unwrap();

        let mut options = Options::new();
        options.push(OPT_VENDOR_CLASS, vec![0, 0, 0, 9, 0, 2, b'i', b'p']);

        let ids = set.classify(&[0, 3, 0, 1, 1, 2, 3, 4, 5, 6], &options, &[]);
        let names: Vec<&str> = ids.iter().map(|id| set.get(*id).name.as_str()).collect();
        assert_eq!(names, vec!["lab", "phones"]);

        let ids = set.classify(&[0, 1], &Options::new(), &[]);
        assert!(ids.is_empty());
    }

    #[test]
    fn test_classify_by_user_class_and_relay() {
        let set = ClassSet::from_config(&[class(
            "branch",
            ClassMatchConfig {
                user_class: Some("kiosk".into()),
                relay_link: Some("2001:db8:5::/48".parse().unwrap()),
                ..Default::default()
            },
        )])
        .unwrap();

        let mut options = Options::new();
        options.push(OPT_USER_CLASS, b"\x00\x03abc\x00\x08my-kiosk".to_vec());
        let relay = RelayMessage {
            msg_type: crate::wire::MSG_RELAY_FORW,
            hop_count: 0,
            link_address: "2001:db8:5:1::1".parse::<Ipv6Addr>().unwrap(),
            peer_address: "fe80::1".parse::<Ipv6Addr>().unwrap(),
            options: Options::new(),
        };

        assert_eq!(set.classify(&[1], &options, &[relay.clone()]), vec![ClassId(0)]);
        // every rule has to hold
        assert!(set.classify(&[1], &options, &[]).is_empty());
    }

    #[test]
    fn test_duplicate_class_rejected() {
        let rule = ClassMatchConfig::default();
        assert!(ClassSet::from_config(&[class("a", rule.clone()), class("a", rule)]).is_err());
    }
}
