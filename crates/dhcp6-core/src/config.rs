use std::net::Ipv6Addr;
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};

use crate::policy::PolicyValues;
use crate::wire::IaKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Global scope, the broadest policy level.
    #[serde(default)]
    pub options: PolicyValues,
    #[serde(default)]
    pub shared_networks: Vec<SharedNetworkConfig>,
    #[serde(default)]
    pub classes: Vec<ClassConfig>,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interfaces the daemon listens on (joined to ff02::1:2).
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Hex server DUID. Generated and persisted in the lease file when unset.
    #[serde(default)]
    pub server_duid: Option<String>,
    /// Extra unicast listening address; packets received there count as unicast.
    #[serde(default)]
    pub unicast_address: Option<Ipv6Addr>,
    #[serde(default = "default_lease_file")]
    pub lease_file: String,
    #[serde(default = "default_max_reply_size")]
    pub max_reply_size: usize,
    #[serde(default = "default_expiry_interval")]
    pub expiry_interval_secs: u64,
    #[serde(default = "default_commit_interval")]
    pub commit_interval_secs: u64,
}

fn default_lease_file() -> String {
    "/var/lib/dhcp6d/dhcp6d.leases".to_string()
}
fn default_max_reply_size() -> usize {
    65535
}
fn default_expiry_interval() -> u64 {
    60
}
fn default_commit_interval() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            server_duid: None,
            unicast_address: None,
            lease_file: default_lease_file(),
            max_reply_size: default_max_reply_size(),
            expiry_interval_secs: default_expiry_interval(),
            commit_interval_secs: default_commit_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedNetworkConfig {
    pub name: String,
    /// Interfaces whose directly attached clients belong to this network.
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub subnets: Vec<Ipv6Net>,
    #[serde(default)]
    pub options: PolicyValues,
    #[serde(default)]
    pub ponds: Vec<PondConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PondConfig {
    #[serde(default)]
    pub permit: Vec<Permit>,
    #[serde(default)]
    pub prohibit: Vec<Permit>,
    #[serde(default)]
    pub options: PolicyValues,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(rename = "type")]
    pub kind: IaKind,
    pub network: Ipv6Net,
    /// Delegated prefix length, prefix pools only.
    #[serde(default)]
    pub prefix_len: Option<u8>,
}

/// Entry of a pond permit or prohibit list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permit {
    KnownClients,
    UnknownClients,
    AllClients,
    MembersOf(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassConfig {
    pub name: String,
    #[serde(rename = "match", default)]
    pub rule: ClassMatchConfig,
    #[serde(default)]
    pub options: PolicyValues,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassMatchConfig {
    /// Hex DUID prefix.
    #[serde(default)]
    pub duid_prefix: Option<String>,
    #[serde(default)]
    pub vendor_enterprise: Option<u32>,
    #[serde(default)]
    pub user_class: Option<String>,
    /// Relay Interface-ID, compared as text.
    #[serde(default)]
    pub interface_id: Option<String>,
    #[serde(default)]
    pub relay_link: Option<Ipv6Net>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    /// Hex client DUID.
    #[serde(default)]
    pub duid: Option<String>,
    /// Ethernet address, matched against DUID-LLT/DUID-LL identifiers.
    #[serde(default)]
    pub hardware: Option<String>,
    #[serde(default)]
    pub identifier: Option<HostIdentifierConfig>,
    #[serde(default)]
    pub fixed_address: Option<Ipv6Addr>,
    #[serde(default)]
    pub fixed_prefixes: Vec<Ipv6Net>,
    #[serde(default)]
    pub options: PolicyValues,
}

/// Match on the raw value of a client (or relay) option.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostIdentifierConfig {
    pub option: u16,
    /// Hex option payload.
    pub value: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            options: PolicyValues::default(),
            shared_networks: Vec::new(),
            classes: Vec::new(),
            hosts: Vec::new(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }

    /// Hex server DUID from the configuration, if any.
    pub fn server_duid(&self) -> Result<Option<Vec<u8>>> {
        self.server
            .server_duid
            .as_deref()
            .map(|s| parse_hex(s).context("Invalid server_duid"))
            .transpose()
    }
}

/// Hex decoding that accepts `aa:bb:cc` and `aabbcc`.
pub fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let cleaned: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
    hex::decode(&cleaned).with_context(|| format!("Invalid hex string: {}", s))
}
