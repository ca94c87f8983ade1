//! Scoped configuration values and their evaluation.
//!
//! Every scope (global, shared network, pond, class, host) carries a sparse
//! [`PolicyValues`]. [`evaluate_policy`] merges a chain of scopes, broadest
//! first, into an immutable [`EffectivePolicy`] snapshot.

use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

/// Valid lifetime used when neither the client nor the configuration
/// supplies one.
pub const DEFAULT_LEASE_TIME: u32 = 43_200;

/// How a client's preferred prefix length is weighed against pool lengths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefixLengthMode {
    /// Any pool, the hint is ignored.
    Ignore,
    /// Pools of the requested length first, then any pool.
    Prefer,
    /// Only pools of the requested length.
    #[default]
    Exact,
    /// Pools delegating the requested length or longer.
    Minimum,
    /// Pools delegating the requested length or shorter.
    Maximum,
}

impl PrefixLengthMode {
    /// Pool-length filters to try in order. `None` means "any length".
    pub fn passes(self, hint: Option<u8>) -> Vec<LengthFilter> {
        let Some(hint) = hint else {
            return vec![LengthFilter::Any];
        };
        match self {
            PrefixLengthMode::Ignore => vec![LengthFilter::Any],
            PrefixLengthMode::Prefer => vec![LengthFilter::Exact(hint), LengthFilter::Any],
            PrefixLengthMode::Exact => vec![LengthFilter::Exact(hint)],
            PrefixLengthMode::Minimum => vec![LengthFilter::AtLeast(hint)],
            PrefixLengthMode::Maximum => vec![LengthFilter::AtMost(hint)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthFilter {
    Any,
    Exact(u8),
    AtLeast(u8),
    AtMost(u8),
}

impl LengthFilter {
    pub fn accepts(self, pool_len: u8) -> bool {
        match self {
            LengthFilter::Any => true,
            LengthFilter::Exact(n) => pool_len == n,
            LengthFilter::AtLeast(n) => pool_len >= n,
            LengthFilter::AtMost(n) => pool_len <= n,
        }
    }
}

/// Sparse per-scope settings. Unset fields inherit from broader scopes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyValues {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_lease_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_lifetime: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewal_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebinding_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tee_times_from_lifetime: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rapid_commit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddns_updates: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_addrs_per_ia: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_prefs_per_ia: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_length_mode: Option<PrefixLengthMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preference: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_servers: Option<Vec<Ipv6Addr>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_search: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub information_refresh_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_release: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_expiry: Option<String>,
}

macro_rules! overlay_fields {
    ($base:ident, $narrower:ident, $($field:ident),+ $(,)?) => {
        $(
            if $narrower.$field.is_some() {
                $base.$field = $narrower.$field.clone();
            }
        )+
    };
}

impl PolicyValues {
    /// Settings of `narrower` replace the ones here; unset fields are kept.
    pub fn overlay(mut self, narrower: &PolicyValues) -> Self {
        overlay_fields!(
            self,
            narrower,
            default_lease_time,
            preferred_lifetime,
            renewal_time,
            rebinding_time,
            tee_times_from_lifetime,
            rapid_commit,
            ddns_updates,
            limit_addrs_per_ia,
            limit_prefs_per_ia,
            prefix_length_mode,
            preference,
            dns_servers,
            domain_search,
            information_refresh_time,
            on_commit,
            on_release,
            on_expiry,
        );
        self
    }
}

/// Resolved settings for one binding or one reply.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    pub default_lease_time: Option<u32>,
    pub preferred_lifetime: Option<u32>,
    pub renewal_time: Option<u32>,
    pub rebinding_time: Option<u32>,
    pub tee_times_from_lifetime: bool,
    pub rapid_commit: bool,
    pub ddns_updates: bool,
    pub limit_addrs_per_ia: u32,
    pub limit_prefs_per_ia: u32,
    pub prefix_length_mode: PrefixLengthMode,
    pub preference: Option<u8>,
    pub dns_servers: Vec<Ipv6Addr>,
    pub domain_search: Vec<String>,
    pub information_refresh_time: Option<u32>,
    pub on_commit: Option<String>,
    pub on_release: Option<String>,
    pub on_expiry: Option<String>,
}

impl Default for EffectivePolicy {
    fn default() -> Self {
        let none: [&PolicyValues; 0] = [];
        evaluate_policy(none)
    }
}

/// Merge scopes in order, broadest first.
pub fn evaluate_policy<'a>(scopes: impl IntoIterator<Item = &'a PolicyValues>) -> EffectivePolicy {
    let merged = scopes
        .into_iter()
        .fold(PolicyValues::default(), |acc, scope| acc.overlay(scope));

    EffectivePolicy {
        default_lease_time: merged.default_lease_time,
        preferred_lifetime: merged.preferred_lifetime,
        renewal_time: merged.renewal_time,
        rebinding_time: merged.rebinding_time,
        tee_times_from_lifetime: merged.tee_times_from_lifetime.unwrap_or(false),
        rapid_commit: merged.rapid_commit.unwrap_or(false),
        ddns_updates: merged.ddns_updates.unwrap_or(true),
        limit_addrs_per_ia: merged.limit_addrs_per_ia.unwrap_or(1),
        limit_prefs_per_ia: merged.limit_prefs_per_ia.unwrap_or(1),
        prefix_length_mode: merged.prefix_length_mode.unwrap_or_default(),
        preference: merged.preference,
        dns_servers: merged.dns_servers.unwrap_or_default(),
        domain_search: merged.domain_search.unwrap_or_default(),
        information_refresh_time: merged.information_refresh_time,
        on_commit: merged.on_commit,
        on_release: merged.on_release,
        on_expiry: merged.on_expiry,
    }
}

impl EffectivePolicy {
    /// Preferred and valid lifetimes to send, given the client's hints
    /// (0 = no hint).
    pub fn lifetimes(&self, client_preferred: u32, client_valid: u32) -> (u32, u32) {
        let valid = self.default_lease_time.unwrap_or(if client_valid == 0 {
            DEFAULT_LEASE_TIME
        } else {
            client_valid
        });
        let mut preferred = self.preferred_lifetime.unwrap_or(if client_preferred == 0 {
            valid
        } else {
            client_preferred
        });
        if preferred >= valid {
            preferred = valid / 2 + valid / 8;
        }
        (preferred, valid)
    }

    /// T1/T2 for an IA whose smallest preferred lifetime is `min_preferred`.
    pub fn tee_times(&self, min_preferred: Option<u32>) -> (u32, u32) {
        let derived = match (self.tee_times_from_lifetime, min_preferred) {
            (true, Some(p)) => (p / 2, (u64::from(p) * 4 / 5) as u32),
            _ => (0, 0),
        };
        (
            self.renewal_time.unwrap_or(derived.0),
            self.rebinding_time.unwrap_or(derived.1),
        )
    }
}
