//! Packet dispatch: validation, relay unwrapping, shared-network selection
//! and the hand-off to the reply builders.
//!
//! [`Dhcp6Server`] owns all mutable server state. Every packet is handled
//! to completion before the next one, which is all the allocation
//! discipline the binding store needs.

use std::collections::HashSet;
use std::net::{Ipv6Addr, SocketAddrV6};

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::class::ClassSet;
use crate::config::{Config, ServerConfig};
use crate::duid::{generate_server_duid, hardware_from_link_local};
use crate::error::ReplyError;
use crate::hooks::{LeaseEvent, LeaseHooks};
use crate::host::HostDb;
use crate::leasefile::{IaRecord, LeaseStore, LoadedLeases};
use crate::policy::{evaluate_policy, PolicyValues};
use crate::reply::release::{self, Disposal};
use crate::reply::{build_reply, ClientContext, Engine};
use crate::store::{BindingStore, IaKey};
use crate::topology::{SharedNetworkId, Topology};
use crate::wire::{
    message_name, ClientMessage, Message, OptionWriter, RelayMessage, CLIENT_PORT, MSG_CONFIRM, MSG_DECLINE,
    MSG_INFORMATION_REQUEST, MSG_REBIND, MSG_RELAY_FORW, MSG_RELAY_REPL, MSG_RELEASE, MSG_RENEW, MSG_REQUEST,
    MSG_SOLICIT, OPTION_HEADER_LEN, OPT_ERO, OPT_IA_NA, OPT_IA_PD, OPT_IA_TA, OPT_INTERFACE_ID, OPT_RELAY_MSG,
    RELAY_HEADER_LEN, SERVER_PORT,
};

/// Relay-forward nesting beyond this is dropped.
pub const MAX_HOP_COUNT: usize = 32;

pub fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

// ── Configuration tables ────────────────────────────────────────────────────

/// Everything derived from the configuration file. Replaced as a whole on
/// reload.
#[derive(Debug)]
pub struct Tables {
    pub server: ServerConfig,
    pub global: PolicyValues,
    pub topology: Topology,
    pub hosts: HostDb,
    pub classes: ClassSet,
    pub server_duid: Vec<u8>,
}

impl Tables {
    pub fn from_config(config: &Config, server_duid: Vec<u8>) -> Result<Self> {
        Ok(Self {
            server: config.server.clone(),
            global: config.options.clone(),
            topology: Topology::from_config(config).context("Invalid shared network configuration")?,
            hosts: HostDb::from_config(&config.hosts).context("Invalid host configuration")?,
            classes: ClassSet::from_config(&config.classes).context("Invalid class configuration")?,
            server_duid,
        })
    }
}

// ── Packets ─────────────────────────────────────────────────────────────────

/// A datagram received on port 547.
#[derive(Debug, Clone, Copy)]
pub struct Inbound<'a> {
    pub payload: &'a [u8],
    pub source: SocketAddrV6,
    /// Name of the receiving interface.
    pub interface: &'a str,
    /// Received on the unicast address rather than ff02::1:2.
    pub unicast: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub payload: Bytes,
    pub destination: SocketAddrV6,
}

// ── Validation ──────────────────────────────────────────────────────────────

/// Solicit, Confirm and Rebind: sent to all servers, so never unicast and
/// never naming one.
pub fn valid_client_msg(msg: &ClientMessage, unicast: bool) -> Result<(), &'static str> {
    if msg.client_id().is_none_or(|id| id.is_empty()) {
        return Err("no client identifier");
    }
    if unicast {
        return Err("received by unicast");
    }
    if msg.server_id().is_some() {
        return Err("carries a server identifier");
    }
    Ok(())
}

/// Request, Renew, Release and Decline: addressed to this server.
pub fn valid_client_resp(msg: &ClientMessage, server_duid: &[u8]) -> Result<(), &'static str> {
    if msg.client_id().is_none_or(|id| id.is_empty()) {
        return Err("no client identifier");
    }
    match msg.server_id() {
        None => Err("no server identifier"),
        Some(id) if id.as_ref() != server_duid => Err("server identifier is not ours"),
        Some(_) => Ok(()),
    }
}

/// Information-request: no unicast, no IAs, and a server identifier (if
/// any) naming this server. The client identifier is optional.
pub fn valid_client_info_req(msg: &ClientMessage, unicast: bool, server_duid: &[u8]) -> Result<(), &'static str> {
    if unicast {
        return Err("received by unicast");
    }
    if [OPT_IA_NA, OPT_IA_TA, OPT_IA_PD].iter().any(|code| msg.options.contains(*code)) {
        return Err("carries an IA");
    }
    if msg.server_id().is_some_and(|id| id.as_ref() != server_duid) {
        return Err("server identifier is not ours");
    }
    Ok(())
}

fn is_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

// ── Server ──────────────────────────────────────────────────────────────────

pub struct Dhcp6Server {
    tables: Tables,
    store: BindingStore,
    leases: Box<dyn LeaseStore>,
    hooks: Box<dyn LeaseHooks>,
}

impl Dhcp6Server {
    /// Build the server from its configuration and whatever the lease store
    /// replayed. The server DUID comes from the configuration, else from
    /// the lease file, else it is generated and recorded.
    pub fn new(
        config: &Config,
        loaded: LoadedLeases,
        mut leases: Box<dyn LeaseStore>,
        hooks: Box<dyn LeaseHooks>,
    ) -> Result<Self> {
        let server_duid = match (config.server_duid()?, loaded.server_duid.clone()) {
            (Some(duid), _) => duid,
            (None, Some(duid)) => duid,
            (None, None) => {
                let duid = generate_server_duid(&config.server.interfaces, unix_now());
                info!("Generated server DUID {}", hex::encode(&duid));
                duid
            }
        };
        if loaded.server_duid.as_ref() != Some(&server_duid) {
            leases
                .write_server_duid(&server_duid)
                .context("Failed to record the server DUID")?;
        }

        let tables = Tables::from_config(config, server_duid)?;
        let mut store = BindingStore::new();
        for record in &loaded.ias {
            match record.key() {
                Ok(key) => store.restore_ia(key, record.cltt, record.restored()),
                Err(e) => warn!("Skipping lease record: {:#}", e),
            }
        }
        store.reattach(&tables.topology, &tables.hosts);

        info!(
            "Server DUID {}, {} shared networks, {} hosts",
            hex::encode(&tables.server_duid),
            tables.topology.networks().len(),
            tables.hosts.len()
        );
        Ok(Self {
            tables,
            store,
            leases,
            hooks,
        })
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn store(&self) -> &BindingStore {
        &self.store
    }

    pub fn server_duid(&self) -> &[u8] {
        &self.tables.server_duid
    }

    /// Swap in a new configuration. Bindings survive; their pool membership
    /// is resolved again. On error the running configuration stays.
    pub fn reload(&mut self, config: &Config) -> Result<()> {
        let server_duid = config.server_duid()?.unwrap_or_else(|| self.tables.server_duid.clone());
        let tables = Tables::from_config(config, server_duid)?;
        if tables.server_duid != self.tables.server_duid {
            self.leases
                .write_server_duid(&tables.server_duid)
                .context("Failed to record the server DUID")?;
        }
        self.store.reattach(&tables.topology, &tables.hosts);
        self.tables = tables;
        info!("Configuration reloaded");
        Ok(())
    }

    /// Answer one datagram. `None` means the packet is dropped.
    pub fn dispatch(&mut self, inbound: &Inbound<'_>, now: u64) -> Option<Outbound> {
        let message = match Message::parse(inbound.payload) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed packet from {}: {}", inbound.source, e);
                return None;
            }
        };
        let to_relay = matches!(message, Message::Relay(_));

        let limit = self.tables.server.max_reply_size;
        let mut relays = Vec::new();
        let payload = self.handle(message, &mut relays, inbound, now, limit);

        if let Err(e) = self.leases.commit(false) {
            error!("Lease file commit failed: {:#}", e);
        }

        let port = if to_relay { SERVER_PORT } else { CLIENT_PORT };
        payload.map(|payload| Outbound {
            payload,
            destination: SocketAddrV6::new(*inbound.source.ip(), port, 0, inbound.source.scope_id()),
        })
    }

    /// `relays` holds the Relay-forward messages enclosing `message`,
    /// outermost first.
    fn handle(
        &mut self,
        message: Message,
        relays: &mut Vec<RelayMessage>,
        inbound: &Inbound<'_>,
        now: u64,
        limit: usize,
    ) -> Option<Bytes> {
        match message {
            Message::Relay(relay) if relay.msg_type == MSG_RELAY_FORW => {
                self.relay_forward(relay, relays, inbound, now, limit)
            }
            Message::Relay(relay) => {
                debug!("Dropping {} from {}", message_name(relay.msg_type), inbound.source);
                None
            }
            Message::Client(msg) => {
                // only the outermost packet can have arrived by unicast
                let unicast = inbound.unicast && relays.is_empty();
                self.client_message(&msg, relays, unicast, inbound, now, limit)
            }
        }
    }

    fn relay_forward(
        &mut self,
        relay: RelayMessage,
        relays: &mut Vec<RelayMessage>,
        inbound: &Inbound<'_>,
        now: u64,
        limit: usize,
    ) -> Option<Bytes> {
        if relays.len() >= MAX_HOP_COUNT {
            debug!("Dropping Relay-forward from {}: nested too deep", inbound.source);
            return None;
        }
        let Some(inner) = relay.options.get(OPT_RELAY_MSG).cloned() else {
            info!(
                "Relay-forward from {} with link address={} and peer address={} missing Relay Message option.",
                inbound.source, relay.link_address, relay.peer_address
            );
            return None;
        };
        let inner = match Message::parse(&inner) {
            Ok(inner) => inner,
            Err(e) => {
                debug!("Dropping Relay-forward from {}: relayed message: {}", inbound.source, e);
                return None;
            }
        };
        let inner_limit = limit.checked_sub(RELAY_HEADER_LEN + OPTION_HEADER_LEN)?;

        relays.push(relay);
        let reply = self.handle(inner, relays, inbound, now, inner_limit);
        let relay = relays.pop()?;
        let reply = reply.filter(|r| !r.is_empty())?;

        match wrap_relay_reply(&relay, &reply, limit) {
            Ok(wrapped) => Some(wrapped),
            Err(e) => {
                debug!("Unable to wrap reply for relay {}: {}", relay.peer_address, e);
                None
            }
        }
    }

    fn client_message(
        &mut self,
        msg: &ClientMessage,
        relays: &[RelayMessage],
        unicast: bool,
        inbound: &Inbound<'_>,
        now: u64,
        limit: usize,
    ) -> Option<Bytes> {
        let name = message_name(msg.msg_type);
        let tables = &self.tables;

        let valid = match msg.msg_type {
            MSG_SOLICIT | MSG_CONFIRM | MSG_REBIND => valid_client_msg(msg, unicast),
            MSG_REQUEST | MSG_RENEW | MSG_RELEASE | MSG_DECLINE => valid_client_resp(msg, &tables.server_duid),
            MSG_INFORMATION_REQUEST => valid_client_info_req(msg, unicast, &tables.server_duid),
            _ => Err("not a message a server accepts"),
        };
        if let Err(reason) = valid {
            debug!("Dropping {} from {}: {}", name, inbound.source, reason);
            return None;
        }

        let client_id = msg.client_id().map(|id| id.as_ref());
        let duid = client_id.unwrap_or_default();
        let shared = select_shared(&tables.topology, relays, inbound.interface, inbound.source.ip());
        let host = shared.and_then(|s| tables.hosts.lookup(duid, &msg.options, relays, &tables.topology, s));
        let classes = tables.classes.classify(duid, &msg.options, relays);
        let class_names = classes.iter().map(|c| tables.classes.get(*c).name.clone()).collect();
        let ctx = ClientContext {
            message: msg,
            client_id,
            relays,
            shared,
            host,
            classes,
            class_names,
            max_reply_size: limit,
        };
        // the innermost relay saw the client's own address
        let client_addr = relays.last().map_or(*inbound.source.ip(), |r| r.peer_address);
        let hardware = hardware_from_link_local(&client_addr).map(hex::encode);
        debug!(
            "{} from {} duid {} hw {} (shared network {:?}, host {:?})",
            name,
            inbound.source,
            hex::encode(duid),
            hardware.as_deref().unwrap_or("-"),
            shared.map(|s| tables.topology.network(s).name.as_str()),
            host.map(|h| tables.hosts.get(h).name.as_str())
        );

        let engine = Engine {
            tables,
            store: &mut self.store,
            leases: &mut *self.leases,
            hooks: &mut *self.hooks,
            now,
        };
        let result = match msg.msg_type {
            MSG_CONFIRM => release::confirm(tables, &ctx),
            MSG_RELEASE => release::release_or_decline(engine, &ctx, Disposal::Release),
            MSG_DECLINE => release::release_or_decline(engine, &ctx, Disposal::Decline),
            _ => match shared {
                Some(shared) => build_reply(engine, &ctx, shared),
                None => {
                    debug!("Dropping {} from {}: no shared network for the client", name, inbound.source);
                    return None;
                }
            },
        };

        match result {
            Ok(reply) => reply,
            Err(ReplyError::NoSpace) => {
                error!("Reply to {} from {} does not fit in {} bytes", name, inbound.source, limit);
                None
            }
            Err(ReplyError::Failure(reason)) => {
                error!("Unable to answer {} from {}: {}", name, inbound.source, reason);
                None
            }
            Err(e) => {
                debug!("Dropping {} from {}: {}", name, inbound.source, e);
                None
            }
        }
    }

    /// Expire every binding whose lifetime ran out, fire expiry hooks and
    /// record the affected IAs. Returns how many bindings expired.
    pub fn expire_leases(&mut self, now: u64) -> usize {
        let expired = self.store.expire_leases(now);
        let mut touched: Vec<IaKey> = Vec::new();
        let mut seen = HashSet::new();

        for lease in &expired {
            let topology = &self.tables.topology;
            let mut scopes: Vec<&PolicyValues> = vec![&self.tables.global];
            if let Some(pool) = lease.pool.map(|p| topology.pool(p)) {
                scopes.push(&topology.network(pool.shared_network).policy);
                scopes.push(&topology.pond(pool.pond).policy);
            }
            let policy = evaluate_policy(scopes);

            info!("Binding {} for {} expired", lease, lease.owner);
            let event = LeaseEvent::from_lease(lease, policy.on_expiry.as_deref());
            self.hooks.on_expiry(&event);
            if policy.ddns_updates {
                self.hooks.ddns_remove(&event);
            }
            if seen.insert(lease.owner.clone()) {
                touched.push(lease.owner.clone());
            }
        }

        for key in &touched {
            let record = IaRecord::snapshot(&self.store, key, now);
            if let Err(e) = self.leases.write_ia(&record) {
                error!("Failed to record {} in the lease file: {:#}", key, e);
            }
        }
        if !expired.is_empty() {
            if let Err(e) = self.leases.commit(false) {
                error!("Lease file commit failed: {:#}", e);
            }
        }
        expired.len()
    }

    /// Push pending lease records to disk; `flush` also syncs them.
    pub fn commit(&mut self, flush: bool) -> Result<()> {
        self.leases.commit(flush)
    }
}

/// The shared network a client is on: the one owning the link address of
/// the relay closest to the client that set a usable one, else the one
/// configured for the receiving interface, else the one owning the
/// client's own global source address, else the only one there is.
pub fn select_shared(
    topology: &Topology,
    relays: &[RelayMessage],
    interface: &str,
    source: &Ipv6Addr,
) -> Option<SharedNetworkId> {
    for relay in relays.iter().rev() {
        let link = relay.link_address;
        if link.is_unspecified() || is_link_local(&link) {
            continue;
        }
        return topology.network_for_address(&link);
    }
    topology
        .network_for_interface(interface)
        .or_else(|| {
            (relays.is_empty() && !is_link_local(source))
                .then(|| topology.network_for_address(source))
                .flatten()
        })
        .or_else(|| topology.sole_network())
}

/// Relay-reply around `reply`: Interface-ID and whatever the relay's ERO
/// asks for (of what the relay itself sent) are echoed back.
fn wrap_relay_reply(relay: &RelayMessage, reply: &[u8], limit: usize) -> Result<Bytes, ReplyError> {
    let mut out = OptionWriter::relay_message(
        MSG_RELAY_REPL,
        relay.hop_count,
        relay.link_address,
        relay.peer_address,
        limit,
    )?;
    if let Some(interface_id) = relay.options.get(OPT_INTERFACE_ID) {
        out.put_option(OPT_INTERFACE_ID, interface_id)?;
    }
    out.put_option(OPT_RELAY_MSG, reply)?;
    for code in relay.options.requested_codes(OPT_ERO) {
        if code == OPT_INTERFACE_ID || code == OPT_RELAY_MSG {
            continue;
        }
        if let Some(data) = relay.options.get(code) {
            if !out.put_option_if_fits(code, data) {
                debug!("Option {} requested by relay {} does not fit", code, relay.peer_address);
            }
        }
    }
    Ok(out.freeze())
}
