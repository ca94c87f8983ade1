//! Reply construction.
//!
//! [`build_reply`] answers Solicit, Request, Renew, Rebind and
//! Information-request: every IA the client sent is processed in order
//! (IA_NA, then IA_TA, then IA_PD) straight into the reply buffer, followed
//! by the top-level options. Confirm, Release and Decline have their own
//! lighter handlers in [`release`].
//!
//! Each IA is opened with a placeholder length and the client's T1/T2; its
//! sub-options are collected first so a status wipe can replace them, then
//! written, and the length and timers are patched when the IA is closed.

mod address;
mod prefix;
pub mod release;
mod temporary;

use std::net::Ipv6Addr;

use bytes::Bytes;
use tracing::{debug, error, info};

use crate::allocator::AllocRequest;
use crate::class::ClassId;
use crate::dispatch::Tables;
use crate::error::ReplyError;
use crate::hooks::{LeaseEvent, LeaseHooks};
use crate::host::{HostId, HostRecord};
use crate::leasefile::{IaRecord, LeaseStore};
use crate::policy::{evaluate_policy, EffectivePolicy, PolicyValues};
use crate::store::{BindingStore, Ia, IaKey, Lease, LeaseId, LeaseState};
use crate::topology::{PondId, Requester, SharedNetworkId};
use crate::wire::{
    encode_addresses, encode_domain_list, message_name, status_data, ClientMessage, IaKind, IaRequest, OptionMark,
    OptionWriter, Options, RelayMessage, StatusCode, MSG_ADVERTISE, MSG_INFORMATION_REQUEST, MSG_REPLY,
    MSG_SOLICIT, OPT_CLIENTID, OPT_DNS_SERVERS, OPT_DOMAIN_LIST, OPT_INFORMATION_REFRESH_TIME, OPT_ORO,
    OPT_PREFERENCE, OPT_RAPID_COMMIT, OPT_RECONF_ACCEPT, OPT_SERVERID, OPT_STATUS_CODE,
};

// ── Request context ─────────────────────────────────────────────────────────

/// Everything known about the client before any IA is looked at.
#[derive(Debug)]
pub struct ClientContext<'a> {
    pub message: &'a ClientMessage,
    /// Absent only for Information-request.
    pub client_id: Option<&'a [u8]>,
    /// Enclosing Relay-forward messages, outermost first.
    pub relays: &'a [RelayMessage],
    pub shared: Option<SharedNetworkId>,
    pub host: Option<HostId>,
    pub classes: Vec<ClassId>,
    pub class_names: Vec<String>,
    /// Room for the reply once enclosing Relay-reply headers are paid for.
    pub max_reply_size: usize,
}

impl ClientContext<'_> {
    pub fn duid(&self) -> &[u8] {
        self.client_id.unwrap_or_default()
    }

    pub fn requester(&self) -> Requester<'_> {
        Requester {
            known: self.host.is_some(),
            classes: &self.class_names,
        }
    }

    pub fn host<'t>(&self, tables: &'t Tables) -> Option<&'t HostRecord> {
        self.host.map(|id| tables.hosts.get(id))
    }

    /// Policy for this client: global, shared network, `pond` when the
    /// binding comes from one, matching classes, host.
    pub fn policy(&self, tables: &Tables, pond: Option<PondId>) -> EffectivePolicy {
        let mut scopes: Vec<&PolicyValues> = vec![&tables.global];
        if let Some(shared) = self.shared {
            scopes.push(&tables.topology.network(shared).policy);
        }
        if let Some(pond) = pond {
            scopes.push(&tables.topology.pond(pond).policy);
        }
        scopes.extend(self.classes.iter().map(|c| &tables.classes.get(*c).policy));
        if let Some(host) = self.host(tables) {
            scopes.push(&host.policy);
        }
        evaluate_policy(scopes)
    }
}

/// Mutable server state a reply works against.
pub struct Engine<'a> {
    pub tables: &'a Tables,
    pub store: &'a mut BindingStore,
    pub leases: &'a mut dyn LeaseStore,
    pub hooks: &'a mut dyn LeaseHooks,
    pub now: u64,
}

// ── Per-IA scratch state ────────────────────────────────────────────────────

/// A host reservation sent in the current IA.
struct FixedResource {
    address: Ipv6Addr,
    prefix_len: u8,
    policy: EffectivePolicy,
}

struct IaScratch {
    key: IaKey,
    mark: OptionMark,
    /// The client's binding before this message.
    old: Option<Ia>,
    /// Sub-options to send, written when the IA is closed.
    options: Options,
    /// Pool bindings making up the new IA, with the policy each was sent under.
    attached: Vec<(LeaseId, EffectivePolicy)>,
    fixed: Vec<FixedResource>,
    /// Policy of the last resource sent; drives T1/T2.
    policy: Option<EffectivePolicy>,
    client_preferred: u32,
    client_valid: u32,
    min_preferred: Option<u32>,
    min_valid: Option<u32>,
    client_resources: u32,
    /// Something (possibly with zero lifetimes) was put in the IA.
    resources_included: bool,
}

impl IaScratch {
    /// Lifetime hints: the smallest nonzero value the client sent wins.
    fn hint_lifetimes(&mut self, preferred: u32, valid: u32) {
        if self.client_valid == 0 || self.client_valid > valid {
            self.client_valid = valid;
        }
        if self.client_preferred == 0 || self.client_preferred > preferred {
            self.client_preferred = preferred;
        }
    }

    /// Replace everything sent so far with a single status code.
    fn wipe(&mut self, status: StatusCode, message: &str) {
        self.options.clear();
        self.options.push(OPT_STATUS_CODE, status_data(status, message));
    }

    fn send(&mut self, code: u16, data: Bytes) {
        self.options.push(code, data);
        self.resources_included = true;
    }

    fn attach(&mut self, id: LeaseId, policy: &EffectivePolicy) {
        if !self.attached.iter().any(|(a, _)| *a == id) {
            self.attached.push((id, policy.clone()));
        }
    }
}

/// Something the client is entitled to in the current IA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resource {
    /// The host reservation.
    Fixed,
    Lease(LeaseId),
}

/// What to do with the rest of an IA after one submitted resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// The IA carries a status code now; skip the rest of its resources.
    Cancel,
}

fn short_kind(kind: IaKind) -> &'static str {
    match kind {
        IaKind::Na => "NA",
        IaKind::Ta => "TA",
        IaKind::Pd => "PD",
    }
}

fn state_rank(state: LeaseState) -> u8 {
    match state {
        LeaseState::Active => 2,
        LeaseState::Expired => 1,
        LeaseState::Abandoned => 0,
    }
}

/// Whether `a` should be preferred over `b` when reusing an old binding.
fn lease_better(a: &Lease, b: &Lease, preferred_len: Option<u8>) -> bool {
    if let Some(len) = preferred_len {
        if (a.prefix_len == len) != (b.prefix_len == len) {
            return a.prefix_len == len;
        }
    }
    match state_rank(a.state).cmp(&state_rank(b.state)) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => a.state != LeaseState::Abandoned && a.hard_end > b.hard_end,
    }
}

// ── Reply state ─────────────────────────────────────────────────────────────

pub struct ReplyState<'a, 'c> {
    engine: Engine<'a>,
    ctx: &'c ClientContext<'c>,
    shared: SharedNetworkId,
    out: OptionWriter,
    reply_type: u8,
    rapid_commit: bool,
    /// Reply-wide policy (no pond).
    policy: EffectivePolicy,
    /// Policy of the last resource sent in any IA, used for top-level options.
    last_policy: Option<EffectivePolicy>,
    ia_count: usize,
    pd_count: usize,
}

/// Build the reply to a Solicit, Request, Renew, Rebind or
/// Information-request. `Ok(None)` means the client gets no answer.
pub fn build_reply<'c>(
    engine: Engine<'_>,
    ctx: &'c ClientContext<'c>,
    shared: SharedNetworkId,
) -> Result<Option<Bytes>, ReplyError> {
    let mut reply = ReplyState::start(engine, ctx, shared)?;

    for ia in IaRequest::all(IaKind::Na, &ctx.message.options)? {
        reply.process_ia_na(&ia)?;
    }
    for ia in IaRequest::all(IaKind::Ta, &ctx.message.options)? {
        reply.process_ia_ta(&ia)?;
    }
    for ia in IaRequest::all(IaKind::Pd, &ctx.message.options)? {
        reply.process_ia_pd(&ia)?;
    }

    reply.finish()
}

impl<'a, 'c> ReplyState<'a, 'c> {
    fn start(engine: Engine<'a>, ctx: &'c ClientContext<'c>, shared: SharedNetworkId) -> Result<Self, ReplyError> {
        let msg = ctx.message;
        let policy = ctx.policy(engine.tables, None);

        let (reply_type, rapid_commit) = if msg.msg_type == MSG_SOLICIT {
            if policy.rapid_commit && msg.options.contains(OPT_RAPID_COMMIT) {
                (MSG_REPLY, true)
            } else {
                (MSG_ADVERTISE, false)
            }
        } else {
            (MSG_REPLY, false)
        };

        let mut out = OptionWriter::client_message(reply_type, msg.transaction_id, ctx.max_reply_size)?;
        if let Some(client_id) = ctx.client_id {
            out.put_option(OPT_CLIENTID, client_id)?;
        }
        out.put_option(OPT_SERVERID, &engine.tables.server_duid)?;

        Ok(Self {
            engine,
            ctx,
            shared,
            out,
            reply_type,
            rapid_commit,
            policy,
            last_policy: None,
            ia_count: 0,
            pd_count: 0,
        })
    }

    fn msg_type(&self) -> u8 {
        self.ctx.message.msg_type
    }

    /// Allocation request for `key`. Borrows the client context, not `self`,
    /// so the store can be handed to the allocator alongside it.
    fn alloc_request<'k>(&self, key: &'k IaKey) -> AllocRequest<'k>
    where
        'c: 'k,
    {
        let ctx: &'c ClientContext<'c> = self.ctx;
        AllocRequest {
            key,
            shared: self.shared,
            requester: ctx.requester(),
        }
    }

    /// A rapid-commit Solicit that turns out to involve an off-link
    /// address is answered with a plain Advertise.
    fn demote_rapid_commit(&mut self) {
        if self.msg_type() == MSG_SOLICIT && self.reply_type == MSG_REPLY {
            debug!("Off-link address in rapid-commit Solicit, sending Advertise");
            self.reply_type = MSG_ADVERTISE;
            self.rapid_commit = false;
            self.out.patch_u8(0, MSG_ADVERTISE);
        }
    }

    /// Policy for a pool binding (its pond's scope included), or for a host
    /// reservation when `lease` is `None`.
    fn resource_policy(&self, lease: Option<LeaseId>) -> EffectivePolicy {
        let tables = self.engine.tables;
        let pond = lease
            .and_then(|id| self.engine.store.lease(id))
            .and_then(|l| l.pool)
            .map(|pool| tables.topology.pool(pool).pond);
        self.ctx.policy(tables, pond)
    }

    /// Whether the IA already carries as many resources as the pool holding
    /// `addr/prefix_len` allows. A hint past the cap must not claim a slot.
    fn ia_is_full(&self, ia: &IaScratch, kind: IaKind, addr: &Ipv6Addr, prefix_len: u8) -> bool {
        if ia.client_resources == 0 {
            return false;
        }
        let topology = &self.engine.tables.topology;
        let pond = topology
            .pool_for(kind, addr, prefix_len)
            .map(|pool| topology.pool(pool).pond);
        let policy = self.ctx.policy(self.engine.tables, pond);
        let limit = match kind {
            IaKind::Pd => policy.limit_prefs_per_ia,
            IaKind::Na | IaKind::Ta => policy.limit_addrs_per_ia,
        };
        ia.client_resources >= limit
    }

    /// Whether the pond a binding was drawn from still admits this client.
    fn pond_permits(&self, lease: &Lease) -> bool {
        let topology = &self.engine.tables.topology;
        lease.pool.is_some_and(|pool| {
            let pool = topology.pool(pool);
            pool.shared_network == self.shared && topology.pond(pool.pond).permits(&self.ctx.requester())
        })
    }

    /// The binding of the client's old IA matching `addr/prefix_len` when
    /// it is still usable and permitted.
    fn owned_lease(&self, ia: &IaScratch, addr: &Ipv6Addr, prefix_len: u8) -> Option<LeaseId> {
        let old = ia.old.as_ref()?;
        let store = &*self.engine.store;
        let lease = store
            .ia_leases(old)
            .find(|l| l.address == *addr && l.prefix_len == prefix_len)?;
        (store.lease_usable(lease.id) && self.pond_permits(lease)).then_some(lease.id)
    }

    /// Best binding of the old IA to hand out again: active before
    /// abandoned, later end time first, and for prefixes the client's
    /// preferred length before anything else.
    fn best_old_lease(&self, ia: &IaScratch, preferred_len: Option<u8>) -> Option<(LeaseId, LeaseState)> {
        let old = ia.old.as_ref()?;
        let store = &*self.engine.store;
        let mut best: Option<&Lease> = None;
        for lease in store.ia_leases(old) {
            if !store.lease_usable(lease.id) || !self.pond_permits(lease) {
                continue;
            }
            best = match best {
                Some(current) if !lease_better(lease, current, preferred_len) => Some(current),
                _ => Some(lease),
            };
        }
        best.map(|l| (l.id, l.state))
    }

    // ── IA framing ──────────────────────────────────────────────────────────

    fn begin_ia(&mut self, req: &IaRequest) -> Result<IaScratch, ReplyError> {
        let key = IaKey::new(req.kind, req.iaid, self.ctx.duid());
        let mark = self.out.begin_option(req.kind.option_code())?;
        self.out.put_u32(req.iaid)?;
        if req.kind != IaKind::Ta {
            // the client's timers stand in until the IA is closed
            self.out.put_u32(req.t1)?;
            self.out.put_u32(req.t2)?;
        }
        let old = self.engine.store.ia(&key).cloned();
        Ok(IaScratch {
            key,
            mark,
            old,
            options: Options::new(),
            attached: Vec::new(),
            fixed: Vec::new(),
            policy: None,
            client_preferred: 0,
            client_valid: 0,
            min_preferred: None,
            min_valid: None,
            client_resources: 0,
            resources_included: false,
        })
    }

    /// Leave the IA out of the reply altogether.
    fn omit_ia(&mut self, ia: IaScratch) {
        debug!("Leaving {} out of the reply: nothing to send", ia.key);
        self.out.discard(ia.mark);
    }

    /// Lifetimes for a resource about to be sent, recorded on the binding
    /// and folded into the IA's minimums. The binding joins the new IA.
    fn is_addressed(&mut self, ia: &mut IaScratch, lease: Option<LeaseId>, policy: &EffectivePolicy) -> (u32, u32) {
        let (preferred, valid) = policy.lifetimes(ia.client_preferred, ia.client_valid);
        ia.min_preferred = Some(ia.min_preferred.map_or(preferred, |m| m.min(preferred)));
        ia.min_valid = Some(ia.min_valid.map_or(valid, |m| m.min(valid)));

        if let Some(id) = lease {
            let soft_end = (self.reply_type == MSG_REPLY).then(|| self.engine.now + u64::from(valid));
            self.engine.store.set_lifetimes(id, preferred, valid, soft_end);
            ia.attach(id, policy);
        }

        ia.policy = Some(policy.clone());
        self.last_policy = Some(policy.clone());
        ia.client_resources += 1;
        (preferred, valid)
    }

    /// Write the IA's sub-options, patch its length and timers and, for a
    /// Reply, commit what it carries.
    fn close_ia(&mut self, ia: IaScratch, canceled: bool) -> Result<(), ReplyError> {
        for opt in ia.options.iter() {
            self.out.put_option(opt.code, &opt.data)?;
        }
        self.out.end_option(ia.mark)?;

        if ia.key.kind != IaKind::Ta {
            let policy = ia.policy.as_ref().unwrap_or(&self.policy);
            let (t1, t2) = policy.tee_times(ia.min_preferred);
            let body = ia.mark.body_offset();
            self.out.patch_u32(body + 4, t1);
            self.out.patch_u32(body + 8, t2);
        }

        if canceled {
            return Ok(());
        }

        self.log_ia(&ia);
        if self.reply_type == MSG_REPLY {
            self.commit_ia(&ia);
        }
        Ok(())
    }

    fn log_ia(&self, ia: &IaScratch) {
        let msg = message_name(self.reply_type);
        let kind = short_kind(ia.key.kind);
        let duid = hex::encode(&ia.key.duid);
        for fixed in &ia.fixed {
            match ia.key.kind {
                IaKind::Pd => info!(
                    "{} {}: prefix {}/{} to client with duid {} iaid = {} static",
                    msg, kind, fixed.address, fixed.prefix_len, duid, ia.key.iaid
                ),
                IaKind::Na | IaKind::Ta => info!(
                    "{} {}: address {} to client with duid {} iaid = {} static",
                    msg, kind, fixed.address, duid, ia.key.iaid
                ),
            }
        }
        for (id, _) in &ia.attached {
            let Some(lease) = self.engine.store.lease(*id) else {
                continue;
            };
            match ia.key.kind {
                IaKind::Pd => info!(
                    "{} {}: prefix {} to client with duid {} iaid = {} valid for {} seconds",
                    msg, kind, lease, duid, ia.key.iaid, lease.valid
                ),
                IaKind::Na | IaKind::Ta => info!(
                    "{} {}: address {} to client with duid {} iaid = {} valid for {} seconds",
                    msg, kind, lease, duid, ia.key.iaid, lease.valid
                ),
            }
        }
    }

    /// Hard-bind everything the IA carries and persist the new IA.
    fn commit_ia(&mut self, ia: &IaScratch) {
        let now = self.engine.now;

        for fixed in &ia.fixed {
            let event = LeaseEvent {
                kind: ia.key.kind,
                address: fixed.address,
                prefix_len: fixed.prefix_len,
                duid: ia.key.duid.clone(),
                iaid: ia.key.iaid,
                hook: fixed.policy.on_commit.clone(),
                fixed: true,
            };
            self.engine.hooks.on_commit(&event);
        }

        if ia.attached.is_empty() {
            return;
        }

        for (id, _) in &ia.attached {
            self.engine.store.renew_lease(*id, now);
        }
        let ids: Vec<LeaseId> = ia.attached.iter().map(|(id, _)| *id).collect();
        self.engine.store.replace_ia(ia.key.clone(), ids, now);

        for (id, policy) in &ia.attached {
            let Some(lease) = self.engine.store.lease(*id) else {
                continue;
            };
            let event = LeaseEvent::from_lease(lease, policy.on_commit.as_deref());
            self.engine.hooks.on_commit(&event);
            if policy.ddns_updates {
                self.engine.hooks.ddns_update(&event);
            }
        }

        let record = IaRecord::snapshot(self.engine.store, &ia.key, now);
        if let Err(e) = self.engine.leases.write_ia(&record) {
            error!("Failed to record {} in the lease file: {:#}", ia.key, e);
        }
    }

    // ── Top-level options ───────────────────────────────────────────────────

    fn finish(mut self) -> Result<Option<Bytes>, ReplyError> {
        let msg = self.ctx.message;
        if self.ia_count == 0 && self.pd_count == 0 && msg.msg_type != MSG_INFORMATION_REQUEST {
            debug!(
                "No IA left to answer in {} from duid {}",
                message_name(msg.msg_type),
                hex::encode(self.ctx.duid())
            );
            return Ok(None);
        }

        if self.rapid_commit {
            self.out.put_option(OPT_RAPID_COMMIT, &[])?;
        }
        if msg.options.contains(OPT_RECONF_ACCEPT) {
            self.out.put_option(OPT_RECONF_ACCEPT, &[])?;
        }

        let policy = self.last_policy.take().unwrap_or_else(|| self.policy.clone());
        write_configured_options(&mut self.out, &policy, msg)?;
        Ok(Some(self.out.freeze()))
    }
}

/// Preference (always, when configured) and whatever the client's ORO asks
/// for that fits.
pub(crate) fn write_configured_options(
    out: &mut OptionWriter,
    policy: &EffectivePolicy,
    msg: &ClientMessage,
) -> Result<(), ReplyError> {
    if let Some(preference) = policy.preference {
        out.put_option(OPT_PREFERENCE, &[preference])?;
    }

    for code in msg.options.requested_codes(OPT_ORO) {
        let written = match code {
            OPT_DNS_SERVERS if !policy.dns_servers.is_empty() => {
                out.put_option_if_fits(code, &encode_addresses(&policy.dns_servers))
            }
            OPT_DOMAIN_LIST if !policy.domain_search.is_empty() => {
                let data = encode_domain_list(&policy.domain_search).ok_or_else(|| {
                    ReplyError::Failure(format!("domain search list {:?} cannot be encoded", policy.domain_search))
                })?;
                out.put_option_if_fits(code, &data)
            }
            OPT_INFORMATION_REFRESH_TIME if msg.msg_type == MSG_INFORMATION_REQUEST => {
                match policy.information_refresh_time {
                    Some(secs) => out.put_option_if_fits(code, &secs.to_be_bytes()),
                    None => true,
                }
            }
            _ => true,
        };
        if !written {
            debug!("Option {} requested but does not fit in the reply", code);
        }
    }
    Ok(())
}
