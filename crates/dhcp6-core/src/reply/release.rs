//! Confirm, Release and Decline.
//!
//! None of these allocate anything. Confirm only checks addresses against
//! the client's link; Release and Decline act on the bindings the client
//! names and answer everything they could not match with NoBinding.

use std::net::Ipv6Addr;

use bytes::Bytes;
use tracing::{error, info};

use super::{write_configured_options, ClientContext, Engine};
use crate::dispatch::Tables;
use crate::error::ReplyError;
use crate::hooks::LeaseEvent;
use crate::host::HostRecord;
use crate::leasefile::IaRecord;
use crate::store::{IaKey, LeaseId};
use crate::wire::{
    status_data, IaKind, IaRequest, OptionWriter, StatusCode, MSG_REPLY, OPT_CLIENTID, OPT_RECONF_ACCEPT,
    OPT_SERVERID, OPT_STATUS_CODE,
};

// ── Confirm ─────────────────────────────────────────────────────────────────

/// Tell the client whether the addresses of its IA_NAs and IA_TAs are
/// still on its link. IA_PDs are ignored. Without a shared network or
/// without any address to judge, the client gets no answer.
pub fn confirm(tables: &Tables, ctx: &ClientContext<'_>) -> Result<Option<Bytes>, ReplyError> {
    let msg = ctx.message;
    let Some(shared) = ctx.shared else {
        return Ok(None);
    };

    let mut has_addrs = false;
    let mut on_link = true;
    for kind in [IaKind::Na, IaKind::Ta] {
        let Ok(ias) = IaRequest::all(kind, &msg.options) else {
            return Ok(None);
        };
        for ia in &ias {
            for addr in ia.addresses() {
                has_addrs = true;
                if !tables.topology.on_link(shared, &addr.address) {
                    on_link = false;
                }
            }
        }
    }
    if !has_addrs {
        return Ok(None);
    }

    let mut out = OptionWriter::client_message(MSG_REPLY, msg.transaction_id, ctx.max_reply_size)?;
    if let Some(client_id) = ctx.client_id {
        out.put_option(OPT_CLIENTID, client_id)?;
    }
    out.put_option(OPT_SERVERID, &tables.server_duid)?;
    let status = if on_link {
        status_data(StatusCode::Success, "All addresses still on link.")
    } else {
        status_data(StatusCode::NotOnLink, "Some of the addresses are not on link.")
    };
    out.put_option(OPT_STATUS_CODE, &status)?;
    if msg.options.contains(OPT_RECONF_ACCEPT) {
        out.put_option(OPT_RECONF_ACCEPT, &[])?;
    }
    write_configured_options(&mut out, &ctx.policy(tables, None), msg)?;
    Ok(Some(out.freeze()))
}

// ── Release / Decline ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    Release,
    Decline,
}

impl Disposal {
    fn label(self) -> &'static str {
        match self {
            Disposal::Release => "Release",
            Disposal::Decline => "Decline",
        }
    }

    /// IA kinds the message acts on. Declining a prefix or a temporary
    /// address means nothing.
    fn kinds(self) -> &'static [IaKind] {
        match self {
            Disposal::Release => &[IaKind::Na, IaKind::Ta, IaKind::Pd],
            Disposal::Decline => &[IaKind::Na],
        }
    }
}

/// Release or decline every address and prefix the client lists. The
/// reply is always a Success overall, with one NoBinding IA for each
/// address or prefix the client does not hold.
pub fn release_or_decline(
    mut engine: Engine<'_>,
    ctx: &ClientContext<'_>,
    disposal: Disposal,
) -> Result<Option<Bytes>, ReplyError> {
    let tables = engine.tables;
    let msg = ctx.message;
    let duid = ctx.duid();

    let mut out = OptionWriter::client_message(MSG_REPLY, msg.transaction_id, ctx.max_reply_size)?;
    out.put_option(OPT_CLIENTID, duid)?;
    out.put_option(OPT_SERVERID, &tables.server_duid)?;
    out.put_option(
        OPT_STATUS_CODE,
        &status_data(StatusCode::Success, &format!("{} received.", disposal.label())),
    )?;

    let hosts = tables.hosts.client_hosts(duid, &msg.options, ctx.relays);

    for &kind in disposal.kinds() {
        for req in IaRequest::all(kind, &msg.options)? {
            let resources: Vec<(Ipv6Addr, u8)> = match kind {
                IaKind::Pd => req.prefixes().iter().map(|p| (p.prefix, p.prefix_len)).collect(),
                IaKind::Na | IaKind::Ta => req.addresses().iter().map(|a| (a.address, 128)).collect(),
            };
            if resources.is_empty() {
                continue;
            }

            let key = IaKey::new(kind, req.iaid, duid);
            let mut unmatched = 0;
            let mut changed = false;
            for (addr, len) in resources {
                let reserved = hosts.iter().any(|h| reserves(h, kind, &addr, len));
                let lease = engine.store.ia(&key).and_then(|ia| {
                    engine
                        .store
                        .ia_leases(ia)
                        .find(|l| l.address == addr && l.prefix_len == len)
                        .map(|l| l.id)
                });
                if !reserved && lease.is_none() {
                    log_unmatched(disposal, duid, kind, &addr, len);
                    unmatched += 1;
                    continue;
                }
                log_matched(disposal, duid, kind, &addr, len);
                if let Some(id) = lease {
                    dispose(&mut engine, ctx, disposal, id);
                    changed = true;
                }
            }

            if changed {
                engine.store.touch_ia(&key, engine.now);
                let record = IaRecord::snapshot(engine.store, &key, engine.now);
                if let Err(e) = engine.leases.write_ia(&record) {
                    error!("Failed to record {} in the lease file: {:#}", key, e);
                }
            }
            for _ in 0..unmatched {
                write_no_binding(&mut out, kind, req.iaid, disposal)?;
            }
        }
    }

    Ok(Some(out.freeze()))
}

fn reserves(host: &HostRecord, kind: IaKind, addr: &Ipv6Addr, len: u8) -> bool {
    match kind {
        IaKind::Pd => host
            .fixed_prefixes
            .iter()
            .any(|net| net.network() == *addr && net.prefix_len() == len),
        IaKind::Na | IaKind::Ta => host.fixed_address == Some(*addr),
    }
}

fn target(kind: IaKind, addr: &Ipv6Addr, len: u8) -> String {
    match kind {
        IaKind::Pd => format!("prefix {}/{}", addr, len),
        IaKind::Na | IaKind::Ta => format!("address {}", addr),
    }
}

fn log_matched(disposal: Disposal, duid: &[u8], kind: IaKind, addr: &Ipv6Addr, len: u8) {
    let client = hex::encode(duid);
    match disposal {
        Disposal::Release => info!("Client {} releases {}", client, target(kind, addr, len)),
        Disposal::Decline => error!(
            "Client {} reports {} is already in use by another host!",
            client,
            target(kind, addr, len)
        ),
    }
}

fn log_unmatched(disposal: Disposal, duid: &[u8], kind: IaKind, addr: &Ipv6Addr, len: u8) {
    let client = hex::encode(duid);
    match disposal {
        Disposal::Release => info!(
            "Client {} releases {}, which is not leased to it.",
            client,
            target(kind, addr, len)
        ),
        Disposal::Decline => info!(
            "Client {} declines {}, which is not offered to it.",
            client,
            target(kind, addr, len)
        ),
    }
}

/// Give a binding back to its pool, or take it out of service for good.
fn dispose(engine: &mut Engine<'_>, ctx: &ClientContext<'_>, disposal: Disposal, id: LeaseId) {
    let tables = engine.tables;
    match disposal {
        Disposal::Release => {
            let pond = engine
                .store
                .lease(id)
                .and_then(|l| l.pool)
                .map(|pool| tables.topology.pool(pool).pond);
            let policy = ctx.policy(tables, pond);
            if let Some(released) = engine.store.release_lease(id) {
                let event = LeaseEvent::from_lease(&released, policy.on_release.as_deref());
                engine.hooks.on_release(&event);
                if policy.ddns_updates {
                    engine.hooks.ddns_remove(&event);
                }
            }
        }
        Disposal::Decline => engine.store.decline_lease(id),
    }
}

/// An IA answering a resource the client does not hold.
fn write_no_binding(out: &mut OptionWriter, kind: IaKind, iaid: u32, disposal: Disposal) -> Result<(), ReplyError> {
    let mark = out.begin_option(kind.option_code())?;
    out.put_u32(iaid)?;
    if kind != IaKind::Ta {
        out.put_u32(0)?;
        out.put_u32(0)?;
    }
    let message = format!("{} for unknown address.", disposal.label());
    out.put_option(OPT_STATUS_CODE, &status_data(StatusCode::NoBinding, &message))?;
    out.end_option(mark)?;
    Ok(())
}
