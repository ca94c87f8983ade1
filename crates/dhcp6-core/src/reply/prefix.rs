//! IA_PD processing.
//!
//! Delegated prefixes are not checked against the link: they are routed to
//! the requesting router, not configured on the link itself. The first
//! IAPREFIX carrying a length sets the client's preferred prefix length.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use tracing::{debug, error};

use super::{Flow, FixedResource, IaScratch, ReplyState, Resource};
use crate::allocator::{pick_prefix, try_prefix};
use crate::error::{AllocError, ReplyError};
use crate::store::LeaseState;
use crate::wire::{IaKind, IaPrefix, IaRequest, StatusCode, MSG_REBIND, MSG_RENEW, MSG_REQUEST, MSG_SOLICIT, OPT_IAPREFIX};

impl ReplyState<'_, '_> {
    pub(super) fn process_ia_pd(&mut self, req: &IaRequest) -> Result<(), ReplyError> {
        let mut ia = self.begin_ia(req)?;
        let fixed: Vec<Ipv6Net> = self
            .ctx
            .host(self.engine.tables)
            .map(|h| h.fixed_prefixes.clone())
            .unwrap_or_default();

        let mut preferred_len = None;
        let mut flow = Flow::Continue;
        for hint in req.prefixes() {
            flow = self.process_prefix(&mut ia, &hint, &fixed, &mut preferred_len);
            if flow == Flow::Cancel {
                break;
            }
        }
        self.pd_count += 1;

        let canceled = flow == Flow::Cancel;
        if !canceled && ia.client_resources == 0 {
            if let Err(e) = self.find_client_prefix(&mut ia, &fixed, preferred_len) {
                match self.msg_type() {
                    MSG_SOLICIT | MSG_REQUEST => {
                        ia.wipe(StatusCode::NoPrefixAvail, "No prefixes available for this interface.")
                    }
                    _ if ia.resources_included => {}
                    _ => {
                        debug!("No prefix for {}: {}", ia.key, e);
                        self.omit_ia(ia);
                        return Ok(());
                    }
                }
            }
        }

        self.close_ia(ia, canceled)
    }

    /// Handle one IAPREFIX the client sent.
    fn process_prefix(
        &mut self,
        ia: &mut IaScratch,
        hint: &IaPrefix,
        fixed: &[Ipv6Net],
        preferred_len: &mut Option<u8>,
    ) -> Flow {
        ia.hint_lifetimes(hint.preferred, hint.valid);

        if hint.prefix_len == 0 && hint.prefix.is_unspecified() {
            return Flow::Continue;
        }
        preferred_len.get_or_insert(hint.prefix_len);
        // ::/len only states the length the client would like
        if hint.prefix.is_unspecified() {
            return Flow::Continue;
        }
        let (prefix, len) = (hint.prefix, hint.prefix_len);

        let resource = match self.prefix_is_owned(ia, &prefix, len, fixed) {
            Some(resource) => resource,
            None if self.msg_type() == MSG_RENEW => {
                ia.wipe(StatusCode::NoBinding, "Prefix not bound to this interface.");
                return Flow::Cancel;
            }
            None => {
                if self.ia_is_full(ia, IaKind::Pd, &prefix, len) {
                    return Flow::Continue;
                }
                let claimed = if fixed.is_empty() {
                    let key = ia.key.clone();
                    let req = self.alloc_request(&key);
                    try_prefix(
                        &self.engine.tables.topology,
                        self.engine.store,
                        &req,
                        &prefix,
                        len,
                        self.engine.now,
                    )
                    .ok()
                } else {
                    None
                };
                match claimed {
                    Some(id) => Resource::Lease(id),
                    None => {
                        if self.msg_type() == MSG_REBIND {
                            send_prefix(ia, prefix, len, 0, 0);
                        }
                        return Flow::Continue;
                    }
                }
            }
        };

        let lease = match resource {
            Resource::Fixed => None,
            Resource::Lease(id) => Some(id),
        };
        let policy = self.resource_policy(lease);
        if ia.client_resources != 0 && ia.client_resources >= policy.limit_prefs_per_ia {
            return Flow::Continue;
        }

        let (preferred, valid) = self.is_addressed(ia, lease, &policy);
        if resource == Resource::Fixed {
            ia.fixed.push(FixedResource {
                address: prefix,
                prefix_len: len,
                policy,
            });
        }
        send_prefix(ia, prefix, len, preferred, valid);
        Flow::Continue
    }

    fn prefix_is_owned(&self, ia: &IaScratch, prefix: &Ipv6Addr, len: u8, fixed: &[Ipv6Net]) -> Option<Resource> {
        if !fixed.is_empty() {
            return fixed
                .iter()
                .any(|net| net.prefix_len() == len && net.network() == *prefix)
                .then_some(Resource::Fixed);
        }
        self.owned_lease(ia, prefix, len).map(Resource::Lease)
    }

    /// Give the IA a prefix the client did not name: a reserved prefix of
    /// the preferred length (or the first one), the best prefix it already
    /// holds, or a fresh one.
    fn find_client_prefix(
        &mut self,
        ia: &mut IaScratch,
        fixed: &[Ipv6Net],
        preferred_len: Option<u8>,
    ) -> Result<(), AllocError> {
        if let Some(first) = fixed.first() {
            let net = fixed
                .iter()
                .find(|n| Some(n.prefix_len()) == preferred_len)
                .unwrap_or(first);
            let policy = self.resource_policy(None);
            let (preferred, valid) = self.is_addressed(ia, None, &policy);
            ia.fixed.push(FixedResource {
                address: net.network(),
                prefix_len: net.prefix_len(),
                policy,
            });
            send_prefix(ia, net.network(), net.prefix_len(), preferred, valid);
            return Ok(());
        }

        let mode = self.policy.prefix_length_mode;
        let acceptable = |len: u8| mode.passes(preferred_len).iter().any(|f| f.accepts(len));

        let best = self.best_old_lease(ia, preferred_len);
        let reusable = best.filter(|(id, state)| {
            *state != LeaseState::Abandoned
                && self.engine.store.lease(*id).is_some_and(|l| acceptable(l.prefix_len))
        });
        let id = match reusable {
            Some((id, _)) => id,
            None => {
                let key = ia.key.clone();
                let req = self.alloc_request(&key);
                match pick_prefix(
                    &self.engine.tables.topology,
                    self.engine.store,
                    &req,
                    preferred_len,
                    mode,
                    self.engine.now,
                ) {
                    Ok(id) => id,
                    Err(e) => {
                        if best.is_some_and(|(_, state)| state == LeaseState::Abandoned) {
                            error!(
                                "Reclaiming abandoned prefixes is not yet supported. \
                                 Treating this as an out of space condition."
                            );
                        }
                        return Err(e);
                    }
                }
            }
        };

        let Some((prefix, len)) = self.engine.store.lease(id).map(|l| (l.address, l.prefix_len)) else {
            return Err(AllocError::NoResources);
        };
        let policy = self.resource_policy(Some(id));
        let (preferred, valid) = self.is_addressed(ia, Some(id), &policy);
        send_prefix(ia, prefix, len, preferred, valid);
        Ok(())
    }
}

fn send_prefix(ia: &mut IaScratch, prefix: Ipv6Addr, prefix_len: u8, preferred: u32, valid: u32) {
    let data = IaPrefix {
        preferred,
        valid,
        prefix_len,
        prefix,
    }
    .encode();
    ia.send(OPT_IAPREFIX, data);
}
