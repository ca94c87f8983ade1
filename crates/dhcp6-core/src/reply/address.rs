//! IA_NA processing.

use std::net::Ipv6Addr;

use tracing::{debug, error};

use super::{Flow, FixedResource, IaScratch, ReplyState, Resource};
use crate::allocator::{pick_address, try_address};
use crate::error::{AllocError, ReplyError};
use crate::store::LeaseState;
use crate::wire::{
    IaAddress, IaKind, IaRequest, StatusCode, MSG_REBIND, MSG_RENEW, MSG_REQUEST, MSG_SOLICIT, OPT_IAADDR,
};

impl ReplyState<'_, '_> {
    pub(super) fn process_ia_na(&mut self, req: &IaRequest) -> Result<(), ReplyError> {
        let mut ia = self.begin_ia(req)?;
        let fixed = self.ctx.host(self.engine.tables).and_then(|h| h.fixed_address);

        let mut flow = Flow::Continue;
        for hint in req.addresses() {
            flow = self.process_addr(&mut ia, &hint, fixed);
            if flow == Flow::Cancel {
                break;
            }
        }
        self.ia_count += 1;

        let canceled = flow == Flow::Cancel;
        if !canceled && ia.client_resources == 0 {
            if let Err(e) = self.find_client_address(&mut ia, fixed) {
                match self.msg_type() {
                    MSG_SOLICIT | MSG_REQUEST => {
                        ia.wipe(StatusCode::NoAddrsAvail, "No addresses available for this interface.")
                    }
                    // zero-lifetime addresses still tell the client to let go
                    _ if ia.resources_included => {}
                    _ => {
                        debug!("No address for {}: {}", ia.key, e);
                        self.omit_ia(ia);
                        return Ok(());
                    }
                }
            }
        }

        self.close_ia(ia, canceled)
    }

    /// Handle one IAADDR the client sent.
    fn process_addr(&mut self, ia: &mut IaScratch, hint: &IaAddress, fixed: Option<Ipv6Addr>) -> Flow {
        ia.hint_lifetimes(hint.preferred, hint.valid);

        // :: only carries lifetime hints
        if hint.address.is_unspecified() {
            return Flow::Continue;
        }
        let addr = hint.address;

        if !self.engine.tables.topology.on_link(self.shared, &addr) {
            return match self.msg_type() {
                MSG_SOLICIT => {
                    self.demote_rapid_commit();
                    Flow::Continue
                }
                MSG_REQUEST => {
                    ia.wipe(StatusCode::NotOnLink, "Address not for use on this link.");
                    Flow::Cancel
                }
                // Renew or Rebind: hand it back with zero lifetimes
                _ => {
                    send_address(ia, addr, 0, 0);
                    Flow::Continue
                }
            };
        }

        let resource = match self.address_is_owned(ia, &addr, fixed) {
            Some(resource) => resource,
            None if self.msg_type() == MSG_RENEW => {
                ia.wipe(StatusCode::NoBinding, "Address not bound to this interface.");
                return Flow::Cancel;
            }
            None => {
                // Solicit, Request or Rebind: the address is a request
                if self.ia_is_full(ia, IaKind::Na, &addr, 128) {
                    return Flow::Continue;
                }
                let claimed = if fixed.is_some() {
                    None
                } else {
                    let key = ia.key.clone();
                    let req = self.alloc_request(&key);
                    try_address(
                        &self.engine.tables.topology,
                        self.engine.store,
                        &req,
                        IaKind::Na,
                        &addr,
                        self.engine.now,
                    )
                    .ok()
                };
                match claimed {
                    Some(id) => Resource::Lease(id),
                    None => {
                        if self.msg_type() == MSG_REBIND {
                            send_address(ia, addr, 0, 0);
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
        if ia.client_resources != 0 && ia.client_resources >= policy.limit_addrs_per_ia {
            return Flow::Continue;
        }

        let (preferred, valid) = self.is_addressed(ia, lease, &policy);
        if resource == Resource::Fixed {
            ia.fixed.push(FixedResource {
                address: addr,
                prefix_len: 128,
                policy,
            });
        }
        send_address(ia, addr, preferred, valid);
        Flow::Continue
    }

    /// A host reservation owns only its fixed address; otherwise the
    /// address has to be a usable binding of the client's old IA.
    fn address_is_owned(&self, ia: &IaScratch, addr: &Ipv6Addr, fixed: Option<Ipv6Addr>) -> Option<Resource> {
        if let Some(fixed) = fixed {
            return (fixed == *addr).then_some(Resource::Fixed);
        }
        self.owned_lease(ia, addr, 128).map(Resource::Lease)
    }

    /// Give the IA an address the client did not ask for: the reservation,
    /// the best binding it already holds, or a fresh one.
    fn find_client_address(&mut self, ia: &mut IaScratch, fixed: Option<Ipv6Addr>) -> Result<(), AllocError> {
        if let Some(addr) = fixed {
            let policy = self.resource_policy(None);
            let (preferred, valid) = self.is_addressed(ia, None, &policy);
            ia.fixed.push(FixedResource {
                address: addr,
                prefix_len: 128,
                policy,
            });
            send_address(ia, addr, preferred, valid);
            return Ok(());
        }

        let best = self.best_old_lease(ia, None);
        let id = match best {
            Some((id, state)) if state != LeaseState::Abandoned => id,
            _ => {
                let key = ia.key.clone();
                let req = self.alloc_request(&key);
                match pick_address(&self.engine.tables.topology, self.engine.store, &req, self.engine.now) {
                    Ok(id) => id,
                    Err(e) => {
                        if best.is_some() {
                            error!(
                                "Reclaiming abandoned addresses is not yet supported. \
                                 Treating this as an out of space condition."
                            );
                        }
                        return Err(e);
                    }
                }
            }
        };

        let Some(addr) = self.engine.store.lease(id).map(|l| l.address) else {
            return Err(AllocError::NoResources);
        };
        let policy = self.resource_policy(Some(id));
        let (preferred, valid) = self.is_addressed(ia, Some(id), &policy);
        send_address(ia, addr, preferred, valid);
        Ok(())
    }
}

pub(super) fn send_address(ia: &mut IaScratch, address: Ipv6Addr, preferred: u32, valid: u32) {
    let data = IaAddress {
        address,
        preferred,
        valid,
    }
    .encode();
    ia.send(OPT_IAADDR, data);
}
