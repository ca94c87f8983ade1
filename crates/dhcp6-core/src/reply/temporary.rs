//! IA_TA processing. Temporary addresses are never reserved for hosts and
//! carry no T1/T2.

use std::net::Ipv6Addr;

use tracing::debug;

use super::address::send_address;
use super::{IaScratch, ReplyState};
use crate::allocator::{pick_temporaries, try_address};
use crate::error::{AllocError, ReplyError};
use crate::store::LeaseId;
use crate::wire::{IaKind, IaRequest, StatusCode, MSG_REQUEST, MSG_SOLICIT};

impl ReplyState<'_, '_> {
    pub(super) fn process_ia_ta(&mut self, req: &IaRequest) -> Result<(), ReplyError> {
        let mut ia = self.begin_ia(req)?;

        let mut rejected = false;
        for hint in req.addresses() {
            ia.hint_lifetimes(hint.preferred, hint.valid);
            if rejected {
                continue;
            }
            match self.temporary_is_available(&ia, &hint.address) {
                Some(id) => {
                    let policy = self.resource_policy(Some(id));
                    let (preferred, valid) = self.is_addressed(&mut ia, Some(id), &policy);
                    send_address(&mut ia, hint.address, preferred, valid);
                }
                None => {
                    // one unusable hint voids the client's whole list
                    debug!("Temporary address {} not available to {}", hint.address, ia.key);
                    ia.options.clear();
                    ia.attached.clear();
                    ia.client_resources = 0;
                    ia.resources_included = false;
                    rejected = true;
                }
            }
        }
        self.ia_count += 1;

        if ia.client_resources == 0 {
            if let Err(e) = self.find_client_temporaries(&mut ia) {
                match self.msg_type() {
                    MSG_SOLICIT | MSG_REQUEST => {
                        ia.wipe(StatusCode::NoAddrsAvail, "No addresses available for this interface.")
                    }
                    _ if ia.resources_included => {}
                    _ => {
                        debug!("No temporary address for {}: {}", ia.key, e);
                        self.omit_ia(ia);
                        return Ok(());
                    }
                }
            }
        }

        self.close_ia(ia, false)
    }

    /// An on-link address the client already holds, or one it may claim
    /// from a temporary pool.
    fn temporary_is_available(&mut self, ia: &IaScratch, addr: &Ipv6Addr) -> Option<LeaseId> {
        if addr.is_unspecified() || !self.engine.tables.topology.on_link(self.shared, addr) {
            return None;
        }
        if let Some(id) = self.owned_lease(ia, addr, 128) {
            return Some(id);
        }
        let req = self.alloc_request(&ia.key);
        try_address(
            &self.engine.tables.topology,
            self.engine.store,
            &req,
            IaKind::Ta,
            addr,
            self.engine.now,
        )
        .ok()
    }

    /// A fresh temporary address from every permitted temporary pool.
    fn find_client_temporaries(&mut self, ia: &mut IaScratch) -> Result<(), AllocError> {
        let key = ia.key.clone();
        let req = self.alloc_request(&key);
        let ids = pick_temporaries(&self.engine.tables.topology, self.engine.store, &req, self.engine.now)?;
        for id in ids {
            let Some(addr) = self.engine.store.lease(id).map(|l| l.address) else {
                continue;
            };
            let policy = self.resource_policy(Some(id));
            let (preferred, valid) = self.is_addressed(ia, Some(id), &policy);
            send_address(ia, addr, preferred, valid);
        }
        Ok(())
    }
}
