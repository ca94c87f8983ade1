//! Lease event hooks: on-commit / on-release / on-expiry statements and
//! dynamic DNS updates.
//!
//! The engine only decides *when* a hook fires and which configured hook
//! name applies; what happens then is up to the [`LeaseHooks`]
//! implementation the server was built with.

use std::net::Ipv6Addr;

use tracing::info;

use crate::store::Lease;
use crate::wire::IaKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseEvent {
    pub kind: IaKind,
    pub address: Ipv6Addr,
    /// 128 for addresses.
    pub prefix_len: u8,
    pub duid: Vec<u8>,
    pub iaid: u32,
    /// Hook name configured for this binding, if any.
    pub hook: Option<String>,
    /// Host reservation rather than a pool binding.
    pub fixed: bool,
}

impl LeaseEvent {
    pub fn from_lease(lease: &Lease, hook: Option<&str>) -> Self {
        Self {
            kind: lease.kind,
            address: lease.address,
            prefix_len: lease.prefix_len,
            duid: lease.owner.duid.clone(),
            iaid: lease.owner.iaid,
            hook: hook.map(str::to_string),
            fixed: false,
        }
    }

    fn target(&self) -> String {
        match self.kind {
            IaKind::Pd => format!("{}/{}", self.address, self.prefix_len),
            IaKind::Na | IaKind::Ta => self.address.to_string(),
        }
    }
}

pub trait LeaseHooks: Send {
    fn on_commit(&mut self, event: &LeaseEvent);
    fn on_release(&mut self, event: &LeaseEvent);
    fn on_expiry(&mut self, event: &LeaseEvent);
    fn ddns_update(&mut self, event: &LeaseEvent);
    fn ddns_remove(&mut self, event: &LeaseEvent);
}

/// Logs every event; used by the daemon.
#[derive(Debug, Default)]
pub struct TracingHooks;

impl LeaseHooks for TracingHooks {
    fn on_commit(&mut self, event: &LeaseEvent) {
        if let Some(hook) = &event.hook {
            info!("on-commit {} for {} ({} iaid {})", hook, event.target(), event.kind, event.iaid);
        }
    }

    fn on_release(&mut self, event: &LeaseEvent) {
        if let Some(hook) = &event.hook {
            info!("on-release {} for {} ({} iaid {})", hook, event.target(), event.kind, event.iaid);
        }
    }

    fn on_expiry(&mut self, event: &LeaseEvent) {
        if let Some(hook) = &event.hook {
            info!("on-expiry {} for {} ({} iaid {})", hook, event.target(), event.kind, event.iaid);
        }
    }

    fn ddns_update(&mut self, event: &LeaseEvent) {
        info!(
            "DDNS update for {} (duid {})",
            event.target(),
            hex::encode(&event.duid)
        );
    }

    fn ddns_remove(&mut self, event: &LeaseEvent) {
        info!(
            "DDNS removal for {} (duid {})",
            event.target(),
            hex::encode(&event.duid)
        );
    }
}

/// Keeps every event in order, tagged with the hook that fired.
#[derive(Debug, Default, Clone)]
pub struct RecordingHooks {
    events: std::sync::Arc<std::sync::Mutex<Vec<(&'static str, LeaseEvent)>>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(&'static str, LeaseEvent)> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, what: &'static str, event: &LeaseEvent) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push((what, event.clone()));
    }
}

impl LeaseHooks for RecordingHooks {
    fn on_commit(&mut self, event: &LeaseEvent) {
        self.record("commit", event);
    }

    fn on_release(&mut self, event: &LeaseEvent) {
        self.record("release", event);
    }

    fn on_expiry(&mut self, event: &LeaseEvent) {
        self.record("expiry", event);
    }

    fn ddns_update(&mut self, event: &LeaseEvent) {
        self.record("ddns-update", event);
    }

    fn ddns_remove(&mut self, event: &LeaseEvent) {
        self.record("ddns-remove", event);
    }
}
