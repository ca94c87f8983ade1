use std::sync::Arc;
use tokio::sync::Mutex;

use dhcp6_core::{Config, Dhcp6Server};

/// Daemon state. Each datagram is handled start to finish under the lock.
pub struct ServerState {
    pub config: Config,
    pub server: Dhcp6Server,
}

pub type SharedState = Arc<Mutex<ServerState>>;
