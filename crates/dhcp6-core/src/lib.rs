//! DHCPv6 server engine: message codec, address and prefix allocation,
//! reply construction and the lease journal.
//!
//! The engine does no I/O besides the lease file. A daemon feeds datagrams
//! to [`dispatch::Dhcp6Server::dispatch`] and sends back what it returns.

pub mod allocator;
pub mod class;
pub mod config;
pub mod dispatch;
pub mod duid;
pub mod error;
pub mod hooks;
pub mod host;
pub mod leasefile;
pub mod policy;
pub mod reply;
pub mod store;
pub mod topology;
pub mod wire;

pub use config::Config;
pub use dispatch::{Dhcp6Server, Inbound, Outbound};
