//! UDP transport: one socket per served interface joined to
//! All_DHCP_Relay_Agents_and_Servers, plus an optional unicast socket.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use dhcp6_core::dispatch::unix_now;
use dhcp6_core::wire::{ALL_DHCP_RELAY_AGENTS_AND_SERVERS, SERVER_PORT};
use dhcp6_core::Inbound;

use crate::shared::SharedState;

/// Interface index from /sys/class/net.
fn interface_index(name: &str) -> Option<u32> {
    if name.is_empty() {
        return None;
    }
    let path = format!("/sys/class/net/{}/ifindex", name);
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn new_socket() -> Result<Socket> {
    let sock = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_only_v6(true)?;
    sock.set_reuse_address(true)?;
    #[cfg(unix)]
    sock.set_reuse_port(true)?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

/// Socket on [::]:547 receiving multicast from `interface` only.
pub fn bind_interface(interface: &str) -> Result<UdpSocket> {
    let if_index = interface_index(interface)
        .with_context(|| format!("Unknown interface {}", interface))?;

    let sock = new_socket()?;
    #[cfg(target_os = "linux")]
    if let Err(e) = sock.bind_device(Some(interface.as_bytes())) {
        warn!("Failed to bind DHCPv6 socket to device {}: {}", interface, e);
    }
    sock.set_multicast_if_v6(if_index)?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, SERVER_PORT, 0, 0);
    sock.bind(&bind_addr.into())
        .with_context(|| format!("Failed to bind DHCPv6 socket on {}", interface))?;

    sock.join_multicast_v6(&ALL_DHCP_RELAY_AGENTS_AND_SERVERS, if_index)
        .with_context(|| format!("Failed to join {} on {}", ALL_DHCP_RELAY_AGENTS_AND_SERVERS, interface))?;
    info!(
        "Joined DHCPv6 multicast group {} on {} (index {})",
        ALL_DHCP_RELAY_AGENTS_AND_SERVERS, interface, if_index
    );

    Ok(UdpSocket::from_std(sock.into())?)
}

/// Socket on the server's unicast address; what arrives here counts as
/// unicast.
pub fn bind_unicast(address: Ipv6Addr) -> Result<UdpSocket> {
    let sock = new_socket()?;
    let bind_addr = SocketAddrV6::new(address, SERVER_PORT, 0, 0);
    sock.bind(&bind_addr.into())
        .with_context(|| format!("Failed to bind DHCPv6 socket to {}", bind_addr))?;
    info!("DHCPv6 unicast socket listening on [{}]:{}", address, SERVER_PORT);
    Ok(UdpSocket::from_std(sock.into())?)
}

/// Receive, dispatch and answer, one datagram at a time.
/// `interface` is empty for the unicast socket.
pub async fn run_listener(socket: UdpSocket, interface: String, unicast: bool, state: SharedState) -> Result<()> {
    let mut buf = vec![0u8; 65536];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("DHCPv6 recv error on {}: {}", label(&interface), e);
                continue;
            }
        };
        let SocketAddr::V6(source) = src else {
            continue;
        };

        let outbound = {
            let mut s = state.lock().await;
            let inbound = Inbound {
                payload: &buf[..len],
                source,
                interface: &interface,
                unicast,
            };
            s.server.dispatch(&inbound, unix_now())
        };

        if let Some(out) = outbound {
            match socket.send_to(&out.payload, out.destination).await {
                Ok(_) => debug!("Sent {} bytes to {}", out.payload.len(), out.destination),
                Err(e) => warn!("Failed to send DHCPv6 reply to {}: {}", out.destination, e),
            }
        }
    }
}

fn label(interface: &str) -> &str {
    if interface.is_empty() { "unicast socket" } else { interface }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_index_unknown() {
        assert_eq!(interface_index(""), None);
        assert_eq!(interface_index("no-such-interface0"), None);
    }

    #[test]
    fn test_label() {
        assert_eq!(label(""), "unicast socket");
        assert_eq!(label("eth0"), "eth0");
    }
}
