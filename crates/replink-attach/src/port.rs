//! Free-port selection for the agent's REPL server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};

use serde::Serialize;
use tracing::debug;

/// The port chosen for the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortChoice {
    pub port: u16,
    /// True when the preferred port was unavailable and an ephemeral one was
    /// picked instead.
    pub fallback: bool,
}

/// Picks a port on localhost. See [`pick_port_on`].
pub fn pick_port(preferred: u16) -> PortChoice {
    pick_port_on(IpAddr::V4(Ipv4Addr::LOCALHOST), preferred)
}

/// Returns `preferred` when it can be bound on `host`, otherwise an
/// OS-assigned ephemeral port with `fallback` set.
///
/// If no ephemeral port can be obtained either, `preferred` is returned
/// unflagged and the caller's later connect will surface the problem.
pub fn pick_port_on(host: IpAddr, preferred: u16) -> PortChoice {
    if is_port_free(host, preferred) {
        return PortChoice {
            port: preferred,
            fallback: false,
        };
    }

    match ephemeral_port(host) {
        Some(port) => {
            debug!(preferred, port, "Preferred port unavailable, using ephemeral port");
            PortChoice {
                port,
                fallback: true,
            }
        }
        None => {
            debug!(preferred, "No ephemeral port available, keeping preferred port");
            PortChoice {
                port: preferred,
                fallback: false,
            }
        }
    }
}

/// Port 0 never counts as free: it would bind an arbitrary port.
fn is_port_free(host: IpAddr, port: u16) -> bool {
    port != 0 && TcpListener::bind(SocketAddr::new(host, port)).is_ok()
}

fn ephemeral_port(host: IpAddr) -> Option<u16> {
    let listener = TcpListener::bind(SocketAddr::new(host, 0)).ok()?;
    listener.local_addr().ok().map(|addr| addr.port())
}
