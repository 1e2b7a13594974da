use local_ip_address::list_afinet_netifas;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use str0m::Candidate;
use systemstat::{Platform, System};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Installs the global fmt subscriber.
///
/// The filter comes from `RUST_LOG` and falls back to `info`. Calling this
/// more than once is harmless; later calls leave the first subscriber in place.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses. The first routable interface is
/// returned as an [`IpAddr`].
///
/// ## Errors
///
/// [`Error::Transport`] if the interfaces cannot be listed or none of them
/// carries a usable IPv4 address.
pub fn select_host_address() -> Result<IpAddr> {
    let system = System::new();
    let networks = system.networks().map_err(Error::transport)?;

    for net in networks.values() {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() {
                    return Ok(IpAddr::V4(v));
                }
            }
        }
    }

    Err(Error::Transport("found no usable network interface".to_string()))
}

/// Host candidates for every routable IPv4 interface, on the port `socket` is
/// bound to.
pub fn get_candidates(socket: &UdpSocket) -> Result<Vec<Candidate>> {
    let port = socket.local_addr().map_err(Error::transport)?.port();
    let mut candidates: Vec<Candidate> = vec![];
    match list_afinet_netifas() {
        Ok(network_interfaces) => {
            for (name, ip) in network_interfaces {
                debug!("iface: {} / {:?}", name, ip);
                match ip {
                    IpAddr::V4(ip4) => {
                        if !ip4.is_loopback() && !ip4.is_link_local() {
                            let socket_addr = SocketAddr::new(ip, port);
                            let candidate = Candidate::host(socket_addr, str0m::net::Protocol::Udp)
                                .map_err(Error::transport)?;
                            info!(%socket_addr, "local host candidate");
                            candidates.push(candidate);
                        }
                    }
                    IpAddr::V6(_ip6) => {}
                }
            }
        }
        Err(e) => debug!("cannot list interfaces: {}", e),
    }

    Ok(candidates)
}
