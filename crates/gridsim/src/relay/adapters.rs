//! Local adapters a listener can bind to

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use crate::server::Adapter;

/// Loopback, all-interfaces and, when it can be found, the primary IPv4
pub fn list_adapters() -> Vec<Adapter> {
    let mut adapters = vec![
        Adapter {
            name: "loopback".to_string(),
            ip: Ipv4Addr::LOCALHOST.to_string(),
        },
        Adapter {
            name: "all interfaces".to_string(),
            ip: Ipv4Addr::UNSPECIFIED.to_string(),
        },
    ];
    if let Some(ip) = primary_ipv4() {
        adapters.push(Adapter {
            name: "primary".to_string(),
            ip: ip.to_string(),
        });
    }
    adapters
}

/// Source address the OS would use for outbound traffic
///
/// Connecting a UDP socket sends nothing; it only selects a route.
fn primary_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}
