// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP endpoint construction.
//!
//! Sockets are built with socket2 (reuse-address, non-blocking) and handed
//! to mio for readiness polling. A sender endpoint binds ephemeral and
//! connects to its peer; a receiver endpoint binds the configured local
//! port and learns the remote from the first datagram.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// Resolve a `host:port` peer-config address to its first socket address.
pub fn resolve(address: &str) -> io::Result<SocketAddr> {
    address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing"))
}

fn raw_socket(for_addr: SocketAddr) -> io::Result<Socket> {
    let domain = match for_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Receiver-side endpoint: bound to the configured local address.
pub fn bind(local: SocketAddr) -> io::Result<mio::net::UdpSocket> {
    let socket = raw_socket(local)?;
    socket.bind(&local.into())?;
    let std_socket: UdpSocket = socket.into();
    log::debug!("[udp] bound {}", std_socket.local_addr()?);
    Ok(mio::net::UdpSocket::from_std(std_socket))
}

/// Sender-side endpoint: ephemeral local port, connected to the remote.
pub fn connect(remote: SocketAddr) -> io::Result<mio::net::UdpSocket> {
    let any: SocketAddr = match remote {
        SocketAddr::V4(_) => "0.0.0.0:0".parse().expect("static addr"),
        SocketAddr::V6(_) => "[::]:0".parse().expect("static addr"),
    };
    let socket = raw_socket(remote)?;
    socket.bind(&any.into())?;
    socket.connect(&remote.into())?;
    let std_socket: UdpSocket = socket.into();
    log::debug!(
        "[udp] connected {} -> {}",
        std_socket.local_addr()?,
        remote
    );
    Ok(mio::net::UdpSocket::from_std(std_socket))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_numeric() {
        let addr = resolve("127.0.0.1:5004").expect("resolves");
        assert_eq!(addr.port(), 5004);
        assert!(addr.is_ipv4());
    }

    #[test]
    fn test_resolve_garbage_fails() {
        assert!(resolve("not an address").is_err());
    }

    #[test]
    fn test_bind_and_connect_loopback() {
        let listener = bind(resolve("127.0.0.1:0").expect("resolves")).expect("binds");
        let local = listener.local_addr().expect("has addr");
        let client = connect(local).expect("connects");
        assert_ne!(client.local_addr().expect("has addr"), local);
    }
}
