// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP socket construction.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

use crate::channel::ChannelConfig;

/// Build a non-blocking datagram socket bound to `addr`.
pub(crate) fn bind_socket(
    addr: SocketAddr,
    config: &ChannelConfig,
) -> io::Result<mio::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(config.reuse_addr)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let socket: std::net::UdpSocket = socket.into();
    log::debug!("[Udp] socket bound addr={:?}", socket.local_addr().ok());
    Ok(mio::net::UdpSocket::from_std(socket))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_socket_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let socket = bind_socket(addr, &ChannelConfig::default()).expect("bind");
        assert_ne!(socket.local_addr().expect("local").port(), 0);
    }
}
