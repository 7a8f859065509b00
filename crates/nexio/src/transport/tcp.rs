// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP socket construction and option plumbing.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

use crate::channel::ChannelConfig;

/// Build a non-blocking listener with the channel's socket options applied
/// before bind.
pub(crate) fn bind_listener(
    addr: SocketAddr,
    config: &ChannelConfig,
) -> io::Result<mio::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(config.reuse_addr)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog as i32)?;
    let listener: std::net::TcpListener = socket.into();
    log::debug!("[Tcp] listener bound addr={:?}", listener.local_addr().ok());
    Ok(mio::net::TcpListener::from_std(listener))
}

/// Apply per-stream options; failures are logged, not fatal.
pub(crate) fn configure_stream(stream: &mio::net::TcpStream, config: &ChannelConfig) {
    if let Err(e) = stream.set_nodelay(config.nodelay) {
        log::debug!("[Tcp] set_nodelay failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listener_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let listener = bind_listener(addr, &ChannelConfig::default()).expect("bind");
        let local = listener.local_addr().expect("local addr");
        assert_ne!(local.port(), 0, "ephemeral port assigned");
    }

    #[test]
    fn test_bind_listener_rejects_in_use_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        let config = ChannelConfig {
            reuse_addr: false,
            ..ChannelConfig::default()
        };
        let first = bind_listener(addr, &config).expect("first bind");
        let taken = first.local_addr().expect("local addr");
        assert!(bind_listener(taken, &config).is_err(), "port already in use");
    }
}
