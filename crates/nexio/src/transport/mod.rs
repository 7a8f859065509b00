// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport backends a channel can sit on.
//!
//! TCP and UDP go through mio's non-blocking socket types (constructed
//! with socket2 so options land before bind); the local transport is an
//! in-process pair that hands flushed buffers straight to the peer
//! channel's loop.

pub(crate) mod local;
pub(crate) mod tcp;
pub(crate) mod udp;

pub use local::local_pair;
pub(crate) use local::LocalTransport;

/// The socket (or socket-to-be) behind a channel.
///
/// `*Init` variants exist between channel creation and the bind/connect
/// operation that actually produces a socket.
pub(crate) enum Transport {
    /// TCP client before `connect`.
    TcpInit,
    /// TCP server before `bind`.
    ServerInit,
    /// UDP before `bind`/`connect`.
    UdpInit,
    TcpStream(mio::net::TcpStream),
    TcpListener(mio::net::TcpListener),
    Udp(mio::net::UdpSocket),
    Local(LocalTransport),
    /// Torn down; the socket is gone.
    Closed,
}
