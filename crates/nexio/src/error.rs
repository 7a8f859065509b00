// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error kinds distinguished by the framework core.
//!
//! Errors are cheap to clone because a single cause may have to fail an
//! arbitrary number of pending write promises at once; transport causes are
//! therefore held behind an `Arc`.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds the core distinguishes.
///
/// | Kind | Meaning |
/// |------|---------|
/// | `ChannelClosed` | Operation on a closed channel |
/// | `NotYetRegistered` | I/O attempted before the channel joined a loop |
/// | `Allocation` | Allocator could not serve the request |
/// | `Protocol` | A handler raised a codec-level error |
/// | `Transport` | Underlying socket I/O failed |
/// | `Cancelled` | A submitted task was cancelled before it ran |
#[derive(Debug, Clone)]
pub enum Error {
    /// Operation attempted on a channel that has already closed.
    ChannelClosed,
    /// I/O attempted before the channel was registered with an event loop.
    NotYetRegistered,
    /// Buffer allocation failed (out of memory or over max capacity).
    Allocation(String),
    /// Handler-level protocol violation.
    Protocol(String),
    /// Underlying I/O error (read/write/accept/connect).
    Transport(Arc<io::Error>),
    /// A submitted task was cancelled before it ran.
    Cancelled,
}

impl Error {
    /// Build an `Allocation` error from anything printable.
    pub fn alloc(msg: impl Into<String>) -> Self {
        Self::Allocation(msg.into())
    }

    /// Build a `Protocol` error from anything printable.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True for errors that terminate the channel when they surface.
    pub fn is_fatal_to_channel(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::Transport(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "channel closed"),
            Self::NotYetRegistered => write!(f, "channel not yet registered with an event loop"),
            Self::Allocation(msg) => write!(f, "allocation failed: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Cancelled => write!(f, "task cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Transport(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_channel_closed() {
        assert_eq!(Error::ChannelClosed.to_string(), "channel closed");
    }

    #[test]
    fn test_transport_wraps_io_error() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset").into();
        match &err {
            Error::Transport(inner) => {
                assert_eq!(inner.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("expected Transport, got {:?}", other),
        }
        // Cloneable so one cause can fail many promises
        let cloned = err.clone();
        assert!(cloned.to_string().contains("peer reset"));
    }

    #[test]
    fn test_fatality_classification() {
        assert!(Error::ChannelClosed.is_fatal_to_channel());
        assert!(!Error::Cancelled.is_fatal_to_channel());
        assert!(!Error::alloc("oom").is_fatal_to_channel());
    }
}
