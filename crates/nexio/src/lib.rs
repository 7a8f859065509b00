// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # nexio - asynchronous event-driven network application framework core
//!
//! The transport substrate beneath protocol codecs: event loops, channels,
//! pipelines, pooled buffers, and precise write-completion reporting.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use nexio::{
//!     Bootstrap, ChannelConfig, Context, EventLoopGroup, Handler, Message,
//!     PooledAllocator, Result, ServerBootstrap,
//! };
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn channel_read(&mut self, ctx: &Context, msg: Message) -> Result<()> {
//!         // Bounce every buffer straight back.
//!         if let Some(ch) = ctx.channel() {
//!             ch.write_and_flush(msg);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let parents = EventLoopGroup::new(1, "boss").expect("boss group");
//!     let workers = EventLoopGroup::new(4, "worker").expect("worker group");
//!     let allocator = Arc::new(PooledAllocator::new());
//!
//!     let server = ServerBootstrap::new(&parents, &workers)
//!         .allocator(allocator)
//!         .config(ChannelConfig::default())
//!         .child_handler(|ch| ch.pipeline().add_last("echo", Echo));
//!     let (_channel, bound) = server.bind("127.0.0.1:7000".parse().expect("addr"))?;
//!     bound.wait()?;
//!     // ... run until shutdown ...
//!     workers.shutdown();
//!     parents.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Handlers                        |
//! |        codecs, framing, business logic (pipeline handlers)         |
//! +--------------------------------------------------------------------+
//! |                            Pipeline                                |
//! |   head <-> named handler contexts <-> tail (per channel, dynamic)  |
//! +--------------------------------------------------------------------+
//! |                            Channels                                |
//! |   TCP stream/server | UDP datagram | in-process pair               |
//! +--------------------------------------------------------------------+
//! |                 Event Loops (one thread, one selector)             |
//! |     readiness dispatch | FIFO task queue | timers | wake CAS       |
//! +--------------------------------------------------------------------+
//! |                 Pooled Allocator (shared across loops)             |
//! |     size-classed arenas, buddy chunks, refcounted byte buffers     |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`EventLoopGroup`] | Fixed pool of selector threads driving channels |
//! | [`Channel`] | One communication endpoint with its pipeline |
//! | [`Pipeline`] / [`Handler`] | Bidirectional handler chain per channel |
//! | [`ByteBuf`] / [`PooledAllocator`] | Pooled, refcounted I/O buffers |
//! | [`FlushNotifier`] | FIFO write-promise resolution by flushed bytes |
//! | [`Bootstrap`] / [`ServerBootstrap`] | Client/server wiring |
//!
//! ## Threading model
//!
//! Every channel is affined to exactly one loop; its pipeline and handler
//! state only ever run there. Off-loop calls hop through the loop's task
//! queue, so application code never locks. Buffers may cross threads when
//! explicitly retained.

/// Client/server wiring builders.
pub mod bootstrap;
/// Pooled, reference-counted byte buffers.
pub mod buffer;
/// Channels: endpoints, outbound buffering, flush notification.
pub mod channel;
/// Promises and completion plumbing.
pub mod concurrent;
/// Error kinds the core distinguishes.
pub mod error;
/// Event loops, loop groups, task handles.
pub mod eventloop;
/// The handler pipeline.
pub mod pipeline;
/// Transport backends (TCP, UDP, in-process).
pub mod transport;

pub use bootstrap::{Bootstrap, ServerBootstrap};
pub use buffer::{AllocatorConfig, AllocatorStats, ByteBuf, Endianness, PooledAllocator};
pub use channel::{Channel, ChannelConfig, ChannelState, FlushNotifier, Message};
pub use concurrent::Promise;
pub use error::{Error, Result};
pub use eventloop::{EventLoop, EventLoopGroup, EventLoopHandle, TaskHandle};
pub use pipeline::{Context, Handler, Pipeline, MASK_INBOUND, MASK_OUTBOUND};
pub use transport::local_pair;
