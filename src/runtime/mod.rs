//! Single-threaded coroutine runtime for the echo server.
//!
//! Readiness-based model: one mio `Poll` tells us when sockets are ready,
//! and each connection is a suspended `async fn` resumed by the reactor.
//! The pieces:
//! - `awaiter`: leaf futures bridging non-blocking syscalls to suspension
//! - `connection`: per-connection state and the echo handler routine
//! - `reactor`: accept loop, event dispatch, and the task table

mod awaiter;
mod connection;
mod reactor;

pub use reactor::Reactor;
pub(crate) use reactor::ReactorHandle;
