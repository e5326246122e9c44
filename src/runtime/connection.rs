//! Per-connection state and the echo handler routine.

use crate::runtime::{awaiter, ReactorHandle};
use mio::net::TcpStream;
use mio::Token;
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

/// Fixed capacity of the per-connection echo buffer.
pub(crate) const BUFFER_SIZE: usize = 1024;

/// A single client connection.
///
/// Owned exclusively by its own handler routine; the reactor holds only
/// the suspended routine. `pending > 0` means the connection is in its
/// write phase, echoing `buf[..pending]` back to the peer; `pending == 0`
/// means it needs to read more.
pub(crate) struct Connection {
    stream: TcpStream,
    token: Token,
    peer: SocketAddr,
    /// Reused for both the read and the echo-write.
    buf: [u8; BUFFER_SIZE],
    pending: usize,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, token: Token, peer: SocketAddr) -> Self {
        Self {
            stream,
            token,
            peer,
            buf: [0; BUFFER_SIZE],
            pending: 0,
        }
    }

    /// Account for `written` echoed bytes. Any unwritten tail is shifted
    /// to the front of the buffer, so byte order survives partial writes.
    fn consume(&mut self, written: usize) {
        debug_assert!(written <= self.pending);
        if written < self.pending {
            self.buf.copy_within(written..self.pending, 0);
        }
        self.pending -= written;
    }
}

/// Drive one connection to completion: alternate reading and writing
/// until the peer disconnects or an I/O error ends the session, then
/// deregister and close. The only suspension points are the two awaiters.
pub(crate) async fn drive(mut conn: Connection, reactor: ReactorHandle) {
    loop {
        if conn.pending > 0 {
            let result = awaiter::write(
                &reactor,
                &mut conn.stream,
                conn.token,
                &conn.buf[..conn.pending],
            )
            .await;
            match result {
                Ok(0) => {
                    warn!(token = conn.token.0, "Write returned zero, closing");
                    break;
                }
                Ok(n) => {
                    trace!(token = conn.token.0, sent = n, "Echoed bytes");
                    conn.consume(n);
                }
                Err(e) => {
                    warn!(token = conn.token.0, error = %e, "Write failed");
                    break;
                }
            }
        } else {
            match awaiter::read(&mut conn.stream, conn.token, &mut conn.buf).await {
                Ok(0) => {
                    debug!(token = conn.token.0, peer = %conn.peer, "Peer disconnected");
                    break;
                }
                Ok(n) => {
                    trace!(token = conn.token.0, received = n, "Read bytes");
                    conn.pending = n;
                }
                Err(e) => {
                    warn!(token = conn.token.0, error = %e, "Read failed");
                    break;
                }
            }
        }
    }

    if let Err(e) = reactor.deregister(&mut conn.stream) {
        debug!(token = conn.token.0, error = %e, "Deregister failed");
    }
    // Dropping the stream closes the descriptor.
    debug!(token = conn.token.0, "Connection closed");
}
