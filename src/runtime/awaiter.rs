//! Leaf futures bridging non-blocking socket syscalls to suspension.
//!
//! Both awaiters follow the same two-phase shape: attempt the syscall
//! immediately, and only if it would block return `Poll::Pending` so the
//! reactor resumes the routine when the descriptor becomes ready. A
//! would-block result never surfaces past an awaiter.

use crate::runtime::ReactorHandle;
use mio::net::TcpStream;
use mio::Token;
use std::future::Future;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::trace;

/// Retryable "try again once the descriptor is ready" condition.
pub(crate) fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Read up to `buf.len()` bytes from `stream`.
///
/// Resolves to the byte count (`0` = orderly disconnect) or a hard I/O
/// error. If the first attempt completes, no second read is issued.
pub(crate) fn read<'a>(
    stream: &'a mut TcpStream,
    token: Token,
    buf: &'a mut [u8],
) -> ReadFuture<'a> {
    ReadFuture { stream, token, buf }
}

pub(crate) struct ReadFuture<'a> {
    stream: &'a mut TcpStream,
    token: Token,
    buf: &'a mut [u8],
}

impl Future for ReadFuture<'_> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.get_mut();
        loop {
            match me.stream.read(me.buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if is_would_block(e) => {
                    // READABLE interest is the descriptor's standing
                    // registration; nothing to install here.
                    trace!(token = me.token.0, "read would block, suspending");
                    return Poll::Pending;
                }
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

/// Write `buf` to `stream`.
///
/// A partial write is a completed outcome; the caller retries with the
/// remaining tail. While suspended, the descriptor's interest is widened
/// to include WRITABLE through `reactor`, and narrowed back exactly once
/// on resumption before the syscall is re-issued.
pub(crate) fn write<'a>(
    reactor: &'a ReactorHandle,
    stream: &'a mut TcpStream,
    token: Token,
    buf: &'a [u8],
) -> WriteFuture<'a> {
    WriteFuture {
        reactor,
        stream,
        token,
        buf,
        armed: false,
    }
}

pub(crate) struct WriteFuture<'a> {
    reactor: &'a ReactorHandle,
    stream: &'a mut TcpStream,
    token: Token,
    buf: &'a [u8],
    /// True while a suspension has WRITABLE interest installed.
    armed: bool,
}

impl Future for WriteFuture<'_> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.get_mut();
        if me.armed {
            trace!(token = me.token.0, "resumed from write");
            me.reactor.narrow_to_readable(me.stream, me.token)?;
            me.armed = false;
        }
        loop {
            match me.stream.write(me.buf) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if is_would_block(e) => {
                    trace!(token = me.token.0, "write would block, suspending");
                    me.reactor.widen_to_writable(me.stream, me.token)?;
                    me.armed = true;
                    return Poll::Pending;
                }
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Interest;
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};
    use std::rc::Rc;
    use std::task::Waker;
    use std::thread;
    use std::time::Duration;

    /// Non-blocking server-side stream plus the (blocking) client end.
    fn connected_pair() -> (TcpStream, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let client = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let mut cx = Context::from_waker(Waker::noop());
        Pin::new(fut).poll(&mut cx)
    }

    fn poll_until_ready<F: Future + Unpin>(fut: &mut F) -> F::Output {
        for _ in 0..500 {
            if let Poll::Ready(out) = poll_once(fut) {
                return out;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("future never became ready");
    }

    #[test]
    fn test_would_block_predicate() {
        assert!(is_would_block(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_would_block(&io::Error::from(
            io::ErrorKind::ConnectionReset
        )));
        assert!(!is_would_block(&io::Error::from(
            io::ErrorKind::Interrupted
        )));
    }

    #[test]
    fn test_read_suspends_then_completes() {
        let (mut server, mut client) = connected_pair();
        let mut buf = [0u8; 16];

        let mut fut = read(&mut server, Token(1), &mut buf);
        assert!(poll_once(&mut fut).is_pending());

        client.write_all(b"ping").unwrap();
        let n = poll_until_ready(&mut fut).unwrap();
        drop(fut);

        assert_eq!(n, 4);
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_read_reports_orderly_disconnect() {
        let (mut server, client) = connected_pair();
        drop(client);

        let mut buf = [0u8; 16];
        let mut fut = read(&mut server, Token(1), &mut buf);
        let n = poll_until_ready(&mut fut).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_write_completes_without_suspension() {
        let poll = mio::Poll::new().unwrap();
        let (mut server, _client) = connected_pair();
        poll.registry()
            .register(&mut server, Token(1), Interest::READABLE)
            .unwrap();
        let handle = ReactorHandle::new(Rc::new(poll.registry().try_clone().unwrap()));

        let mut fut = write(&handle, &mut server, Token(1), b"pong");
        match poll_once(&mut fut) {
            Poll::Ready(Ok(n)) => assert_eq!(n, 4),
            other => panic!("expected immediate completion, got {other:?}"),
        }
    }
}
