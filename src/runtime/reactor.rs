//! The event loop: owns the readiness notifier, the listening socket,
//! and the table of suspended connection routines.
//!
//! Continuations are never round-tripped through the OS as raw pointers.
//! Each suspended routine lives in a slab owned by the reactor, and the
//! mio `Token` carried by a readiness event is the slab index of the
//! routine to resume. A token whose slot is gone names a connection that
//! already finished, and its events are ignored.

use crate::runtime::awaiter;
use crate::runtime::connection::{self, Connection};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Wake, Waker};
use tracing::{debug, error, trace, warn};

/// Token reserved for the listening socket.
const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Token reserved for the cross-wait wakeup channel.
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Readiness events dispatched per wait call.
const EVENT_CAPACITY: usize = 128;

/// Listen backlog.
const BACKLOG: i32 = 1024;

/// A suspended connection routine.
type Task = Pin<Box<dyn Future<Output = ()>>>;

/// Task indices woken through the `Waker` contract rather than through
/// socket readiness. Drained once per loop iteration.
type ReadyQueue = Arc<Mutex<VecDeque<usize>>>;

/// Waker that records which task asked to be re-polled and interrupts
/// the wait call, so a wake raised while the loop is blocked is not
/// stranded until unrelated I/O arrives.
struct TokenWaker {
    token: usize,
    ready: ReadyQueue,
    poll_waker: Arc<mio::Waker>,
}

impl Wake for TokenWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.lock().unwrap().push_back(self.token);
        // A failed wakeup signal still leaves the token queued for the
        // next dispatch.
        let _ = self.poll_waker.wake();
    }
}

/// Handle the awaiters use to adjust a descriptor's registered interest.
///
/// Registration changes are explicit calls on this handle rather than
/// ambient access to reactor internals; it exposes only the operations
/// the suspension logic needs.
#[derive(Clone)]
pub(crate) struct ReactorHandle {
    registry: Rc<Registry>,
}

impl ReactorHandle {
    pub(crate) fn new(registry: Rc<Registry>) -> Self {
        Self { registry }
    }

    /// Register a freshly accepted stream with its default interest.
    pub(crate) fn register(&self, stream: &mut TcpStream, token: Token) -> io::Result<()> {
        self.registry.register(stream, token, Interest::READABLE)
    }

    /// Widen interest to include WRITABLE while a write awaiter is
    /// suspended.
    pub(crate) fn widen_to_writable(
        &self,
        stream: &mut TcpStream,
        token: Token,
    ) -> io::Result<()> {
        self.registry
            .reregister(stream, token, Interest::READABLE | Interest::WRITABLE)
    }

    /// Narrow interest back to READABLE once the write awaiter resumes.
    pub(crate) fn narrow_to_readable(
        &self,
        stream: &mut TcpStream,
        token: Token,
    ) -> io::Result<()> {
        self.registry.reregister(stream, token, Interest::READABLE)
    }

    pub(crate) fn deregister(&self, stream: &mut TcpStream) -> io::Result<()> {
        self.registry.deregister(stream)
    }
}

/// The event loop. Single-threaded and cooperative: connection routines
/// are resumed synchronously, one readiness event at a time.
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    handle: ReactorHandle,
    tasks: Slab<Task>,
    ready: ReadyQueue,
    poll_waker: Arc<mio::Waker>,
}

impl Reactor {
    /// Bind the listener and set up the readiness notifier.
    ///
    /// Any failure here is fatal: it indicates a misconfigured
    /// environment, and the caller is expected to terminate.
    pub fn new(addr: SocketAddr) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let poll_waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN)?);
        let handle = ReactorHandle::new(Rc::new(poll.registry().try_clone()?));

        Ok(Self {
            poll,
            listener,
            local_addr,
            handle,
            tasks: Slab::new(),
            ready: Arc::new(Mutex::new(VecDeque::new())),
            poll_waker,
        })
    }

    /// The address the listener actually bound (relevant when binding
    /// port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the wait-then-dispatch loop forever.
    ///
    /// Only a failure of the wait call itself returns an error.
    /// Per-connection failures are absorbed by their handlers and never
    /// unwind into this loop.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        loop {
            self.poll.poll(&mut events, None)?;

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_ready(),
                    // Queued wakes are drained below.
                    WAKER_TOKEN => {}
                    Token(id) => self.resume(id),
                }
            }

            self.drain_wakes();
        }
    }

    /// Accept until the listener would block. Each new connection gets a
    /// slab slot, READABLE registration under that slot's token, and one
    /// initial resumption so the handler runs to its first suspension.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let entry = self.tasks.vacant_entry();
                    let token = Token(entry.key());
                    // A registration failure is local to this connection;
                    // the reactor keeps serving the rest.
                    if let Err(e) = self.handle.register(&mut stream, token) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        continue;
                    }
                    debug!(token = token.0, peer = %peer, "Accepted connection");

                    let conn = Connection::new(stream, token, peer);
                    entry.insert(Box::pin(connection::drive(conn, self.handle.clone())));
                    self.resume(token.0);
                }
                Err(ref e) if awaiter::is_would_block(e) => break,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // The listener registration is edge-triggered, so an
                    // abandoned accept pass would strand connections
                    // already in the backlog until a new SYN arrives.
                    // Re-arm it so the next wait retries the accept.
                    if let Err(e) = self.poll.registry().reregister(
                        &mut self.listener,
                        LISTENER_TOKEN,
                        Interest::READABLE,
                    ) {
                        error!(error = %e, "Failed to re-arm listener");
                    }
                    break;
                }
            }
        }
    }

    /// Resume the suspended routine stored under `id`, removing it from
    /// the table once it runs to completion.
    fn resume(&mut self, id: usize) {
        let Some(task) = self.tasks.get_mut(id) else {
            trace!(token = id, "Event for retired connection");
            return;
        };
        let waker = Waker::from(Arc::new(TokenWaker {
            token: id,
            ready: Arc::clone(&self.ready),
            poll_waker: Arc::clone(&self.poll_waker),
        }));
        let mut cx = Context::from_waker(&waker);
        if task.as_mut().poll(&mut cx).is_ready() {
            // The routine already ran to completion; its slot is retired.
            drop(self.tasks.remove(id));
            trace!(token = id, "Handler finished");
        }
    }

    /// Re-poll any tasks woken through the `Waker` contract.
    fn drain_wakes(&mut self) {
        loop {
            let next = self.ready.lock().unwrap().pop_front();
            match next {
                Some(id) => self.resume(id),
                None => break,
            }
        }
    }
}

/// Create the listening socket: SO_REUSEADDR, non-blocking, bound and
/// listening before the descriptor is handed to mio.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
