// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! TCP connections and listeners over the completion queue. A connection is
//! one full-duplex stream with a dedicated operation context per direction,
//! so one receive and one send may be outstanding at the same time. All
//! socket completions route through [complete_io], which consumes the
//! context's continuation exactly once per delivered completion.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    net::{
        endpoint::Endpoint,
        futures::{
            accept::AcceptFuture,
            connect::ConnectFuture,
            recv::RecvFuture,
            send::SendFuture,
        },
        socket::TcpSocket,
    },
    runtime::{
        context::{
            CompletionPacket,
            Continuation,
            OpContext,
            OpStart,
        },
        fail::Fail,
        queue::SharedCompletionQueue,
    },
};
use ::std::{
    os::fd::RawFd,
    sync::Arc,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Listen backlog for accepting sockets.
const LISTEN_BACKLOG: i32 = 100;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A full-duplex TCP stream issuing non-blocking operations through a
/// completion queue. Move-only; dropping it closes the stream and releases
/// its queue registration.
pub struct Connection {
    /// The attached socket.
    sock: TcpSocket,
    /// Context for the receive direction (also carries connect).
    recv_ctx: Arc<OpContext>,
    /// Context for the send direction.
    send_ctx: Arc<OpContext>,
}

/// A listening TCP socket accepting connections through the queue.
pub struct Listener {
    /// The attached listening socket.
    sock: TcpSocket,
    /// Context for the accept in flight.
    accept_ctx: Arc<OpContext>,
    /// Queue that accepted connections are registered with.
    queue: SharedCompletionQueue,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Connection {
    /// Starts an asynchronous connect to `remote`. The returned future
    /// resolves to the connected stream; the underlying socket is bound to
    /// an ephemeral local endpoint and registered with `queue` before the
    /// connect is issued.
    pub fn connect(queue: &SharedCompletionQueue, remote: Endpoint) -> ConnectFuture {
        ConnectFuture::new(queue, remote)
    }

    /// Receives into `buffer`, suspending the caller until data (or end of
    /// stream, or an error) arrives. Resolves to the byte count and the
    /// buffer; zero bytes is end of stream.
    pub fn receive(&self, buffer: Vec<u8>) -> RecvFuture<'_> {
        RecvFuture::new(self, buffer)
    }

    /// Sends `buffer`, suspending the caller until the bytes are accepted.
    /// Resolves to the byte count actually sent and the buffer.
    pub fn send(&self, buffer: Vec<u8>) -> SendFuture<'_> {
        SendFuture::new(self, buffer)
    }

    /// Issues a receive with an explicit completion step. `handler` runs
    /// exactly once, on a queue worker, if and only if this returns
    /// `Pending`; an inline completion or an issue failure never invokes it
    /// and is the caller's to handle from the return value.
    pub fn read_with<F>(&self, buffer: Vec<u8>, handler: F) -> OpStart
    where
        F: FnOnce(i32, u32) + Send + 'static,
    {
        self.recv_ctx.set_continuation(Continuation::Invoke(Box::new(handler)));
        let start: OpStart = self.sock.receive(&self.recv_ctx, buffer);
        if !matches!(start, OpStart::Pending) {
            drop(self.recv_ctx.take_continuation());
        }
        start
    }

    /// Issues a send with an explicit completion step. Same contract as
    /// [Self::read_with].
    pub fn write_with<F>(&self, buffer: Vec<u8>, handler: F) -> OpStart
    where
        F: FnOnce(i32, u32) + Send + 'static,
    {
        self.send_ctx.set_continuation(Continuation::Invoke(Box::new(handler)));
        let start: OpStart = self.sock.send(&self.send_ctx, buffer);
        if !matches!(start, OpStart::Pending) {
            drop(self.send_ctx.take_continuation());
        }
        start
    }

    /// Forces `handler` onto a queue worker thread as a synthetic send
    /// completion carrying `bytes`. Used to bootstrap a send loop off its
    /// first caller's stack when the first send finished inline.
    pub fn repost_write<F>(&self, bytes: u32, handler: F) -> Result<(), Fail>
    where
        F: FnOnce(i32, u32) + Send + 'static,
    {
        let queue: SharedCompletionQueue = match self.sock.queue() {
            Some(queue) => queue.clone(),
            None => return Err(Fail::new(libc::EINVAL, "socket is not attached to a queue")),
        };
        self.send_ctx.set_continuation(Continuation::Invoke(Box::new(handler)));
        if let Err(e) = queue.post(&self.send_ctx, bytes, complete_io) {
            drop(self.send_ctx.take_continuation());
            return Err(e);
        }
        Ok(())
    }

    /// Takes back the buffer of the last completed receive.
    pub fn take_read_buffer(&self) -> Option<Vec<u8>> {
        self.recv_ctx.take_buffer()
    }

    /// Takes back the buffer of the last completed send.
    pub fn take_write_buffer(&self) -> Option<Vec<u8>> {
        self.send_ctx.take_buffer()
    }

    /// Builds an unconnected stream registered with the queue, ready for a
    /// connect issue: ephemeral local binding, then registration.
    pub(crate) fn prepare(queue: &SharedCompletionQueue) -> Result<Self, Fail> {
        let mut sock: TcpSocket = TcpSocket::stream()?;
        sock.bind(&Endpoint::any())?;
        sock.attach(queue, complete_io)?;
        Ok(Self::wrap(sock))
    }

    /// Wraps a socket the OS just accepted and registers it with the queue.
    /// On registration failure the wrapper goes down with the handle: the
    /// accepted socket is closed, never leaked.
    pub(crate) fn from_accepted(fd: RawFd, queue: &SharedCompletionQueue) -> Result<Self, Fail> {
        let mut sock: TcpSocket = unsafe { TcpSocket::from_raw(fd) };
        sock.attach(queue, complete_io)?;
        Ok(Self::wrap(sock))
    }

    fn wrap(sock: TcpSocket) -> Self {
        Self {
            sock,
            recv_ctx: Arc::new(OpContext::new()),
            send_ctx: Arc::new(OpContext::new()),
        }
    }

    pub(crate) fn recv_context(&self) -> &Arc<OpContext> {
        &self.recv_ctx
    }

    pub(crate) fn send_context(&self) -> &Arc<OpContext> {
        &self.send_ctx
    }

    pub(crate) fn issue_receive(&self, buffer: Vec<u8>) -> OpStart {
        self.sock.receive(&self.recv_ctx, buffer)
    }

    pub(crate) fn issue_send(&self, buffer: Vec<u8>) -> OpStart {
        self.sock.send(&self.send_ctx, buffer)
    }

    pub(crate) fn issue_connect(&self, remote: &Endpoint) -> OpStart {
        self.sock.connect(&self.recv_ctx, remote)
    }
}

impl Listener {
    /// Creates a listening socket on `local` and registers it with the
    /// queue.
    pub fn create(queue: &SharedCompletionQueue, local: &Endpoint) -> Result<Self, Fail> {
        let mut sock: TcpSocket = TcpSocket::stream()?;
        sock.set_reuse_address()?;
        sock.bind(local)?;
        sock.listen(LISTEN_BACKLOG)?;
        sock.attach(queue, complete_io)?;
        debug!("create(): listening on {}", local);
        Ok(Self {
            sock,
            accept_ctx: Arc::new(OpContext::new()),
            queue: queue.clone(),
        })
    }

    /// Accepts one connection, suspending the caller until it arrives. The
    /// listener is not re-armed automatically: accepting the next
    /// connection takes another call, keeping accept concurrency at the
    /// call sites.
    pub fn accept(&self) -> AcceptFuture<'_> {
        AcceptFuture::new(self)
    }

    /// Issues an accept with an explicit completion step. `handler` runs
    /// exactly once, on a queue worker, if and only if this returns
    /// `Pending`; it receives the accepted connection already registered
    /// with the queue, or the error that prevented that.
    pub fn accept_with<F>(&self, handler: F) -> OpStart
    where
        F: FnOnce(Result<Connection, Fail>) + Send + 'static,
    {
        let queue: SharedCompletionQueue = self.queue.clone();
        self.accept_ctx
            .set_continuation(Continuation::Invoke(Box::new(move |error, bytes| {
                if error != 0 {
                    handler(Err(Fail::new(error, "accept failed")));
                    return;
                }
                handler(Connection::from_accepted(bytes as RawFd, &queue));
            })));
        let start: OpStart = self.sock.accept(&self.accept_ctx);
        if !matches!(start, OpStart::Pending) {
            drop(self.accept_ctx.take_continuation());
        }
        start
    }

    /// The local endpoint the listener is bound to.
    pub fn local_endpoint(&self) -> Result<Endpoint, Fail> {
        self.sock.local_endpoint()
    }

    pub(crate) fn accept_context(&self) -> &Arc<OpContext> {
        &self.accept_ctx
    }

    pub(crate) fn issue_accept(&self) -> OpStart {
        self.sock.accept(&self.accept_ctx)
    }

    pub(crate) fn queue_handle(&self) -> &SharedCompletionQueue {
        &self.queue
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Routing key for every socket registered by this module: records the
/// delivered results in the operation context and runs its continuation.
/// A context whose continuation was already taken belongs to an abandoned
/// operation; the delivery releases the parked buffer and invokes nothing,
/// leaving the context ready for the next issue.
pub fn complete_io(packet: CompletionPacket) {
    let CompletionPacket { error, bytes, ctx } = packet;
    match ctx.complete(error, bytes) {
        Some(Continuation::Invoke(step)) => step(error, bytes),
        Some(Continuation::Resume(waker)) => waker.wake(),
        None => {
            drop(ctx.take_buffer());
            trace!("complete_io(): completion abandoned (error={:?} bytes={:?})", error, bytes);
        },
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        complete_io,
        Connection,
    };
    use crate::runtime::{
        context::OpStart,
        fail::Fail,
        queue::SharedCompletionQueue,
    };
    use ::anyhow::Result;
    use ::crossbeam_channel::{
        unbounded,
        Receiver,
        Sender,
    };
    use ::std::{
        os::fd::RawFd,
        thread,
        time::{
            Duration,
            Instant,
        },
    };

    fn unix_pair() -> (RawFd, RawFd) {
        let mut fds: [libc::c_int; 2] = [0; 2];
        let rc: libc::c_int = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn send_all(fd: RawFd, data: &[u8]) {
        let n: isize = unsafe { libc::send(fd, data.as_ptr().cast::<libc::c_void>(), data.len(), 0) };
        assert_eq!(n, data.len() as isize);
    }

    /// Pumps completions on the calling thread until `done` or a timeout.
    fn pump_until<F: Fn() -> bool>(queue: &SharedCompletionQueue, done: F) -> bool {
        let deadline: Instant = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            if !queue.poll_once() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        done()
    }

    /// Tests the cleanup contract: when registering an accepted socket
    /// fails, the socket is closed, not leaked.
    #[test]
    fn failed_registration_closes_accepted_socket() -> Result<()> {
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(0, false);
        let (a, b): (RawFd, RawFd) = unix_pair();
        // Occupy the registry slot so registration of `a` must fail.
        queue.associate(a, complete_io)?;

        let error: Fail = match Connection::from_accepted(a, &queue) {
            Ok(_) => anyhow::bail!("registering an occupied handle must fail"),
            Err(e) => e,
        };
        crate::ensure_eq!(error.errno, libc::EEXIST);

        // The descriptor must be gone.
        let rc: libc::c_int = unsafe { libc::fcntl(a, libc::F_GETFD) };
        crate::ensure_eq!(rc, -1);
        let errno: libc::c_int = unsafe { *libc::__errno_location() };
        crate::ensure_eq!(errno, libc::EBADF);

        unsafe { libc::close(b) };
        queue.dissociate(a);
        queue.stop();
        queue.wait();
        Ok(())
    }

    /// Tests if a receive and a send outstanding at the same time on one
    /// connection complete independently with their own results.
    #[test]
    fn duplex_operations_use_disjoint_contexts() -> Result<()> {
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(0, false);
        let (a, b): (RawFd, RawFd) = unix_pair();
        let conn: Connection = Connection::from_accepted(a, &queue)?;
        send_all(b, b"ping-data");

        let (read_tx, read_rx): (Sender<(i32, u32)>, Receiver<(i32, u32)>) = unbounded();
        let started: OpStart = conn.read_with(vec![0u8; 64], move |error, bytes| {
            let _ = read_tx.send((error, bytes));
        });
        crate::ensure_eq!(matches!(started, OpStart::Pending), true);

        let (write_tx, write_rx): (Sender<(i32, u32)>, Receiver<(i32, u32)>) = unbounded();
        let started: OpStart = conn.write_with(b"pong".to_vec(), move |error, bytes| {
            let _ = write_tx.send((error, bytes));
        });
        crate::ensure_eq!(matches!(started, OpStart::Pending), true);

        let finished: bool = pump_until(&queue, || !read_rx.is_empty() && !write_rx.is_empty());
        crate::ensure_eq!(finished, true);

        crate::ensure_eq!(read_rx.recv()?, (0, 9));
        let read_buffer: Vec<u8> = conn.take_read_buffer().unwrap();
        crate::ensure_eq!(&read_buffer[..9], b"ping-data");

        crate::ensure_eq!(write_rx.recv()?, (0, 4));
        let mut peer_buffer: [u8; 16] = [0; 16];
        let n: isize = unsafe { libc::recv(b, peer_buffer.as_mut_ptr().cast::<libc::c_void>(), 16, 0) };
        crate::ensure_eq!(n, 4);
        crate::ensure_eq!(&peer_buffer[..4], b"pong");

        unsafe { libc::close(b) };
        drop(conn);
        queue.stop();
        queue.wait();
        Ok(())
    }

    /// Tests the synchronous fast path of the callback layer: data already
    /// available completes at issue and the handler is never invoked.
    #[test]
    fn inline_read_skips_the_handler() -> Result<()> {
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(0, true);
        let (a, b): (RawFd, RawFd) = unix_pair();
        let conn: Connection = Connection::from_accepted(a, &queue)?;
        send_all(b, b"early");

        let (tx, rx): (Sender<(i32, u32)>, Receiver<(i32, u32)>) = unbounded();
        let started: OpStart = conn.read_with(vec![0u8; 16], move |error, bytes| {
            let _ = tx.send((error, bytes));
        });
        match started {
            OpStart::CompletedInline(bytes) => crate::ensure_eq!(bytes, 5),
            other => anyhow::bail!("expected an inline completion, got {:?}", other),
        }
        crate::ensure_eq!(rx.try_recv().is_err(), true);
        let buffer: Vec<u8> = conn.take_read_buffer().unwrap();
        crate::ensure_eq!(&buffer[..5], b"early");

        unsafe { libc::close(b) };
        drop(conn);
        queue.stop();
        queue.wait();
        Ok(())
    }

    /// Tests if an issue-time failure comes back in the return value with
    /// the handler uninvoked.
    #[test]
    fn failed_write_reports_at_issue() -> Result<()> {
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(0, true);
        let (a, b): (RawFd, RawFd) = unix_pair();
        unsafe { libc::close(b) };
        let conn: Connection = Connection::from_accepted(a, &queue)?;

        let (tx, rx): (Sender<(i32, u32)>, Receiver<(i32, u32)>) = unbounded();
        let started: OpStart = conn.write_with(b"data".to_vec(), move |error, bytes| {
            let _ = tx.send((error, bytes));
        });
        match started {
            OpStart::Failed(e) => crate::ensure_eq!(e.errno, libc::EPIPE),
            other => anyhow::bail!("expected an issue failure, got {:?}", other),
        }
        crate::ensure_eq!(rx.try_recv().is_err(), true);

        drop(conn);
        queue.stop();
        queue.wait();
        Ok(())
    }
}
