// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! TCP socket with asynchronous operation issue. A socket owns exactly one
//! native handle and must be attached to a completion queue before any
//! operation is issued on it. Issue calls never block: each either finishes
//! inline, goes pending with exactly one dispatch to follow, or fails with
//! no dispatch ever.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    net::endpoint::Endpoint,
    runtime::{
        context::{
            DispatchFn,
            OpContext,
            OpStart,
        },
        fail::Fail,
        queue::{
            reclaim,
            SharedCompletionQueue,
        },
    },
};
use ::io_uring::{
    opcode,
    squeue,
    types,
};
use ::socket2::{
    Domain,
    Protocol,
    Socket,
    Type,
};
use ::std::{
    mem,
    os::fd::{
        AsRawFd,
        FromRawFd,
        RawFd,
    },
    ptr,
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A TCP socket handle. Move-only: dropping it detaches the handle from its
/// queue and closes it.
pub struct TcpSocket {
    /// Owned native handle.
    sock: Socket,
    /// Queue attachment, set once by [Self::attach].
    binding: Option<Binding>,
}

/// The completion queue a socket was attached to, with the routing key its
/// completions dispatch through.
struct Binding {
    queue: SharedCompletionQueue,
    key: DispatchFn,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TcpSocket {
    /// Creates a TCP stream socket.
    pub fn stream() -> Result<Self, Fail> {
        let sock: Socket = match Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) {
            Ok(sock) => sock,
            Err(e) => {
                let cause: String = format!("cannot create TCP socket: {:?}", e);
                error!("stream(): {}", cause);
                return Err(Fail::new(e.raw_os_error().unwrap_or(libc::EIO), &cause));
            },
        };
        if sock.set_nodelay(true).is_err() {
            warn!("cannot set TCP_NODELAY option");
        }
        Ok(Self { sock, binding: None })
    }

    /// Wraps a native handle handed over by the OS, taking ownership of it.
    ///
    /// # Safety
    ///
    /// `fd` must be an open socket descriptor owned by no one else.
    pub(crate) unsafe fn from_raw(fd: RawFd) -> Self {
        let sock: Socket = unsafe { Socket::from_raw_fd(fd) };
        if sock.set_nodelay(true).is_err() {
            warn!("cannot set TCP_NODELAY option");
        }
        Self { sock, binding: None }
    }

    /// The native handle.
    pub fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Allows local address reuse. Set on listeners before binding.
    pub fn set_reuse_address(&self) -> Result<(), Fail> {
        if let Err(e) = self.sock.set_reuse_address(true) {
            let cause: String = format!("cannot set SO_REUSEADDR option: {:?}", e);
            error!("set_reuse_address(): {}", cause);
            return Err(Fail::new(e.raw_os_error().unwrap_or(libc::EIO), &cause));
        }
        Ok(())
    }

    /// Binds the socket to a local endpoint.
    pub fn bind(&self, local: &Endpoint) -> Result<(), Fail> {
        trace!("bind(): local={}", local);
        match unsafe { libc::bind(self.raw_fd(), local.as_raw(), Endpoint::SIZE as libc::socklen_t) } {
            0 => Ok(()),
            _ => {
                let fail: Fail = Fail::last_os_error("cannot bind socket");
                error!("bind(): {:?}", fail);
                Err(fail)
            },
        }
    }

    /// Puts the socket into listening state.
    pub fn listen(&self, backlog: i32) -> Result<(), Fail> {
        trace!("listen(): backlog={:?}", backlog);
        match unsafe { libc::listen(self.raw_fd(), backlog) } {
            0 => Ok(()),
            _ => {
                let fail: Fail = Fail::last_os_error("cannot listen on socket");
                error!("listen(): {:?}", fail);
                Err(fail)
            },
        }
    }

    /// Reads back the local endpoint the socket is bound to.
    pub fn local_endpoint(&self) -> Result<Endpoint, Fail> {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len: libc::socklen_t = Endpoint::SIZE as libc::socklen_t;
        let addr_ptr: *mut libc::sockaddr = (&mut addr as *mut libc::sockaddr_in).cast::<libc::sockaddr>();
        match unsafe { libc::getsockname(self.raw_fd(), addr_ptr, &mut len) } {
            0 => Ok(Endpoint::from_raw(addr)),
            _ => {
                let fail: Fail = Fail::last_os_error("cannot read local endpoint");
                error!("local_endpoint(): {:?}", fail);
                Err(fail)
            },
        }
    }

    /// Registers the handle with the completion queue, binding the routing
    /// key its completions dispatch through. Required exactly once before
    /// any operation is issued on the socket.
    pub fn attach(&mut self, queue: &SharedCompletionQueue, key: DispatchFn) -> Result<(), Fail> {
        if self.binding.is_some() {
            return Err(Fail::new(libc::EBUSY, "socket is already attached to a queue"));
        }
        queue.associate(self.raw_fd(), key)?;
        self.binding = Some(Binding {
            queue: queue.clone(),
            key,
        });
        Ok(())
    }

    /// The queue this socket is attached to, if any.
    pub(crate) fn queue(&self) -> Option<&SharedCompletionQueue> {
        self.binding.as_ref().map(|binding| &binding.queue)
    }

    /// Issues an asynchronous receive into `buffer`. The buffer is parked in
    /// the context while the operation is in flight; on an inline completion
    /// it stays parked for the caller to take back, on failure it is
    /// released. With the queue's fast path enabled, data already available
    /// completes the call inline and nothing is ever submitted.
    pub fn receive(&self, ctx: &Arc<OpContext>, buffer: Vec<u8>) -> OpStart {
        let binding: &Binding = match self.require_binding() {
            Ok(binding) => binding,
            Err(e) => return OpStart::Failed(e),
        };
        if let Err(e) = ctx.begin() {
            return OpStart::Failed(e);
        }
        ctx.set_key(binding.key);
        ctx.park_buffer(buffer);
        let (buf_ptr, buf_len): (*mut u8, usize) = match ctx.buffer_parts() {
            Some(parts) => parts,
            None => return abort_issue(ctx, Fail::new(libc::EINVAL, "no buffer parked for receive")),
        };

        if binding.queue.sync_enabled() {
            let n: isize =
                unsafe { libc::recv(self.raw_fd(), buf_ptr.cast::<libc::c_void>(), buf_len, libc::MSG_DONTWAIT) };
            if n >= 0 {
                trace!("receive(): completed at issue (bytes={:?})", n);
                ctx.cancel();
                return OpStart::CompletedInline(n as u32);
            }
            let fail: Fail = Fail::last_os_error("receive failed at issue");
            if !fast_path_inconclusive(fail.errno) {
                return abort_issue(ctx, fail);
            }
        }

        let entry: squeue::Entry = opcode::Recv::new(types::Fd(self.raw_fd()), buf_ptr, buf_len as u32).build();
        self.submit_op(binding, ctx, entry)
    }

    /// Issues an asynchronous send of `buffer`. Symmetric to
    /// [Self::receive]; an inline completion may cover fewer bytes than the
    /// buffer holds.
    pub fn send(&self, ctx: &Arc<OpContext>, buffer: Vec<u8>) -> OpStart {
        let binding: &Binding = match self.require_binding() {
            Ok(binding) => binding,
            Err(e) => return OpStart::Failed(e),
        };
        if let Err(e) = ctx.begin() {
            return OpStart::Failed(e);
        }
        ctx.set_key(binding.key);
        ctx.park_buffer(buffer);
        let (buf_ptr, buf_len): (*mut u8, usize) = match ctx.buffer_parts() {
            Some(parts) => parts,
            None => return abort_issue(ctx, Fail::new(libc::EINVAL, "no buffer parked for send")),
        };

        if binding.queue.sync_enabled() {
            let flags: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
            let n: isize = unsafe { libc::send(self.raw_fd(), buf_ptr.cast::<libc::c_void>(), buf_len, flags) };
            if n >= 0 {
                trace!("send(): completed at issue (bytes={:?})", n);
                ctx.cancel();
                return OpStart::CompletedInline(n as u32);
            }
            let fail: Fail = Fail::last_os_error("send failed at issue");
            if !fast_path_inconclusive(fail.errno) {
                return abort_issue(ctx, fail);
            }
        }

        let entry: squeue::Entry = opcode::Send::new(types::Fd(self.raw_fd()), buf_ptr.cast_const(), buf_len as u32)
            .flags(libc::MSG_NOSIGNAL)
            .build();
        self.submit_op(binding, ctx, entry)
    }

    /// Issues an asynchronous connect to `remote`. Never completes inline:
    /// the true result always arrives through the queue. The remote address
    /// image is parked in the context for the lifetime of the operation.
    pub fn connect(&self, ctx: &Arc<OpContext>, remote: &Endpoint) -> OpStart {
        let binding: &Binding = match self.require_binding() {
            Ok(binding) => binding,
            Err(e) => return OpStart::Failed(e),
        };
        if let Err(e) = ctx.begin() {
            return OpStart::Failed(e);
        }
        ctx.set_key(binding.key);
        ctx.park_buffer(remote.image());
        let (addr_ptr, _): (*mut u8, usize) = match ctx.buffer_parts() {
            Some(parts) => parts,
            None => return abort_issue(ctx, Fail::new(libc::EINVAL, "no address parked for connect")),
        };

        trace!("connect(): remote={}", remote);
        let entry: squeue::Entry = opcode::Connect::new(
            types::Fd(self.raw_fd()),
            addr_ptr.cast_const().cast::<libc::sockaddr>(),
            Endpoint::SIZE as libc::socklen_t,
        )
        .build();
        self.submit_op(binding, ctx, entry)
    }

    /// Issues an asynchronous accept. The completion's byte count carries
    /// the accepted socket's descriptor; the caller wraps and registers it
    /// at delivery.
    pub fn accept(&self, ctx: &Arc<OpContext>) -> OpStart {
        let binding: &Binding = match self.require_binding() {
            Ok(binding) => binding,
            Err(e) => return OpStart::Failed(e),
        };
        if let Err(e) = ctx.begin() {
            return OpStart::Failed(e);
        }
        ctx.set_key(binding.key);

        let entry: squeue::Entry =
            opcode::Accept::new(types::Fd(self.raw_fd()), ptr::null_mut(), ptr::null_mut()).build();
        self.submit_op(binding, ctx, entry)
    }

    fn require_binding(&self) -> Result<&Binding, Fail> {
        match &self.binding {
            Some(binding) => Ok(binding),
            None => Err(Fail::new(libc::EINVAL, "socket is not attached to a queue")),
        }
    }

    /// Tags the entry with the context and pushes it. On a submission
    /// failure the context reference travelling with the entry is released
    /// and the context returns to idle: no dispatch will ever follow.
    fn submit_op(&self, binding: &Binding, ctx: &Arc<OpContext>, entry: squeue::Entry) -> OpStart {
        let user_data: u64 = ctx.marshal(false);
        let entry: squeue::Entry = entry.user_data(user_data);
        match binding.queue.submit_entry(&entry) {
            Ok(()) => OpStart::Pending,
            Err(e) => {
                reclaim(user_data);
                abort_issue(ctx, e)
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for TcpSocket {
    fn drop(&mut self) {
        if let Some(binding) = &self.binding {
            binding.queue.dissociate(self.sock.as_raw_fd());
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Unwinds a failed issue: the context returns to idle with no buffer
/// parked, and the caller is told no dispatch will ever arrive.
fn abort_issue(ctx: &Arc<OpContext>, fail: Fail) -> OpStart {
    ctx.cancel();
    drop(ctx.take_buffer());
    OpStart::Failed(fail)
}

/// Classifies a fast path errno: these outcomes leave the operation
/// undecided, so the issue falls through to the queued submission instead
/// of failing. A signal landing during the attempt says nothing about the
/// socket.
fn fast_path_inconclusive(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
