// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    net::conn::{
        Connection,
        Listener,
    },
    runtime::{
        context::{
            Continuation,
            OpContext,
            OpStart,
        },
        fail::Fail,
    },
};
use ::std::{
    future::Future,
    os::fd::RawFd,
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Suspension adapter for one accept on a listener. The accepted socket is
/// wrapped and registered with the queue when the completion is delivered;
/// if that registration fails the socket is closed and the failure resolves
/// the adapter. One call accepts one connection; the caller re-arms by
/// calling again.
pub struct AcceptFuture<'a> {
    /// Listener the accept runs on.
    listener: &'a Listener,
    /// Whether the operation went pending.
    issued: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<'a> AcceptFuture<'a> {
    pub(crate) fn new(listener: &'a Listener) -> Self {
        Self {
            listener,
            issued: false,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Future for AcceptFuture<'_> {
    type Output = Result<Connection, Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this: &mut Self = self.get_mut();
        let op: &Arc<OpContext> = this.listener.accept_context();
        if !this.issued {
            op.set_continuation(Continuation::Resume(ctx.waker().clone()));
            match this.listener.issue_accept() {
                OpStart::Pending => {
                    this.issued = true;
                    Poll::Pending
                },
                OpStart::Failed(e) => {
                    drop(op.take_continuation());
                    Poll::Ready(Err(e))
                },
                OpStart::CompletedInline(_) => {
                    drop(op.take_continuation());
                    Poll::Ready(Err(Fail::new(libc::EIO, "accept completed at issue")))
                },
            }
        } else if op.is_complete() || !op.park_waker(ctx.waker()) {
            this.issued = false;
            let (error, bytes): (i32, u32) = op.result();
            if error != 0 {
                return Poll::Ready(Err(Fail::new(error, "accept failed")));
            }
            // The delivered byte count carries the accepted descriptor.
            Poll::Ready(Connection::from_accepted(bytes as RawFd, this.listener.queue_handle()))
        } else {
            Poll::Pending
        }
    }
}

impl Drop for AcceptFuture<'_> {
    fn drop(&mut self) {
        if self.issued && !self.listener.accept_context().is_complete() {
            drop(self.listener.accept_context().take_continuation());
        }
    }
}
