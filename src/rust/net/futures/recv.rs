// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    net::conn::Connection,
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

/// Suspension adapter for one receive on a connection. Issues the operation
/// at first poll with the resume handle already installed; resolves to the
/// received byte count and the buffer. Zero bytes is end of stream.
pub struct RecvFuture<'a> {
    /// Connection the receive runs on.
    conn: &'a Connection,
    /// Buffer handed over at issue. `None` once issued.
    buffer: Option<Vec<u8>>,
    /// Whether the operation went pending.
    issued: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<'a> RecvFuture<'a> {
    pub(crate) fn new(conn: &'a Connection, buffer: Vec<u8>) -> Self {
        Self {
            conn,
            buffer: Some(buffer),
            issued: false,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Future for RecvFuture<'_> {
    type Output = Result<(u32, Vec<u8>), Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this: &mut Self = self.get_mut();
        let op: &Arc<OpContext> = this.conn.recv_context();
        if !this.issued {
            let buffer: Vec<u8> = match this.buffer.take() {
                Some(buffer) => buffer,
                None => return Poll::Ready(Err(Fail::new(libc::EINVAL, "receive polled after completion"))),
            };
            op.set_continuation(Continuation::Resume(ctx.waker().clone()));
            match this.conn.issue_receive(buffer) {
                OpStart::CompletedInline(bytes) => {
                    drop(op.take_continuation());
                    Poll::Ready(Ok((bytes, op.take_buffer().unwrap_or_default())))
                },
                OpStart::Pending => {
                    this.issued = true;
                    Poll::Pending
                },
                OpStart::Failed(e) => {
                    drop(op.take_continuation());
                    Poll::Ready(Err(e))
                },
            }
        } else if op.is_complete() || !op.park_waker(ctx.waker()) {
            this.issued = false;
            let (error, bytes): (i32, u32) = op.result();
            if error != 0 {
                drop(op.take_buffer());
                return Poll::Ready(Err(Fail::new(error, "receive failed")));
            }
            Poll::Ready(Ok((bytes, op.take_buffer().unwrap_or_default())))
        } else {
            Poll::Pending
        }
    }
}

impl Drop for RecvFuture<'_> {
    fn drop(&mut self) {
        // Abandon an operation still in flight: delivery finds nothing to
        // resume and releases the context without invoking anything.
        if self.issued && !self.conn.recv_context().is_complete() {
            drop(self.conn.recv_context().take_continuation());
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
