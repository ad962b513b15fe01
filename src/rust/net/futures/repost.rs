// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    net::conn::complete_io,
    runtime::{
        context::{
            Continuation,
            OpContext,
        },
        fail::Fail,
        queue::SharedCompletionQueue,
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

/// Suspension adapter that parks the caller and resumes it on a queue
/// worker thread via a synthetic completion. A yield point into the queue:
/// whatever follows the await runs on worker stack.
pub struct RepostFuture {
    /// Queue the synthetic completion goes through.
    queue: SharedCompletionQueue,
    /// Dedicated context for the posted completion.
    op: Arc<OpContext>,
    /// Whether the completion was posted.
    posted: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Future for RepostFuture {
    type Output = Result<(), Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this: &mut Self = self.get_mut();
        if !this.posted {
            this.op.set_continuation(Continuation::Resume(ctx.waker().clone()));
            match this.queue.post(&this.op, 0, complete_io) {
                Ok(()) => {
                    this.posted = true;
                    Poll::Pending
                },
                Err(e) => {
                    drop(this.op.take_continuation());
                    Poll::Ready(Err(e))
                },
            }
        } else if this.op.is_complete() || !this.op.park_waker(ctx.waker()) {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}

impl Drop for RepostFuture {
    fn drop(&mut self) {
        if self.posted && !self.op.is_complete() {
            drop(self.op.take_continuation());
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Parks the calling computation and resumes it on a queue worker thread.
pub fn repost(queue: &SharedCompletionQueue) -> RepostFuture {
    RepostFuture {
        queue: queue.clone(),
        op: Arc::new(OpContext::new()),
        posted: false,
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
