// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    net::{
        conn::Connection,
        endpoint::Endpoint,
    },
    runtime::{
        context::{
            Continuation,
            OpContext,
            OpStart,
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

/// Suspension adapter for establishing a connection. At first poll it
/// builds the socket, registers it with the queue, and issues the connect;
/// the true result always arrives through the queue, never at issue.
/// Resolves to the connected stream.
pub struct ConnectFuture {
    /// Queue the new connection registers with.
    queue: SharedCompletionQueue,
    /// Remote endpoint to connect to.
    remote: Endpoint,
    /// The stream being connected, held while the connect is in flight.
    conn: Option<Connection>,
    /// Whether the operation went pending.
    issued: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl ConnectFuture {
    pub(crate) fn new(queue: &SharedCompletionQueue, remote: Endpoint) -> Self {
        Self {
            queue: queue.clone(),
            remote,
            conn: None,
            issued: false,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Future for ConnectFuture {
    type Output = Result<Connection, Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this: &mut Self = self.get_mut();
        if !this.issued {
            let conn: Connection = match Connection::prepare(&this.queue) {
                Ok(conn) => conn,
                Err(e) => return Poll::Ready(Err(e)),
            };
            let op: Arc<OpContext> = conn.recv_context().clone();
            op.set_continuation(Continuation::Resume(ctx.waker().clone()));
            match conn.issue_connect(&this.remote) {
                OpStart::Pending => {
                    this.conn = Some(conn);
                    this.issued = true;
                    Poll::Pending
                },
                OpStart::Failed(e) => {
                    drop(op.take_continuation());
                    Poll::Ready(Err(e))
                },
                OpStart::CompletedInline(_) => {
                    drop(op.take_continuation());
                    Poll::Ready(Err(Fail::new(libc::EIO, "connect completed at issue")))
                },
            }
        } else {
            let op: Arc<OpContext> = match &this.conn {
                Some(conn) => conn.recv_context().clone(),
                None => return Poll::Ready(Err(Fail::new(libc::EINVAL, "connect polled after completion"))),
            };
            if op.is_complete() || !op.park_waker(ctx.waker()) {
                drop(op.take_buffer());
                let (error, _): (i32, u32) = op.result();
                if error != 0 {
                    this.conn = None;
                    return Poll::Ready(Err(Fail::new(error, "connect failed")));
                }
                match this.conn.take() {
                    Some(conn) => Poll::Ready(Ok(conn)),
                    None => Poll::Ready(Err(Fail::new(libc::EINVAL, "connect polled after completion"))),
                }
            } else {
                Poll::Pending
            }
        }
    }
}

impl Drop for ConnectFuture {
    fn drop(&mut self) {
        if let Some(conn) = &self.conn {
            if self.issued && !conn.recv_context().is_complete() {
                drop(conn.recv_context().take_continuation());
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use crate::{
        net::{
            conn::Connection,
            endpoint::Endpoint,
        },
        runtime::{
            queue::SharedCompletionQueue,
            task,
        },
    };
    use ::anyhow::Result;
    use ::crossbeam_channel::{
        unbounded,
        Receiver,
        Sender,
    };
    use ::std::{
        net::Ipv4Addr,
        time::Duration,
    };

    /// Tests if a refused connect resumes the caller with the refusal.
    #[test]
    fn refused_connect_surfaces_errno() -> Result<()> {
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(1, false);
        let target: Endpoint = Endpoint::new(Ipv4Addr::LOCALHOST, 1);

        let (tx, rx): (Sender<i32>, Receiver<i32>) = unbounded();
        let handle: SharedCompletionQueue = queue.clone();
        task::spawn(async move {
            let errno: i32 = match Connection::connect(&handle, target).await {
                Ok(_) => 0,
                Err(e) => e.errno,
            };
            let _ = tx.send(errno);
        });

        crate::ensure_eq!(rx.recv_timeout(Duration::from_secs(5))?, libc::ECONNREFUSED);
        queue.stop();
        queue.wait();
        Ok(())
    }
}
