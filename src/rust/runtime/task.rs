// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::futures::{
    future::BoxFuture,
    task::{
        waker_ref,
        ArcWake,
    },
    FutureExt,
};
use ::std::{
    future::Future,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A self-contained unit of suspended work. Waking a task polls its future
/// inline on the waking thread, so a completion dispatched on a queue worker
/// resumes the suspended operation right there, with no hand-off to a
/// separate executor.
pub struct Task {
    /// The future being driven. `None` once it has run to completion.
    future: Mutex<Option<BoxFuture<'static, ()>>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Task {
    /// Polls the task's future once. The slot is held locked across the
    /// poll, so a wake racing in from another thread blocks until the
    /// future is either parked again or retired.
    fn poll(self: &Arc<Self>) {
        let mut slot: MutexGuard<Option<BoxFuture<'static, ()>>> =
            self.future.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut future) = slot.take() {
            let waker = waker_ref(self);
            let mut ctx: Context = Context::from_waker(&waker);
            match future.as_mut().poll(&mut ctx) {
                Poll::Ready(()) => trace!("poll(): task ran to completion"),
                Poll::Pending => *slot = Some(future),
            }
        }
    }

    /// Returns whether the task's future has run to completion.
    pub fn is_finished(&self) -> bool {
        self.future.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

/// Spawns `future` as a task and polls it once on the calling thread. If it
/// suspends, completion dispatch resumes it later through its waker.
pub fn spawn<F>(future: F) -> Arc<Task>
where
    F: Future<Output = ()> + Send + 'static,
{
    let task: Arc<Task> = Arc::new(Task {
        future: Mutex::new(Some(future.boxed())),
    });
    task.poll();
    task
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.poll();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::spawn;
    use ::anyhow::Result;
    use ::std::{
        future::Future,
        pin::Pin,
        sync::{
            Arc,
            Mutex,
        },
        task::{
            Context,
            Poll,
            Waker,
        },
        thread,
    };

    /// A future that suspends once, publishing its waker for the test to
    /// fire from another thread.
    struct SuspendOnce {
        waker: Arc<Mutex<Option<Waker>>>,
        polled: bool,
    }

    impl Future for SuspendOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<()> {
            if self.polled {
                Poll::Ready(())
            } else {
                self.polled = true;
                *self.waker.lock().unwrap() = Some(ctx.waker().clone());
                Poll::Pending
            }
        }
    }

    /// Tests if a future that never suspends runs during spawn.
    #[test]
    fn ready_future_runs_inline() -> Result<()> {
        let ran: Arc<Mutex<bool>> = Arc::new(Mutex::new(false));
        let flag: Arc<Mutex<bool>> = ran.clone();
        let task = spawn(async move {
            *flag.lock().unwrap() = true;
        });
        crate::ensure_eq!(*ran.lock().unwrap(), true);
        crate::ensure_eq!(task.is_finished(), true);
        Ok(())
    }

    /// Tests if waking a suspended task polls it to completion on the
    /// waking thread.
    #[test]
    fn wake_resumes_on_waking_thread() -> Result<()> {
        let slot: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));
        let task = spawn(SuspendOnce {
            waker: slot.clone(),
            polled: false,
        });
        crate::ensure_eq!(task.is_finished(), false);

        let waker: Waker = slot.lock().unwrap().take().unwrap();
        let handle = thread::spawn(move || waker.wake());
        handle.join().unwrap();

        crate::ensure_eq!(task.is_finished(), true);
        Ok(())
    }
}
