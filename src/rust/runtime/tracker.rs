// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    queue::SharedCompletionQueue,
};
use ::std::sync::atomic::{
    AtomicIsize,
    Ordering,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Countdown over a bounded set of concurrent work items. Every item
/// reports exactly one terminal state, completion or failure; when the last
/// one reports, the tracker stops the completion queue. Failures are
/// logged, never retried.
pub struct WorkTracker {
    /// Work items still outstanding.
    outstanding: AtomicIsize,
    /// Queue to stop once all work has drained.
    queue: SharedCompletionQueue,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl WorkTracker {
    /// Creates a tracker for `work` outstanding items. The queue handle is
    /// what reaching zero shuts down.
    pub fn new(work: usize, queue: SharedCompletionQueue) -> Self {
        Self {
            outstanding: AtomicIsize::new(work as isize),
            queue,
        }
    }

    /// Reports one work item as completed.
    pub fn completed(&self) {
        trace!("completed(): one work item done");
        self.release_work();
    }

    /// Reports one work item as failed.
    pub fn failed(&self, err: Fail) {
        warn!("failed(): work item failed (err={:?})", err);
        self.release_work();
    }

    /// Decrements the outstanding count; the crossing to zero happens for
    /// exactly one caller, which initiates queue shutdown.
    fn release_work(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!("release_work(): all work drained, stopping the queue");
            self.queue.stop();
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::WorkTracker;
    use crate::runtime::queue::SharedCompletionQueue;
    use ::anyhow::Result;
    use ::std::{
        sync::Arc,
        thread,
    };

    /// Tests if N concurrent terminal reports produce exactly one stop.
    #[test]
    fn countdown_stops_queue_exactly_once() -> Result<()> {
        const WORKERS: usize = 8;
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(1, false);
        let tracker: Arc<WorkTracker> = Arc::new(WorkTracker::new(WORKERS, queue.clone()));

        let mut handles: Vec<thread::JoinHandle<()>> = Vec::with_capacity(WORKERS);
        for _ in 0..WORKERS {
            let tracker: Arc<WorkTracker> = tracker.clone();
            handles.push(thread::spawn(move || tracker.completed()));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        crate::ensure_eq!(queue.stop_requested(), true);
        crate::ensure_eq!(queue.stop_calls(), 1);
        queue.wait();
        Ok(())
    }

    /// Tests the mixed outcome scenario: two items complete, one fails with
    /// a connection reset, and shutdown is initiated exactly once.
    #[test]
    fn mixed_completion_and_failure() -> Result<()> {
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(1, false);
        let tracker: WorkTracker = WorkTracker::new(3, queue.clone());

        tracker.completed();
        crate::ensure_eq!(queue.stop_requested(), false);
        tracker.completed();
        crate::ensure_eq!(queue.stop_requested(), false);
        tracker.failed(crate::runtime::fail::Fail::new(libc::ECONNRESET, "connection reset by peer"));

        crate::ensure_eq!(queue.stop_requested(), true);
        crate::ensure_eq!(queue.stop_calls(), 1);
        queue.wait();
        Ok(())
    }

    /// Tests if reports beyond the initial count never re-trigger shutdown.
    #[test]
    fn excess_reports_do_not_stop_again() -> Result<()> {
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(1, false);
        let tracker: WorkTracker = WorkTracker::new(1, queue.clone());

        tracker.completed();
        tracker.completed();
        crate::ensure_eq!(queue.stop_calls(), 1);
        queue.wait();
        Ok(())
    }
}
