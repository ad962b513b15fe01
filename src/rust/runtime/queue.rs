// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The completion queue: one native io_uring instance drained by a fixed
//! pool of worker threads. Sockets associate their handles with a routing
//! key, issue operations tagged with an operation context, and the dispatch
//! loop routes every delivered completion to that key. A completion whose
//! context reference is null is the stop sentinel; one is posted per worker
//! at shutdown.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    context::{
        CompletionPacket,
        DispatchFn,
        OpContext,
        OsCompletion,
    },
    fail::Fail,
    fatal,
    logging,
};
use ::io_uring::{
    cqueue,
    opcode,
    squeue,
    IoUring,
};
use ::std::{
    collections::{
        hash_map::Entry,
        HashMap,
    },
    os::fd::RawFd,
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    thread,
    thread::JoinHandle,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Submission ring depth. Far above the handful of concurrently outstanding
/// operations this runtime issues per connection.
const RING_DEPTH: u32 = 256;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A process-scoped completion queue: the native ring, its worker pool, and
/// the handle registry.
pub struct CompletionQueue {
    /// Native completion facility.
    ring: IoUring,
    /// Serializes access to the shared submission queue handle.
    sq_lock: Mutex<()>,
    /// Serializes access to the shared completion queue handle.
    cq_lock: Mutex<()>,
    /// Handles registered for completion dispatch, with their routing keys.
    registry: Mutex<HashMap<RawFd, DispatchFn>>,
    /// Worker threads draining the ring.
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Number of worker threads spawned.
    thread_count: usize,
    /// Whether sockets should attempt the synchronous-completion fast path
    /// at issue time.
    sync_completion: bool,
    /// Set once shutdown begins.
    stopped: AtomicBool,
    /// Number of times stop() was called.
    stop_calls: AtomicUsize,
}

/// Shared handle to a [CompletionQueue].
#[derive(Clone)]
pub struct SharedCompletionQueue(Arc<CompletionQueue>);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SharedCompletionQueue {
    /// Creates the native completion facility and spawns `thread_count`
    /// worker threads running the dispatch loop. Infrastructure failures
    /// here abort the process: nothing can run without the queue.
    pub fn create(thread_count: usize, sync_completion: bool) -> Self {
        logging::initialize();
        let ring: IoUring = match IoUring::new(RING_DEPTH) {
            Ok(ring) => ring,
            Err(e) => fatal(&format!("cannot create completion queue: {:?}", e)),
        };
        debug!(
            "create(): thread_count={:?} sync_completion={:?}",
            thread_count, sync_completion
        );
        let queue: SharedCompletionQueue = Self(Arc::new(CompletionQueue {
            ring,
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
            registry: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::with_capacity(thread_count)),
            thread_count,
            sync_completion,
            stopped: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
        }));
        for id in 0..thread_count {
            let worker: SharedCompletionQueue = queue.clone();
            let handle: JoinHandle<()> = match thread::Builder::new()
                .name(format!("cq-worker-{}", id))
                .spawn(move || worker.run_worker(id))
            {
                Ok(handle) => handle,
                Err(e) => fatal(&format!("cannot spawn worker thread: {:?}", e)),
            };
            lock(&queue.workers).push(handle);
        }
        queue
    }
}

impl CompletionQueue {
    /// Binds a routing key to a handle. Must be called exactly once per
    /// handle before any operation is issued on it; the key is what the
    /// dispatch loop invokes for the handle's completions.
    pub fn associate(&self, fd: RawFd, key: DispatchFn) -> Result<(), Fail> {
        if fd < 0 {
            return Err(Fail::new(libc::EBADF, "cannot associate an invalid handle"));
        }
        let mut registry: MutexGuard<HashMap<RawFd, DispatchFn>> = lock(&self.registry);
        match registry.entry(fd) {
            Entry::Occupied(_) => {
                let cause: String = format!("handle is already associated (fd={:?})", fd);
                error!("associate(): {}", cause);
                Err(Fail::new(libc::EEXIST, &cause))
            },
            Entry::Vacant(slot) => {
                trace!("associate(): fd={:?}", fd);
                slot.insert(key);
                Ok(())
            },
        }
    }

    /// Removes a handle from the registry. Sockets call this on teardown so
    /// a recycled descriptor number can be associated again.
    pub fn dissociate(&self, fd: RawFd) {
        let mut registry: MutexGuard<HashMap<RawFd, DispatchFn>> = lock(&self.registry);
        if registry.remove(&fd).is_none() {
            warn!("dissociate(): handle was not associated (fd={:?})", fd);
        }
    }

    /// Injects a synthetic completion carrying `bytes` for `ctx`, routed to
    /// `key`. Forces the continuation onto a worker thread; the caller must
    /// have installed the continuation beforehand.
    pub fn post(&self, ctx: &Arc<OpContext>, bytes: u32, key: DispatchFn) -> Result<(), Fail> {
        ctx.begin()?;
        ctx.set_key(key);
        ctx.stage(0, bytes);
        let user_data: u64 = ctx.marshal(true);
        let entry: squeue::Entry = opcode::Nop::new().build().user_data(user_data);
        if let Err(e) = self.submit_entry(&entry) {
            reclaim(user_data);
            ctx.cancel();
            return Err(e);
        }
        trace!("post(): bytes={:?}", bytes);
        Ok(())
    }

    /// Begins shutdown: posts one stop sentinel per worker thread. Only the
    /// first call posts; the return value reports whether this call was the
    /// one that initiated shutdown.
    pub fn stop(&self) -> bool {
        self.stop_calls.fetch_add(1, Ordering::Relaxed);
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!("stop(): posting {} stop sentinel(s)", self.thread_count);
        for _ in 0..self.thread_count {
            let entry: squeue::Entry = opcode::Nop::new().build().user_data(0);
            // A worker that never sees its sentinel never exits.
            if let Err(e) = self.push_and_submit(&entry) {
                fatal(&format!("cannot post stop sentinel: {:?}", e));
            }
        }
        true
    }

    /// Joins all worker threads, then releases the contexts of any
    /// completions still sitting in the queue. Abandoned completions are
    /// never invoked.
    pub fn wait(&self) {
        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                warn!("wait(): worker thread panicked");
            }
        }
        let drained: usize = self.drain();
        debug!(
            "wait(): queue drained (left_over={:?} stop_calls={:?})",
            drained,
            self.stop_calls.load(Ordering::Relaxed)
        );
    }

    /// Whether shutdown has begun.
    pub fn stop_requested(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Number of times [Self::stop] has been called.
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::Relaxed)
    }

    /// Whether sockets should attempt the synchronous-completion fast path.
    pub fn sync_enabled(&self) -> bool {
        self.sync_completion
    }

    /// Pushes one submission entry and makes the kernel aware of it.
    /// Refused once shutdown has begun: the workers are exiting and nothing
    /// may be added behind the sentinels.
    pub(crate) fn submit_entry(&self, entry: &squeue::Entry) -> Result<(), Fail> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Fail::new(libc::ESHUTDOWN, "completion queue is shutting down"));
        }
        self.push_and_submit(entry)
    }

    /// Processes at most one pending completion on the calling thread,
    /// returning whether one was consumed. This is a manual pump for
    /// callers (and tests) that drive dispatch without worker threads.
    pub fn poll_once(&self) -> bool {
        let entry: Option<cqueue::Entry> = {
            let _guard: MutexGuard<()> = lock(&self.cq_lock);
            let mut cq: cqueue::CompletionQueue = unsafe { self.ring.completion_shared() };
            cq.next()
        };
        match entry {
            Some(entry) => {
                let image: OsCompletion = OsCompletion::from_entry(&entry);
                if !image.is_sentinel() {
                    self.dispatch(image);
                }
                true
            },
            None => false,
        }
    }

    /// The dispatch loop. Blocks for the next completion, reconstructs
    /// (error, bytes, context), and invokes the routing key. Exits on the
    /// stop sentinel; any other dequeue failure is fatal.
    fn run_worker(&self, id: usize) {
        trace!("run_worker(): worker {} up", id);
        loop {
            let entry: Option<cqueue::Entry> = {
                let _guard: MutexGuard<()> = lock(&self.cq_lock);
                let mut cq: cqueue::CompletionQueue = unsafe { self.ring.completion_shared() };
                cq.next()
            };
            match entry {
                Some(entry) => {
                    let image: OsCompletion = OsCompletion::from_entry(&entry);
                    if image.is_sentinel() {
                        trace!("run_worker(): worker {} observed the stop sentinel", id);
                        break;
                    }
                    self.dispatch(image);
                },
                None => {
                    if let Err(e) = self.ring.submit_and_wait(1) {
                        if e.raw_os_error() == Some(libc::EINTR) {
                            continue;
                        }
                        fatal(&format!("worker {}: cannot dequeue completion: {:?}", id, e));
                    }
                },
            }
        }
    }

    /// Routes one completion: recovers the context, decodes the results,
    /// and invokes the routing key with the completion packet.
    fn dispatch(&self, image: OsCompletion) {
        let ctx: Arc<OpContext> = unsafe { image.unmarshal() };
        let (error, bytes): (i32, u32) = if image.is_synthetic() {
            ctx.staged()
        } else if image.result < 0 {
            (-image.result, 0)
        } else {
            (0, image.result as u32)
        };
        let key: DispatchFn = match ctx.key() {
            Some(key) => key,
            None => fatal("dispatch: completion carries a null routing key"),
        };
        trace!("dispatch(): error={:?} bytes={:?}", error, bytes);
        key(CompletionPacket { error, bytes, ctx });
    }

    /// Releases the contexts of all completions still in the queue without
    /// invoking anything. Their continuations are dropped as well; an
    /// uninvoked callback may be what keeps its own context alive.
    fn drain(&self) -> usize {
        let _guard: MutexGuard<()> = lock(&self.cq_lock);
        let mut released: usize = 0;
        let mut cq: cqueue::CompletionQueue = unsafe { self.ring.completion_shared() };
        for entry in cq.by_ref() {
            let image: OsCompletion = OsCompletion::from_entry(&entry);
            if !image.is_sentinel() {
                let ctx: Arc<OpContext> = unsafe { image.unmarshal() };
                drop(ctx.take_continuation());
                released += 1;
            }
        }
        released
    }

    fn push_and_submit(&self, entry: &squeue::Entry) -> Result<(), Fail> {
        {
            let _guard: MutexGuard<()> = lock(&self.sq_lock);
            loop {
                let full: bool = {
                    let mut sq: squeue::SubmissionQueue = unsafe { self.ring.submission_shared() };
                    unsafe { sq.push(entry) }.is_err()
                };
                if !full {
                    break;
                }
                // Submission ring is full: flush it and retry the push.
                if let Err(e) = self.ring.submit() {
                    if e.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    return Err(Fail::from(e));
                }
            }
        }
        loop {
            // Wake any worker parked in the kernel so the entry is seen.
            match self.ring.submit() {
                Ok(_) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(Fail::from(e)),
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl std::ops::Deref for SharedCompletionQueue {
    type Target = CompletionQueue;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        // Worker threads hold shared handles, so by the time the queue
        // drops they have exited; joining here only reaps them.
        if !self.stop_requested() {
            self.stop();
        }
        self.wait();
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// A poisoned lock means another thread panicked inside a continuation; the
/// queue keeps draining regardless.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Releases the context reference attached to an entry that never made it
/// into the queue.
pub(crate) fn reclaim(user_data: u64) {
    let image: OsCompletion = OsCompletion {
        user_data,
        result: 0,
        flags: 0,
    };
    drop(unsafe { image.unmarshal() });
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::SharedCompletionQueue;
    use crate::runtime::context::{
        CompletionPacket,
        Continuation,
        OpContext,
    };
    use ::anyhow::Result;
    use ::crossbeam_channel::{
        unbounded,
        Receiver,
        Sender,
    };
    use ::std::{
        sync::{
            Arc,
            OnceLock,
        },
        time::Duration,
    };

    /// Completes the context and fires its continuation, like the standard
    /// network dispatcher does.
    fn firing_dispatch(p: CompletionPacket) {
        if let Some(continuation) = p.ctx.complete(p.error, p.bytes) {
            match continuation {
                Continuation::Invoke(f) => f(p.error, p.bytes),
                Continuation::Resume(waker) => waker.wake(),
            }
        }
    }

    static POSTED: OnceLock<Sender<(i32, u32)>> = OnceLock::new();

    fn counting_dispatch(p: CompletionPacket) {
        let _ = p.ctx.complete(p.error, p.bytes);
        if let Some(tx) = POSTED.get() {
            let _ = tx.send((p.error, p.bytes));
        }
    }

    /// Tests if a posted completion is dispatched exactly once.
    #[test]
    fn post_dispatches_exactly_once() -> Result<()> {
        let (tx, rx): (Sender<(i32, u32)>, Receiver<(i32, u32)>) = unbounded();
        let _ = POSTED.set(tx);
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(2, false);
        let ctx: Arc<OpContext> = Arc::new(OpContext::new());

        queue.post(&ctx, 77, counting_dispatch)?;
        crate::ensure_eq!(rx.recv_timeout(Duration::from_secs(5))?, (0, 77));
        crate::ensure_eq!(rx.recv_timeout(Duration::from_millis(200)).is_err(), true);

        // The context is reusable once its completion was consumed.
        queue.post(&ctx, 11, counting_dispatch)?;
        crate::ensure_eq!(rx.recv_timeout(Duration::from_secs(5))?, (0, 11));

        queue.stop();
        queue.wait();
        Ok(())
    }

    /// Tests if a posted completion runs the installed continuation on a
    /// worker thread.
    #[test]
    fn post_runs_continuation() -> Result<()> {
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(1, false);
        let ctx: Arc<OpContext> = Arc::new(OpContext::new());
        let (tx, rx): (Sender<u32>, Receiver<u32>) = unbounded();
        ctx.set_continuation(Continuation::Invoke(Box::new(move |error, bytes| {
            assert_eq!(error, 0);
            let _ = tx.send(bytes);
        })));

        queue.post(&ctx, 4096, firing_dispatch)?;
        crate::ensure_eq!(rx.recv_timeout(Duration::from_secs(5))?, 4096);

        queue.stop();
        queue.wait();
        Ok(())
    }

    /// Tests if only the first stop() call initiates shutdown.
    #[test]
    fn stop_is_idempotent() -> Result<()> {
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(2, false);
        crate::ensure_eq!(queue.stop(), true);
        crate::ensure_eq!(queue.stop(), false);
        crate::ensure_eq!(queue.stop_requested(), true);
        crate::ensure_eq!(queue.stop_calls(), 2);
        queue.wait();
        Ok(())
    }

    /// Tests if submissions are refused once shutdown has begun.
    #[test]
    fn post_after_stop_is_refused() -> Result<()> {
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(1, false);
        queue.stop();
        let ctx: Arc<OpContext> = Arc::new(OpContext::new());
        let refused = queue.post(&ctx, 1, counting_dispatch);
        crate::ensure_eq!(refused.is_err(), true);
        crate::ensure_eq!(refused.unwrap_err().errno, libc::ESHUTDOWN);
        queue.wait();
        Ok(())
    }

    /// Tests if associating the same handle twice is rejected and if
    /// dissociation makes the handle available again.
    #[test]
    fn associate_exactly_once() -> Result<()> {
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(1, false);
        queue.associate(42, counting_dispatch)?;
        let duplicate = queue.associate(42, counting_dispatch);
        crate::ensure_eq!(duplicate.is_err(), true);
        crate::ensure_eq!(duplicate.unwrap_err().errno, libc::EEXIST);

        queue.dissociate(42);
        queue.associate(42, counting_dispatch)?;

        queue.stop();
        queue.wait();
        Ok(())
    }

    /// Tests if wait() releases contexts of completions nobody dispatched.
    #[test]
    fn wait_drains_left_over_completions() -> Result<()> {
        let queue: SharedCompletionQueue = SharedCompletionQueue::create(0, false);
        let ctx: Arc<OpContext> = Arc::new(OpContext::new());
        queue.post(&ctx, 9, counting_dispatch)?;
        crate::ensure_eq!(Arc::strong_count(&ctx), 2);

        queue.stop();
        queue.wait();
        crate::ensure_eq!(Arc::strong_count(&ctx), 1);
        Ok(())
    }
}
