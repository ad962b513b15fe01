// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-operation completion state. Every in-flight asynchronous operation is
//! represented by exactly one [OpContext], which outlives the OS operation:
//! the submission entry carries a raw reference to it, and the dispatch loop
//! recovers it when the completion arrives. The context carries the routing
//! key, the completion results, the continuation to run on delivery, and the
//! I/O buffer the kernel reads or writes while the operation is in flight.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::io_uring::cqueue;
use ::std::{
    mem,
    sync::{
        atomic::{
            AtomicI32,
            AtomicU32,
            AtomicU8,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    task::Waker,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// No operation outstanding; the context may be begun.
const OP_IDLE: u8 = 0;
/// An operation was issued and its completion has not been delivered.
const OP_INFLIGHT: u8 = 1;
/// The completion was delivered; results are readable.
const OP_COMPLETE: u8 = 2;

/// Tag bit marking a synthetic (posted) completion. Contexts are allocated
/// with at least word alignment, so the low bit of their address is free.
const SYNTHETIC_TAG: u64 = 1;

//======================================================================================================================
// Structures
//======================================================================================================================

/// The function invoked by the dispatch loop for each delivered completion.
/// This is the routing key bound to a handle at association time: the queue
/// never consults a handle-to-handler map, the key itself is the handler.
pub type DispatchFn = fn(CompletionPacket);

/// Binary image of one native completion queue entry. The layout must match
/// the platform descriptor exactly; this is validated at build time below.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct OsCompletion {
    /// Tagged context reference carried through the OS queue.
    pub user_data: u64,
    /// Raw operation result: negative errno on failure, byte count (or new
    /// descriptor, for accept) on success.
    pub result: i32,
    /// Native flags. Carried for layout fidelity; not interpreted.
    pub flags: u32,
}

// The context protocol transports raw pointers through the native queue and
// relies on this record being interchangeable with the platform descriptor.
const _: () = assert!(mem::size_of::<OsCompletion>() == mem::size_of::<cqueue::Entry>());
const _: () = assert!(mem::align_of::<OpContext>() >= 2);

/// A delivered completion: error code, transferred byte count, and the
/// operation context it belongs to. Handed to the routing key by the
/// dispatch loop.
pub struct CompletionPacket {
    /// Error code (errno); zero on success.
    pub error: i32,
    /// Transferred byte count. For accept completions this is the new
    /// socket descriptor instead.
    pub bytes: u32,
    /// The context the operation was issued with.
    pub ctx: Arc<OpContext>,
}

/// What to do when the operation completes: either an explicit callback
/// step or a parked computation's resume handle. Installed before the OS
/// call and consumed exactly once on delivery.
pub enum Continuation {
    /// Callback invoked with (error, bytes).
    Invoke(Box<dyn FnOnce(i32, u32) + Send>),
    /// Parked computation woken by the dispatcher.
    Resume(Waker),
}

/// Three-way result of issuing an asynchronous operation.
#[derive(Debug)]
pub enum OpStart {
    /// The operation finished at issue time. The completion queue will
    /// never deliver anything for it; the caller already has the result.
    CompletedInline(u32),
    /// The operation was queued. Exactly one dispatch will follow.
    Pending,
    /// The operation failed at issue time. The completion queue will never
    /// deliver anything for it; completion handling falls to the issuer.
    Failed(Fail),
}

/// State of one asynchronous operation, shared between the issuing side and
/// the dispatch loop. Reusable: once a completion has been consumed the
/// context can be begun again for the next operation.
pub struct OpContext {
    /// Routing key, stored as a plain machine word. Reinterpreted as a
    /// [DispatchFn] at dispatch time. Zero means unset.
    key: AtomicUsize,
    /// Operation state (`OP_IDLE`/`OP_INFLIGHT`/`OP_COMPLETE`).
    state: AtomicU8,
    /// Delivered error code.
    error: AtomicI32,
    /// Delivered byte count.
    bytes: AtomicU32,
    /// Continuation consumed on delivery.
    continuation: Mutex<Option<Continuation>>,
    /// I/O buffer owned by the context while an operation is in flight. The
    /// submission entry points into this allocation; it must stay parked
    /// until the completion is delivered or the issue call fails.
    buffer: Mutex<Option<Vec<u8>>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl OsCompletion {
    /// Copies a native completion queue entry into its plain data image.
    pub fn from_entry(entry: &cqueue::Entry) -> Self {
        Self {
            user_data: entry.user_data(),
            result: entry.result(),
            flags: entry.flags(),
        }
    }

    /// Checks for the stop sentinel: a completion carrying no context.
    pub fn is_sentinel(&self) -> bool {
        self.user_data == 0
    }

    /// Checks whether this completion was posted rather than produced by an
    /// OS operation. Posted completions carry their results staged in the
    /// context instead of in the native result field.
    pub fn is_synthetic(&self) -> bool {
        self.user_data & SYNTHETIC_TAG != 0
    }

    /// Recovers the operation context this completion belongs to, assuming
    /// ownership of the reference the submission side attached.
    ///
    /// # Safety
    ///
    /// The caller must ensure `user_data` was produced by [OpContext::marshal]
    /// and is consumed at most once.
    pub(crate) unsafe fn unmarshal(&self) -> Arc<OpContext> {
        Arc::from_raw((self.user_data & !SYNTHETIC_TAG) as *const OpContext)
    }
}

impl OpContext {
    /// Creates an idle operation context with no routing key.
    pub fn new() -> Self {
        Self {
            key: AtomicUsize::new(0),
            state: AtomicU8::new(OP_IDLE),
            error: AtomicI32::new(0),
            bytes: AtomicU32::new(0),
            continuation: Mutex::new(None),
            buffer: Mutex::new(None),
        }
    }

    /// Encodes a tagged reference to this context for transport through the
    /// native queue. The returned word owns one strong reference, released
    /// by [OsCompletion::unmarshal] when the completion is dispatched.
    pub(crate) fn marshal(self: &Arc<Self>, synthetic: bool) -> u64 {
        let raw: u64 = Arc::into_raw(self.clone()) as u64;
        if synthetic {
            raw | SYNTHETIC_TAG
        } else {
            raw
        }
    }

    /// Binds the routing key invoked when completions for this context are
    /// dispatched.
    pub fn set_key(&self, key: DispatchFn) {
        self.key.store(key as usize, Ordering::Relaxed);
    }

    /// Reads the routing key back. Returns `None` when no key was bound.
    pub fn key(&self) -> Option<DispatchFn> {
        let raw: usize = self.key.load(Ordering::Relaxed);
        if raw == 0 {
            return None;
        }
        // The word was stored from a DispatchFn in set_key.
        Some(unsafe { mem::transmute::<usize, DispatchFn>(raw) })
    }

    /// Marks the context as owning an in-flight operation. Fails when an
    /// operation is already outstanding: each context backs at most one
    /// operation at a time.
    pub fn begin(&self) -> Result<(), Fail> {
        let previous: u8 = self.state.swap(OP_INFLIGHT, Ordering::AcqRel);
        if previous == OP_INFLIGHT {
            return Err(Fail::new(libc::EBUSY, "operation already in flight on this context"));
        }
        Ok(())
    }

    /// Returns the context to idle after an issue call that will never
    /// produce a dispatch (inline completion or issue-time failure).
    pub fn cancel(&self) {
        self.state.store(OP_IDLE, Ordering::Release);
    }

    /// Records delivered results, publishes completion, and takes the
    /// continuation. Returns `None` when the operation was abandoned (the
    /// issuing side dropped its interest before delivery).
    pub fn complete(&self, error: i32, bytes: u32) -> Option<Continuation> {
        self.error.store(error, Ordering::Relaxed);
        self.bytes.store(bytes, Ordering::Relaxed);
        self.state.store(OP_COMPLETE, Ordering::Release);
        self.take_continuation()
    }

    /// Stages results for a synthetic completion before it is posted. The
    /// dispatch loop reads them back when the posted entry arrives.
    pub(crate) fn stage(&self, error: i32, bytes: u32) {
        self.error.store(error, Ordering::Relaxed);
        self.bytes.store(bytes, Ordering::Release);
    }

    /// Reads back staged results.
    pub(crate) fn staged(&self) -> (i32, u32) {
        let bytes: u32 = self.bytes.load(Ordering::Acquire);
        let error: i32 = self.error.load(Ordering::Relaxed);
        (error, bytes)
    }

    /// Checks whether a completion has been delivered and not yet consumed
    /// by a new [Self::begin].
    pub fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == OP_COMPLETE
    }

    /// Reads the delivered (error, bytes) pair. Meaningful only after
    /// [Self::is_complete] reports true.
    pub fn result(&self) -> (i32, u32) {
        (self.error.load(Ordering::Relaxed), self.bytes.load(Ordering::Relaxed))
    }

    /// Installs the continuation consumed on delivery. At most one
    /// continuation may be pending at a time.
    pub fn set_continuation(&self, continuation: Continuation) {
        let mut slot: MutexGuard<Option<Continuation>> = self.lock_continuation();
        debug_assert!(slot.is_none(), "continuation already installed");
        *slot = Some(continuation);
    }

    /// Removes the pending continuation, if any. Used by the dispatch path
    /// on delivery and by adapters abandoning an in-flight operation.
    pub fn take_continuation(&self) -> Option<Continuation> {
        self.lock_continuation().take()
    }

    /// Re-parks a resume handle for an operation that is still in flight.
    /// Returns false without parking when the completion has already been
    /// delivered; the caller then reads [Self::result] directly. The state
    /// check happens under the continuation lock, so a completion racing in
    /// either sees the parked handle or reports delivery here. Replaces any
    /// previously parked handle.
    pub fn park_waker(&self, waker: &Waker) -> bool {
        let mut slot: MutexGuard<Option<Continuation>> = self.lock_continuation();
        if self.is_complete() {
            return false;
        }
        *slot = Some(Continuation::Resume(waker.clone()));
        true
    }

    /// Parks the I/O buffer for the duration of an operation.
    pub fn park_buffer(&self, buffer: Vec<u8>) {
        let mut slot: MutexGuard<Option<Vec<u8>>> = self.lock_buffer();
        debug_assert!(slot.is_none(), "buffer already parked");
        *slot = Some(buffer);
    }

    /// Takes the parked I/O buffer back, if any.
    pub fn take_buffer(&self) -> Option<Vec<u8>> {
        self.lock_buffer().take()
    }

    /// Address and capacity of the parked buffer, for building submission
    /// entries. The allocation stays pinned while parked: taking the vector
    /// out moves only its handle, never the heap block, and nothing touches
    /// the parked vector while an operation is in flight.
    pub(crate) fn buffer_parts(&self) -> Option<(*mut u8, usize)> {
        let mut slot: MutexGuard<Option<Vec<u8>>> = self.lock_buffer();
        slot.as_mut().map(|b| (b.as_mut_ptr(), b.len()))
    }

    /// A poisoned lock means a continuation panicked on another thread; the
    /// protected state is plain data, so keep going with it.
    fn lock_continuation(&self) -> MutexGuard<'_, Option<Continuation>> {
        self.continuation.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_buffer(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for OpContext {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
