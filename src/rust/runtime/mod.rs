// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod context;
pub mod fail;
pub mod logging;
pub mod queue;
pub mod task;
pub mod tracker;

pub use self::{
    context::{
        CompletionPacket,
        Continuation,
        DispatchFn,
        OpContext,
        OpStart,
    },
    fail::Fail,
    queue::{
        CompletionQueue,
        SharedCompletionQueue,
    },
    tracker::WorkTracker,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Aborts the process over an unusable OS resource or a broken runtime
/// invariant. There is no recovery path for infrastructure failures: the
/// cause is logged and the process exits with status 1.
pub fn fatal(cause: &str) -> ! {
    error!("fatal: {}", cause);
    eprintln!("fatal: {}", cause);
    std::process::exit(1);
}
