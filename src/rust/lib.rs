// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A completion-queue based asynchronous I/O runtime. A pool of worker
//! threads drains one shared OS completion queue and routes every completion
//! to the continuation registered for it. TCP sockets issue non-blocking
//! connect/accept/send/receive operations tagged with a per-operation
//! context; calling code consumes results either through explicit callback
//! continuations or through thin suspension adapters that park and resume
//! sequential-looking code.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod net;
pub mod runtime;

pub use self::{
    net::{
        conn::{
            Connection,
            Listener,
        },
        endpoint::Endpoint,
        socket::TcpSocket,
    },
    runtime::{
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
    },
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, bailing out of the calling test
/// with a descriptive error when they are not.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    ::anyhow::bail!(
                        "ensure failed: `(left == right)` left: `{:?}`, right: `{:?}`",
                        left_val,
                        right_val
                    );
                }
            },
        }
    }};
}

/// Ensures that two expressions are not equal, bailing out of the calling
/// test with a descriptive error when they are.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    ::anyhow::bail!(
                        "ensure failed: `(left != right)` left: `{:?}`, right: `{:?}`",
                        left_val,
                        right_val
                    );
                }
            },
        }
    }};
}
