// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Suspension adapters over the asynchronous socket operations. Each
//! adapter issues its operation at suspend time with the resume handle
//! installed first, never parks when the operation finishes inline, and
//! surfaces the delivered (error, bytes) pair as an ordinary return value
//! on resume.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod accept;
pub mod connect;
pub mod recv;
pub mod repost;
pub mod send;

pub use self::{
    accept::AcceptFuture,
    connect::ConnectFuture,
    recv::RecvFuture,
    repost::RepostFuture,
    send::SendFuture,
};
