// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod conn;
pub mod endpoint;
pub mod futures;
pub mod socket;

pub use self::{
    conn::{
        complete_io,
        Connection,
        Listener,
    },
    endpoint::Endpoint,
    futures::repost::repost,
    socket::TcpSocket,
};
