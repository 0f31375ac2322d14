// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Remote Procedure Calls
//!
//! Request/response over one-way messaging. The client publishes a request
//! tagged with a correlation id and its reply queue; the server answers on that
//! queue with the same correlation id; the client matches the answer through
//! its pending call table or gives up after a timeout.

pub mod client;
pub mod math;
pub mod pending;
pub mod protocol;
pub mod server;
