// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod configs;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod rpc;
pub mod topology;
pub mod traces;
