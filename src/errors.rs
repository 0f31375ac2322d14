// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Broker-facing failures are represented by [`AmqpError`]. The RPC layer adds
//! [`RpcError`] for what a caller of [`crate::rpc::client::RpcClient`] can observe,
//! and [`OperationError`] for failures raised by server-side operations, which are
//! never sent over the wire as-is but converted into structured error payloads.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Topology errors are fatal to the participant that raised them. Errors raised
/// while handling a single delivery are contained to that delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Configuration could not be parsed
    #[error("invalid configuration `{0}`")]
    InvalidConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing a message to the retry exchange
    #[error("failure to publish to retry")]
    PublishingToRetryError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq")]
    PublishingToDQLError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Errors surfaced to RPC callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// No matching response arrived before the deadline
    #[error("rpc call timed out after {0:?}")]
    Timeout(Duration),

    /// The broker refused or failed an operation needed by the call
    #[error(transparent)]
    Broker(#[from] AmqpError),

    /// A request or response body could not be (de)serialized
    #[error("failure to serialize payload `{0}`")]
    Serialization(String),

    /// The server answered with a structured error payload
    #[error("remote error `{0}`")]
    Remote(String),

    /// A correlation id was already pending on this client
    #[error("correlation id `{0}` is already pending")]
    DuplicateCorrelation(String),

    /// The reply listener stopped before a response was matched
    #[error("rpc client closed")]
    ClientClosed,
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

/// Failure signaled by an RPC operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("expected {expected} params, got {got}")]
    Arity { expected: usize, got: usize },

    #[error("division by zero")]
    DivisionByZero,

    #[error("{0}")]
    Failed(String),
}
