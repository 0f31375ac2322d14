// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capability
//!
//! The subset of broker operations the delivery patterns are written against.
//! [`crate::amqp::AmqpBroker`] drives a real RabbitMQ channel through lapin and
//! [`crate::memory::InMemoryBroker`] runs the same semantics in-process.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, Message},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries produced by [`Broker::consume`].
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, AmqpError>> + Send>>;

/// Name of the default exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares an exchange. Re-declaring with identical parameters is a no-op.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns its actual name.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    /// Binds a queue to an exchange. Binding twice does not duplicate routing.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), AmqpError>;

    /// Starts a manual-ack subscription on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries per consumer.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;
}
