// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes messages through a [`Broker`], carrying the OpenTelemetry context
//! of the caller in the message headers.

use crate::{broker::Broker, errors::AmqpError, message::Message, otel};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error};

/// Publishes messages through a shared [`Broker`].
///
/// Cheap to clone; clones share the underlying broker handle.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
}

impl Publisher {
    /// Creates a publisher that sends through `broker`.
    pub fn new(broker: Arc<dyn Broker>) -> Publisher {
        Publisher { broker }
    }

    /// Publishes `message` to `exchange` with `routing_key`.
    ///
    /// The trace context of `ctx` is added to the message headers; existing
    /// headers are kept.
    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        mut message: Message,
    ) -> Result<(), AmqpError> {
        otel::inject(ctx, &mut message.headers);

        match self.broker.publish(exchange, routing_key, &message).await {
            Err(err) => {
                error!(error = err.to_string(), exchange, "error publishing message");
                Err(err)
            }
            _ => {
                debug!(exchange, routing_key, "message published");
                Ok(())
            }
        }
    }
}
