// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Coordinator
//!
//! Decides what happens to each inbound delivery and performs the matching
//! broker side effects:
//!
//! - attempt counter above `max_retry`: publish an unmodified copy to the
//!   dead-letter exchange, then ack. The handler is not invoked.
//! - handler accepts: ack.
//! - handler rejects: publish a copy with `x-retry` incremented to the retry
//!   exchange, then ack. The retry queue's TTL brings it back to the main flow.
//!
//! The copy is published before the original is acknowledged, so a crash in
//! between duplicates the message rather than losing it (at-least-once). When
//! the copy cannot be published the original is negatively acknowledged with
//! requeue and nothing is acknowledged.

use crate::{
    broker::{Broker, DEFAULT_EXCHANGE},
    errors::AmqpError,
    message::{Delivery, Headers},
    otel,
    publisher::Publisher,
    topology::RetryableTopology,
};
use async_trait::async_trait;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// Result of handling a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Reject,
}

impl From<bool> for Outcome {
    fn from(ok: bool) -> Self {
        if ok {
            Outcome::Accept
        } else {
            Outcome::Reject
        }
    }
}

/// The success predicate applied to each delivery.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Outcome;
}

#[async_trait]
impl<F> DeliveryHandler for F
where
    F: Fn(&Delivery) -> Outcome + Send + Sync,
{
    async fn handle(&self, _ctx: &Context, delivery: &Delivery) -> Outcome {
        self(delivery)
    }
}

/// What to do with a delivery once it has been evaluated.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Processed; acknowledge.
    Ack,
    /// Failed; republish to the retry exchange with these headers.
    RetryWith(Headers),
    /// Attempts exhausted; republish to the dead-letter exchange.
    DeadLetter,
}

/// Attempt threshold of a retryable flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retry: u32,
}

impl RetryPolicy {
    /// Messages whose attempt counter exceeds `max_retry` are dead-lettered.
    pub fn new(max_retry: u32) -> RetryPolicy {
        RetryPolicy { max_retry }
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_retry
    }

    /// Maps a handler outcome to a disposition. Exhaustion wins over success.
    pub fn dispose(&self, delivery: &Delivery, outcome: Outcome) -> Disposition {
        let attempt = delivery.message.attempt();

        if self.is_exhausted(attempt) {
            return Disposition::DeadLetter;
        }

        match outcome {
            Outcome::Accept => Disposition::Ack,
            Outcome::Reject => Disposition::RetryWith(
                delivery
                    .message
                    .with_attempt(attempt.saturating_add(1))
                    .headers,
            ),
        }
    }
}

/// Applies a [`DeliveryHandler`] and a [`RetryPolicy`] to deliveries of one queue.
pub struct RetryCoordinator {
    broker: Arc<dyn Broker>,
    publisher: Publisher,
    handler: Arc<dyn DeliveryHandler>,
    tracer: BoxedTracer,
    policy: RetryPolicy,
    queue: String,
    retry_exchange: String,
    dead_letter_exchange: String,
}

impl RetryCoordinator {
    /// Creates a coordinator for the main queue of `topology`.
    ///
    /// # Parameters
    /// * `broker` - Broker used to ack, nack and republish
    /// * `topology` - Resources returned by [`crate::topology::declare_retryable_delivery`]
    /// * `handler` - Success predicate applied to each delivery
    pub fn new(
        broker: Arc<dyn Broker>,
        topology: &RetryableTopology,
        handler: Arc<dyn DeliveryHandler>,
    ) -> RetryCoordinator {
        RetryCoordinator {
            publisher: Publisher::new(broker.clone()),
            broker,
            handler,
            tracer: global::tracer("amqp consumer"),
            policy: RetryPolicy::new(topology.max_retry),
            queue: topology.main_queue.clone(),
            retry_exchange: topology.retry_exchange.clone(),
            dead_letter_exchange: topology.dead_letter_exchange.clone(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Runs one delivery through the state machine.
    ///
    /// The original delivery is acknowledged exactly once on every successful
    /// transition. Errors are contained to this delivery and returned for
    /// logging; they never require the consumer loop to stop.
    pub async fn process(&self, delivery: &Delivery) -> Result<Disposition, AmqpError> {
        let (ctx, mut span) = otel::new_span(&delivery.message.headers, &self.tracer, &self.queue);
        let attempt = delivery.message.attempt();

        debug!(
            queue = self.queue.as_str(),
            exchange = delivery.exchange.as_str(),
            attempt,
            "received"
        );

        let disposition = if self.policy.is_exhausted(attempt) {
            Disposition::DeadLetter
        } else {
            let outcome = self.handler.handle(&ctx, delivery).await;
            self.policy.dispose(delivery, outcome)
        };

        match &disposition {
            Disposition::Ack => {
                debug!("message successfully processed");
            }
            Disposition::RetryWith(headers) => {
                warn!(attempt, "error whiling handling msg, requeuing for latter");

                let mut copy = delivery.message.clone();
                copy.headers = headers.clone();

                if let Err(err) = self
                    .publisher
                    .publish(&ctx, &self.retry_exchange, DEFAULT_EXCHANGE, copy)
                    .await
                {
                    record(&mut span, &err, "error to requeuing msg");
                    self.requeue(delivery).await;
                    return Err(AmqpError::PublishingToRetryError);
                }
            }
            Disposition::DeadLetter => {
                error!(attempt, "too many attempts, sending to dlq");

                if let Err(err) = self
                    .broker
                    .publish(&self.dead_letter_exchange, DEFAULT_EXCHANGE, &delivery.message)
                    .await
                {
                    record(&mut span, &err, "error to send msg to dlq");
                    self.requeue(delivery).await;
                    return Err(AmqpError::PublishingToDQLError);
                }
            }
        }

        if let Err(err) = self.broker.ack(delivery.tag).await {
            error!("error whiling ack msg");
            record(&mut span, &err, "error to ack msg");
            return Err(err);
        }

        span.set_status(Status::Ok);
        Ok(disposition)
    }

    async fn requeue(&self, delivery: &Delivery) {
        if let Err(err) = self.broker.nack(delivery.tag, true).await {
            error!(error = err.to_string(), "error whiling nack msg");
        }
    }
}

fn record(span: &mut BoxedSpan, err: &AmqpError, description: &'static str) {
    span.record_error(err);
    span.set_status(Status::Error {
        description: Cow::from(description),
    });
}
