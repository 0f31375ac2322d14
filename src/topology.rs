// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module declares the exchanges, queues and bindings a delivery pattern
//! needs. The main components are:
//! - [`Topology`]: a batch of declarations installed in a fixed order
//! - [`declare_fanout_delivery`]: broadcast exchange with a private subscriber queue
//! - [`declare_retryable_delivery`]: main flow plus retry and dead-letter branches
//!
//! The retry branch has no scheduler: the retry queue's message TTL expires and
//! its dead-letter exchange is the main exchange, so the broker re-injects the
//! message into the main flow after the backoff delay.

use crate::{
    broker::Broker,
    configs::LogsSettings,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, error, info};

/// A batch of exchange, queue and binding declarations.
///
/// All declarations are idempotent on the broker side; adding the same binding
/// twice to one batch declares it once.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        if !self.exchanges.contains(&def) {
            self.exchanges.push(def);
        }
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        if !self.queues.contains(&def) {
            self.queues.push(def);
        }
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        if !self.queues_binding.contains(&binding) {
            self.queues_binding.push(binding);
        }
        self
    }

    /// Installs the topology on the broker.
    ///
    /// Exchanges are declared first, then queues, then bindings. The first
    /// failure aborts the installation and is returned to the caller.
    pub async fn install(&self, broker: &dyn Broker) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            broker.declare_exchange(exch).await?;
        }

        for queue in &self.queues {
            broker.declare_queue(queue).await?;
        }

        for binding in &self.queues_binding {
            broker.bind_queue(binding).await?;
        }

        debug!("topology installed");
        Ok(())
    }
}

/// Declares a durable fanout exchange and an exclusive, broker-named queue
/// bound to it. Returns the queue name.
pub async fn declare_fanout_delivery(
    broker: &dyn Broker,
    exchange: &str,
) -> Result<String, AmqpError> {
    broker
        .declare_exchange(&ExchangeDefinition::new(exchange).fanout().durable())
        .await?;

    let queue = broker
        .declare_queue(&QueueDefinition::new("").exclusive())
        .await?;

    broker
        .bind_queue(&QueueBinding::new(&queue).exchange(exchange))
        .await?;

    info!(exchange, queue = queue.as_str(), "fanout delivery declared");
    Ok(queue)
}

/// Describes a delivery flow with a delayed retry branch and a dead-letter sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryableDelivery {
    exchange: ExchangeDefinition,
    routing_key: String,
    queue: QueueDefinition,
    retry_exchange: String,
    retry_queue: String,
    retry_ttl: u32,
    max_retry: u32,
    dead_letter_exchange: String,
    dead_letter_queue: String,
}

impl RetryableDelivery {
    /// Creates a fanout flow on `exchange` whose failed messages wait
    /// `retry_ttl` milliseconds before redelivery and are dead-lettered to
    /// `dead_letter_exchange` once their attempt counter exceeds `max_retry`.
    ///
    /// Queue and retry exchange names derive from `exchange` and can be
    /// overridden with the builder methods.
    pub fn new(
        exchange: &str,
        retry_ttl: u32,
        max_retry: u32,
        dead_letter_exchange: &str,
    ) -> RetryableDelivery {
        let queue = format!("{exchange}-queue");

        RetryableDelivery {
            exchange: ExchangeDefinition::new(exchange).fanout(),
            routing_key: String::new(),
            retry_exchange: format!("{exchange}-retry"),
            retry_queue: format!("{queue}-retry"),
            dead_letter_queue: format!("{queue}-dlq"),
            queue: QueueDefinition::new(&queue),
            retry_ttl,
            max_retry,
            dead_letter_exchange: dead_letter_exchange.to_owned(),
        }
    }

    /// Broadcasts on the main exchange.
    pub fn fanout(mut self) -> Self {
        self.exchange = self.exchange.fanout();
        self.routing_key = String::new();
        self
    }

    /// Routes on the main exchange by `routing_key`. Retried messages come back
    /// with the same key.
    pub fn direct(mut self, routing_key: &str) -> Self {
        self.exchange = self.exchange.direct();
        self.routing_key = routing_key.to_owned();
        self
    }

    pub fn durable(mut self) -> Self {
        self.exchange = self.exchange.durable();
        self
    }

    /// Replaces the main queue definition.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queue = def;
        self
    }

    pub fn retry_names(mut self, exchange: &str, queue: &str) -> Self {
        self.retry_exchange = exchange.to_owned();
        self.retry_queue = queue.to_owned();
        self
    }

    pub fn dead_letter_queue(mut self, queue: &str) -> Self {
        self.dead_letter_queue = queue.to_owned();
        self
    }

    /// The declarations this flow needs, in installation order.
    pub fn topology(&self) -> Topology {
        let exchange = self.exchange.name();

        Topology::new()
            .exchange(self.exchange.clone())
            .exchange(ExchangeDefinition::new(&self.retry_exchange).direct())
            .exchange(ExchangeDefinition::new(&self.dead_letter_exchange).direct())
            .queue(self.queue.clone())
            .queue(
                QueueDefinition::new(&self.retry_queue)
                    .ttl(self.retry_ttl)
                    .dead_letter(exchange, &self.routing_key),
            )
            .queue(QueueDefinition::new(&self.dead_letter_queue))
            .queue_binding(
                QueueBinding::new(self.queue.name())
                    .exchange(exchange)
                    .routing_key(&self.routing_key),
            )
            .queue_binding(QueueBinding::new(&self.retry_queue).exchange(&self.retry_exchange))
            .queue_binding(
                QueueBinding::new(&self.dead_letter_queue).exchange(&self.dead_letter_exchange),
            )
    }
}

impl From<&LogsSettings> for RetryableDelivery {
    fn from(settings: &LogsSettings) -> Self {
        RetryableDelivery::new(
            &settings.exchange,
            settings.retry_ttl,
            settings.max_retry,
            &settings.dead_letter_exchange,
        )
        .queue(QueueDefinition::new(&settings.queue))
        .retry_names(&settings.retry_exchange, &settings.retry_queue)
        .dead_letter_queue(&settings.dead_letter_queue)
    }
}

/// The resources declared by [`declare_retryable_delivery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryableTopology {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub routing_key: String,
    pub main_queue: String,
    pub retry_exchange: String,
    pub retry_queue: String,
    pub dead_letter_exchange: String,
    pub dead_queue: String,
    pub max_retry: u32,
}

/// Declares the main, retry and dead-letter resources of `delivery`.
///
/// Any broker failure aborts the declaration; callers must treat it as fatal.
///
/// # Parameters
/// * `broker` - Broker to declare on
/// * `delivery` - Names, routing and retry timings of the flow
///
/// # Returns
/// The declared resource names plus the retry threshold, ready to build a
/// [`crate::consumer::RetryCoordinator`]
pub async fn declare_retryable_delivery(
    broker: &dyn Broker,
    delivery: &RetryableDelivery,
) -> Result<RetryableTopology, AmqpError> {
    if let Err(err) = delivery.topology().install(broker).await {
        error!(
            error = err.to_string(),
            exchange = delivery.exchange.name(),
            "failure to declare retryable delivery"
        );
        return Err(err);
    }

    info!(
        exchange = delivery.exchange.name(),
        queue = delivery.queue.name(),
        retry_ttl = delivery.retry_ttl,
        max_retry = delivery.max_retry,
        "retryable delivery declared"
    );

    Ok(RetryableTopology {
        exchange: delivery.exchange.name().to_owned(),
        exchange_kind: delivery.exchange.exchange_kind(),
        routing_key: delivery.routing_key.clone(),
        main_queue: delivery.queue.name().to_owned(),
        retry_exchange: delivery.retry_exchange.clone(),
        retry_queue: delivery.retry_queue.clone(),
        dead_letter_exchange: delivery.dead_letter_exchange.clone(),
        dead_queue: delivery.dead_letter_queue.clone(),
        max_retry: delivery.max_retry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_queue_dead_letters_into_main_exchange() {
        let delivery = RetryableDelivery::new("logs-ex", 3000, 2, "dead-ex").direct("info");
        let topology = delivery.topology();

        let retry = topology
            .queues
            .iter()
            .find(|q| q.name() == "logs-ex-queue-retry")
            .unwrap();
        assert_eq!(retry.message_ttl(), Some(3000));
        assert_eq!(retry.dead_letter_exchange(), Some("logs-ex"));
        assert_eq!(retry.dead_letter_routing_key(), Some("info"));

        let dead = topology
            .queues
            .iter()
            .find(|q| q.name() == "logs-ex-queue-dlq")
            .unwrap();
        assert_eq!(dead.message_ttl(), None);
        assert_eq!(dead.dead_letter_exchange(), None);
    }

    #[test]
    fn main_exchange_kind_follows_pattern() {
        let fanout = RetryableDelivery::new("logs-ex", 3000, 2, "dead-ex");
        assert_eq!(fanout.topology().exchanges[0].exchange_kind(), ExchangeKind::Fanout);

        let direct = fanout.direct("error");
        assert_eq!(direct.topology().exchanges[0].exchange_kind(), ExchangeKind::Direct);
    }

    #[test]
    fn logs_settings_name_every_resource() {
        let delivery = RetryableDelivery::from(&LogsSettings::default());
        let topology = delivery.topology();

        let exchanges: Vec<&str> = topology.exchanges.iter().map(|e| e.name()).collect();
        assert_eq!(exchanges, vec!["logs-ex", "retry-ex", "dead-ex"]);

        let queues: Vec<&str> = topology.queues.iter().map(|q| q.name()).collect();
        assert_eq!(queues, vec!["logs-queue", "retry-queue", "dead-queue"]);
    }

    #[test]
    fn duplicate_entries_collapse() {
        let binding = QueueBinding::new("q").exchange("ex");
        let topology = Topology::new()
            .queue_binding(binding.clone())
            .queue_binding(binding);

        assert_eq!(topology.queues_binding.len(), 1);
    }
}
