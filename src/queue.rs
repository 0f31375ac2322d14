// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builders for queues and queue-to-exchange bindings. Queue arguments cover
//! message TTL, idle expiry and dead-letter routing, which together let a TTL
//! queue act as a delay line that hands expired messages back to an exchange.

/// Definition of a queue with its configuration parameters.
///
/// An empty name asks the broker to generate one; the generated name is what
/// [`crate::broker::Broker::declare_queue`] returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) ttl: Option<u32>,
    pub(crate) expires: Option<u32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is non-durable, non-exclusive and has no arguments.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_ttl(&self) -> Option<u32> {
        self.ttl
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    pub fn dead_letter_routing_key(&self) -> Option<&str> {
        self.dead_letter_routing_key.as_deref()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete once its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    ///
    /// Expired messages are dropped, or re-published to the dead-letter
    /// exchange when one is configured.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Deletes the queue after it has been unused for `expires` milliseconds.
    pub fn expires(mut self, expires: u32) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Routes expired or rejected messages to `exchange` with `routing_key`.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_queue_arguments() {
        let def = QueueDefinition::new("retry-queue")
            .ttl(3000)
            .dead_letter("logs-ex", "");

        assert_eq!(def.message_ttl(), Some(3000));
        assert_eq!(def.dead_letter_exchange(), Some("logs-ex"));
        assert_eq!(def.dead_letter_routing_key(), Some(""));
        assert!(!def.durable);
    }

    #[test]
    fn binding_defaults_to_empty_key() {
        let binding = QueueBinding::new("q").exchange("ex");
        assert_eq!(binding.exchange_name, "ex");
        assert_eq!(binding.routing_key, "");
    }
}
