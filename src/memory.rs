// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An in-process [`Broker`] with the routing semantics the delivery patterns rely
//! on: idempotent declarations, default-exchange routing by queue name, fanout and
//! direct exchanges, per-queue message TTL with dead-letter re-routing, and manual
//! acknowledgment. Useful for tests and for running both RPC participants in a
//! single process.
//!
//! Message TTL only applies to messages waiting in a queue with no consumer, the
//! same way an expiring retry queue behaves on RabbitMQ. Dropping a delivery
//! stream cancels its subscription: deliveries it left unacknowledged go back to
//! their queue flagged as redelivered. The publish log keeps the most recent
//! [`DEFAULT_PUBLISH_LOG_CAPACITY`] entries unless configured otherwise.

use crate::{
    broker::{Broker, DeliveryStream, DEFAULT_EXCHANGE},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{Delivery, Message},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, UnboundedSender},
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Number of publish log entries kept by [`InMemoryBroker::new`].
pub const DEFAULT_PUBLISH_LOG_CAPACITY: usize = 10_000;

/// A message accepted by [`InMemoryBroker::publish`], kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

#[derive(Debug, Clone)]
struct Stored {
    id: u64,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    message: Message,
}

#[derive(Debug, Clone)]
struct ConsumerSlot {
    id: u64,
    tx: UnboundedSender<Delivery>,
}

#[derive(Debug)]
struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<Stored>,
    consumer: Option<ConsumerSlot>,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer: u64,
    stored: Stored,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: BTreeSet<QueueBinding>,
    unacked: HashMap<u64, Unacked>,
    published: VecDeque<PublishedMessage>,
    publish_log_capacity: usize,
    next_tag: u64,
    next_id: u64,
    next_consumer: u64,
}

/// In-process [`Broker`] implementation.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        InMemoryBroker::with_capacity(DEFAULT_PUBLISH_LOG_CAPACITY)
    }
}

impl InMemoryBroker {
    /// Creates an empty broker with the default publish log capacity.
    pub fn new() -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker::default())
    }

    /// Creates an empty broker whose publish log keeps at most `capacity`
    /// entries, dropping the oldest first. A capacity of 0 disables the log.
    pub fn with_publish_log(capacity: usize) -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker::with_capacity(capacity))
    }

    fn with_capacity(capacity: usize) -> InMemoryBroker {
        InMemoryBroker {
            state: Arc::new(Mutex::new(State {
                publish_log_capacity: capacity,
                ..Default::default()
            })),
        }
    }

    /// Number of messages waiting in `queue`, excluding unacknowledged ones.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock()
            .map(|st| st.queues.get(queue).map_or(0, |q| q.ready.len()))
            .unwrap_or_default()
    }

    /// Drains the messages waiting in `queue`.
    pub fn take_ready(&self, queue: &str) -> Vec<Message> {
        self.lock()
            .map(|mut st| {
                st.queues
                    .get_mut(queue)
                    .map(|q| q.ready.drain(..).map(|s| s.message).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Number of deliveries handed to a live subscription and not yet
    /// acknowledged, across all queues.
    pub fn unacked_count(&self) -> usize {
        self.lock().map(|st| st.unacked.len()).unwrap_or_default()
    }

    /// Bindings whose source is `exchange`.
    pub fn bindings_of(&self, exchange: &str) -> Vec<QueueBinding> {
        self.lock()
            .map(|st| {
                st.bindings
                    .iter()
                    .filter(|b| b.exchange_name == exchange)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock()
            .map(|st| st.queues.contains_key(queue))
            .unwrap_or_default()
    }

    /// Messages accepted by `exchange` still held by the publish log, in
    /// publish order.
    pub fn published_to(&self, exchange: &str) -> Vec<PublishedMessage> {
        self.lock()
            .map(|st| {
                st.published
                    .iter()
                    .filter(|p| p.exchange == exchange)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Empties the publish log.
    pub fn clear_published(&self) {
        if let Ok(mut st) = self.lock() {
            st.published.clear();
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, AmqpError> {
        self.state.lock().map_err(|_| AmqpError::InternalError)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut st = self.lock()?;

        match st.exchanges.get(&def.name) {
            Some(existing) if existing != def => {
                warn!(name = def.name.as_str(), "inequivalent exchange declaration");
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                debug!("creating exchange: {}", def.name);
                st.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut st = self.lock()?;

        let name = if def.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            def.name.clone()
        };

        match st.queues.get(&name) {
            Some(existing) if existing.def != *def => {
                warn!(name = name.as_str(), "inequivalent queue declaration");
                Err(AmqpError::DeclareQueueError(name))
            }
            Some(_) => Ok(name),
            None => {
                debug!("creating queue: {}", name);
                let mut def = def.clone();
                def.name = name.clone();
                st.queues.insert(
                    name.clone(),
                    QueueState {
                        def,
                        ready: VecDeque::new(),
                        consumer: None,
                    },
                );
                Ok(name)
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut st = self.lock()?;

        if !st.queues.contains_key(&binding.queue_name)
            || !st.exchanges.contains_key(&binding.exchange_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        st.bindings.insert(binding.clone());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), AmqpError> {
        let mut st = self.lock()?;

        route(&self.state, &mut st, exchange, routing_key, message.clone())?;

        if st.publish_log_capacity > 0 {
            st.published.push_back(PublishedMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                message: message.clone(),
            });
            while st.published.len() > st.publish_log_capacity {
                st.published.pop_front();
            }
        }
        Ok(())
    }

    /// Subscribes to `queue`. Dropping the returned stream cancels the
    /// subscription and requeues its unacknowledged deliveries.
    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut st = self.lock()?;

        if !st.queues.contains_key(queue) {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        st.next_consumer += 1;
        let slot = ConsumerSlot {
            id: st.next_consumer,
            tx,
        };

        let pending: Vec<Stored> = st
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default();
        for stored in pending {
            dispatch(&mut st, &slot, queue, stored);
        }

        let guard = SubscriptionGuard {
            shared: self.state.clone(),
            queue: queue.to_owned(),
            consumer: slot.id,
        };

        if let Some(q) = st.queues.get_mut(queue) {
            q.consumer = Some(slot);
        }

        Ok(stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), (rx, guard)))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut st = self.lock()?;

        match st.unacked.remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(AmqpError::AckMessageError),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut st = self.lock()?;

        let Some(Unacked {
            queue, mut stored, ..
        }) = st.unacked.remove(&delivery_tag)
        else {
            return Err(AmqpError::NackMessageError);
        };

        if requeue {
            stored.redelivered = true;
            enqueue(&self.state, &mut st, &queue, stored);
            return Ok(());
        }

        dead_letter(&self.state, &mut st, &queue, stored);
        Ok(())
    }

    async fn qos(&self, _prefetch: u16) -> Result<(), AmqpError> {
        Ok(())
    }
}

/// Cancels a subscription when its delivery stream is dropped.
struct SubscriptionGuard {
    shared: Arc<Mutex<State>>,
    queue: String,
    consumer: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let Ok(mut st) = self.shared.lock() else {
            return;
        };

        if let Some(q) = st.queues.get_mut(&self.queue) {
            if q.consumer.as_ref().is_some_and(|c| c.id == self.consumer) {
                q.consumer = None;
            }
        }

        let mut tags: Vec<u64> = st
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == self.consumer)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        if !tags.is_empty() {
            debug!(
                queue = self.queue.as_str(),
                count = tags.len(),
                "subscription dropped, requeuing unacked deliveries"
            );
        }

        for tag in tags {
            if let Some(Unacked {
                queue, mut stored, ..
            }) = st.unacked.remove(&tag)
            {
                stored.redelivered = true;
                enqueue(&self.shared, &mut st, &queue, stored);
            }
        }
    }
}

fn route(
    shared: &Arc<Mutex<State>>,
    st: &mut State,
    exchange: &str,
    routing_key: &str,
    message: Message,
) -> Result<(), AmqpError> {
    let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
        if st.queues.contains_key(routing_key) {
            vec![routing_key.to_owned()]
        } else {
            vec![]
        }
    } else {
        let Some(kind) = st.exchanges.get(exchange).map(|e| e.kind) else {
            return Err(AmqpError::PublishingError(exchange.to_owned()));
        };

        st.bindings
            .iter()
            .filter(|b| b.exchange_name == exchange)
            .filter(|b| kind == ExchangeKind::Fanout || b.routing_key == routing_key)
            .map(|b| b.queue_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    };

    if targets.is_empty() {
        debug!(exchange, routing_key, "message unroutable, dropping");
    }

    for queue in targets {
        st.next_id += 1;
        let stored = Stored {
            id: st.next_id,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            message: message.clone(),
        };
        enqueue(shared, st, &queue, stored);
    }

    Ok(())
}

fn enqueue(shared: &Arc<Mutex<State>>, st: &mut State, queue: &str, stored: Stored) {
    let consumer = st.queues.get(queue).and_then(|q| q.consumer.clone());

    if let Some(slot) = consumer {
        if dispatch(st, &slot, queue, stored.clone()) {
            return;
        }
        if let Some(q) = st.queues.get_mut(queue) {
            q.consumer = None;
        }
    }

    let Some(q) = st.queues.get_mut(queue) else {
        return;
    };

    let id = stored.id;
    q.ready.push_back(stored);

    if let Some(ttl) = q.def.ttl {
        schedule_expiry(shared.clone(), queue.to_owned(), id, ttl);
    }
}

/// Hands `stored` to a consumer. Returns false when the consumer is gone.
fn dispatch(st: &mut State, slot: &ConsumerSlot, queue: &str, stored: Stored) -> bool {
    st.next_tag += 1;
    let tag = st.next_tag;

    let delivery = Delivery {
        tag,
        exchange: stored.exchange.clone(),
        routing_key: stored.routing_key.clone(),
        redelivered: stored.redelivered,
        message: stored.message.clone(),
    };

    if slot.tx.send(delivery).is_err() {
        return false;
    }

    st.unacked.insert(
        tag,
        Unacked {
            queue: queue.to_owned(),
            consumer: slot.id,
            stored,
        },
    );
    true
}

fn schedule_expiry(shared: Arc<Mutex<State>>, queue: String, id: u64, ttl: u32) {
    // Outside a runtime (a stream dropped during shutdown) the message just stays queued.
    let Ok(handle) = Handle::try_current() else {
        return;
    };

    handle.spawn(async move {
        tokio::time::sleep(Duration::from_millis(u64::from(ttl))).await;

        let Ok(mut st) = shared.lock() else {
            return;
        };

        let expired = st.queues.get_mut(&queue).and_then(|q| {
            q.ready
                .iter()
                .position(|s| s.id == id)
                .and_then(|pos| q.ready.remove(pos))
        });

        if let Some(stored) = expired {
            debug!(queue = queue.as_str(), "message expired");
            dead_letter(&shared, &mut st, &queue, stored);
        }
    });
}

fn dead_letter(shared: &Arc<Mutex<State>>, st: &mut State, queue: &str, stored: Stored) {
    let Some(def) = st.queues.get(queue).map(|q| q.def.clone()) else {
        return;
    };

    let Some(exchange) = def.dead_letter_exchange else {
        return;
    };

    let routing_key = def
        .dead_letter_routing_key
        .unwrap_or_else(|| stored.routing_key.clone());

    if let Err(err) = route(shared, st, &exchange, &routing_key, stored.message) {
        warn!(error = err.to_string(), queue, "failure to dead-letter message");
    }
}
