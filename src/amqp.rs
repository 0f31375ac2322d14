// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Broker
//!
//! [`Broker`] implementation on top of a lapin [`Channel`]. This module owns the
//! translation between the crate's broker-agnostic types and AMQP: queue
//! arguments, header tables and message properties.

use crate::{
    broker::{Broker, DeliveryStream},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, HeaderValue, Headers, Message},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify the idle expiry of a queue
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";

/// RabbitMQ implementation of the [`Broker`] trait.
pub struct AmqpBroker {
    channel: Arc<Channel>,
}

impl AmqpBroker {
    /// Wraps an open lapin channel. The connection owning the channel must
    /// outlive the broker.
    pub fn new(channel: Arc<Channel>) -> Arc<AmqpBroker> {
        Arc::new(AmqpBroker { channel })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                queue_arguments(def),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                let name = queue.name().as_str().to_owned();
                debug!("queue: {} was created", name);
                Ok(name)
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.payload,
                to_properties(message),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), exchange, "error publishing message");
                Err(AmqpError::PublishingError(exchange.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(into_delivery)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }
}

fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(ttl) = def.ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongLongInt(i64::from(ttl)),
        );
    }

    if let Some(expires) = def.expires {
        args.insert(
            ShortString::from(AMQP_HEADERS_EXPIRES),
            AMQPValue::LongLongInt(i64::from(expires)),
        );
    }

    if let Some(exchange) = &def.dead_letter_exchange {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }

    if let Some(key) = &def.dead_letter_routing_key {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(key.clone())),
        );
    }

    FieldTable::from(args)
}

fn to_properties(message: &Message) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(to_field_table(&message.headers));

    if let Some(content_type) = &message.content_type {
        props = props.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(id) = &message.correlation_id {
        props = props.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &message.reply_to {
        props = props.with_reply_to(ShortString::from(reply_to.clone()));
    }

    props
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;

    let headers = props
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    let message = Message {
        headers,
        correlation_id: props.correlation_id().as_ref().map(|v| v.to_string()),
        reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        payload: delivery.data,
    };

    Delivery {
        tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        message,
    }
}

pub(crate) fn to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Float(v) => AMQPValue::Double(*v),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(btree)
}

/// Converts an AMQP header table, dropping values with no [`HeaderValue`]
/// counterpart (arrays, nested tables, timestamps).
pub(crate) fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
                AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
                AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
                AMQPValue::Double(v) => HeaderValue::Float(*v),
                AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
                AMQPValue::ShortString(v) => HeaderValue::Str(v.to_string()),
                AMQPValue::LongString(v) => {
                    HeaderValue::Str(String::from_utf8_lossy(v.as_bytes()).into_owned())
                }
                _ => return None,
            };
            Some((key.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RETRY_HEADER;

    #[test]
    fn retry_counter_survives_header_table() {
        let msg = Message::new("hi").with_attempt(2);
        let table = to_field_table(&msg.headers);

        let back = Message {
            headers: from_field_table(&table),
            ..Message::new("hi")
        };
        assert_eq!(back.attempt(), 2);
    }

    #[test]
    fn narrow_integer_headers_are_widened() {
        let mut btree = BTreeMap::new();
        btree.insert(ShortString::from(RETRY_HEADER), AMQPValue::ShortShortUInt(3));
        btree.insert(ShortString::from("nested"), AMQPValue::FieldTable(FieldTable::default()));

        let headers = from_field_table(&FieldTable::from(btree));

        assert_eq!(headers.get(RETRY_HEADER), Some(&HeaderValue::Int(3)));
        assert!(!headers.contains_key("nested"));
    }

    #[test]
    fn retry_queue_arguments_are_encoded() {
        let def = QueueDefinition::new("retry-queue")
            .ttl(3000)
            .dead_letter("logs-ex", "info");

        let args = queue_arguments(&def);
        let inner = args.inner();

        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongLongInt(3000))
        );
        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString(LongString::from("logs-ex")))
        );
        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)),
            Some(&AMQPValue::LongString(LongString::from("info")))
        );
        assert!(inner.get(&ShortString::from(AMQP_HEADERS_EXPIRES)).is_none());
    }
}
