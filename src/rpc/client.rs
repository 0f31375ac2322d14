// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Client
//!
//! [`RpcClient`] is a session object: it owns one reply queue and one pending
//! call table, and a background listener that routes responses arriving on the
//! reply queue to their callers. Calls on the same client are independent and
//! may be outstanding concurrently; responses are matched by correlation id only.

use crate::{
    broker::Broker,
    configs::RpcSettings,
    errors::{AmqpError, RpcError},
    exchange::ExchangeDefinition,
    message::Message,
    publisher::Publisher,
    queue::QueueDefinition,
    rpc::{
        pending::{new_correlation_id, PendingCalls},
        protocol::{RpcErrorPayload, RpcRequest},
    },
};
use futures_util::StreamExt;
use opentelemetry::Context;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Client-side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcClientConfig {
    pub exchange: String,
    pub routing_key: String,
    /// Message TTL of the reply queue, in milliseconds.
    pub reply_ttl: u32,
    /// Idle expiry of the reply queue, in milliseconds.
    pub reply_expires: u32,
    pub timeout: Duration,
}

impl From<&RpcSettings> for RpcClientConfig {
    fn from(settings: &RpcSettings) -> Self {
        RpcClientConfig {
            exchange: settings.rpc_exchange.clone(),
            routing_key: String::new(),
            reply_ttl: settings.rpc_ttl,
            reply_expires: settings.reply_queue_expires,
            timeout: settings.call_timeout,
        }
    }
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        RpcClientConfig::from(&RpcSettings::default())
    }
}

/// An RPC session bound to one private reply queue.
///
/// Dropping the client stops its reply listener; calls still waiting then
/// fail with [`RpcError::ClientClosed`] or time out.
pub struct RpcClient {
    publisher: Publisher,
    config: RpcClientConfig,
    reply_queue: String,
    pending: Arc<PendingCalls>,
    listener: JoinHandle<()>,
}

impl RpcClient {
    /// Declares the RPC exchange and a private reply queue, then starts
    /// listening for responses.
    ///
    /// # Parameters
    /// * `broker` - Broker shared with any other participant in the process
    /// * `config` - Exchange, routing key, reply queue limits and default timeout
    ///
    /// # Returns
    /// The connected client, or [`RpcError::Broker`] when a declaration or the
    /// reply subscription fails
    pub async fn connect(
        broker: Arc<dyn Broker>,
        config: RpcClientConfig,
    ) -> Result<RpcClient, RpcError> {
        broker
            .declare_exchange(&ExchangeDefinition::new(&config.exchange).direct())
            .await?;

        let reply_queue = broker
            .declare_queue(
                &QueueDefinition::new("")
                    .exclusive()
                    .delete()
                    .ttl(config.reply_ttl)
                    .expires(config.reply_expires),
            )
            .await?;

        let pending = PendingCalls::new();
        let listener = spawn_listener(broker.clone(), &reply_queue, pending.clone()).await?;

        debug!(reply_queue = reply_queue.as_str(), "rpc client ready");

        Ok(RpcClient {
            publisher: Publisher::new(broker),
            config,
            reply_queue,
            pending,
            listener,
        })
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Calls `method` with `params` and returns the raw response payload.
    ///
    /// Structured error payloads are returned as-is; see [`RpcClient::call_value`]
    /// for a decoded variant.
    pub async fn call(
        &self,
        method: &str,
        params: &[f64],
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        let correlation_id = new_correlation_id();
        let (_guard, mut receiver) = self.pending.register(&correlation_id)?;

        let request = RpcRequest {
            method: method.to_owned(),
            params: params.to_vec(),
        };
        let message = Message::json(&request)?
            .correlation_id(correlation_id.as_str())
            .reply_to(self.reply_queue.as_str());

        debug!(
            method,
            correlation_id = correlation_id.as_str(),
            "sending rpc request"
        );

        self.publisher
            .publish(
                &Context::current(),
                &self.config.exchange,
                &self.config.routing_key,
                message,
            )
            .await?;

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(RpcError::ClientClosed),
            // The listener may have matched the response right at the deadline.
            Err(_) => match receiver.try_recv() {
                Ok(payload) => Ok(payload),
                Err(_) => {
                    warn!(
                        method,
                        correlation_id = correlation_id.as_str(),
                        "rpc call timed out"
                    );
                    Err(RpcError::Timeout(timeout))
                }
            },
        }
    }

    /// Calls `method` with the configured timeout and decodes the JSON result.
    ///
    /// A `{error}` response becomes [`RpcError::Remote`].
    pub async fn call_value(&self, method: &str, params: &[f64]) -> Result<Value, RpcError> {
        let payload = self.call(method, params, self.config.timeout).await?;
        let value: Value = serde_json::from_slice(&payload)?;

        match RpcErrorPayload::from_value(&value) {
            Some(err) => Err(RpcError::Remote(err.error)),
            None => Ok(value),
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn spawn_listener(
    broker: Arc<dyn Broker>,
    reply_queue: &str,
    pending: Arc<PendingCalls>,
) -> Result<JoinHandle<()>, AmqpError> {
    let mut responses = broker.consume(reply_queue, reply_queue).await?;

    Ok(tokio::spawn(async move {
        while let Some(result) = responses.next().await {
            let delivery = match result {
                Ok(delivery) => delivery,
                Err(err) => {
                    error!(error = err.to_string(), "errors consume rpc response");
                    continue;
                }
            };

            let matched = match delivery.message.correlation_id.as_deref() {
                Some(id) => pending.resolve(id, delivery.message.payload.clone()),
                None => false,
            };

            if !matched {
                debug!(
                    correlation_id = delivery.message.correlation_id.as_deref().unwrap_or_default(),
                    "dropping orphan response"
                );
            }

            if let Err(err) = broker.ack(delivery.tag).await {
                error!(error = err.to_string(), "error whiling ack rpc response");
            }
        }
    }))
}
