// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Server
//!
//! Consumes requests from the RPC queue, dispatches them to a registered
//! [`Operation`] and answers on the caller's reply queue with the caller's
//! correlation id. Unknown methods, malformed requests and operation failures
//! are all answered with an `{error}` payload; the request is acknowledged only
//! after the answer has been published.
//!
//! Requests go through the [`RetryCoordinator`]: when the answer cannot be
//! published the request is retried through the retry exchange and eventually
//! dead-lettered. Operations may therefore run more than once for one request.

use crate::{
    broker::{Broker, DEFAULT_EXCHANGE},
    configs::RpcSettings,
    consumer::{DeliveryHandler, Outcome, RetryCoordinator},
    dispatcher::Dispatcher,
    errors::{AmqpError, OperationError},
    message::{Delivery, Message, JSON_CONTENT_TYPE},
    publisher::Publisher,
    queue::QueueDefinition,
    rpc::protocol::{RpcErrorPayload, RpcRequest},
    topology::{declare_retryable_delivery, RetryableDelivery, RetryableTopology},
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A named operation callable over RPC.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn invoke(&self, params: &[f64]) -> Result<Value, OperationError>;
}

/// Operations by method name.
#[derive(Clone, Default)]
pub struct OperationTable {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationTable {
    pub fn new() -> OperationTable {
        OperationTable::default()
    }

    /// Registers `operation` under `name`, replacing any previous entry.
    pub fn register<O>(mut self, name: &str, operation: O) -> Self
    where
        O: Operation + 'static,
    {
        self.operations.insert(name.to_owned(), Arc::new(operation));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Operation>> {
        self.operations.get(name)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Server-side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcServerConfig {
    pub delivery: RetryableDelivery,
    /// Maximum number of requests handled concurrently.
    pub prefetch: u16,
}

impl From<&RpcSettings> for RpcServerConfig {
    fn from(settings: &RpcSettings) -> Self {
        let delivery = RetryableDelivery::new(
            &settings.rpc_exchange,
            settings.retry_ttl,
            settings.max_retry,
            &settings.dead_letter_exchange,
        )
        .direct("")
        .queue(
            QueueDefinition::new(&settings.rpc_queue)
                .delete()
                .ttl(settings.rpc_ttl),
        )
        .retry_names(&settings.retry_exchange, &settings.retry_queue)
        .dead_letter_queue(&settings.dead_letter_queue);

        RpcServerConfig {
            delivery,
            prefetch: 10,
        }
    }
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        RpcServerConfig::from(&RpcSettings::default())
    }
}

/// Answers RPC requests; the success predicate of the server's retry flow.
pub struct RequestHandler {
    publisher: Publisher,
    operations: Arc<OperationTable>,
}

impl RequestHandler {
    pub fn new(broker: Arc<dyn Broker>, operations: Arc<OperationTable>) -> RequestHandler {
        RequestHandler {
            publisher: Publisher::new(broker),
            operations,
        }
    }

    /// Computes the response body for a request payload. Never fails: every
    /// failure is expressed as an `{error}` value.
    pub async fn respond(&self, payload: &[u8]) -> Value {
        let request: RpcRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = err.to_string(), "invalid rpc request");
                return error_value(RpcErrorPayload::new(format!("invalid request: {err}")));
            }
        };

        info!(
            method = request.method.as_str(),
            params = ?request.params,
            "attempting to call method"
        );

        let Some(operation) = self.operations.get(&request.method) else {
            error!(method = request.method.as_str(), "method not found");
            return error_value(RpcErrorPayload::method_not_found());
        };

        match operation.invoke(&request.params).await {
            Ok(result) => result,
            Err(err) => {
                error!(
                    method = request.method.as_str(),
                    error = err.to_string(),
                    "operation failed"
                );
                error_value(RpcErrorPayload::new(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for RequestHandler {
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Outcome {
        let Some(reply_to) = delivery.message.reply_to.as_deref() else {
            warn!("rpc request without reply address, dropping");
            return Outcome::Accept;
        };

        let response = self.respond(&delivery.message.payload).await;

        let body = match serde_json::to_vec(&response) {
            Ok(body) => body,
            Err(err) => {
                error!(error = err.to_string(), "failure to serialize rpc response");
                return Outcome::Reject;
            }
        };

        let mut message = Message::new(body).content_type(JSON_CONTENT_TYPE);
        if let Some(id) = &delivery.message.correlation_id {
            message = message.correlation_id(id.as_str());
        }

        match self
            .publisher
            .publish(ctx, DEFAULT_EXCHANGE, reply_to, message)
            .await
        {
            Ok(()) => {
                debug!(reply_to, "rpc response sent");
                Outcome::Accept
            }
            Err(_) => Outcome::Reject,
        }
    }
}

fn error_value(payload: RpcErrorPayload) -> Value {
    json!({ "error": payload.error })
}

/// Serves an [`OperationTable`] on the RPC queue.
pub struct RpcServer {
    topology: RetryableTopology,
    dispatcher: Dispatcher,
}

impl RpcServer {
    /// Declares the request, retry and dead-letter resources. A declaration
    /// failure is returned and no server is created.
    ///
    /// # Parameters
    /// * `broker` - Broker to declare on and consume from
    /// * `config` - Retryable delivery layout and prefetch
    /// * `operations` - Methods callable by clients
    ///
    /// # Returns
    /// A bound server; nothing is consumed until [`RpcServer::serve`] or
    /// [`RpcServer::spawn`] is called
    pub async fn bind(
        broker: Arc<dyn Broker>,
        config: RpcServerConfig,
        operations: OperationTable,
    ) -> Result<RpcServer, AmqpError> {
        let topology = declare_retryable_delivery(broker.as_ref(), &config.delivery).await?;

        let handler = RequestHandler::new(broker.clone(), Arc::new(operations));
        let coordinator = RetryCoordinator::new(broker.clone(), &topology, Arc::new(handler));
        let dispatcher = Dispatcher::new(broker, Arc::new(coordinator)).prefetch(config.prefetch);

        Ok(RpcServer {
            topology,
            dispatcher,
        })
    }

    pub fn topology(&self) -> &RetryableTopology {
        &self.topology
    }

    /// Serves requests until the subscription ends.
    pub async fn serve(&self) -> Result<(), AmqpError> {
        info!(queue = self.topology.main_queue.as_str(), "rpc server started");
        self.dispatcher.consume_blocking().await
    }

    pub fn spawn(self) -> JoinHandle<Result<(), AmqpError>> {
        tokio::spawn(async move { self.serve().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::InMemoryBroker, rpc::math::MathOperation};

    fn handler() -> RequestHandler {
        RequestHandler::new(InMemoryBroker::new(), Arc::new(MathOperation::table()))
    }

    #[tokio::test]
    async fn known_method_returns_result() {
        let value = handler().respond(br#"{"method":"add","params":[2,3]}"#).await;
        assert_eq!(value, json!(5));
    }

    #[tokio::test]
    async fn unknown_method_returns_structured_error() {
        let value = handler().respond(br#"{"method":"unknownOp","params":[1]}"#).await;
        assert_eq!(value, json!({"error": "method not found"}));
    }

    #[tokio::test]
    async fn operation_failure_is_wrapped() {
        let value = handler().respond(br#"{"method":"divide","params":[1,0]}"#).await;
        assert_eq!(value, json!({"error": "division by zero"}));
    }

    #[tokio::test]
    async fn malformed_request_is_answered() {
        let value = handler().respond(b"not json").await;
        let error = value.get("error").and_then(Value::as_str).unwrap();
        assert!(error.starts_with("invalid request"));
    }

    #[test]
    fn default_config_mirrors_rpc_settings() {
        let config = RpcServerConfig::default();
        let topology = config.delivery.topology();

        let names: Vec<&str> = topology.queues.iter().map(|q| q.name()).collect();
        assert_eq!(names, vec!["rpc-queue", "retry-queue", "dead-queue"]);
    }
}
