use async_trait::async_trait;
use futures_util::future::join_all;
use rabbitmq_rpc::{
    broker::{Broker, DeliveryStream, DEFAULT_EXCHANGE},
    configs::RpcSettings,
    errors::{AmqpError, RpcError},
    exchange::ExchangeDefinition,
    memory::InMemoryBroker,
    message::Message,
    queue::{QueueBinding, QueueDefinition},
    rpc::{
        client::{RpcClient, RpcClientConfig},
        math::MathOperation,
        protocol::RpcRequest,
        server::{RpcServer, RpcServerConfig},
    },
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

const TIMEOUT: Duration = Duration::from_secs(1);

/// Delegates to an [`InMemoryBroker`] but refuses every publish to the
/// default exchange, so no response can ever reach a reply queue.
struct UnreachableReplies {
    inner: Arc<InMemoryBroker>,
}

#[async_trait]
impl Broker for UnreachableReplies {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.inner.declare_exchange(def).await
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.inner.declare_queue(def).await
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.inner.bind_queue(binding).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), AmqpError> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(AmqpError::PublishingError(routing_key.to_owned()));
        }
        self.inner.publish(exchange, routing_key, message).await
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.inner.consume(queue, consumer_tag).await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.inner.ack(delivery_tag).await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.inner.nack(delivery_tag, requeue).await
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.inner.qos(prefetch).await
    }
}

async fn start_server(broker: Arc<InMemoryBroker>) {
    RpcServer::bind(broker, RpcServerConfig::default(), MathOperation::table())
        .await
        .unwrap()
        .spawn();
}

async fn connect(broker: Arc<InMemoryBroker>) -> RpcClient {
    RpcClient::connect(broker, RpcClientConfig::default())
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn add_returns_the_sum_tagged_with_the_request_correlation_id() {
    let broker = InMemoryBroker::new();
    start_server(broker.clone()).await;
    let client = connect(broker.clone()).await;

    let payload = client.call("add", &[2.0, 3.0], TIMEOUT).await.unwrap();
    assert_eq!(payload, b"5".to_vec());

    let request = &broker.published_to("rpc-ex")[0].message;
    let response = &broker.published_to("")[0];
    assert_eq!(response.routing_key, client.reply_queue());
    assert_eq!(response.message.correlation_id, request.correlation_id);
    assert!(request.correlation_id.is_some());

    let sent: RpcRequest = serde_json::from_slice(&request.payload).unwrap();
    assert_eq!(sent.method, "add");
    assert_eq!(request.reply_to.as_deref(), Some(client.reply_queue()));

    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_method_is_answered_with_a_structured_error() {
    let broker = InMemoryBroker::new();
    start_server(broker.clone()).await;
    let client = connect(broker.clone()).await;

    let payload = client.call("unknownOp", &[1.0], TIMEOUT).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(value, json!({"error": "method not found"}));

    assert_eq!(
        client.call_value("unknownOp", &[1.0]).await,
        Err(RpcError::Remote("method not found".into()))
    );
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn operation_failures_become_remote_errors() {
    let broker = InMemoryBroker::new();
    start_server(broker.clone()).await;
    let client = connect(broker.clone()).await;

    assert_eq!(
        client.call_value("divide", &[1.0, 0.0]).await,
        Err(RpcError::Remote("division by zero".into()))
    );
    assert_eq!(client.call_value("divide", &[3.0, 2.0]).await, Ok(json!(1.5)));
}

#[tokio::test(start_paused = true)]
async fn call_without_server_times_out_and_leaves_no_pending_entry() {
    let broker = InMemoryBroker::new();
    let client = connect(broker.clone()).await;

    let started = Instant::now();
    let result = client
        .call("add", &[2.0, 3.0], Duration::from_millis(100))
        .await;

    assert_eq!(result, Err(RpcError::Timeout(Duration::from_millis(100))));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_calls_are_matched_by_correlation_id() {
    let broker = InMemoryBroker::new();
    start_server(broker.clone()).await;
    let client = connect(broker.clone()).await;

    let calls = (0..20u32).map(|i| {
        let client = &client;
        async move {
            let n = f64::from(i);
            let payload = client.call("multiply", &[n, 2.0], TIMEOUT).await.unwrap();
            (i, payload)
        }
    });

    for (i, payload) in join_all(calls).await {
        assert_eq!(payload, (i * 2).to_string().into_bytes());
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn late_and_unknown_responses_are_acked_and_dropped() {
    let broker = InMemoryBroker::new();
    let client = connect(broker.clone()).await;

    // A server that never answers in time.
    broker.declare_queue(&QueueDefinition::new("slow")).await.unwrap();
    broker
        .bind_queue(&QueueBinding::new("slow").exchange("rpc-ex"))
        .await
        .unwrap();

    let result = client.call("add", &[1.0, 1.0], Duration::from_millis(50)).await;
    assert!(matches!(result, Err(RpcError::Timeout(_))));

    let request = broker.take_ready("slow").remove(0);
    let reply_to = request.reply_to.clone().unwrap();
    let late = Message::new("2").correlation_id(request.correlation_id.unwrap());
    broker.publish("", &reply_to, &late).await.unwrap();
    broker
        .publish("", &reply_to, &Message::new("?").correlation_id("nobody"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(client.pending_calls(), 0);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth(client.reply_queue()), 0);
}

#[tokio::test(start_paused = true)]
async fn request_without_reply_address_is_acked_without_answer() {
    let broker = InMemoryBroker::new();
    start_server(broker.clone()).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let request = RpcRequest {
        method: "add".into(),
        params: vec![1.0, 2.0],
    };
    broker
        .publish("rpc-ex", "", &Message::json(&request).unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(broker.published_to("").is_empty());
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn client_and_server_share_the_rpc_exchange_declaration() {
    let broker = InMemoryBroker::new();
    let _client = connect(broker.clone()).await;
    start_server(broker.clone()).await;

    assert!(broker
        .declare_exchange(&ExchangeDefinition::new("rpc-ex").direct())
        .await
        .is_ok());
    assert!(broker.has_queue("rpc-queue"));
    assert!(broker.has_queue("retry-queue"));
    assert!(broker.has_queue("dead-queue"));
}

#[tokio::test(start_paused = true)]
async fn unpublishable_response_is_retried_then_dead_lettered() {
    let inner = InMemoryBroker::new();
    let broker = Arc::new(UnreachableReplies {
        inner: inner.clone(),
    });
    let max_retry = RpcSettings::default().max_retry;

    RpcServer::bind(broker.clone(), RpcServerConfig::default(), MathOperation::table())
        .await
        .unwrap()
        .spawn();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let request = RpcRequest {
        method: "add".into(),
        params: vec![2.0, 3.0],
    };
    let message = Message::json(&request)
        .unwrap()
        .correlation_id("c1")
        .reply_to("amq.gen-gone");
    broker.publish("rpc-ex", "", &message).await.unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;

    let retries: Vec<(u32, Option<String>, Option<String>)> = inner
        .published_to("retry-ex")
        .into_iter()
        .map(|p| {
            (
                p.message.attempt(),
                p.message.correlation_id,
                p.message.reply_to,
            )
        })
        .collect();
    let expected: Vec<(u32, Option<String>, Option<String>)> = (1..=max_retry + 1)
        .map(|n| (n, Some("c1".into()), Some("amq.gen-gone".into())))
        .collect();
    assert_eq!(retries, expected);

    let dead = inner.published_to("dead-ex");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.correlation_id.as_deref(), Some("c1"));
    assert_eq!(dead[0].message.payload, message.payload);
    assert_eq!(inner.queue_depth("dead-queue"), 1);
    assert_eq!(inner.unacked_count(), 0);
}
