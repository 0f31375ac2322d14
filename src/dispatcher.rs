// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Subscribes to a queue and feeds every delivery to a [`RetryCoordinator`].
//! Deliveries are handled one at a time unless a prefetch above one is
//! configured, in which case up to `prefetch` deliveries are in flight.

use crate::{broker::Broker, consumer::RetryCoordinator, errors::AmqpError};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

/// Consume loop for the main queue of one [`RetryCoordinator`].
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    coordinator: Arc<RetryCoordinator>,
    consumer_tag: String,
    prefetch: u16,
}

impl Dispatcher {
    /// Creates a dispatcher for the coordinator's queue.
    ///
    /// # Parameters
    /// * `broker` - Broker the subscription is opened on
    /// * `coordinator` - Coordinator every delivery is handed to
    ///
    /// # Returns
    /// A dispatcher handling one delivery at a time, with a unique consumer tag
    pub fn new(broker: Arc<dyn Broker>, coordinator: Arc<RetryCoordinator>) -> Dispatcher {
        Dispatcher {
            consumer_tag: format!("{}-{}", coordinator.queue(), Uuid::new_v4().simple()),
            broker,
            coordinator,
            prefetch: 1,
        }
    }

    /// Allows up to `prefetch` unacknowledged deliveries to be handled concurrently.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Consumes until the subscription ends.
    ///
    /// Failures of individual deliveries are logged and do not stop the loop.
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        if self.prefetch > 1 {
            self.broker.qos(self.prefetch).await?;
        }

        let queue = self.coordinator.queue();
        let deliveries = self.broker.consume(queue, &self.consumer_tag).await?;
        info!(queue, consumer = self.consumer_tag.as_str(), "consuming");

        let coordinator = &self.coordinator;
        deliveries
            .for_each_concurrent(usize::from(self.prefetch), |result| async move {
                match result {
                    Ok(delivery) => {
                        if let Err(err) = coordinator.process(&delivery).await {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            })
            .await;

        info!(queue, "subscription closed");
        Ok(())
    }

    /// Runs [`Dispatcher::consume_blocking`] on a background task.
    pub fn spawn(self) -> JoinHandle<Result<(), AmqpError>> {
        tokio::spawn(async move { self.consume_blocking().await })
    }
}
