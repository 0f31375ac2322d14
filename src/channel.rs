// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels from
//! [`RabbitMQConfigs`]. Connection failures are fatal to the participant that
//! requested them; no automatic reconnect is attempted.

use crate::{configs::RabbitMQConfigs, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Creates a new AMQP channel for communication with RabbitMQ.
///
/// Both the connection and channel are wrapped in Arc for thread-safe sharing.
/// The connection must be kept alive for as long as the channel is used.
///
/// # Example
/// ```ignore
/// let (conn, channel) = new_amqp_channel(&RabbitMQConfigs::from_env()?).await?;
/// ```
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    debug!(host = %cfg.host, port = cfg.port, "connecting to rabbitmq");
    let conn = Connection::connect(&cfg.uri(), options)
        .await
        .map_err(|err| {
            error!(error = err.to_string(), host = %cfg.host, "failure to connect");
            AmqpError::ConnectionError
        })?;

    let channel = conn.create_channel().await.map_err(|err| {
        error!(error = err.to_string(), "failure to create channel");
        AmqpError::ChannelError
    })?;

    debug!(channel = channel.id(), "amqp channel ready");
    Ok((Arc::new(conn), Arc::new(channel)))
}
