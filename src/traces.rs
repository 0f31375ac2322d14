// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Tracing Setup
//!
//! Installs the `tracing` subscriber, the W3C trace-context propagator used to
//! carry spans across the broker, and a global tracer provider identifying the
//! application.

use crate::errors::AmqpError;
use opentelemetry::global;
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace::SdkTracerProvider, Resource};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a fmt subscriber filtered by `RUST_LOG` (default `info`) and a
/// tracer provider whose `service.name` is `app_name`.
///
/// # Returns
/// `AmqpError::InternalError` when a global subscriber is already installed;
/// this function never panics.
pub fn setup_tracing(app_name: &str) -> Result<(), AmqpError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let provider = SdkTracerProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(app_name.to_owned())
                .build(),
        )
        .build();
    global::set_tracer_provider(provider);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| {
            error!(error = err.to_string(), "tracing subscriber already installed");
            AmqpError::InternalError
        })?;

    info!(app = app_name, "tracing installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_installation_is_an_error() {
        let _ = setup_tracing("rabbitmq-rpc-test");
        assert_eq!(
            setup_tracing("rabbitmq-rpc-test"),
            Err(AmqpError::InternalError)
        );
    }
}
