// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Deliveries
//!
//! Broker-agnostic representation of what is published ([`Message`]) and what a
//! consumer receives ([`Delivery`]). The payload is an opaque byte buffer.

use std::collections::BTreeMap;

/// Header carrying the retry attempt counter. Absent means attempt 0.
pub const RETRY_HEADER: &str = "x-retry";

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A single header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl HeaderValue {
    /// Integer view of the value. Whole-number floats and numeric strings are
    /// accepted, saturating at the `i64` bounds; fractional and non-finite
    /// values are not.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Float(v) => float_to_int(*v),
            HeaderValue::Str(v) => v
                .trim()
                .parse()
                .ok()
                .or_else(|| v.trim().parse::<f64>().ok().and_then(float_to_int)),
            HeaderValue::Bool(_) => None,
        }
    }
}

fn float_to_int(v: f64) -> Option<i64> {
    // `as` saturates at the i64 bounds.
    if v.is_finite() && v.fract() == 0.0 {
        Some(v as i64)
    } else {
        None
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// A message as handed to [`crate::broker::Broker::publish`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Message {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Message::new(serde_json::to_vec(value)?).content_type(JSON_CONTENT_TYPE))
    }

    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Reads the attempt counter from the `x-retry` header.
    ///
    /// Missing, negative or non-numeric values count as attempt 0. Values
    /// above `u32::MAX` saturate so an exhausted counter never wraps back.
    pub fn attempt(&self) -> u32 {
        match self.headers.get(RETRY_HEADER).and_then(HeaderValue::as_int) {
            Some(v) if v > 0 => u32::try_from(v).unwrap_or(u32::MAX),
            _ => 0,
        }
    }

    /// Copy of this message with the attempt counter set to `attempt`.
    pub fn with_attempt(&self, attempt: u32) -> Self {
        self.clone()
            .header(RETRY_HEADER, HeaderValue::Int(i64::from(attempt)))
    }
}

/// A message received from a queue, pending acknowledgment.
///
/// The delivery tag is the acknowledgment handle; it must be passed to
/// [`crate::broker::Broker::ack`] or [`crate::broker::Broker::nack`] exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message: Message,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_defaults_to_zero() {
        assert_eq!(Message::new("hi").attempt(), 0);
    }

    #[test]
    fn attempt_reads_numeric_and_string_headers() {
        let msg = Message::new("hi").header(RETRY_HEADER, HeaderValue::Int(2));
        assert_eq!(msg.attempt(), 2);

        let msg = Message::new("hi").header(RETRY_HEADER, HeaderValue::Str("3".into()));
        assert_eq!(msg.attempt(), 3);

        let msg = Message::new("hi").header(RETRY_HEADER, HeaderValue::Int(-1));
        assert_eq!(msg.attempt(), 0);
    }

    #[test]
    fn attempt_accepts_whole_number_floats() {
        let msg = Message::new("hi").header(RETRY_HEADER, HeaderValue::Float(3.0));
        assert_eq!(msg.attempt(), 3);

        let msg = Message::new("hi").header(RETRY_HEADER, HeaderValue::Str("2.0".into()));
        assert_eq!(msg.attempt(), 2);

        let msg = Message::new("hi").header(RETRY_HEADER, HeaderValue::Float(1.5));
        assert_eq!(msg.attempt(), 0);

        let msg = Message::new("hi").header(RETRY_HEADER, HeaderValue::Float(f64::NAN));
        assert_eq!(msg.attempt(), 0);
    }

    #[test]
    fn oversized_attempt_saturates() {
        let msg = Message::new("hi").header(RETRY_HEADER, HeaderValue::Int(5_000_000_000));
        assert_eq!(msg.attempt(), u32::MAX);

        let msg = Message::new("hi").header(RETRY_HEADER, HeaderValue::Float(1e30));
        assert_eq!(msg.attempt(), u32::MAX);
    }

    #[test]
    fn with_attempt_keeps_routing_properties() {
        let msg = Message::new("hi")
            .correlation_id("abc")
            .reply_to("amq.gen-1")
            .header("tenant", HeaderValue::Str("t1".into()));

        let retried = msg.with_attempt(1);

        assert_eq!(retried.attempt(), 1);
        assert_eq!(retried.correlation_id.as_deref(), Some("abc"));
        assert_eq!(retried.reply_to.as_deref(), Some("amq.gen-1"));
        assert_eq!(retried.payload, msg.payload);
        assert_eq!(
            retried.headers.get("tenant"),
            Some(&HeaderValue::Str("t1".into()))
        );
    }
}
