// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Wire payloads. Requests are `{method, params}`, successful responses are the
//! bare result value and failures are `{error}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error text sent when the requested method is not registered.
pub const METHOD_NOT_FOUND: &str = "method not found";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorPayload {
    pub error: String,
}

impl RpcErrorPayload {
    pub fn new(error: impl Into<String>) -> Self {
        RpcErrorPayload {
            error: error.into(),
        }
    }

    pub fn method_not_found() -> Self {
        RpcErrorPayload::new(METHOD_NOT_FOUND)
    }

    /// Recognizes an error payload: an object whose only key is `error`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.len() != 1 {
            return None;
        }
        object
            .get("error")
            .and_then(Value::as_str)
            .map(RpcErrorPayload::new)
    }
}

/// JSON form of a numeric result. Integral values within the exactly
/// representable range are emitted as integers.
pub fn number_value(result: f64) -> Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;

    if result.fract() == 0.0 && result.abs() <= MAX_EXACT {
        return Value::from(result as i64);
    }

    serde_json::Number::from_f64(result)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_format() {
        let request: RpcRequest = serde_json::from_str(r#"{"method":"add","params":[2,3]}"#).unwrap();
        assert_eq!(
            request,
            RpcRequest {
                method: "add".into(),
                params: vec![2.0, 3.0]
            }
        );
    }

    #[test]
    fn integral_results_are_integers() {
        assert_eq!(number_value(5.0).to_string(), "5");
        assert_eq!(number_value(-1.0).to_string(), "-1");
        assert_eq!(number_value(2.5).to_string(), "2.5");
    }

    #[test]
    fn error_payload_detection() {
        assert_eq!(
            RpcErrorPayload::from_value(&json!({"error": "method not found"})),
            Some(RpcErrorPayload::method_not_found())
        );
        assert_eq!(RpcErrorPayload::from_value(&json!(5)), None);
        assert_eq!(RpcErrorPayload::from_value(&json!({"error": "x", "data": 1})), None);
    }
}
