// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Arithmetic operations served over RPC.

use crate::{
    errors::OperationError,
    rpc::{
        protocol::number_value,
        server::{Operation, OperationTable},
    },
};
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathOperation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl MathOperation {
    pub const ALL: [MathOperation; 4] = [
        MathOperation::Add,
        MathOperation::Subtract,
        MathOperation::Multiply,
        MathOperation::Divide,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MathOperation::Add => "add",
            MathOperation::Subtract => "subtract",
            MathOperation::Multiply => "multiply",
            MathOperation::Divide => "divide",
        }
    }

    pub fn apply(&self, a: f64, b: f64) -> Result<f64, OperationError> {
        let result = match self {
            MathOperation::Add => a + b,
            MathOperation::Subtract => a - b,
            MathOperation::Multiply => a * b,
            MathOperation::Divide if b == 0.0 => return Err(OperationError::DivisionByZero),
            MathOperation::Divide => a / b,
        };

        if !result.is_finite() {
            return Err(OperationError::Failed(format!(
                "{} overflowed",
                self.name()
            )));
        }

        Ok(result)
    }

    /// Table with every arithmetic operation registered under its name.
    pub fn table() -> OperationTable {
        MathOperation::ALL
            .into_iter()
            .fold(OperationTable::new(), |table, op| table.register(op.name(), op))
    }
}

#[async_trait]
impl Operation for MathOperation {
    async fn invoke(&self, params: &[f64]) -> Result<Value, OperationError> {
        let [a, b] = params else {
            return Err(OperationError::Arity {
                expected: 2,
                got: params.len(),
            });
        };

        self.apply(*a, *b).map(number_value)
    }
}
