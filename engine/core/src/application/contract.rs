// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde_json::Value;

use crate::domain::errors::ProcessingError;
use crate::domain::exchange::Exchange;
use crate::domain::policy::Validator;

/// Checks the JSON shape of the body against `json:<shape>`.
pub struct JsonTypeValidator;

impl JsonTypeValidator {
    pub const DATA_TYPES: [&'static str; 5] = [
        "json:object",
        "json:array",
        "json:string",
        "json:number",
        "json:boolean",
    ];
}

impl Validator for JsonTypeValidator {
    fn validate(&self, exchange: &Exchange, data_type: &str) -> Result<(), ProcessingError> {
        let body = exchange.body();
        let ok = match data_type {
            "json:object" => body.is_object(),
            "json:array" => body.is_array(),
            "json:string" => body.is_string(),
            "json:number" => body.is_number(),
            "json:boolean" => body.is_boolean(),
            other => {
                return Err(ProcessingError::ContractViolation(format!(
                    "unknown data type '{other}'"
                )))
            }
        };
        if ok {
            Ok(())
        } else {
            Err(ProcessingError::ContractViolation(format!(
                "expected {data_type}, got {}",
                shape_of(body)
            )))
        }
    }
}

fn shape_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_shapes() {
        let validator = JsonTypeValidator;
        assert!(validator.validate(&Exchange::new(json!({"a": 1})), "json:object").is_ok());
        let err = validator
            .validate(&Exchange::new(json!([1])), "json:object")
            .unwrap_err();
        assert_eq!(err.to_string(), "Contract violation: expected json:object, got array");
    }
}
