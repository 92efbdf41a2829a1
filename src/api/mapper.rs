//! Verification results to wire items.

use serde::Serialize;

use crate::domain::{Outcome, VerificationResult, Violation};
use crate::infra::{ProviderError, Result};

use super::types::{Item, ValidationValue};

/// Item for one verified key.
///
/// A policy denial becomes an item error; a result that cannot be encoded
/// is a system error for the whole request.
pub fn validation_item(key: &str, result: VerificationResult) -> Result<Item> {
    if result.outcome == Outcome::Failure {
        return Ok(Item::error(key, deny_message(key, &result.violations)));
    }

    let value = ValidationValue {
        outcome: result.outcome,
        input: result.input,
        vsa: result.vsa,
        violations: result.violations,
    };
    Ok(Item::value(key, encode_value(key, &value)?))
}

fn encode_value<T: Serialize>(key: &str, value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| {
        ProviderError::Internal(format!("unable to encode verification result for {key}: {e}"))
    })
}

/// Human-readable reason an image was denied
pub fn deny_message(key: &str, violations: &[Violation]) -> String {
    if violations.is_empty() {
        return format!("image {key} failed policy verification");
    }
    let reasons: Vec<String> = violations
        .iter()
        .map(|v| format!("{}: {}", v.violation_type, v.description))
        .collect();
    format!(
        "image {key} failed policy verification: {}",
        reasons.join("; ")
    )
}

/// Item for one resolved mutate key
pub fn mutation_item(key: &str, reference: String) -> Item {
    Item::value(key, serde_json::Value::String(reference))
}
