//! Wire types of the Gatekeeper external data protocol.

use serde::{Deserialize, Serialize};

use crate::domain::{Outcome, PolicyInput, Statement, Violation};

pub const API_VERSION: &str = "externaldata.gatekeeper.sh/v1beta1";
pub const RESPONSE_KIND: &str = "ProviderResponse";

/// Request sent by Gatekeeper.
///
/// Only the keys are read. Both the full envelope and a bare
/// `{"keys": [...]}` body are accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    #[serde(default)]
    pub keys: Vec<String>,
}

impl ProviderRequest {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: "ProviderRequest".to_string(),
            request: Some(RequestBody { keys }),
            keys: None,
        }
    }

    /// Keys in request order
    pub fn keys(&self) -> &[String] {
        match (&self.request, &self.keys) {
            (Some(request), _) => &request.keys,
            (None, Some(keys)) => keys,
            (None, None) => &[],
        }
    }
}

/// Result for one key; exactly one of `value` and `error` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Item {
    pub fn value(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
            error: None,
        }
    }

    pub fn error(key: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            error: Some(error.into()),
        }
    }
}

/// Response envelope returned to Gatekeeper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponse {
    pub api_version: String,
    pub kind: String,
    pub response: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    pub idempotent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Item>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_error: Option<String>,
}

/// Item value reported for an admitted image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationValue {
    pub outcome: Outcome,
    pub input: Option<PolicyInput>,
    pub vsa: Option<Statement>,
    pub violations: Vec<Violation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shapes() {
        let full: ProviderRequest = serde_json::from_str(
            r#"{"apiVersion":"externaldata.gatekeeper.sh/v1beta1","kind":"ProviderRequest","request":{"keys":["a","b"]}}"#,
        )
        .unwrap();
        assert_eq!(full.keys(), ["a", "b"]);

        let bare: ProviderRequest = serde_json::from_str(r#"{"keys":["c"]}"#).unwrap();
        assert_eq!(bare.keys(), ["c"]);

        let empty: ProviderRequest = serde_json::from_str("{}").unwrap();
        assert!(empty.keys().is_empty());

        assert_eq!(ProviderRequest::new(vec!["x".into()]).keys(), ["x"]);
    }

    #[test]
    fn test_item_serialization_omits_unset_fields() {
        let item = serde_json::to_value(Item::error("k", "denied")).unwrap();
        assert_eq!(item, serde_json::json!({"key": "k", "error": "denied"}));

        let item = serde_json::to_value(Item::value("k", "v".into())).unwrap();
        assert_eq!(item, serde_json::json!({"key": "k", "value": "v"}));
    }
}
