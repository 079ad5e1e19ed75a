//! Signer wire protocol.
//!
//! Newline-delimited JSON over a local stream socket. Requests carry a
//! `type` tag; responses mirror `{ success, data?, error? }`. Connections
//! are short-lived and requests within one connection are answered in
//! order.

use serde::{Deserialize, Serialize};

/// Request messages accepted by the signer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignerRequest {
    HealthCheck,
    GetAddress,
    #[serde(rename_all = "camelCase")]
    SignTransaction {
        transaction_hash: String,
        serialized_tx: String,
        approval_token: String,
    },
    #[serde(rename_all = "camelCase")]
    SignMessage {
        message: String,
        approval_token: String,
    },
}

/// Response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SignerResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
