//! Transaction domain types.
//!
//! Represents what an agent proposes to sign. `TransactionRequest` is the
//! wire shape (string-encoded numbers, as they arrive from an agent or tool
//! call); `CheckedTransaction` is the validated, strongly-typed form the
//! evaluation pipeline operates on.

use alloy_primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{WardexError, WardexResult};

/// A transaction proposed by an agent, as received on the wire.
///
/// This is the primary input to the evaluation pipeline. Numeric fields are
/// strings because callers hand us JSON produced by agents; validation
/// happens in [`TransactionRequest::check`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    /// Target address (0x-prefixed, 40 hex chars).
    pub to: String,

    /// Native value in wei (decimal or 0x-hex string). Defaults to zero.
    #[serde(default)]
    pub value: Option<String>,

    /// Calldata as a hex string, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    /// Chain identifier.
    pub chain_id: u64,

    /// Gas price in wei (decimal or 0x-hex string), if specified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<String>,

    /// Transaction nonce, if specified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
}

/// A validated transaction with strongly-typed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedTransaction {
    pub to: Address,
    pub value: U256,
    pub data: Option<Bytes>,
    pub chain_id: u64,
    pub gas_price: Option<U256>,
    pub nonce: Option<u64>,
}

impl TransactionRequest {
    /// Create a request with just a target and value (test and builder use).
    pub fn new(to: impl Into<String>, value_wei: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            value: Some(value_wei.into()),
            data: None,
            chain_id: 1,
            gas_price: None,
            nonce: None,
        }
    }

    /// Attach calldata.
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the chain id.
    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    /// Set the gas price in wei.
    pub fn with_gas_price(mut self, gas_price: impl Into<String>) -> Self {
        self.gas_price = Some(gas_price.into());
        self
    }

    /// Validate the request and produce a typed transaction.
    ///
    /// Enforces: `to` is `0x` + 40 hex chars, `value` and `gas_price` parse
    /// as unsigned 256-bit integers, `data` (if present) is valid hex, and
    /// the chain id is positive.
    pub fn check(&self) -> WardexResult<CheckedTransaction> {
        let to = parse_address(&self.to)?;

        let value = match self.value.as_deref() {
            Some(s) if !s.is_empty() => parse_u256(s)
                .map_err(|e| WardexError::InvalidTransaction(format!("bad value: {e}")))?,
            _ => U256::ZERO,
        };

        let data = match self.data.as_deref() {
            Some(s) if !s.is_empty() => {
                let stripped = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(stripped).map_err(|e| {
                    WardexError::InvalidTransaction(format!("bad calldata hex: {e}"))
                })?;
                Some(Bytes::from(bytes))
            }
            _ => None,
        };

        if self.chain_id == 0 {
            return Err(WardexError::InvalidTransaction(
                "chain id must be positive".to_string(),
            ));
        }

        let gas_price = match self.gas_price.as_deref() {
            Some(s) if !s.is_empty() => Some(
                parse_u256(s)
                    .map_err(|e| WardexError::InvalidTransaction(format!("bad gas price: {e}")))?,
            ),
            _ => None,
        };

        Ok(CheckedTransaction {
            to,
            value,
            data,
            chain_id: self.chain_id,
            gas_price,
            nonce: self.nonce,
        })
    }
}

fn parse_address(s: &str) -> WardexResult<Address> {
    let valid = s.len() == 42
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(WardexError::InvalidTransaction(format!(
            "malformed target address: {s:?}"
        )));
    }
    Address::from_str(s)
        .map_err(|e| WardexError::InvalidTransaction(format!("malformed target address: {e}")))
}

fn parse_u256(s: &str) -> Result<U256, String> {
    let result = if let Some(hex_part) = s.strip_prefix("0x") {
        U256::from_str_radix(hex_part, 16)
    } else {
        U256::from_str_radix(s, 10)
    };
    result.map_err(|e| e.to_string())
}

/// Result of calldata inspection by the decoder stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedTransaction {
    /// Canonical signature of the recognized function, e.g.
    /// `approve(address,uint256)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,

    /// Raw 32-byte parameter words following the selector.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub params: Vec<U256>,

    /// Whether this call grants spending rights.
    pub is_approval: bool,

    /// Whether this call moves tokens.
    pub is_transfer: bool,

    /// Whether native value is attached.
    pub involves_eth: bool,

    /// Estimated USD at risk, written by the value assessor.
    pub estimated_value_usd: f64,

    /// Approval amount, when the call is `approve(address,uint256)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_amount: Option<U256>,

    /// Token amount moved, for transfer-shaped calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_amount: Option<U256>,
}
