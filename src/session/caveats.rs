//! Caveat mapping for on-chain delegation frameworks.
//!
//! Session constraints translate deterministically into enforcer terms:
//! each limit becomes one (enforcer, ABI-encoded terms) pair that an
//! on-chain delegation manager can enforce independently of this process.

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};

use super::SessionConstraints;
use crate::engine::safe_delegation_selectors;

/// Seconds in the native-token spending period.
const PERIOD_SECONDS: u64 = 86_400;

/// One enforcer term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaveatTerm {
    /// Enforcer name, e.g. `AllowedTargets`.
    pub enforcer: String,
    /// ABI-encoded terms, 0x-prefixed hex.
    pub terms: String,
}

impl CaveatTerm {
    fn new(enforcer: &str, terms: Vec<u8>) -> Self {
        Self {
            enforcer: enforcer.to_string(),
            terms: format!("0x{}", hex::encode(terms)),
        }
    }
}

/// Map session constraints onto enforcer terms.
///
/// The `AllowedMethods` selector allowlist is emitted only when the session
/// forbids infinite approvals; it pins the delegation to transfer, swap and
/// batching selectors, with approval-granting selectors excluded.
pub fn caveats_for(constraints: &SessionConstraints, now: DateTime<Utc>) -> Vec<CaveatTerm> {
    let expires = now.timestamp().max(0) as u64 + constraints.duration_seconds;

    let mut caveats = vec![
        CaveatTerm::new(
            "AllowedTargets",
            encode_address_array(&constraints.allowed_contracts),
        ),
        CaveatTerm::new("ValueLte", encode_word(constraints.max_value_per_tx)),
        CaveatTerm::new(
            "NativeTokenPeriod",
            encode_pair(constraints.max_daily_volume, U256::from(PERIOD_SECONDS)),
        ),
        CaveatTerm::new(
            "Timestamp",
            encode_pair(U256::ZERO, U256::from(expires)),
        ),
    ];

    if constraints.forbid_infinite_approvals {
        caveats.push(CaveatTerm::new(
            "AllowedMethods",
            encode_selector_array(&safe_delegation_selectors()),
        ));
    }

    caveats
}

fn encode_word(value: U256) -> Vec<u8> {
    value.to_be_bytes::<32>().to_vec()
}

fn encode_pair(a: U256, b: U256) -> Vec<u8> {
    let mut out = encode_word(a);
    out.extend(encode_word(b));
    out
}

fn encode_address_array(addresses: &[Address]) -> Vec<u8> {
    let mut out = encode_word(U256::from(0x20));
    out.extend(encode_word(U256::from(addresses.len())));
    for address in addresses {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(address.as_slice());
        out.extend(word);
    }
    out
}

fn encode_selector_array(selectors: &[[u8; 4]]) -> Vec<u8> {
    let mut out = encode_word(U256::from(0x20));
    out.extend(encode_word(U256::from(selectors.len())));
    for selector in selectors {
        // bytes4 is left-aligned in its word.
        let mut word = [0u8; 32];
        word[..4].copy_from_slice(selector);
        out.extend(word);
    }
    out
}
