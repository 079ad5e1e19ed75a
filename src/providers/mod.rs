//! Intelligence provider interfaces.
//!
//! The shield treats address reputation and contract analysis as opaque
//! capabilities: live explorer clients, cached layers, and test stubs all
//! implement the same traits. Provider failure is informational, never
//! blocking; the shield degrades gracefully without the data.

use alloy_primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{WardexError, WardexResult};

/// What is known about an address.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressReputation {
    /// Whether code is deployed at the address.
    pub is_contract: bool,
    /// Age of the address in days, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_days: Option<u32>,
    /// Historical transaction count, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_count: Option<u64>,
    /// Provider-reported risk factors, one reason each.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_factors: Vec<String>,
}

/// What is known about a contract's code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractAnalysis {
    pub verified: bool,
    pub has_selfdestruct: bool,
    pub has_delegatecall: bool,
    pub is_proxy: bool,
    pub allows_infinite_approval: bool,
    /// Provider-supplied custom findings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_findings: Vec<String>,
}

/// Capability interface for address reputation lookups.
#[async_trait]
pub trait AddressReputationProvider: Send + Sync {
    async fn reputation(&self, chain_id: u64, address: Address)
        -> WardexResult<AddressReputation>;
}

/// Capability interface for contract analysis.
#[async_trait]
pub trait ContractAnalysisProvider: Send + Sync {
    async fn analyze(&self, chain_id: u64, address: Address) -> WardexResult<ContractAnalysis>;
}

/// In-memory reputation provider for tests and offline operation.
#[derive(Default)]
pub struct StaticReputationProvider {
    entries: HashMap<(u64, Address), AddressReputation>,
}

impl StaticReputationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chain_id: u64, address: Address, reputation: AddressReputation) {
        self.entries.insert((chain_id, address), reputation);
    }
}

#[async_trait]
impl AddressReputationProvider for StaticReputationProvider {
    async fn reputation(
        &self,
        chain_id: u64,
        address: Address,
    ) -> WardexResult<AddressReputation> {
        self.entries
            .get(&(chain_id, address))
            .cloned()
            .ok_or_else(|| WardexError::Provider(format!("no reputation data for {address}")))
    }
}

/// In-memory contract analyzer for tests and offline operation.
#[derive(Default)]
pub struct StaticContractAnalyzer {
    entries: HashMap<(u64, Address), ContractAnalysis>,
}

impl StaticContractAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chain_id: u64, address: Address, analysis: ContractAnalysis) {
        self.entries.insert((chain_id, address), analysis);
    }
}

#[async_trait]
impl ContractAnalysisProvider for StaticContractAnalyzer {
    async fn analyze(&self, chain_id: u64, address: Address) -> WardexResult<ContractAnalysis> {
        self.entries
            .get(&(chain_id, address))
            .cloned()
            .ok_or_else(|| WardexError::Provider(format!("no analysis data for {address}")))
    }
}

/// EIP-1167 minimal proxy: creation-independent runtime prefix, then the
/// 20-byte implementation address, then the fixed suffix.
const EIP1167_PREFIX: [u8; 10] = [0x36, 0x3d, 0x3d, 0x37, 0x3d, 0x3d, 0x3d, 0x36, 0x3d, 0x73];
const EIP1167_SUFFIX: [u8; 15] = [
    0x5a, 0xf4, 0x3d, 0x82, 0x80, 0x3e, 0x90, 0x3d, 0x91, 0x60, 0x2b, 0x57, 0xfd, 0x5b, 0xf3,
];

/// EIP-1967 implementation slot constant:
/// keccak256("eip1967.proxy.implementation") - 1.
const EIP1967_IMPLEMENTATION_SLOT: [u8; 32] = [
    0x36, 0x08, 0x94, 0xa1, 0x3b, 0xa1, 0xa3, 0x21, 0x06, 0x67, 0xc8, 0x28, 0x49, 0x2d, 0xb9,
    0x8d, 0xca, 0x3e, 0x20, 0x76, 0xcc, 0x37, 0x35, 0xa9, 0x20, 0xa3, 0xca, 0x50, 0x5d, 0x38,
    0x2b, 0xbc,
];

const OP_SELFDESTRUCT: u8 = 0xff;
const OP_DELEGATECALL: u8 = 0xf4;
const OP_CALLCODE: u8 = 0xf2;

/// Findings from a local bytecode scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BytecodeFindings {
    pub has_selfdestruct: bool,
    pub has_delegatecall: bool,
    pub has_callcode: bool,
    /// Implementation target when the code is an EIP-1167 minimal proxy.
    pub minimal_proxy_target: Option<Address>,
    /// Whether the code references the EIP-1967 implementation slot.
    pub references_eip1967_slot: bool,
}

impl BytecodeFindings {
    pub fn is_proxy(&self) -> bool {
        self.minimal_proxy_target.is_some() || self.references_eip1967_slot
    }
}

/// Scan runtime bytecode for dangerous opcodes and proxy signatures.
///
/// Walks the instruction stream, skipping PUSH immediates so data bytes do
/// not count as opcodes. The EIP-1167 and EIP-1967 checks work on the raw
/// byte string since those are literal patterns.
pub fn inspect_bytecode(code: &[u8]) -> BytecodeFindings {
    let mut findings = BytecodeFindings::default();

    let mut i = 0;
    while i < code.len() {
        let op = code[i];
        match op {
            // PUSH1..PUSH32 carry 1..32 immediate bytes.
            0x60..=0x7f => {
                i += 1 + (op - 0x5f) as usize;
                continue;
            }
            OP_SELFDESTRUCT => findings.has_selfdestruct = true,
            OP_DELEGATECALL => findings.has_delegatecall = true,
            OP_CALLCODE => findings.has_callcode = true,
            _ => {}
        }
        i += 1;
    }

    if let Some(target) = minimal_proxy_target(code) {
        findings.minimal_proxy_target = Some(target);
    }
    findings.references_eip1967_slot = contains_slice(code, &EIP1967_IMPLEMENTATION_SLOT);

    findings
}

fn minimal_proxy_target(code: &[u8]) -> Option<Address> {
    let expected_len = EIP1167_PREFIX.len() + 20 + EIP1167_SUFFIX.len();
    if code.len() < expected_len || !code.starts_with(&EIP1167_PREFIX) {
        return None;
    }
    let target_start = EIP1167_PREFIX.len();
    let suffix_start = target_start + 20;
    if &code[suffix_start..suffix_start + EIP1167_SUFFIX.len()] != EIP1167_SUFFIX {
        return None;
    }
    Some(Address::from_slice(&code[target_start..suffix_start]))
}

fn contains_slice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

impl ContractAnalysis {
    /// Derive an (unverified) analysis from local bytecode inspection.
    pub fn from_bytecode(code: &[u8]) -> Self {
        let findings = inspect_bytecode(code);
        Self {
            verified: false,
            has_selfdestruct: findings.has_selfdestruct,
            has_delegatecall: findings.has_delegatecall || findings.has_callcode,
            is_proxy: findings.is_proxy(),
            allows_infinite_approval: false,
            custom_findings: Vec::new(),
        }
    }
}
