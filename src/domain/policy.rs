//! Security policy domain types.
//!
//! A policy is the operator's complete configuration of the shield: the
//! ordered tier set, allow and deny lists, global limits, and the knobs of
//! the behavioral and context-analysis stages. Policies are constructed at
//! startup and replaced atomically through `AgentShield::update_policy`,
//! which enforces guardrails first.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{WardexError, WardexResult};

/// Enforcement behavior of a matched tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// Observe and record only; never interfere.
    Audit,
    /// Advise on elevated risk, approve otherwise.
    Copilot,
    /// Block above the tier's threshold, advise when approaching it.
    Guardian,
    /// Block everything; release only via delay or human approval.
    Fortress,
}

impl std::fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnforcementMode::Audit => write!(f, "audit"),
            EnforcementMode::Copilot => write!(f, "copilot"),
            EnforcementMode::Guardian => write!(f, "guardian"),
            EnforcementMode::Fortress => write!(f, "fortress"),
        }
    }
}

/// Conditions under which a tier matches a transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierTriggers {
    /// Inclusive lower bound on estimated USD at risk.
    pub min_value_at_risk_usd: f64,
    /// Exclusive upper bound on estimated USD at risk.
    pub max_value_at_risk_usd: f64,
    /// Explicit target addresses; matching overrides value bands.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_addresses: Vec<Address>,
    /// Explicit function signatures, e.g. `approve(address,uint256)`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_signatures: Vec<String>,
}

/// One tier of the policy: triggers plus enforcement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityTierConfig {
    pub id: String,
    pub display_name: String,
    pub triggers: TierTriggers,
    pub mode: EnforcementMode,
    /// Composite score at which guardian mode blocks.
    pub block_threshold: u8,
    pub human_approval_required: bool,
    pub operator_notification: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_lock_seconds: Option<u64>,
    pub on_chain_proof_required: bool,
}

/// Addresses and protocols the operator explicitly trusts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Allowlists {
    #[serde(default)]
    pub addresses: HashSet<Address>,
    #[serde(default)]
    pub contracts: HashSet<Address>,
    #[serde(default)]
    pub protocols: Vec<String>,
}

impl Allowlists {
    /// Whether a target address appears on either allowlist.
    pub fn contains(&self, address: &Address) -> bool {
        self.addresses.contains(address) || self.contracts.contains(address)
    }
}

/// Addresses and patterns the operator explicitly forbids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Denylists {
    #[serde(default)]
    pub addresses: HashSet<Address>,
    /// Substring patterns matched against the decoded function signature.
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Hard limits applied regardless of tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalLimits {
    pub max_transaction_value_wei: U256,
    pub max_daily_volume_wei: U256,
    pub max_approval_wei: U256,
    pub max_gas_price_gwei: u64,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        let eth = U256::from(10).pow(U256::from(18));
        Self {
            max_transaction_value_wei: eth * U256::from(10),
            max_daily_volume_wei: eth * U256::from(50),
            max_approval_wei: U256::from(1) << 128,
            max_gas_price_gwei: 500,
        }
    }
}

/// Baseline-comparison sensitivity. Maps to a standard-deviation
/// multiplier: the lower the sensitivity, the wider the tolerance band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
}

impl Sensitivity {
    pub fn std_dev_multiplier(&self) -> f64 {
        match self {
            Sensitivity::Low => 4.0,
            Sensitivity::Medium => 2.5,
            Sensitivity::High => 1.5,
        }
    }
}

/// Behavioral comparison configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehavioralConfig {
    pub enabled: bool,
    pub learning_window_days: u32,
    pub sensitivity: Sensitivity,
}

impl Default for BehavioralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            learning_window_days: 7,
            sensitivity: Sensitivity::Medium,
        }
    }
}

/// Context-analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextConfig {
    pub injection_detection: bool,
    pub trust_evaluation: bool,
    pub coherence_check: bool,
    pub escalation_detection: bool,
    pub tool_output_scanning: bool,
    /// Operator-supplied regex patterns flagged at medium severity.
    #[serde(default)]
    pub custom_suspicious_patterns: Vec<String>,
    /// Keywords that keep the coherence heuristic satisfied. The heuristic
    /// wants at least one of these in the last five messages; tune the list
    /// rather than the check when false positives bite.
    #[serde(default = "default_crypto_keywords")]
    pub crypto_keywords: Vec<String>,
}

fn default_crypto_keywords() -> Vec<String> {
    [
        "wallet", "transaction", "transfer", "swap", "token", "eth", "gas", "approve",
        "contract", "bridge", "stake", "mint", "nft", "defi", "chain", "sign", "send",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            injection_detection: true,
            trust_evaluation: true,
            coherence_check: true,
            escalation_detection: true,
            tool_output_scanning: true,
            custom_suspicious_patterns: Vec::new(),
            crypto_keywords: default_crypto_keywords(),
        }
    }
}

/// The operator's complete shield configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicy {
    pub tiers: Vec<SecurityTierConfig>,
    #[serde(default)]
    pub allowlists: Allowlists,
    #[serde(default)]
    pub denylists: Denylists,
    #[serde(default)]
    pub global_limits: GlobalLimits,
    #[serde(default)]
    pub behavioral: BehavioralConfig,
    #[serde(default)]
    pub context: ContextConfig,
}

impl SecurityPolicy {
    /// Guardrail validation: a usable policy needs at least one tier and at
    /// least one tier that can actually block (guardian or fortress).
    pub fn validate(&self) -> WardexResult<()> {
        if self.tiers.is_empty() {
            return Err(WardexError::Policy(
                "policy must define at least one tier".to_string(),
            ));
        }
        let has_blocking_tier = self.tiers.iter().any(|t| {
            matches!(
                t.mode,
                EnforcementMode::Guardian | EnforcementMode::Fortress
            )
        });
        if !has_blocking_tier {
            return Err(WardexError::Policy(
                "policy must include at least one guardian or fortress tier".to_string(),
            ));
        }
        Ok(())
    }

    /// The tier with the lowest value band, used as the fallback match.
    pub fn lowest_tier(&self) -> Option<&SecurityTierConfig> {
        self.tiers.iter().min_by(|a, b| {
            a.triggers
                .min_value_at_risk_usd
                .total_cmp(&b.triggers.min_value_at_risk_usd)
        })
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            tiers: vec![
                SecurityTierConfig {
                    id: "observation".to_string(),
                    display_name: "Observation".to_string(),
                    triggers: TierTriggers {
                        min_value_at_risk_usd: 0.0,
                        max_value_at_risk_usd: 100.0,
                        target_addresses: Vec::new(),
                        function_signatures: Vec::new(),
                    },
                    mode: EnforcementMode::Audit,
                    block_threshold: 100,
                    human_approval_required: false,
                    operator_notification: false,
                    time_lock_seconds: None,
                    on_chain_proof_required: false,
                },
                SecurityTierConfig {
                    id: "copilot".to_string(),
                    display_name: "Copilot".to_string(),
                    triggers: TierTriggers {
                        min_value_at_risk_usd: 100.0,
                        max_value_at_risk_usd: 1_000.0,
                        target_addresses: Vec::new(),
                        function_signatures: Vec::new(),
                    },
                    mode: EnforcementMode::Copilot,
                    block_threshold: 90,
                    human_approval_required: false,
                    operator_notification: false,
                    time_lock_seconds: None,
                    on_chain_proof_required: false,
                },
                SecurityTierConfig {
                    id: "guardian".to_string(),
                    display_name: "Guardian".to_string(),
                    triggers: TierTriggers {
                        min_value_at_risk_usd: 1_000.0,
                        max_value_at_risk_usd: 100_000.0,
                        target_addresses: Vec::new(),
                        function_signatures: Vec::new(),
                    },
                    mode: EnforcementMode::Guardian,
                    block_threshold: 70,
                    human_approval_required: true,
                    operator_notification: true,
                    time_lock_seconds: None,
                    on_chain_proof_required: false,
                },
                SecurityTierConfig {
                    id: "fortress".to_string(),
                    display_name: "Fortress".to_string(),
                    triggers: TierTriggers {
                        min_value_at_risk_usd: 100_000.0,
                        max_value_at_risk_usd: f64::MAX,
                        target_addresses: Vec::new(),
                        function_signatures: Vec::new(),
                    },
                    mode: EnforcementMode::Fortress,
                    block_threshold: 0,
                    human_approval_required: true,
                    operator_notification: true,
                    time_lock_seconds: Some(3600),
                    on_chain_proof_required: false,
                },
            ],
            allowlists: Allowlists::default(),
            denylists: Denylists::default(),
            global_limits: GlobalLimits::default(),
            behavioral: BehavioralConfig::default(),
            context: ContextConfig::default(),
        }
    }
}
