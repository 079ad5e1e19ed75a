//! Policy stage.
//!
//! The terminal stage: turns the matched tier's enforcement mode and the
//! accumulated findings into the verdict. Carries the innate-immunity
//! overrides (critical findings block everywhere except audit), checks the
//! global limits last, and stamps the verdict with a fresh evaluation id.

use async_trait::async_trait;
use alloy_primitives::U256;
use uuid::Uuid;

use crate::domain::{
    Decision, EnforcementMode, ReasonSource, RequiredAction, SecurityTierConfig, SecurityVerdict,
    Severity,
};
use crate::engine::pipeline::{EvaluationContext, Middleware, Next, PipelineError};

/// Fraction of the block threshold at which guardian mode starts advising.
const GUARDIAN_ADVISE_FRACTION: f64 = 0.6;

/// Stage 9: policy decision.
pub struct PolicyStage;

impl PolicyStage {
    pub fn new() -> Self {
        Self
    }

    fn base_decision(tier: &SecurityTierConfig, composite: u8) -> Decision {
        match tier.mode {
            EnforcementMode::Audit => Decision::Approve,
            EnforcementMode::Copilot => {
                if composite > 50 {
                    Decision::Advise
                } else {
                    Decision::Approve
                }
            }
            EnforcementMode::Guardian => {
                let advise_at =
                    (GUARDIAN_ADVISE_FRACTION * tier.block_threshold as f64).round() as u8;
                if composite >= tier.block_threshold {
                    Decision::Block
                } else if composite >= advise_at {
                    Decision::Advise
                } else {
                    Decision::Approve
                }
            }
            EnforcementMode::Fortress => Decision::Block,
        }
    }

    fn check_global_limits(ctx: &mut EvaluationContext) -> bool {
        let limits = ctx.policy.global_limits.clone();
        let mut violated = false;

        if ctx.tx.value > limits.max_transaction_value_wei {
            ctx.push_reason(
                "EXCEEDS_TX_LIMIT",
                format!(
                    "Value {} wei exceeds the global per-transaction limit",
                    ctx.tx.value
                ),
                Severity::High,
                ReasonSource::Policy,
            );
            violated = true;
        }

        let approval_amount = ctx.decoded.as_ref().and_then(|d| d.approval_amount);
        if approval_amount.is_some_and(|amount| amount > limits.max_approval_wei) {
            ctx.push_reason(
                "EXCEEDS_APPROVAL_LIMIT",
                "Approval amount exceeds the global approval limit",
                Severity::High,
                ReasonSource::Policy,
            );
            violated = true;
        }

        let gas_limit_wei = U256::from(limits.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        if ctx.tx.gas_price.is_some_and(|gas| gas > gas_limit_wei) {
            ctx.push_reason(
                "GAS_PRICE_EXCESSIVE",
                format!(
                    "Gas price exceeds the global limit of {} gwei",
                    limits.max_gas_price_gwei
                ),
                Severity::High,
                ReasonSource::Policy,
            );
            violated = true;
        }

        violated
    }

    fn suggestion_for(code: &str) -> Option<&'static str> {
        let suggestion = match code {
            "INFINITE_APPROVAL" | "EXCEEDS_APPROVAL_LIMIT" => {
                "Use a specific approval amount instead of an unlimited one"
            }
            "SET_APPROVAL_FOR_ALL" => {
                "Approve individual token ids instead of the whole collection"
            }
            "DENYLISTED_ADDRESS" => "Do not interact with this address",
            "NEW_ADDRESS" | "LOW_ACTIVITY_ADDRESS" => {
                "Verify the recipient address through an independent channel"
            }
            "CONTRACT_UNVERIFIED" | "CONTRACT_UNVERIFIED_PROXY" => {
                "Prefer contracts with verified source code"
            }
            "MULTICALL_DETECTED" => "Review each batched call individually before signing",
            "VALUE_ESCALATION" => "Slow down; values are rising quickly across requests",
            "EXCEEDS_TX_LIMIT" => "Split the transfer or raise the policy limit deliberately",
            "GAS_PRICE_EXCESSIVE" => "Re-check the gas price; it is far above the cap",
            "CONTEXT_INCOHERENT" => {
                "Confirm the user actually asked for this transaction"
            }
            code if code.starts_with("INJECTION_") || code == "CROSS_MCP_INJECTION" => {
                "Review the conversation for prompt injection before proceeding"
            }
            _ => return None,
        };
        Some(suggestion)
    }

    fn build_suggestions(ctx: &EvaluationContext) -> Vec<String> {
        let mut suggestions = Vec::new();
        for reason in &ctx.reasons {
            if let Some(s) = Self::suggestion_for(&reason.code) {
                if !suggestions.iter().any(|existing| existing == s) {
                    suggestions.push(s.to_string());
                }
            }
        }
        suggestions
    }
}

impl Default for PolicyStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for PolicyStage {
    fn name(&self) -> &'static str {
        "policy_engine"
    }

    async fn handle(
        &self,
        ctx: &mut EvaluationContext,
        next: &mut Next<'_>,
    ) -> Result<(), PipelineError> {
        // Only this stage may write the verdict slot. Anything already
        // there means an earlier (custom) stage tampered with it.
        let tampered = ctx.verdict.take().is_some();
        if tampered {
            ctx.push_reason(
                "MIDDLEWARE_VERDICT_TAMPER_BLOCKED",
                "A middleware wrote the verdict slot before policy evaluation",
                Severity::Critical,
                ReasonSource::Policy,
            );
        }

        let tier = match ctx.matched_tier.clone() {
            Some(tier) => tier,
            // The aggregator always resolves a tier; a missing one means the
            // pipeline was assembled wrong. Fail safe.
            None => {
                ctx.verdict = Some(SecurityVerdict::synthetic_block(
                    "PIPELINE_ERROR",
                    "no tier resolved before policy evaluation",
                    ctx.now,
                ));
                return next.run(ctx).await;
            }
        };

        let composite = ctx.risk_scores.composite;
        let mut decision = Self::base_decision(&tier, composite);

        // Innate immunity. Audit tiers observe everything and touch nothing.
        if tier.mode != EnforcementMode::Audit {
            if tampered || ctx.reasons.iter().any(|r| r.is_critical()) {
                decision = Decision::Block;
            } else if decision == Decision::Approve
                && ctx
                    .reasons
                    .iter()
                    .any(|r| r.source == ReasonSource::Context && r.severity >= Severity::High)
            {
                decision = Decision::Advise;
            }
        }

        // Global limits are checked last. Violations are always recorded as
        // findings; only the block consequence is withheld in audit mode.
        if Self::check_global_limits(ctx) && tier.mode != EnforcementMode::Audit {
            decision = Decision::Block;
        }

        let (required_action, delay_seconds) = match decision {
            Decision::Block => match (tier.mode, tier.time_lock_seconds) {
                (EnforcementMode::Fortress, Some(lock)) => (RequiredAction::Delay, Some(lock)),
                _ => (RequiredAction::HumanApproval, None),
            },
            _ => (RequiredAction::None, None),
        };

        let verdict = SecurityVerdict {
            decision,
            risk_score: ctx.risk_scores,
            reasons: ctx.reasons.clone(),
            suggestions: Self::build_suggestions(ctx),
            required_action,
            delay_seconds,
            timestamp: ctx.now,
            evaluation_id: Uuid::new_v4(),
            tier_id: tier.id.clone(),
            proof_hash: None,
        };

        tracing::debug!(
            evaluation_id = %verdict.evaluation_id,
            tier = %tier.id,
            mode = %tier.mode,
            composite = composite,
            decision = %decision,
            "policy decision"
        );

        ctx.verdict = Some(verdict);
        next.run(ctx).await
    }
}
