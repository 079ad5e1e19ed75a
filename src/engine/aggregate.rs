//! Risk aggregator stage.
//!
//! Folds the accumulated findings into the three component scores, computes
//! the weighted composite, and resolves which policy tier governs the
//! transaction. Must run after every scoring stage and before the policy
//! stage.

use async_trait::async_trait;

use crate::domain::{ReasonSource, SecurityTierConfig};
use crate::engine::pipeline::{EvaluationContext, Middleware, Next, PipelineError};

const WEIGHT_CONTEXT: f64 = 0.40;
const WEIGHT_TRANSACTION: f64 = 0.35;
const WEIGHT_BEHAVIORAL: f64 = 0.25;

/// A single component at or above this raises the composite floor.
const COMPONENT_ALARM: u8 = 90;
/// Composite floor applied when a component alarms.
const COMPOSITE_FLOOR: u8 = 80;

/// Stage 8: score aggregation and tier resolution.
pub struct RiskAggregator;

impl RiskAggregator {
    pub fn new() -> Self {
        Self
    }

    fn severity_sum(ctx: &EvaluationContext, sources: &[ReasonSource]) -> u8 {
        let sum: u32 = ctx
            .reasons
            .iter()
            .filter(|r| sources.contains(&r.source))
            .map(|r| r.severity.weight())
            .sum();
        sum.min(100) as u8
    }

    fn transaction_score(ctx: &EvaluationContext) -> u8 {
        if ctx.has_reason("DENYLISTED_ADDRESS") {
            return 100;
        }
        if ctx.allowlisted {
            // Allowlisting zeroes the address component; transaction-shape
            // findings (approvals, batching) still count.
            return Self::severity_sum(ctx, &[ReasonSource::Transaction]);
        }
        Self::severity_sum(
            ctx,
            &[
                ReasonSource::Transaction,
                ReasonSource::Address,
                ReasonSource::Contract,
            ],
        )
    }

    fn composite(context: u8, transaction: u8, behavioral: u8) -> u8 {
        let weighted = WEIGHT_CONTEXT * context as f64
            + WEIGHT_TRANSACTION * transaction as f64
            + WEIGHT_BEHAVIORAL * behavioral as f64;
        let mut composite = weighted.round().clamp(0.0, 100.0) as u8;
        if context >= COMPONENT_ALARM
            || transaction >= COMPONENT_ALARM
            || behavioral >= COMPONENT_ALARM
        {
            composite = composite.max(COMPOSITE_FLOOR);
        }
        composite
    }

    /// Tier resolution order: explicit address triggers, then explicit
    /// function-signature triggers, then value bands by descending minimum
    /// (so an exact boundary lands in the higher tier). Falls back to the
    /// lowest tier.
    fn resolve_tier(ctx: &EvaluationContext) -> Option<SecurityTierConfig> {
        let tiers = &ctx.policy.tiers;

        if let Some(tier) = tiers
            .iter()
            .find(|t| t.triggers.target_addresses.contains(&ctx.tx.to))
        {
            return Some(tier.clone());
        }

        if let Some(signature) = ctx
            .decoded
            .as_ref()
            .and_then(|d| d.function_name.as_deref())
        {
            if let Some(tier) = tiers
                .iter()
                .find(|t| t.triggers.function_signatures.iter().any(|s| s == signature))
            {
                return Some(tier.clone());
            }
        }

        let estimated = ctx
            .decoded
            .as_ref()
            .map(|d| d.estimated_value_usd)
            .unwrap_or(0.0);

        let mut by_min: Vec<&SecurityTierConfig> = tiers.iter().collect();
        by_min.sort_by(|a, b| {
            b.triggers
                .min_value_at_risk_usd
                .total_cmp(&a.triggers.min_value_at_risk_usd)
        });
        for tier in by_min {
            if estimated >= tier.triggers.min_value_at_risk_usd
                && estimated < tier.triggers.max_value_at_risk_usd
            {
                return Some(tier.clone());
            }
        }

        ctx.policy.lowest_tier().cloned()
    }
}

impl Default for RiskAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for RiskAggregator {
    fn name(&self) -> &'static str {
        "risk_aggregator"
    }

    async fn handle(
        &self,
        ctx: &mut EvaluationContext,
        next: &mut Next<'_>,
    ) -> Result<(), PipelineError> {
        ctx.risk_scores.transaction = Self::transaction_score(ctx);
        ctx.risk_scores.behavioral = Self::severity_sum(ctx, &[ReasonSource::Behavioral]);
        ctx.risk_scores.composite = Self::composite(
            ctx.risk_scores.context,
            ctx.risk_scores.transaction,
            ctx.risk_scores.behavioral,
        );
        ctx.matched_tier = Self::resolve_tier(ctx);

        next.run(ctx).await
    }
}
