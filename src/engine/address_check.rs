//! Address checker stage.
//!
//! Matches the normalized target against the policy's deny and allow lists,
//! then enriches with reputation intelligence when a provider is configured.
//! Intelligence failures degrade to an informational finding; they never
//! block an evaluation.

use async_trait::async_trait;
use std::sync::Arc;

use crate::engine::pipeline::{EvaluationContext, Middleware, Next, PipelineError};
use crate::domain::{ReasonSource, Severity};
use crate::providers::AddressReputationProvider;

/// Addresses younger than this are flagged as new.
const NEW_ADDRESS_AGE_DAYS: u32 = 7;
/// Addresses with fewer historical transactions are flagged as low-activity.
const LOW_ACTIVITY_TX_COUNT: u64 = 5;

/// Stage 4: target address checks.
pub struct AddressChecker {
    provider: Option<Arc<dyn AddressReputationProvider>>,
}

impl AddressChecker {
    pub fn new(provider: Option<Arc<dyn AddressReputationProvider>>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Middleware for AddressChecker {
    fn name(&self) -> &'static str {
        "address_checker"
    }

    async fn handle(
        &self,
        ctx: &mut EvaluationContext,
        next: &mut Next<'_>,
    ) -> Result<(), PipelineError> {
        // Address comparison is case-insensitive by construction: parsing
        // normalized the hex, and policy lists hold parsed addresses too.
        let target = ctx.tx.to;

        if ctx.policy.denylists.addresses.contains(&target) {
            ctx.push_reason(
                "DENYLISTED_ADDRESS",
                format!("Target {target} is on the operator denylist"),
                Severity::Critical,
                ReasonSource::Address,
            );
            return next.run(ctx).await;
        }

        if ctx.policy.allowlists.contains(&target) {
            ctx.allowlisted = true;
            // Allowlisted targets skip reputation escalation entirely.
            return next.run(ctx).await;
        }

        if let Some(provider) = self.provider.as_ref() {
            match provider.reputation(ctx.tx.chain_id, target).await {
                Ok(reputation) => {
                    if reputation.age_days.is_some_and(|age| age < NEW_ADDRESS_AGE_DAYS) {
                        ctx.push_reason(
                            "NEW_ADDRESS",
                            format!(
                                "Target {target} is younger than {NEW_ADDRESS_AGE_DAYS} days"
                            ),
                            Severity::Medium,
                            ReasonSource::Address,
                        );
                    }
                    if reputation
                        .transaction_count
                        .is_some_and(|count| count < LOW_ACTIVITY_TX_COUNT)
                    {
                        ctx.push_reason(
                            "LOW_ACTIVITY_ADDRESS",
                            format!(
                                "Target {target} has fewer than {LOW_ACTIVITY_TX_COUNT} \
                                 historical transactions"
                            ),
                            Severity::Low,
                            ReasonSource::Address,
                        );
                    }
                    for factor in &reputation.risk_factors {
                        ctx.push_reason(
                            "ADDRESS_RISK_FACTOR",
                            format!("Intelligence flagged {target}: {factor}"),
                            Severity::High,
                            ReasonSource::Address,
                        );
                    }
                    ctx.reputation = Some(reputation);
                }
                Err(e) => {
                    tracing::debug!(error = %e, address = %target, "reputation lookup failed");
                    ctx.push_reason(
                        "INTELLIGENCE_UNAVAILABLE",
                        "Address reputation service unavailable; continuing without it",
                        Severity::Info,
                        ReasonSource::Address,
                    );
                }
            }
        }

        next.run(ctx).await
    }
}
