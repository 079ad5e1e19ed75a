//! Contract checker stage.
//!
//! Runs only when the transaction carries calldata or reputation marked the
//! target as a contract. Surfaces destructive capabilities (selfdestruct,
//! delegatecall in unverified code), proxy indirection, and unverified
//! source, from whichever analysis tier the configured provider implements.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::{ReasonSource, Severity};
use crate::engine::pipeline::{EvaluationContext, Middleware, Next, PipelineError};
use crate::providers::ContractAnalysisProvider;

/// Stage 5: contract analysis.
pub struct ContractChecker {
    provider: Option<Arc<dyn ContractAnalysisProvider>>,
}

impl ContractChecker {
    pub fn new(provider: Option<Arc<dyn ContractAnalysisProvider>>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Middleware for ContractChecker {
    fn name(&self) -> &'static str {
        "contract_checker"
    }

    async fn handle(
        &self,
        ctx: &mut EvaluationContext,
        next: &mut Next<'_>,
    ) -> Result<(), PipelineError> {
        let looks_like_contract_call = ctx.tx.data.is_some()
            || ctx.reputation.as_ref().is_some_and(|r| r.is_contract);
        if !looks_like_contract_call {
            return next.run(ctx).await;
        }

        let Some(provider) = self.provider.as_ref() else {
            return next.run(ctx).await;
        };

        match provider.analyze(ctx.tx.chain_id, ctx.tx.to).await {
            Ok(analysis) => {
                let target = ctx.tx.to;
                let is_approval = ctx.decoded.as_ref().is_some_and(|d| d.is_approval);

                if analysis.has_selfdestruct {
                    ctx.push_reason(
                        "CONTRACT_SELFDESTRUCT",
                        format!("Contract {target} contains SELFDESTRUCT"),
                        Severity::Critical,
                        ReasonSource::Contract,
                    );
                }
                if analysis.has_delegatecall && !analysis.verified {
                    ctx.push_reason(
                        "CONTRACT_UNSAFE_DELEGATECALL",
                        format!("Unverified contract {target} uses DELEGATECALL"),
                        Severity::High,
                        ReasonSource::Contract,
                    );
                }
                if ctx.allowlisted {
                    // Allowlisted contracts keep only the findings above;
                    // verification and approval nits are escalations.
                    ctx.contract_analysis = Some(analysis);
                    return next.run(ctx).await;
                }
                if analysis.is_proxy && !analysis.verified {
                    ctx.push_reason(
                        "CONTRACT_UNVERIFIED_PROXY",
                        format!("Contract {target} is a proxy with unverified implementation"),
                        Severity::High,
                        ReasonSource::Contract,
                    );
                } else if !analysis.verified {
                    ctx.push_reason(
                        "CONTRACT_UNVERIFIED",
                        format!("Contract {target} source is not verified"),
                        Severity::Medium,
                        ReasonSource::Contract,
                    );
                }
                if analysis.allows_infinite_approval && is_approval {
                    ctx.push_reason(
                        "CONTRACT_ALLOWS_INFINITE_APPROVAL",
                        format!("Contract {target} is known to accept unlimited approvals"),
                        Severity::Medium,
                        ReasonSource::Contract,
                    );
                }
                for finding in &analysis.custom_findings {
                    ctx.push_reason(
                        "CONTRACT_RISK_PATTERN",
                        format!("Analysis flagged {target}: {finding}"),
                        Severity::High,
                        ReasonSource::Contract,
                    );
                }
                ctx.contract_analysis = Some(analysis);
            }
            Err(e) => {
                tracing::debug!(error = %e, address = %ctx.tx.to, "contract analysis failed");
                ctx.push_reason(
                    "INTELLIGENCE_UNAVAILABLE",
                    "Contract analysis service unavailable; continuing without it",
                    Severity::Info,
                    ReasonSource::Contract,
                );
            }
        }

        next.run(ctx).await
    }
}
