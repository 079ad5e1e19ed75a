//! Middleware pipeline.
//!
//! Evaluation is an ordered chain of stages operating on a shared mutable
//! `EvaluationContext`. Each stage does its work and then drives the
//! continuation (`Next`) exactly once; driving it twice is a programming
//! error detected at runtime. Order is load-bearing: later stages depend on
//! earlier decoded data, aggregation must follow all scoring stages, and
//! policy evaluation must come last.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::domain::{
    CheckedTransaction, ConversationContext, DecodedTransaction, ReasonSource, RiskScores,
    SecurityPolicy, SecurityReason, SecurityTierConfig, SecurityVerdict, Severity,
};
use crate::providers::{AddressReputation, ContractAnalysis};

/// Pipeline invariant violations. The shield folds these into a synthetic
/// block verdict with reason code `PIPELINE_ERROR`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("stage at index {0} drove its continuation twice")]
    NextCalledTwice(usize),

    #[error("pipeline completed without producing a verdict")]
    NoVerdict,
}

/// Mutable state threaded through the stages of one evaluation.
///
/// Each evaluation owns its context exclusively; the policy inside is an
/// immutable snapshot, which is what keeps custom middleware sandboxed.
pub struct EvaluationContext {
    /// The validated transaction under evaluation.
    pub tx: CheckedTransaction,
    /// Conversation context, when the caller supplied one.
    pub conversation: Option<ConversationContext>,
    /// Immutable policy snapshot for this evaluation.
    pub policy: Arc<SecurityPolicy>,
    /// Accumulated findings.
    pub reasons: Vec<SecurityReason>,
    /// Partial risk scores; the aggregator completes them.
    pub risk_scores: RiskScores,
    /// Tier matched by the aggregator.
    pub matched_tier: Option<SecurityTierConfig>,
    /// Calldata inspection result.
    pub decoded: Option<DecodedTransaction>,
    /// Address reputation, when a provider supplied it.
    pub reputation: Option<AddressReputation>,
    /// Contract analysis, when a provider supplied it.
    pub contract_analysis: Option<ContractAnalysis>,
    /// Whether the target is on an allowlist; suppresses escalations.
    pub allowlisted: bool,
    /// Evaluation start time; all window math keys off this.
    pub now: DateTime<Utc>,
    /// Free-form inter-stage scratch space.
    pub metadata: HashMap<String, serde_json::Value>,
    /// The verdict slot. Written by the policy stage only; any earlier
    /// write is tampering.
    pub verdict: Option<SecurityVerdict>,
}

impl EvaluationContext {
    pub fn new(
        tx: CheckedTransaction,
        conversation: Option<ConversationContext>,
        policy: Arc<SecurityPolicy>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tx,
            conversation,
            policy,
            reasons: Vec::new(),
            risk_scores: RiskScores::default(),
            matched_tier: None,
            decoded: None,
            reputation: None,
            contract_analysis: None,
            allowlisted: false,
            now,
            metadata: HashMap::new(),
            verdict: None,
        }
    }

    /// Record a finding.
    pub fn push_reason(
        &mut self,
        code: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        source: ReasonSource,
    ) {
        self.reasons
            .push(SecurityReason::new(code, message, severity, source));
    }

    /// Whether a finding with the given code was recorded.
    pub fn has_reason(&self, code: &str) -> bool {
        self.reasons.iter().any(|r| r.code == code)
    }
}

/// One stage of the evaluation pipeline.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stable stage name, used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Do this stage's work, then drive `next` exactly once.
    async fn handle(
        &self,
        ctx: &mut EvaluationContext,
        next: &mut Next<'_>,
    ) -> Result<(), PipelineError>;
}

#[async_trait]
impl<T: Middleware> Middleware for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn handle(
        &self,
        ctx: &mut EvaluationContext,
        next: &mut Next<'_>,
    ) -> Result<(), PipelineError> {
        (**self).handle(ctx, next).await
    }
}

/// Continuation handle advancing the pipeline by index.
pub struct Next<'a> {
    stages: &'a [Box<dyn Middleware>],
    index: usize,
    dispatched: &'a Mutex<Vec<bool>>,
}

impl<'a> Next<'a> {
    /// Dispatch the remainder of the pipeline.
    pub fn run<'b>(
        &'b mut self,
        ctx: &'b mut EvaluationContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'b>>
    where
        'a: 'b,
    {
        Box::pin(async move {
            {
                let mut dispatched = self
                    .dispatched
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if dispatched[self.index] {
                    return Err(PipelineError::NextCalledTwice(self.index));
                }
                dispatched[self.index] = true;
            }

            if self.index >= self.stages.len() {
                return Ok(());
            }

            let stage = &self.stages[self.index];
            tracing::trace!(stage = stage.name(), "dispatching pipeline stage");
            let mut next = Next {
                stages: self.stages,
                index: self.index + 1,
                dispatched: self.dispatched,
            };
            stage.handle(ctx, &mut next).await
        })
    }
}

/// Ordered composition of middleware stages.
pub struct Pipeline {
    stages: Vec<Box<dyn Middleware>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Middleware>>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in registration order. Succeeds only when all stages
    /// ran and a verdict landed in the context.
    pub async fn dispatch(&self, ctx: &mut EvaluationContext) -> Result<(), PipelineError> {
        // One guard slot per continuation point, including the terminal one.
        let dispatched = Mutex::new(vec![false; self.stages.len() + 1]);
        let mut next = Next {
            stages: &self.stages,
            index: 0,
            dispatched: &dispatched,
        };
        next.run(ctx).await?;

        if ctx.verdict.is_none() {
            return Err(PipelineError::NoVerdict);
        }
        Ok(())
    }
}
