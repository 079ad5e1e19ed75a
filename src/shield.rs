//! Shield orchestrator.
//!
//! Owns the policy, the frozen flag, counters, the daily volume ledger, and
//! the audit ring; runs the evaluation pipeline per request. The shield
//! never raises from `evaluate`: malformed input, pipeline invariant
//! violations, and provider failures all terminate in a verdict, possibly a
//! synthetic block. Auto-freeze trips when the recent audit window shows a
//! burst of blocks, which is what an active attack looks like.

use alloy_primitives::U256;
use chrono::{Datelike, DateTime, Utc};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    AuditEntry, AuditLog, ContextSummary, ConversationContext, Decision, ReasonSource,
    RequiredAction, SecurityPolicy, SecurityReason, SecurityVerdict, Severity,
    TransactionRequest,
};
use crate::engine::{
    AddressChecker, BehavioralComparator, ContextAnalyzer, ContractChecker, EvaluationContext,
    Middleware, Pipeline, PolicyStage, RiskAggregator, TransactionDecoder, ValueAssessor,
    ValueAssessorConfig,
};
use crate::error::WardexResult;
use crate::filter::OutputFilter;
use crate::providers::{AddressReputationProvider, ContractAnalysisProvider};

/// Capacity of the audit ring.
const AUDIT_CAPACITY: usize = 10_000;
/// Auto-freeze window and trip count: freeze when at least `TRIP` of the
/// latest `WINDOW` audited evaluations were blocking.
const AUTO_FREEZE_WINDOW: usize = 10;
const AUTO_FREEZE_TRIP: usize = 5;

type VerdictCallback = Box<dyn Fn(&SecurityVerdict) + Send + Sync>;
type FreezeCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Best-effort operator callbacks. Panics inside a handler are contained
/// and never affect the verdict.
#[derive(Default)]
pub struct ShieldCallbacks {
    pub on_block: Option<VerdictCallback>,
    pub on_advisory: Option<VerdictCallback>,
    pub on_threat: Option<VerdictCallback>,
    pub on_freeze: Option<FreezeCallback>,
}

/// Point-in-time operational snapshot.
#[derive(Debug, Clone)]
pub struct ShieldStatus {
    pub evaluations: u64,
    pub blocks: u64,
    pub advisories: u64,
    pub frozen: bool,
    pub freeze_reason: Option<String>,
    pub daily_volume_wei: U256,
    pub audit_entries: usize,
    pub signer_healthy: Option<bool>,
    pub intelligence_at: Option<DateTime<Utc>>,
}

struct ShieldState {
    policy: Arc<SecurityPolicy>,
    frozen: bool,
    freeze_reason: Option<String>,
    evaluations: u64,
    blocks: u64,
    advisories: u64,
    daily_volume_wei: U256,
    volume_day: i32,
    audit: AuditLog,
    signer_healthy: Option<bool>,
    intelligence_at: Option<DateTime<Utc>>,
    /// Blocking entries at or before this moment no longer arm auto-freeze.
    /// Set by `unfreeze` so service actually resumes.
    freeze_cutoff: Option<DateTime<Utc>>,
}

impl ShieldState {
    fn roll_day(&mut self, now: DateTime<Utc>) {
        let day = now.date_naive().num_days_from_ce();
        if day != self.volume_day {
            self.volume_day = day;
            self.daily_volume_wei = U256::ZERO;
        }
    }
}

/// Builder for [`AgentShield`].
pub struct AgentShieldBuilder {
    policy: SecurityPolicy,
    value_config: ValueAssessorConfig,
    reputation_provider: Option<Arc<dyn AddressReputationProvider>>,
    contract_provider: Option<Arc<dyn ContractAnalysisProvider>>,
    custom_middleware: Vec<Box<dyn Middleware>>,
    callbacks: ShieldCallbacks,
}

impl AgentShieldBuilder {
    pub fn new() -> Self {
        Self {
            policy: SecurityPolicy::default(),
            value_config: ValueAssessorConfig::default(),
            reputation_provider: None,
            contract_provider: None,
            custom_middleware: Vec::new(),
            callbacks: ShieldCallbacks::default(),
        }
    }

    pub fn policy(mut self, policy: SecurityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn value_config(mut self, config: ValueAssessorConfig) -> Self {
        self.value_config = config;
        self
    }

    pub fn reputation_provider(mut self, provider: Arc<dyn AddressReputationProvider>) -> Self {
        self.reputation_provider = Some(provider);
        self
    }

    pub fn contract_provider(mut self, provider: Arc<dyn ContractAnalysisProvider>) -> Self {
        self.contract_provider = Some(provider);
        self
    }

    /// Register a custom middleware. Custom stages run after the built-in
    /// scoring stages and before aggregation.
    pub fn middleware(mut self, stage: Box<dyn Middleware>) -> Self {
        self.custom_middleware.push(stage);
        self
    }

    pub fn on_block(mut self, cb: VerdictCallback) -> Self {
        self.callbacks.on_block = Some(cb);
        self
    }

    pub fn on_advisory(mut self, cb: VerdictCallback) -> Self {
        self.callbacks.on_advisory = Some(cb);
        self
    }

    pub fn on_threat(mut self, cb: VerdictCallback) -> Self {
        self.callbacks.on_threat = Some(cb);
        self
    }

    pub fn on_freeze(mut self, cb: FreezeCallback) -> Self {
        self.callbacks.on_freeze = Some(cb);
        self
    }

    pub fn build(self) -> WardexResult<AgentShield> {
        self.policy.validate()?;

        let behavioral = Arc::new(BehavioralComparator::new());

        let mut stages: Vec<Box<dyn Middleware>> = vec![
            Box::new(ContextAnalyzer::new(self.value_config.native_price_usd)),
            Box::new(TransactionDecoder::new()),
            Box::new(ValueAssessor::new(self.value_config)),
            Box::new(AddressChecker::new(self.reputation_provider)),
            Box::new(ContractChecker::new(self.contract_provider)),
            Box::new(Arc::clone(&behavioral)),
        ];
        stages.extend(self.custom_middleware);
        stages.push(Box::new(RiskAggregator::new()));
        stages.push(Box::new(PolicyStage::new()));

        Ok(AgentShield {
            state: Mutex::new(ShieldState {
                policy: Arc::new(self.policy),
                frozen: false,
                freeze_reason: None,
                evaluations: 0,
                blocks: 0,
                advisories: 0,
                daily_volume_wei: U256::ZERO,
                volume_day: 0,
                audit: AuditLog::new(AUDIT_CAPACITY),
                signer_healthy: None,
                intelligence_at: None,
                freeze_cutoff: None,
            }),
            pipeline: Pipeline::new(stages),
            behavioral,
            filter: OutputFilter::new(),
            callbacks: self.callbacks,
        })
    }
}

impl Default for AgentShieldBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The security mediator: evaluates every proposed transaction and produces
/// a verdict before any signing material is touched.
pub struct AgentShield {
    state: Mutex<ShieldState>,
    pipeline: Pipeline,
    behavioral: Arc<BehavioralComparator>,
    filter: OutputFilter,
    callbacks: ShieldCallbacks,
}

impl AgentShield {
    pub fn builder() -> AgentShieldBuilder {
        AgentShieldBuilder::new()
    }

    /// Evaluate one proposed transaction. Never raises; every failure mode
    /// folds into the returned verdict.
    pub async fn evaluate(
        &self,
        request: &TransactionRequest,
        context: Option<&ConversationContext>,
    ) -> SecurityVerdict {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        if state.frozen {
            let reason = state
                .freeze_reason
                .clone()
                .unwrap_or_else(|| "shield is frozen".to_string());
            let mut verdict = SecurityVerdict::frozen(reason, now);
            self.sanitize(&mut verdict);
            state.evaluations += 1;
            state.blocks += 1;
            Self::push_audit(&mut state, request, context, &verdict);
            drop(state);
            self.fire_verdict(&self.callbacks.on_block, &verdict);
            return verdict;
        }

        let checked = match request.check() {
            Ok(checked) => checked,
            Err(e) => {
                let mut verdict =
                    SecurityVerdict::synthetic_block("INVALID_TRANSACTION", e.to_string(), now);
                self.sanitize(&mut verdict);
                state.evaluations += 1;
                state.blocks += 1;
                Self::push_audit(&mut state, request, context, &verdict);
                let freeze_note = Self::maybe_auto_freeze(&mut state);
                drop(state);
                self.fire_verdict(&self.callbacks.on_block, &verdict);
                self.fire_freeze(freeze_note);
                return verdict;
            }
        };

        let policy = Arc::clone(&state.policy);
        let mut ctx = EvaluationContext::new(checked, context.cloned(), policy, now);

        let pipeline_result = self.pipeline.dispatch(&mut ctx).await;
        let mut verdict = match pipeline_result {
            Ok(()) => match ctx.verdict.take() {
                Some(verdict) => verdict,
                None => SecurityVerdict::synthetic_block(
                    "PIPELINE_ERROR",
                    "pipeline completed without a verdict",
                    now,
                ),
            },
            Err(e) => {
                tracing::error!(error = %e, "pipeline invariant violation");
                SecurityVerdict::synthetic_block("PIPELINE_ERROR", e.to_string(), now)
            }
        };

        if ctx.reputation.is_some() || ctx.contract_analysis.is_some() {
            state.intelligence_at = Some(now);
        }

        // Daily volume is an orchestrator-level control: approved value
        // accrues, and crossing the limit retroactively blocks.
        if verdict.decision == Decision::Approve {
            state.roll_day(now);
            state.daily_volume_wei = state.daily_volume_wei.saturating_add(ctx.tx.value);
            if state.daily_volume_wei > state.policy.global_limits.max_daily_volume_wei {
                verdict.decision = Decision::Block;
                verdict.required_action = RequiredAction::HumanApproval;
                verdict.reasons.push(SecurityReason::new(
                    "DAILY_VOLUME_EXCEEDED",
                    "Cumulative approved volume exceeds the daily limit",
                    Severity::High,
                    ReasonSource::Policy,
                ));
            }
        }

        self.sanitize(&mut verdict);

        state.evaluations += 1;
        match verdict.decision {
            Decision::Block | Decision::Freeze => state.blocks += 1,
            Decision::Advise => state.advisories += 1,
            Decision::Approve => {}
        }

        if verdict.decision == Decision::Approve {
            let usd = ctx
                .decoded
                .as_ref()
                .map(|d| d.estimated_value_usd)
                .unwrap_or(0.0);
            self.behavioral.record_approved(ctx.tx.to, usd, now);
        }

        Self::push_audit(&mut state, request, context, &verdict);
        let freeze_note = Self::maybe_auto_freeze(&mut state);

        tracing::info!(
            evaluation_id = %verdict.evaluation_id,
            decision = %verdict.decision,
            composite = verdict.risk_score.composite,
            tier = %verdict.tier_id,
            reason_count = verdict.reasons.len(),
            "evaluation complete"
        );

        drop(state);

        match verdict.decision {
            Decision::Block | Decision::Freeze => {
                self.fire_verdict(&self.callbacks.on_block, &verdict)
            }
            Decision::Advise => self.fire_verdict(&self.callbacks.on_advisory, &verdict),
            Decision::Approve => {}
        }
        if verdict.has_critical_reason() {
            self.fire_verdict(&self.callbacks.on_threat, &verdict);
        }
        self.fire_freeze(freeze_note);

        verdict
    }

    /// Replace the active policy. Guardrails are validated first; on
    /// failure the previous policy stays in force.
    pub async fn update_policy(&self, policy: SecurityPolicy) -> WardexResult<()> {
        policy.validate()?;
        let mut state = self.state.lock().await;
        state.policy = Arc::new(policy);
        tracing::info!("security policy replaced");
        Ok(())
    }

    /// Manually freeze the shield.
    pub async fn freeze(&self, reason: &str) {
        let reason = self.filter.apply(reason);
        let mut state = self.state.lock().await;
        state.frozen = true;
        state.freeze_reason = Some(reason.clone());
        drop(state);
        tracing::warn!(reason = %reason, "shield frozen");
        self.fire_freeze(Some(reason));
    }

    /// Manually unfreeze the shield. Resets the auto-freeze detector so
    /// the block burst that caused the freeze is not counted again.
    pub async fn unfreeze(&self) {
        let mut state = self.state.lock().await;
        state.frozen = false;
        state.freeze_reason = None;
        state.freeze_cutoff = Some(Utc::now());
        tracing::info!("shield unfrozen");
    }

    pub async fn is_frozen(&self) -> bool {
        self.state.lock().await.frozen
    }

    /// Snapshot of the audit log; most recent `limit` entries when given.
    pub async fn audit_log(&self, limit: Option<usize>) -> Vec<AuditEntry> {
        let state = self.state.lock().await;
        match limit {
            Some(limit) => state.audit.tail(limit),
            None => state.audit.entries(),
        }
    }

    /// Mark an audited evaluation as executed.
    pub async fn mark_executed(&self, evaluation_id: Uuid) -> bool {
        self.state.lock().await.audit.mark_executed(evaluation_id)
    }

    /// Record the signer's most recent health probe result.
    pub async fn note_signer_health(&self, healthy: bool) {
        self.state.lock().await.signer_healthy = Some(healthy);
    }

    pub async fn status(&self) -> ShieldStatus {
        let state = self.state.lock().await;
        ShieldStatus {
            evaluations: state.evaluations,
            blocks: state.blocks,
            advisories: state.advisories,
            frozen: state.frozen,
            freeze_reason: state.freeze_reason.clone(),
            daily_volume_wei: state.daily_volume_wei,
            audit_entries: state.audit.len(),
            signer_healthy: state.signer_healthy,
            intelligence_at: state.intelligence_at,
        }
    }

    fn push_audit(
        state: &mut ShieldState,
        request: &TransactionRequest,
        context: Option<&ConversationContext>,
        verdict: &SecurityVerdict,
    ) {
        state.audit.push(AuditEntry {
            evaluation_id: verdict.evaluation_id,
            timestamp: verdict.timestamp,
            transaction: request.clone(),
            verdict: verdict.clone(),
            context_summary: context.map(ContextSummary::from_context),
            executed: false,
        });
    }

    /// Auto-freeze detection; runs after audit insertion so the triggering
    /// block counts itself. Returns the freeze note to report, if tripped.
    fn maybe_auto_freeze(state: &mut ShieldState) -> Option<String> {
        if state.frozen {
            return None;
        }
        let count = state
            .audit
            .recent_block_count(AUTO_FREEZE_WINDOW, state.freeze_cutoff);
        if count < AUTO_FREEZE_TRIP {
            return None;
        }
        let ids: Vec<String> = state
            .audit
            .recent_block_ids(AUTO_FREEZE_WINDOW, state.freeze_cutoff)
            .iter()
            .map(|id| id.to_string())
            .collect();
        let reason = format!(
            "auto-freeze: {count} blocking verdicts in the last {AUTO_FREEZE_WINDOW} \
             evaluations ({})",
            ids.join(", ")
        );
        state.frozen = true;
        state.freeze_reason = Some(reason.clone());
        tracing::warn!(block_count = count, "auto-freeze tripped");
        Some(reason)
    }

    /// Every outbound text field passes the output filter.
    fn sanitize(&self, verdict: &mut SecurityVerdict) {
        for reason in verdict.reasons.iter_mut() {
            reason.message = self.filter.apply(&reason.message);
        }
        for suggestion in verdict.suggestions.iter_mut() {
            *suggestion = self.filter.apply(suggestion);
        }
    }

    fn fire_verdict(&self, callback: &Option<VerdictCallback>, verdict: &SecurityVerdict) {
        if let Some(cb) = callback {
            if catch_unwind(AssertUnwindSafe(|| cb(verdict))).is_err() {
                tracing::warn!("verdict callback panicked");
            }
        }
    }

    fn fire_freeze(&self, reason: Option<String>) {
        let Some(reason) = reason else { return };
        if let Some(cb) = self.callbacks.on_freeze.as_ref() {
            if catch_unwind(AssertUnwindSafe(|| cb(&reason))).is_err() {
                tracing::warn!("freeze callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ALLOWED: &str = "0x1111111111111111111111111111111111111111";
    const OTHER: &str = "0x2222222222222222222222222222222222222222";

    fn allowlisting_policy() -> SecurityPolicy {
        let mut policy = SecurityPolicy::default();
        policy
            .allowlists
            .addresses
            .insert(Address::from_str(ALLOWED).unwrap());
        policy
    }

    fn shield() -> AgentShield {
        AgentShield::builder()
            .policy(allowlisting_policy())
            .build()
            .unwrap()
    }

    // 1 ETH lands in the guardian tier at the default $3000 price, so the
    // denylist's critical finding actually blocks (audit tiers observe only).
    fn denylisted_request() -> TransactionRequest {
        TransactionRequest::new(OTHER, "1000000000000000000")
    }

    fn denylisting_policy() -> SecurityPolicy {
        let mut policy = SecurityPolicy::default();
        policy
            .denylists
            .addresses
            .insert(Address::from_str(OTHER).unwrap());
        policy
    }

    #[tokio::test]
    async fn test_low_value_allowlisted_approves() {
        let shield = shield();
        let request = TransactionRequest::new(ALLOWED, "1000000000000000");
        let verdict = shield.evaluate(&request, None).await;

        assert_eq!(verdict.decision, Decision::Approve);
        assert!(verdict.risk_score.composite <= 20);
    }

    #[tokio::test]
    async fn test_invalid_address_synthetic_block() {
        let shield = shield();
        let request = TransactionRequest::new("0xnope", "0");
        let verdict = shield.evaluate(&request, None).await;

        assert_eq!(verdict.decision, Decision::Block);
        assert!(verdict.reasons.iter().any(|r| r.code == "INVALID_TRANSACTION"));

        // Still audited.
        assert_eq!(shield.audit_log(None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_counters_track_decisions() {
        let shield = AgentShield::builder()
            .policy(denylisting_policy())
            .build()
            .unwrap();

        shield
            .evaluate(&TransactionRequest::new(ALLOWED, "1000"), None)
            .await;
        shield.evaluate(&denylisted_request(), None).await;

        let status = shield.status().await;
        assert_eq!(status.evaluations, 2);
        assert_eq!(status.blocks, 1);
    }

    #[tokio::test]
    async fn test_manual_freeze_and_unfreeze() {
        let shield = shield();
        shield.freeze("manual investigation").await;
        assert!(shield.is_frozen().await);

        let verdict = shield
            .evaluate(&TransactionRequest::new(ALLOWED, "1000"), None)
            .await;
        assert_eq!(verdict.decision, Decision::Freeze);

        shield.unfreeze().await;
        assert!(!shield.is_frozen().await);
        let verdict = shield
            .evaluate(&TransactionRequest::new(ALLOWED, "1000"), None)
            .await;
        assert_eq!(verdict.decision, Decision::Approve);
    }

    #[tokio::test]
    async fn test_auto_freeze_after_block_burst() {
        let shield = AgentShield::builder()
            .policy(denylisting_policy())
            .build()
            .unwrap();

        for _ in 0..5 {
            let verdict = shield.evaluate(&denylisted_request(), None).await;
            assert_eq!(verdict.decision, Decision::Block);
        }

        assert!(shield.is_frozen().await);
        let status = shield.status().await;
        assert!(status.freeze_reason.as_deref().unwrap().contains("auto-freeze"));

        // Every further evaluation freezes until manual unfreeze.
        let verdict = shield
            .evaluate(&TransactionRequest::new(ALLOWED, "1000"), None)
            .await;
        assert_eq!(verdict.decision, Decision::Freeze);

        shield.unfreeze().await;
        let verdict = shield
            .evaluate(&TransactionRequest::new(ALLOWED, "1000"), None)
            .await;
        assert_eq!(verdict.decision, Decision::Approve);
    }

    #[tokio::test]
    async fn test_daily_volume_promotion() {
        let mut policy = allowlisting_policy();
        policy.global_limits.max_daily_volume_wei = U256::from(1_500_000_000_000_000u64);
        let shield = AgentShield::builder().policy(policy).build().unwrap();

        let request = TransactionRequest::new(ALLOWED, "1000000000000000");
        let first = shield.evaluate(&request, None).await;
        assert_eq!(first.decision, Decision::Approve);

        let second = shield.evaluate(&request, None).await;
        assert_eq!(second.decision, Decision::Block);
        assert!(second
            .reasons
            .iter()
            .any(|r| r.code == "DAILY_VOLUME_EXCEEDED"));
        assert_ne!(second.required_action, RequiredAction::None);

        let status = shield.status().await;
        assert_eq!(status.blocks, 1);
    }

    #[tokio::test]
    async fn test_update_policy_guardrails() {
        let shield = shield();
        let bad = SecurityPolicy {
            tiers: Vec::new(),
            ..SecurityPolicy::default()
        };
        assert!(shield.update_policy(bad).await.is_err());

        // Old policy still in force: allowlisted transfer still approves.
        let verdict = shield
            .evaluate(&TransactionRequest::new(ALLOWED, "1000"), None)
            .await;
        assert_eq!(verdict.decision, Decision::Approve);
    }

    #[tokio::test]
    async fn test_callbacks_fire_and_panics_are_contained() {
        static BLOCKS: AtomicUsize = AtomicUsize::new(0);

        let shield = AgentShield::builder()
            .policy(denylisting_policy())
            .on_block(Box::new(|_| {
                BLOCKS.fetch_add(1, Ordering::SeqCst);
                panic!("handler bug");
            }))
            .build()
            .unwrap();

        let verdict = shield.evaluate(&denylisted_request(), None).await;
        assert_eq!(verdict.decision, Decision::Block);
        assert_eq!(BLOCKS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mark_executed() {
        let shield = shield();
        let verdict = shield
            .evaluate(&TransactionRequest::new(ALLOWED, "1000"), None)
            .await;

        assert!(shield.mark_executed(verdict.evaluation_id).await);
        let log = shield.audit_log(None).await;
        assert!(log[0].executed);
    }

    #[tokio::test]
    async fn test_verdict_text_is_filtered() {
        // A hostile context plants a private key into a reason message via
        // the custom-pattern path; the filter must strip it on the way out.
        struct KeyLeaker;

        #[async_trait::async_trait]
        impl Middleware for KeyLeaker {
            fn name(&self) -> &'static str {
                "key_leaker"
            }

            async fn handle(
                &self,
                ctx: &mut EvaluationContext,
                next: &mut crate::engine::Next<'_>,
            ) -> Result<(), crate::engine::PipelineError> {
                ctx.push_reason(
                    "LEAKY",
                    format!("found key {}", "c".repeat(64)),
                    Severity::Info,
                    ReasonSource::Policy,
                );
                next.run(ctx).await
            }
        }

        let shield = AgentShield::builder()
            .policy(allowlisting_policy())
            .middleware(Box::new(KeyLeaker))
            .build()
            .unwrap();

        let verdict = shield
            .evaluate(&TransactionRequest::new(ALLOWED, "1000"), None)
            .await;
        let leaky = verdict.reasons.iter().find(|r| r.code == "LEAKY").unwrap();
        assert!(!leaky.message.contains("cccc"));
        assert!(leaky.message.contains("[REDACTED BY WARDEX]"));
    }

    #[tokio::test]
    async fn test_audit_context_summary_sanitized() {
        use crate::domain::{Message, MessageRole};

        let shield = shield();
        let context = ConversationContext::from_user(
            "alice",
            vec![Message::new(MessageRole::User, "send my transfer please")],
        );
        shield
            .evaluate(&TransactionRequest::new(ALLOWED, "1000"), Some(&context))
            .await;

        let log = shield.audit_log(None).await;
        let summary = log[0].context_summary.as_ref().unwrap();
        assert_eq!(summary.message_count, 1);
        let json = serde_json::to_string(summary).unwrap();
        assert!(!json.contains("transfer please"));
    }

    #[tokio::test]
    async fn test_audit_tail_limit() {
        let shield = shield();
        for _ in 0..5 {
            shield
                .evaluate(&TransactionRequest::new(ALLOWED, "1000"), None)
                .await;
        }
        assert_eq!(shield.audit_log(Some(2)).await.len(), 2);
        assert_eq!(shield.audit_log(None).await.len(), 5);
    }
}
