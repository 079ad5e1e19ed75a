//! Behavioral comparator stage.
//!
//! Maintains a per-policy baseline of what normal activity looks like: USD
//! value distribution, active hours, known contracts, and transaction
//! frequency. The stage itself only reads; the shield feeds the baseline
//! after a verdict, and only with approved transactions, so a blocked
//! attacker cannot poison the profile. Anomalies are suppressed until the
//! learning window has elapsed.

use alloy_primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use crate::domain::{BehavioralConfig, ReasonSource, Severity};
use crate::engine::pipeline::{EvaluationContext, Middleware, Next, PipelineError};

/// Minimum samples before the value distribution is meaningful.
const MIN_SAMPLES: u64 = 5;
/// Frequency window length.
const FREQUENCY_WINDOW_MINUTES: i64 = 10;
/// Evaluations inside the frequency window that count as anomalous.
const FREQUENCY_LIMIT: usize = 10;

#[derive(Debug, Default)]
struct Baseline {
    started_at: Option<DateTime<Utc>>,
    count: u64,
    mean: f64,
    m2: f64,
    hour_counts: [u64; 24],
    known_contracts: HashSet<Address>,
    recent: VecDeque<DateTime<Utc>>,
}

impl Baseline {
    /// Welford update of the running value distribution.
    fn record_value(&mut self, usd: f64) {
        self.count += 1;
        let delta = usd - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (usd - self.mean);
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).sqrt()
    }
}

/// Stage 6: baseline comparison.
pub struct BehavioralComparator {
    baseline: Mutex<Baseline>,
}

impl BehavioralComparator {
    pub fn new() -> Self {
        Self {
            baseline: Mutex::new(Baseline::default()),
        }
    }

    /// Feed an approved transaction into the baseline. Called by the shield
    /// after the verdict; never during evaluation.
    pub fn record_approved(&self, target: Address, usd: f64, now: DateTime<Utc>) {
        let mut baseline = self
            .baseline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if baseline.started_at.is_none() {
            baseline.started_at = Some(now);
        }
        baseline.record_value(usd);
        baseline.hour_counts[now.hour() as usize] += 1;
        baseline.known_contracts.insert(target);

        let cutoff = now - Duration::minutes(FREQUENCY_WINDOW_MINUTES);
        baseline.recent.push_back(now);
        while baseline.recent.front().is_some_and(|t| *t < cutoff) {
            baseline.recent.pop_front();
        }
    }

    /// Number of approved transactions recorded so far.
    pub fn sample_count(&self) -> u64 {
        self.baseline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .count
    }
}

impl Default for BehavioralComparator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for BehavioralComparator {
    fn name(&self) -> &'static str {
        "behavioral_comparator"
    }

    async fn handle(
        &self,
        ctx: &mut EvaluationContext,
        next: &mut Next<'_>,
    ) -> Result<(), PipelineError> {
        let config: BehavioralConfig = ctx.policy.behavioral.clone();
        if !config.enabled {
            return next.run(ctx).await;
        }

        let usd = ctx
            .decoded
            .as_ref()
            .map(|d| d.estimated_value_usd)
            .unwrap_or(0.0);
        let target = ctx.tx.to;
        let has_calldata = ctx.tx.data.is_some();
        let now = ctx.now;

        let mut findings = Vec::new();
        {
            let baseline = self
                .baseline
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let window = Duration::days(config.learning_window_days as i64);
            let established = baseline
                .started_at
                .is_some_and(|start| now - start >= window)
                && baseline.count >= MIN_SAMPLES;

            if established {
                let multiplier = config.sensitivity.std_dev_multiplier();
                let std_dev = baseline.std_dev();
                if std_dev > 0.0 && usd > baseline.mean + multiplier * std_dev {
                    findings.push((
                        "VALUE_ANOMALY",
                        format!(
                            "Value ${usd:.2} deviates from the baseline \
                             (mean ${:.2}, tolerance {multiplier} sigma)",
                            baseline.mean
                        ),
                        Severity::High,
                    ));
                }
                if has_calldata && !baseline.known_contracts.contains(&target) {
                    findings.push((
                        "NEW_CONTRACT_INTERACTION",
                        format!("First interaction with contract {target}"),
                        Severity::Medium,
                    ));
                }
                let recent_count = baseline
                    .recent
                    .iter()
                    .filter(|t| **t > now - Duration::minutes(FREQUENCY_WINDOW_MINUTES))
                    .count();
                if recent_count >= FREQUENCY_LIMIT {
                    findings.push((
                        "FREQUENCY_ANOMALY",
                        format!(
                            "{recent_count} transactions in the last \
                             {FREQUENCY_WINDOW_MINUTES} minutes"
                        ),
                        Severity::Medium,
                    ));
                }
                if baseline.count >= 24 && baseline.hour_counts[now.hour() as usize] == 0 {
                    findings.push((
                        "TIMING_ANOMALY",
                        format!("No prior activity at hour {:02} UTC", now.hour()),
                        Severity::Low,
                    ));
                }
            }
        }

        for (code, message, severity) in findings {
            ctx.push_reason(code, message, severity, ReasonSource::Behavioral);
        }

        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DecodedTransaction, SecurityPolicy, Sensitivity, TransactionRequest};
    use crate::engine::pipeline::testing::run_single;
    use std::str::FromStr;
    use std::sync::Arc;

    const TARGET: &str = "0x6666666666666666666666666666666666666666";

    fn make_ctx(usd: f64, now: DateTime<Utc>, sensitivity: Sensitivity) -> EvaluationContext {
        let tx = TransactionRequest::new(TARGET, "0").check().unwrap();
        let mut policy = SecurityPolicy::default();
        policy.behavioral.sensitivity = sensitivity;
        let mut ctx = EvaluationContext::new(tx, None, Arc::new(policy), now);
        ctx.decoded = Some(DecodedTransaction {
            estimated_value_usd: usd,
            ..DecodedTransaction::default()
        });
        ctx
    }

    /// Build a comparator whose learning window elapsed: samples recorded
    /// `days` ago around a $100 mean.
    fn trained_comparator(days: i64, now: DateTime<Utc>) -> BehavioralComparator {
        let comparator = BehavioralComparator::new();
        let start = now - Duration::days(days);
        let target = Address::from_str(TARGET).unwrap();
        for (i, usd) in [90.0, 95.0, 100.0, 105.0, 110.0, 100.0].iter().enumerate() {
            comparator.record_approved(target, *usd, start + Duration::hours(i as i64));
        }
        comparator
    }

    #[tokio::test]
    async fn test_no_findings_during_learning_window() {
        let now = Utc::now();
        // Trained only 2 days ago; default window is 7 days.
        let comparator = trained_comparator(2, now);
        let mut ctx = make_ctx(100_000.0, now, Sensitivity::High);

        run_single(&comparator, &mut ctx).await.unwrap();
        assert!(ctx.reasons.is_empty());
    }

    #[tokio::test]
    async fn test_value_anomaly_after_window() {
        let now = Utc::now();
        let comparator = trained_comparator(10, now);
        let mut ctx = make_ctx(10_000.0, now, Sensitivity::High);

        run_single(&comparator, &mut ctx).await.unwrap();
        assert!(ctx.has_reason("VALUE_ANOMALY"));
    }

    #[tokio::test]
    async fn test_sensitivity_widens_tolerance() {
        let now = Utc::now();
        // Mean ~100, std ~7. A $125 value is ~3.5 sigma out: anomalous at
        // high sensitivity (1.5x), tolerated at low (4x).
        let comparator = trained_comparator(10, now);
        let mut ctx = make_ctx(125.0, now, Sensitivity::High);
        run_single(&comparator, &mut ctx).await.unwrap();
        assert!(ctx.has_reason("VALUE_ANOMALY"));

        let comparator = trained_comparator(10, now);
        let mut ctx = make_ctx(125.0, now, Sensitivity::Low);
        run_single(&comparator, &mut ctx).await.unwrap();
        assert!(!ctx.has_reason("VALUE_ANOMALY"));
    }

    #[tokio::test]
    async fn test_new_contract_interaction() {
        let now = Utc::now();
        let comparator = trained_comparator(10, now);

        let tx = TransactionRequest::new("0x7777777777777777777777777777777777777777", "0")
            .with_data("0xa9059cbb")
            .check()
            .unwrap();
        let mut ctx = EvaluationContext::new(
            tx,
            None,
            Arc::new(SecurityPolicy::default()),
            now,
        );
        ctx.decoded = Some(DecodedTransaction {
            estimated_value_usd: 100.0,
            ..DecodedTransaction::default()
        });

        run_single(&comparator, &mut ctx).await.unwrap();
        assert!(ctx.has_reason("NEW_CONTRACT_INTERACTION"));
    }

    #[tokio::test]
    async fn test_frequency_anomaly() {
        let now = Utc::now();
        let comparator = trained_comparator(10, now);
        let target = Address::from_str(TARGET).unwrap();
        for i in 0..FREQUENCY_LIMIT {
            comparator.record_approved(target, 100.0, now - Duration::seconds(30 + i as i64));
        }

        let mut ctx = make_ctx(100.0, now, Sensitivity::Medium);
        run_single(&comparator, &mut ctx).await.unwrap();
        assert!(ctx.has_reason("FREQUENCY_ANOMALY"));
    }

    #[tokio::test]
    async fn test_disabled_stage_skips() {
        let now = Utc::now();
        let comparator = trained_comparator(10, now);
        let tx = TransactionRequest::new(TARGET, "0").check().unwrap();
        let mut policy = SecurityPolicy::default();
        policy.behavioral.enabled = false;
        let mut ctx = EvaluationContext::new(tx, None, Arc::new(policy), now);
        ctx.decoded = Some(DecodedTransaction {
            estimated_value_usd: 1_000_000.0,
            ..DecodedTransaction::default()
        });

        run_single(&comparator, &mut ctx).await.unwrap();
        assert!(ctx.reasons.is_empty());
    }

    #[test]
    fn test_welford_statistics() {
        let mut baseline = Baseline::default();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            baseline.record_value(v);
        }
        assert!((baseline.mean - 5.0).abs() < 1e-9);
        // Sample standard deviation of that series is ~2.138.
        assert!((baseline.std_dev() - 2.138).abs() < 0.01);
    }
}
