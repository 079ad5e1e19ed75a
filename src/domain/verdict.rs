//! Verdict domain types.
//!
//! The terminal artifact of an evaluation: a decision, the component risk
//! scores, the findings that led there, and the correlation metadata
//! consumers need (evaluation id, tier, timestamp).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::reason::{ReasonSource, SecurityReason, Severity};

/// Terminal decision of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Safe to proceed.
    Approve,
    /// Proceed with caution; advisory findings attached.
    Advise,
    /// Do not sign.
    Block,
    /// Shield is frozen; no evaluation performed.
    Freeze,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Approve => write!(f, "approve"),
            Decision::Advise => write!(f, "advise"),
            Decision::Block => write!(f, "block"),
            Decision::Freeze => write!(f, "freeze"),
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approve" => Ok(Decision::Approve),
            "advise" => Ok(Decision::Advise),
            "block" => Ok(Decision::Block),
            "freeze" => Ok(Decision::Freeze),
            _ => Err(format!("Unknown decision: {s}")),
        }
    }
}

/// Follow-up action a verdict demands from the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAction {
    None,
    HumanApproval,
    Delay,
}

/// Component risk scores, each in [0, 100].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskScores {
    pub context: u8,
    pub transaction: u8,
    pub behavioral: u8,
    /// Weighted aggregate of the other three.
    pub composite: u8,
}

/// The terminal decision object produced by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityVerdict {
    pub decision: Decision,
    pub risk_score: RiskScores,
    pub reasons: Vec<SecurityReason>,
    pub suggestions: Vec<String>,
    pub required_action: RequiredAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub evaluation_id: Uuid,
    pub tier_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_hash: Option<String>,
}

impl SecurityVerdict {
    /// Synthetic block verdict carrying a single policy finding. Used for
    /// input-validation failures and pipeline invariant violations, which
    /// must terminate in a verdict rather than an error.
    pub fn synthetic_block(
        code: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            decision: Decision::Block,
            risk_score: RiskScores {
                context: 0,
                transaction: 100,
                behavioral: 0,
                composite: 100,
            },
            reasons: vec![SecurityReason::new(
                code,
                message,
                Severity::High,
                ReasonSource::Policy,
            )],
            suggestions: Vec::new(),
            required_action: RequiredAction::HumanApproval,
            delay_seconds: None,
            timestamp: now,
            evaluation_id: Uuid::new_v4(),
            tier_id: String::new(),
            proof_hash: None,
        }
    }

    /// Synthetic freeze verdict returned while the shield is frozen.
    pub fn frozen(reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            decision: Decision::Freeze,
            risk_score: RiskScores {
                context: 0,
                transaction: 0,
                behavioral: 0,
                composite: 100,
            },
            reasons: vec![SecurityReason::new(
                "SHIELD_FROZEN",
                reason,
                Severity::Critical,
                ReasonSource::Policy,
            )],
            suggestions: vec!["Unfreeze the shield manually after investigating".to_string()],
            required_action: RequiredAction::HumanApproval,
            delay_seconds: None,
            timestamp: now,
            evaluation_id: Uuid::new_v4(),
            tier_id: String::new(),
            proof_hash: None,
        }
    }

    /// Whether any finding is critical.
    pub fn has_critical_reason(&self) -> bool {
        self.reasons.iter().any(|r| r.is_critical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_serialization() {
        let decision = Decision::Advise;
        let json = serde_json::to_string(&decision).unwrap();
        assert_eq!(json, "\"advise\"");

        let parsed: Decision = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Decision::Advise);
    }

    #[test]
    fn test_synthetic_block_shape() {
        let verdict =
            SecurityVerdict::synthetic_block("INVALID_TRANSACTION", "bad address", Utc::now());
        assert_eq!(verdict.decision, Decision::Block);
        assert_eq!(verdict.reasons.len(), 1);
        assert_eq!(verdict.reasons[0].severity, Severity::High);
        assert_eq!(verdict.reasons[0].source, ReasonSource::Policy);
        assert_eq!(verdict.risk_score.composite, 100);
    }

    #[test]
    fn test_frozen_verdict() {
        let verdict = SecurityVerdict::frozen("5 blocks in last 10 evaluations", Utc::now());
        assert_eq!(verdict.decision, Decision::Freeze);
        assert!(verdict.has_critical_reason());
    }

    #[test]
    fn test_verdict_wire_shape() {
        let verdict = SecurityVerdict::synthetic_block("PIPELINE_ERROR", "no verdict", Utc::now());
        let json = serde_json::to_string(&verdict).unwrap();
        assert!(json.contains("\"riskScore\""));
        assert!(json.contains("\"requiredAction\":\"human_approval\""));
        assert!(json.contains("\"evaluationId\""));
        assert!(json.contains("\"tierId\""));
        // Absent optionals stay off the wire.
        assert!(!json.contains("proofHash"));
    }

    #[test]
    fn test_unique_evaluation_ids() {
        let now = Utc::now();
        let a = SecurityVerdict::synthetic_block("X", "x", now);
        let b = SecurityVerdict::synthetic_block("X", "x", now);
        assert_ne!(a.evaluation_id, b.evaluation_id);
    }
}
