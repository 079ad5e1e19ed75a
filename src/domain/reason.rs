//! Security finding domain types.
//!
//! A `SecurityReason` is an immutable finding produced by an evaluation
//! stage: a stable machine code, a human message, a severity, and the stage
//! family that produced it. Consumers depend on the codes being stable.

use serde::{Deserialize, Serialize};

/// Severity of a security finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Contribution of one finding of this severity to a component risk
    /// score (clamped to 100 at aggregation).
    pub fn weight(&self) -> u32 {
        match self {
            Severity::Info => 0,
            Severity::Low => 5,
            Severity::Medium => 15,
            Severity::High => 25,
            Severity::Critical => 40,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("Unknown severity: {s}")),
        }
    }
}

/// Stage family that produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonSource {
    Context,
    Transaction,
    Address,
    Contract,
    Behavioral,
    Policy,
}

impl std::fmt::Display for ReasonSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReasonSource::Context => write!(f, "context"),
            ReasonSource::Transaction => write!(f, "transaction"),
            ReasonSource::Address => write!(f, "address"),
            ReasonSource::Contract => write!(f, "contract"),
            ReasonSource::Behavioral => write!(f, "behavioral"),
            ReasonSource::Policy => write!(f, "policy"),
        }
    }
}

/// An immutable security finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityReason {
    /// Stable machine-readable code, e.g. `INFINITE_APPROVAL`.
    pub code: String,
    /// Human-readable explanation.
    pub message: String,
    pub severity: Severity,
    pub source: ReasonSource,
}

impl SecurityReason {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        source: ReasonSource,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity,
            source,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Info);
    }

    #[test]
    fn test_severity_weights() {
        assert_eq!(Severity::Critical.weight(), 40);
        assert_eq!(Severity::High.weight(), 25);
        assert_eq!(Severity::Medium.weight(), 15);
        assert_eq!(Severity::Low.weight(), 5);
        assert_eq!(Severity::Info.weight(), 0);
    }

    #[test]
    fn test_severity_round_trip() {
        for s in ["info", "low", "medium", "high", "critical"] {
            let parsed: Severity = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("fatal".parse::<Severity>().is_err());
    }

    #[test]
    fn test_reason_serialization() {
        let reason = SecurityReason::new(
            "INFINITE_APPROVAL",
            "Approval amount is effectively unlimited",
            Severity::Critical,
            ReasonSource::Transaction,
        );
        let json = serde_json::to_string(&reason).unwrap();
        assert!(json.contains("\"severity\":\"critical\""));
        assert!(json.contains("\"source\":\"transaction\""));
    }
}
