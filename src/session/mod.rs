//! Session key management.
//!
//! A session key is a subordinate signing key with narrowed authority: a
//! contract allowlist, per-transaction and daily value caps, an expiry, and
//! an optional ban on approval-granting calls. The manager enforces the
//! constraint chain on every proposed transaction and zeroizes secrets the
//! moment a session is revoked or found expired.

mod caveats;

pub use caveats::*;

use alloy_primitives::{keccak256, Address, U256};
use chrono::{DateTime, Datelike, Duration, Utc};
use k256::ecdsa::SigningKey;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::engine::{approval_intent, infinite_approval_threshold, ApprovalIntent};
use crate::domain::CheckedTransaction;
use crate::error::{WardexError, WardexResult};

/// Operator-chosen limits for a session key.
#[derive(Debug, Clone)]
pub struct SessionConstraints {
    /// Contracts the session may target.
    pub allowed_contracts: Vec<Address>,
    /// Maximum value of a single transaction, in wei.
    pub max_value_per_tx: U256,
    /// Maximum cumulative value per UTC day, in wei.
    pub max_daily_volume: U256,
    /// Lifetime of the session in seconds.
    pub duration_seconds: u64,
    /// Reject unlimited approvals and operator approvals.
    pub forbid_infinite_approvals: bool,
}

/// Result of constraint validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionValidation {
    pub valid: bool,
    pub reason: Option<String>,
}

impl SessionValidation {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Public snapshot of a session key (no secret material).
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub address: Address,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub daily_used: U256,
    /// False once the secret has been zeroized (revocation or expiry).
    pub key_available: bool,
}

struct SessionKey {
    id: String,
    address: Address,
    constraints: SessionConstraints,
    started_at: DateTime<Utc>,
    daily_used: U256,
    used_day: i32,
    revoked: bool,
    secret: Option<Zeroizing<[u8; 32]>>,
}

impl SessionKey {
    fn expires_at(&self) -> DateTime<Utc> {
        self.started_at + Duration::seconds(self.constraints.duration_seconds as i64)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let day = now.date_naive().num_days_from_ce();
        if day != self.used_day {
            self.used_day = day;
            self.daily_used = U256::ZERO;
        }
    }

    /// Drop the secret; `Zeroizing` wipes the bytes on drop.
    fn wipe(&mut self) {
        self.secret = None;
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            address: self.address,
            started_at: self.started_at,
            expires_at: self.expires_at(),
            revoked: self.revoked,
            daily_used: self.daily_used,
            key_available: self.secret.is_some(),
        }
    }
}

/// Tracks session keys by identifier.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionKey>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh session key under the given constraints.
    pub fn create_session(
        &self,
        constraints: SessionConstraints,
        now: DateTime<Utc>,
    ) -> WardexResult<SessionInfo> {
        if constraints.duration_seconds == 0 {
            return Err(WardexError::Session(
                "session duration must be positive".to_string(),
            ));
        }
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        let secret: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes().into());
        let encoded = signing_key.verifying_key().to_encoded_point(false);
        let address = Address::from_slice(&keccak256(&encoded.as_bytes()[1..])[12..]);

        let session = SessionKey {
            id: Uuid::new_v4().to_string(),
            address,
            constraints,
            started_at: now,
            daily_used: U256::ZERO,
            used_day: now.date_naive().num_days_from_ce(),
            revoked: false,
            secret: Some(secret),
        };
        let info = session.info();

        let mut sessions = self.lock();
        sessions.insert(session.id.clone(), session);
        tracing::info!(session_id = %info.id, address = %info.address, "session key created");
        Ok(info)
    }

    /// Enforce the constraint chain, in order: existence and revocation,
    /// expiry, target allowlist, per-transaction cap, daily cap, approval
    /// restrictions.
    pub fn validate_transaction(
        &self,
        session_id: &str,
        tx: &CheckedTransaction,
        now: DateTime<Utc>,
    ) -> SessionValidation {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            return SessionValidation::rejected("session not found");
        };

        if session.revoked {
            return SessionValidation::rejected("session revoked");
        }
        if session.is_expired(now) {
            session.wipe();
            return SessionValidation::rejected("session expired");
        }
        if !session.constraints.allowed_contracts.contains(&tx.to) {
            return SessionValidation::rejected(format!(
                "target {} not in session allowlist",
                tx.to
            ));
        }
        if tx.value > session.constraints.max_value_per_tx {
            return SessionValidation::rejected("value exceeds per-transaction cap");
        }

        session.roll_day(now);
        if session.daily_used.saturating_add(tx.value) > session.constraints.max_daily_volume {
            return SessionValidation::rejected("value exceeds remaining daily volume");
        }

        if session.constraints.forbid_infinite_approvals {
            if let Some(data) = tx.data.as_ref() {
                match approval_intent(data) {
                    Some(ApprovalIntent::Amount(amount))
                        if amount > infinite_approval_threshold() =>
                    {
                        return SessionValidation::rejected(
                            "unlimited approvals are forbidden for this session",
                        );
                    }
                    Some(ApprovalIntent::OperatorAll) => {
                        return SessionValidation::rejected(
                            "operator approvals are forbidden for this session",
                        );
                    }
                    _ => {}
                }
            }
        }

        SessionValidation::ok()
    }

    /// Add an accepted transaction's value to the session's daily counter.
    pub fn record_spend(
        &self,
        session_id: &str,
        value: U256,
        now: DateTime<Utc>,
    ) -> WardexResult<()> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| WardexError::Session("session not found".to_string()))?;
        session.roll_day(now);
        session.daily_used = session.daily_used.saturating_add(value);
        Ok(())
    }

    /// Validate and, on success, record the spend atomically.
    pub fn authorize(
        &self,
        session_id: &str,
        tx: &CheckedTransaction,
        now: DateTime<Utc>,
    ) -> SessionValidation {
        let validation = self.validate_transaction(session_id, tx, now);
        if validation.valid {
            if let Err(e) = self.record_spend(session_id, tx.value, now) {
                return SessionValidation::rejected(e.to_string());
            }
        }
        validation
    }

    /// Revoke a session and wipe its secret. Returns false when unknown.
    pub fn revoke(&self, session_id: &str) -> bool {
        let mut sessions = self.lock();
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.revoked = true;
                session.wipe();
                tracing::info!(session_id = %session_id, "session key revoked");
                true
            }
            None => false,
        }
    }

    /// Replace a session with a fresh key inheriting its constraints. The
    /// old session is revoked and wiped.
    pub fn rotate(&self, session_id: &str, now: DateTime<Utc>) -> WardexResult<SessionInfo> {
        let constraints = {
            let sessions = self.lock();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| WardexError::Session("session not found".to_string()))?;
            if session.revoked {
                return Err(WardexError::Session("session already revoked".to_string()));
            }
            session.constraints.clone()
        };

        let info = self.create_session(constraints, now)?;
        self.revoke(session_id);
        Ok(info)
    }

    /// Snapshot of a session, if present.
    pub fn session(&self, session_id: &str) -> Option<SessionInfo> {
        self.lock().get(session_id).map(|s| s.info())
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionKey>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
