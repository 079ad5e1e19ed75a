//! Audit trail domain types.
//!
//! Every evaluation leaves exactly one entry in a bounded FIFO ring. The
//! context summary is sanitized: message counts and source identity only,
//! never message content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use super::context::{ConversationContext, TrustLevel};
use super::transaction::TransactionRequest;
use super::verdict::{Decision, SecurityVerdict};

/// Sanitized summary of the conversation context of an evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub message_count: usize,
    pub source_identifier: String,
    pub source_trust: TrustLevel,
    pub tool_call_count: usize,
}

impl ContextSummary {
    pub fn from_context(context: &ConversationContext) -> Self {
        Self {
            message_count: context.messages.len(),
            source_identifier: context.source.identifier.clone(),
            source_trust: context.source.trust,
            tool_call_count: context.tool_calls.len(),
        }
    }
}

/// One audited evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub evaluation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub transaction: TransactionRequest,
    pub verdict: SecurityVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_summary: Option<ContextSummary>,
    /// Whether the approved transaction was actually executed.
    pub executed: bool,
}

/// Bounded FIFO of the most recent audit entries.
///
/// Not internally synchronized; the shield owns one behind its state lock
/// and hands out snapshot copies to readers.
#[derive(Debug)]
pub struct AuditLog {
    entries: VecDeque<AuditEntry>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when at capacity.
    pub fn push(&mut self, entry: AuditEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Snapshot of all entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Snapshot of the most recent `limit` entries, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<AuditEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// How many of the latest `window` entries carry a blocking decision
    /// (block or freeze). Entries at or before `since` are ignored, which is
    /// how a manual unfreeze resets the detector. Drives auto-freeze.
    pub fn recent_block_count(&self, window: usize, since: Option<DateTime<Utc>>) -> usize {
        self.recent_blocking(window, since).count()
    }

    /// Evaluation ids of blocking decisions among the latest `window`
    /// entries, newest first.
    pub fn recent_block_ids(&self, window: usize, since: Option<DateTime<Utc>>) -> Vec<Uuid> {
        self.recent_blocking(window, since)
            .map(|e| e.evaluation_id)
            .collect()
    }

    fn recent_blocking(
        &self,
        window: usize,
        since: Option<DateTime<Utc>>,
    ) -> impl Iterator<Item = &AuditEntry> {
        self.entries
            .iter()
            .rev()
            .take(window)
            .filter(move |e| since.is_none_or(|cutoff| e.timestamp > cutoff))
            .filter(|e| matches!(e.verdict.decision, Decision::Block | Decision::Freeze))
    }

    /// Mark the entry with the given evaluation id as executed.
    pub fn mark_executed(&mut self, evaluation_id: Uuid) -> bool {
        for entry in self.entries.iter_mut() {
            if entry.evaluation_id == evaluation_id {
                entry.executed = true;
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
