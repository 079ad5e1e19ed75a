//! Wardex - security mediator between AI agents and wallet signers.
//!
//! Every transaction an agent proposes runs through a composable middleware
//! pipeline that scores it against a composite threat model (prompt
//! injection, malicious contracts, behavioral anomalies, policy limits) and
//! produces a verdict before any signing material is touched. Approved
//! transactions mint a short-lived approval token that an out-of-process
//! signer demands before signing.
//!
//! The crate is organized around six components:
//! - [`engine`]: the middleware pipeline and its nine evaluation stages
//! - [`shield`]: the orchestrator holding policy, counters, and the audit log
//! - [`filter`]: the mandatory output redactor for key material
//! - [`signer`]: the isolated signer protocol (client, server, key file)
//! - [`session`]: session-key constraints and on-chain caveat mapping
//! - [`token`]: approval token minting and verification

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod filter;
pub mod logging;
pub mod providers;
pub mod session;
pub mod shield;
pub mod signer;
pub mod token;

pub use domain::{
    AuditEntry, ConversationContext, Decision, Message, MessageRole, RequiredAction, RiskScores,
    SecurityPolicy, SecurityReason, SecurityTierConfig, SecurityVerdict, Severity,
    TransactionRequest,
};
pub use error::{WardexError, WardexResult};
pub use filter::OutputFilter;
pub use shield::{AgentShield, AgentShieldBuilder, ShieldStatus};
