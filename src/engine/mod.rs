//! Evaluation engine for Wardex.
//!
//! This module contains the middleware pipeline and its nine stages:
//! - Context Analyzer: prompt injection, trust, coherence, escalation
//! - Transaction Decoder: selector table and ABI parameter extraction
//! - Value Assessor: USD-at-risk estimation
//! - Address Checker: deny/allow lists and reputation intelligence
//! - Contract Checker: contract analysis and bytecode findings
//! - Behavioral Comparator: baseline deviation detection
//! - (custom middleware slot)
//! - Risk Aggregator: component scores, composite, tier resolution
//! - Policy Stage: enforcement modes, innate immunity, verdict stamping

mod address_check;
mod aggregate;
mod behavioral;
mod context_analyzer;
mod contract_check;
mod decoder;
mod pipeline;
mod policy_engine;
mod value;

pub use address_check::*;
pub use aggregate::*;
pub use behavioral::*;
pub use context_analyzer::*;
pub use contract_check::*;
pub use decoder::*;
pub use pipeline::*;
pub use policy_engine::*;
pub use value::*;
