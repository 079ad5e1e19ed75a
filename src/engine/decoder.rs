//! Transaction decoder stage.
//!
//! Parses the 4-byte function selector against a fixed table of well-known
//! signatures and extracts the 32-byte ABI parameter words. Flags the
//! dangerous shapes: unlimited approvals, operator approvals, batched calls,
//! and native value riding along with calldata.

use alloy_primitives::U256;
use async_trait::async_trait;

use crate::domain::{DecodedTransaction, ReasonSource, Severity};
use crate::engine::pipeline::{EvaluationContext, Middleware, Next, PipelineError};

/// Approval amounts above 2^128 are treated as unlimited.
pub fn infinite_approval_threshold() -> U256 {
    U256::from(1) << 128
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Transfer,
    TransferFrom,
    Approve,
    SafeTransferFrom,
    SetApprovalForAll,
    Swap,
    Multicall,
    HandleOps,
    Deposit,
    Withdraw,
}

struct KnownSelector {
    selector: [u8; 4],
    signature: &'static str,
    kind: CallKind,
}

/// The fixed selector table. ERC-20/721 movement and approvals, common DEX
/// swaps, wrapped-native helpers, batching, and ERC-4337 bundler entry.
const SELECTOR_TABLE: &[KnownSelector] = &[
    KnownSelector {
        selector: [0xa9, 0x05, 0x9c, 0xbb],
        signature: "transfer(address,uint256)",
        kind: CallKind::Transfer,
    },
    KnownSelector {
        selector: [0x23, 0xb8, 0x72, 0xdd],
        signature: "transferFrom(address,address,uint256)",
        kind: CallKind::TransferFrom,
    },
    KnownSelector {
        selector: [0x09, 0x5e, 0xa7, 0xb3],
        signature: "approve(address,uint256)",
        kind: CallKind::Approve,
    },
    KnownSelector {
        selector: [0x42, 0x84, 0x2e, 0x0e],
        signature: "safeTransferFrom(address,address,uint256)",
        kind: CallKind::SafeTransferFrom,
    },
    KnownSelector {
        selector: [0xb8, 0x8d, 0x4f, 0xde],
        signature: "safeTransferFrom(address,address,uint256,bytes)",
        kind: CallKind::SafeTransferFrom,
    },
    KnownSelector {
        selector: [0xa2, 0x2c, 0xb4, 0x65],
        signature: "setApprovalForAll(address,bool)",
        kind: CallKind::SetApprovalForAll,
    },
    KnownSelector {
        selector: [0x38, 0xed, 0x17, 0x39],
        signature: "swapExactTokensForTokens(uint256,uint256,address[],address,uint256)",
        kind: CallKind::Swap,
    },
    KnownSelector {
        selector: [0x7f, 0xf3, 0x6a, 0xb5],
        signature: "swapExactETHForTokens(uint256,address[],address,uint256)",
        kind: CallKind::Swap,
    },
    KnownSelector {
        selector: [0x88, 0x03, 0xdb, 0xee],
        signature: "swapTokensForExactTokens(uint256,uint256,address[],address,uint256)",
        kind: CallKind::Swap,
    },
    KnownSelector {
        selector: [0x41, 0x4b, 0xf3, 0x89],
        signature: "exactInputSingle((address,address,uint24,address,uint256,uint256,uint256,uint160))",
        kind: CallKind::Swap,
    },
    KnownSelector {
        selector: [0xac, 0x96, 0x50, 0xd8],
        signature: "multicall(bytes[])",
        kind: CallKind::Multicall,
    },
    KnownSelector {
        selector: [0x5a, 0xe4, 0x01, 0xdc],
        signature: "multicall(uint256,bytes[])",
        kind: CallKind::Multicall,
    },
    KnownSelector {
        selector: [0x1f, 0xad, 0x94, 0x8c],
        signature: "handleOps((address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes)[],address)",
        kind: CallKind::HandleOps,
    },
    KnownSelector {
        selector: [0xd0, 0xe3, 0x0d, 0xb0],
        signature: "deposit()",
        kind: CallKind::Deposit,
    },
    KnownSelector {
        selector: [0x2e, 0x1a, 0x7d, 0x4d],
        signature: "withdraw(uint256)",
        kind: CallKind::Withdraw,
    },
];

/// Approval-shaped intent extracted from raw calldata. Shared with the
/// session layer, which enforces approval restrictions independently of the
/// pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalIntent {
    /// `approve(address,uint256)` with the given amount.
    Amount(U256),
    /// `setApprovalForAll(address,bool)` with approved = true.
    OperatorAll,
}

/// Inspect calldata for approval semantics without full decoding.
pub fn approval_intent(data: &[u8]) -> Option<ApprovalIntent> {
    if data.len() < 4 {
        return None;
    }
    let words = param_words(data);
    match &data[..4] {
        [0x09, 0x5e, 0xa7, 0xb3] => words.get(1).map(|amount| ApprovalIntent::Amount(*amount)),
        [0xa2, 0x2c, 0xb4, 0x65] => match words.get(1) {
            Some(flag) if !flag.is_zero() => Some(ApprovalIntent::OperatorAll),
            _ => None,
        },
        _ => None,
    }
}

/// Selectors safe to allow in a restricted delegation: token movement,
/// swaps, and batching. Approval-granting selectors are deliberately absent.
pub fn safe_delegation_selectors() -> Vec<[u8; 4]> {
    SELECTOR_TABLE
        .iter()
        .filter(|k| {
            matches!(
                k.kind,
                CallKind::Transfer
                    | CallKind::TransferFrom
                    | CallKind::SafeTransferFrom
                    | CallKind::Swap
                    | CallKind::Multicall
            )
        })
        .map(|k| k.selector)
        .collect()
}

fn param_words(data: &[u8]) -> Vec<U256> {
    data[4.min(data.len())..]
        .chunks(32)
        .filter(|chunk| chunk.len() == 32)
        .map(U256::from_be_slice)
        .collect()
}

/// Stage 2: calldata decoding.
pub struct TransactionDecoder;

impl TransactionDecoder {
    pub fn new() -> Self {
        Self
    }

    fn decode(ctx: &EvaluationContext) -> (DecodedTransaction, Vec<(String, String, Severity)>) {
        let mut decoded = DecodedTransaction {
            involves_eth: !ctx.tx.value.is_zero(),
            ..DecodedTransaction::default()
        };
        let mut flags = Vec::new();

        let Some(data) = ctx.tx.data.as_ref() else {
            return (decoded, flags);
        };

        if !ctx.tx.value.is_zero() {
            flags.push((
                "ETH_WITH_CALLDATA".to_string(),
                "Native value attached to a contract call".to_string(),
                Severity::Low,
            ));
        }

        if data.len() < 4 {
            flags.push((
                "CALLDATA_UNPARSEABLE".to_string(),
                "Calldata is shorter than a function selector".to_string(),
                Severity::Low,
            ));
            return (decoded, flags);
        }

        decoded.params = param_words(data);

        let Some(known) = SELECTOR_TABLE.iter().find(|k| k.selector == data[..4]) else {
            return (decoded, flags);
        };
        decoded.function_name = Some(known.signature.to_string());

        match known.kind {
            CallKind::Transfer => {
                decoded.is_transfer = true;
                decoded.token_amount = decoded.params.get(1).copied();
            }
            CallKind::TransferFrom | CallKind::SafeTransferFrom => {
                decoded.is_transfer = true;
                decoded.token_amount = decoded.params.get(2).copied();
            }
            CallKind::Approve => {
                decoded.is_approval = true;
                decoded.approval_amount = decoded.params.get(1).copied();
                if let Some(amount) = decoded.approval_amount {
                    if amount > infinite_approval_threshold() {
                        flags.push((
                            "INFINITE_APPROVAL".to_string(),
                            "Approval amount is effectively unlimited".to_string(),
                            Severity::Critical,
                        ));
                    }
                }
            }
            CallKind::SetApprovalForAll => {
                decoded.is_approval = true;
                if decoded.params.get(1).is_some_and(|flag| !flag.is_zero()) {
                    flags.push((
                        "SET_APPROVAL_FOR_ALL".to_string(),
                        "Grants operator control over an entire collection".to_string(),
                        Severity::High,
                    ));
                }
            }
            CallKind::Multicall | CallKind::HandleOps => {
                flags.push((
                    "MULTICALL_DETECTED".to_string(),
                    format!(
                        "Batched execution via {} hides the individual calls",
                        known.signature
                    ),
                    Severity::Medium,
                ));
            }
            CallKind::Swap | CallKind::Deposit | CallKind::Withdraw => {
                decoded.is_transfer = matches!(known.kind, CallKind::Withdraw);
            }
        }

        (decoded, flags)
    }
}

impl Default for TransactionDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for TransactionDecoder {
    fn name(&self) -> &'static str {
        "transaction_decoder"
    }

    async fn handle(
        &self,
        ctx: &mut EvaluationContext,
        next: &mut Next<'_>,
    ) -> Result<(), PipelineError> {
        let (decoded, flags) = Self::decode(ctx);
        for (code, message, severity) in flags {
            ctx.push_reason(code, message, severity, ReasonSource::Transaction);
        }
        ctx.decoded = Some(decoded);
        next.run(ctx).await
    }
}
