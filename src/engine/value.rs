//! Value assessor stage.
//!
//! Converts the transaction into an estimated USD at risk: native value at
//! the configured price, token movements via a per-token price map, and a
//! conservative floor for unlimited approvals so they always resolve into
//! the strictest tier.

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use std::collections::HashMap;

use crate::engine::decoder::infinite_approval_threshold;
use crate::engine::pipeline::{EvaluationContext, Middleware, Next, PipelineError};

/// Convert a wei amount into USD at the given native price.
///
/// Goes through a decimal string so values beyond u128 degrade to an
/// (enormous) approximation instead of panicking.
pub(crate) fn wei_to_usd(value: U256, price_usd: f64) -> f64 {
    let whole: f64 = value.to_string().parse().unwrap_or(f64::MAX);
    (whole / 1e18) * price_usd
}

/// Configuration of the value assessor.
#[derive(Debug, Clone)]
pub struct ValueAssessorConfig {
    /// USD price of the native asset.
    pub native_price_usd: f64,
    /// USD price per token contract (lowercased address), assuming
    /// 18 decimals.
    pub token_prices: HashMap<Address, f64>,
    /// Floor for the estimated USD of an unlimited approval.
    pub infinite_value_floor_usd: f64,
}

impl Default for ValueAssessorConfig {
    fn default() -> Self {
        Self {
            native_price_usd: 3000.0,
            token_prices: HashMap::new(),
            infinite_value_floor_usd: 100_000.0,
        }
    }
}

impl From<&crate::config::ValuationSettings> for ValueAssessorConfig {
    fn from(settings: &crate::config::ValuationSettings) -> Self {
        Self {
            native_price_usd: settings.native_price_usd,
            token_prices: HashMap::new(),
            infinite_value_floor_usd: settings.infinite_value_floor_usd,
        }
    }
}

/// Stage 3: USD-at-risk estimation.
pub struct ValueAssessor {
    config: ValueAssessorConfig,
}

impl ValueAssessor {
    pub fn new(config: ValueAssessorConfig) -> Self {
        Self { config }
    }

    fn estimate(&self, ctx: &EvaluationContext) -> f64 {
        let mut usd = wei_to_usd(ctx.tx.value, self.config.native_price_usd);

        if let Some(decoded) = ctx.decoded.as_ref() {
            let token_price = self.config.token_prices.get(&ctx.tx.to).copied();

            if let Some(amount) = decoded.token_amount {
                if let Some(price) = token_price {
                    usd += wei_to_usd(amount, price);
                }
            }

            if let Some(amount) = decoded.approval_amount {
                if amount > infinite_approval_threshold() {
                    // Unlimited approvals escalate conservatively.
                    usd = usd.max(self.config.infinite_value_floor_usd);
                } else if let Some(price) = token_price {
                    usd = usd.max(wei_to_usd(amount, price));
                }
            }
        }

        usd
    }
}

#[async_trait]
impl Middleware for ValueAssessor {
    fn name(&self) -> &'static str {
        "value_assessor"
    }

    async fn handle(
        &self,
        ctx: &mut EvaluationContext,
        next: &mut Next<'_>,
    ) -> Result<(), PipelineError> {
        let usd = self.estimate(ctx);
        if let Some(decoded) = ctx.decoded.as_mut() {
            decoded.estimated_value_usd = usd;
        }
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DecodedTransaction, SecurityPolicy, TransactionRequest};
    use crate::engine::pipeline::testing::run_single;
    use chrono::Utc;
    use std::str::FromStr;
    use std::sync::Arc;

    fn make_ctx(value_wei: &str) -> EvaluationContext {
        let tx = TransactionRequest::new("0x2222222222222222222222222222222222222222", value_wei)
            .check()
            .unwrap();
        let mut ctx = EvaluationContext::new(
            tx,
            None,
            Arc::new(SecurityPolicy::default()),
            Utc::now(),
        );
        ctx.decoded = Some(DecodedTransaction::default());
        ctx
    }

    #[test]
    fn test_wei_to_usd() {
        let one_eth = U256::from(10).pow(U256::from(18));
        assert_eq!(wei_to_usd(one_eth, 3000.0), 3000.0);
        assert_eq!(wei_to_usd(U256::ZERO, 3000.0), 0.0);
    }

    #[tokio::test]
    async fn test_native_value_estimate() {
        let assessor = ValueAssessor::new(ValueAssessorConfig::default());
        // 0.001 ETH at $3000.
        let mut ctx = make_ctx("1000000000000000");
        run_single(&assessor, &mut ctx).await.unwrap();

        let estimate = ctx.decoded.as_ref().unwrap().estimated_value_usd;
        assert!((estimate - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_token_transfer_priced_from_map() {
        let token = Address::from_str("0x2222222222222222222222222222222222222222").unwrap();
        let mut config = ValueAssessorConfig::default();
        config.token_prices.insert(token, 2.0);
        let assessor = ValueAssessor::new(config);

        let mut ctx = make_ctx("0");
        ctx.decoded.as_mut().unwrap().token_amount =
            Some(U256::from(10).pow(U256::from(18)) * U256::from(50));
        run_single(&assessor, &mut ctx).await.unwrap();

        let estimate = ctx.decoded.as_ref().unwrap().estimated_value_usd;
        assert!((estimate - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_infinite_approval_clamped_to_floor() {
        let assessor = ValueAssessor::new(ValueAssessorConfig::default());
        let mut ctx = make_ctx("0");
        ctx.decoded.as_mut().unwrap().is_approval = true;
        ctx.decoded.as_mut().unwrap().approval_amount = Some(U256::MAX);
        run_single(&assessor, &mut ctx).await.unwrap();

        assert!(ctx.decoded.as_ref().unwrap().estimated_value_usd >= 100_000.0);
    }

    #[tokio::test]
    async fn test_floor_is_configurable() {
        let config = ValueAssessorConfig {
            infinite_value_floor_usd: 500_000.0,
            ..ValueAssessorConfig::default()
        };
        let assessor = ValueAssessor::new(config);
        let mut ctx = make_ctx("0");
        ctx.decoded.as_mut().unwrap().approval_amount = Some(U256::MAX);
        run_single(&assessor, &mut ctx).await.unwrap();

        assert!(ctx.decoded.as_ref().unwrap().estimated_value_usd >= 500_000.0);
    }

    #[tokio::test]
    async fn test_bounded_approval_uses_token_price() {
        let token = Address::from_str("0x2222222222222222222222222222222222222222").unwrap();
        let mut config = ValueAssessorConfig::default();
        config.token_prices.insert(token, 1.0);
        let assessor = ValueAssessor::new(config);

        let mut ctx = make_ctx("0");
        ctx.decoded.as_mut().unwrap().approval_amount =
            Some(U256::from(10).pow(U256::from(18)) * U256::from(250));
        run_single(&assessor, &mut ctx).await.unwrap();

        let estimate = ctx.decoded.as_ref().unwrap().estimated_value_usd;
        assert!((estimate - 250.0).abs() < 1e-9);
    }
}
