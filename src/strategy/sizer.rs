//! Position sizing from funding score.

use crate::config::PositionConfig;
use crate::exchange::{Exchange, ExchangeError, ExchangeResult};
use crate::strategy::precision::{quantize_spot, spot_step};
use crate::utils::decimal::ceil_to_step;
use rust_decimal::{Decimal, MathematicalOps};
use std::sync::Arc;
use tracing::debug;

/// Sized hedge pair target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSize {
    /// USD value of `quantity` at `price`; zero means "do not trade"
    pub value: Decimal,
    /// Spot-quantized base quantity
    pub quantity: Decimal,
    /// Spot price used for sizing
    pub price: Decimal,
}

impl TargetSize {
    fn skip(price: Decimal) -> Self {
        Self {
            value: Decimal::ZERO,
            quantity: Decimal::ZERO,
            price,
        }
    }

    pub fn is_tradeable(&self) -> bool {
        self.value > Decimal::ZERO
    }
}

/// USD notional for a score, before quantization.
///
/// Without scaling this is the minimum position value. With scaling the
/// clamped |score| times the scaling factor goes through `1 + ln(1 + x)`,
/// and the result is capped at the maximum position value.
pub fn target_notional(config: &PositionConfig, score: Decimal) -> Decimal {
    let base = config.min_position_value;
    if !config.position_scaling {
        return base.min(config.max_position_value);
    }

    let rate = score
        .abs()
        .max(config.min_scaling_rate)
        .min(config.max_scaling_rate);
    let x = rate * config.scaling_factor;
    let multiplier = (Decimal::ONE + x)
        .checked_ln()
        .map(|ln| Decimal::ONE + ln)
        .unwrap_or(Decimal::ONE);

    (base * multiplier).min(config.max_position_value)
}

/// Quantize a notional at `price` into a tradeable size.
///
/// The floored quantity is bumped up one spot step when flooring alone
/// drops the value under the minimum, as long as that stays within the
/// maximum; otherwise the result is zero.
pub fn size_at_price(
    config: &PositionConfig,
    notional: Decimal,
    price: Decimal,
) -> ExchangeResult<TargetSize> {
    let invalid = |_| ExchangeError::PriceUnavailable(format!("spot price {}", price));
    let step = spot_step(price).map_err(invalid)?;
    let mut quantity = quantize_spot(notional / price, price).map_err(invalid)?;

    if quantity * price < config.min_position_value {
        let bumped = ceil_to_step(config.min_position_value / price, step);
        if bumped * price <= config.max_position_value {
            quantity = bumped;
        }
    }

    let value = quantity * price;
    if quantity.is_zero() || value < config.min_position_value {
        return Ok(TargetSize::skip(price));
    }
    Ok(TargetSize {
        value,
        quantity,
        price,
    })
}

/// Turns a ranked score into a target USD value and spot quantity.
pub struct PositionSizer {
    exchange: Arc<dyn Exchange>,
    config: PositionConfig,
}

impl PositionSizer {
    pub fn new(exchange: Arc<dyn Exchange>, config: PositionConfig) -> Self {
        Self { exchange, config }
    }

    pub fn config(&self) -> &PositionConfig {
        &self.config
    }

    /// Target size for `symbol` at the current spot price.
    pub async fn target_value(&self, symbol: &str, score: Decimal) -> ExchangeResult<TargetSize> {
        let price = self.exchange.spot_price(symbol).await?;
        if price <= Decimal::ZERO {
            return Err(ExchangeError::PriceUnavailable(symbol.to_string()));
        }

        let notional = target_notional(&self.config, score);
        let target = size_at_price(&self.config, notional, price)?;
        debug!(
            %symbol,
            %score,
            %notional,
            value = %target.value,
            qty = %target.quantity,
            "Sized target"
        );
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchange;
    use rust_decimal_macros::dec;

    fn scaling_config() -> PositionConfig {
        PositionConfig {
            min_position_value: dec!(50),
            max_position_value: dec!(500),
            position_scaling: true,
            scaling_factor: dec!(2),
            min_scaling_rate: dec!(0.0001),
            max_scaling_rate: dec!(0.01),
            ..Default::default()
        }
    }

    #[test]
    fn test_scaled_notional_scenario() {
        // x = 0.005 * 2 = 0.01, multiplier = 1 + ln(1.01) ~= 1.00995
        let notional = target_notional(&scaling_config(), dec!(0.005));
        assert!(notional > dec!(50.49) && notional < dec!(50.51), "{}", notional);
    }

    #[test]
    fn test_unscaled_notional_is_minimum() {
        let config = PositionConfig {
            position_scaling: false,
            ..scaling_config()
        };
        assert_eq!(target_notional(&config, dec!(0.05)), dec!(50));
    }

    #[test]
    fn test_rate_clamped_to_scaling_bounds() {
        let config = scaling_config();
        // Rates above the max scaling rate size the same as the max.
        assert_eq!(
            target_notional(&config, dec!(0.5)),
            target_notional(&config, dec!(0.01))
        );
        // Negative scores size by magnitude.
        assert_eq!(
            target_notional(&config, dec!(-0.003)),
            target_notional(&config, dec!(0.003))
        );
    }

    #[test]
    fn test_notional_capped_at_max() {
        let config = PositionConfig {
            min_position_value: dec!(400),
            scaling_factor: dec!(100),
            ..scaling_config()
        };
        assert_eq!(target_notional(&config, dec!(0.01)), dec!(500));
    }

    #[test]
    fn test_size_at_price_bumps_to_minimum() {
        let config = scaling_config();
        // 50 / 3 = 16.67 -> floor 16.6 -> 49.8 < 50, bump to 16.7 -> 50.1
        let target = size_at_price(&config, dec!(50), dec!(3)).unwrap();
        assert_eq!(target.quantity, dec!(16.7));
        assert_eq!(target.value, dec!(50.1));
    }

    #[test]
    fn test_size_at_price_zero_when_minimum_unreachable() {
        let config = PositionConfig {
            min_position_value: dec!(50),
            max_position_value: dec!(50),
            ..scaling_config()
        };
        // Price 0.007: spot step 100 is 0.7 USD, 50/0.007 = 7142.86 -> 7100 -> 49.7,
        // bumped 7200 -> 50.4 exceeds the max.
        let target = size_at_price(&config, dec!(50), dec!(0.007)).unwrap();
        assert!(!target.is_tradeable());
    }

    #[tokio::test]
    async fn test_target_value_requires_price() {
        let mock = Arc::new(MockExchange::default());
        let sizer = PositionSizer::new(mock.clone(), scaling_config());
        let err = sizer.target_value("ETHUSDT", dec!(0.001)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::PriceUnavailable(_)));

        mock.set_prices("ETHUSDT", dec!(2000), dec!(2000)).await;
        let target = sizer.target_value("ETHUSDT", dec!(0.001)).await.unwrap();
        assert!(target.is_tradeable());
        assert!(target.value >= dec!(50) && target.value <= dec!(500));
    }
}
