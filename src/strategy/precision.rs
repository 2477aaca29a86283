//! Price-tiered quantity rounding.
//!
//! Order quantities are floored to a step chosen by price: expensive assets
//! trade in small base fractions, cheap ones in whole (or tens of) units.

use crate::exchange::ExchangeError;
use crate::utils::decimal::{ceil_to_step, floor_to_step};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

/// Smallest notional worth placing, in quote currency.
pub const MIN_ORDER_NOTIONAL: Decimal = dec!(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrecisionError {
    #[error("invalid price {0}: must be positive")]
    InvalidPrice(Decimal),
}

impl From<PrecisionError> for ExchangeError {
    fn from(err: PrecisionError) -> Self {
        ExchangeError::PriceUnavailable(err.to_string())
    }
}

/// (minimum price, spot step, contract step), highest tier first.
const TIERS: [(Decimal, Decimal, Decimal); 6] = [
    (dec!(10000), dec!(0.00001), dec!(0.001)),
    (dec!(1000), dec!(0.0001), dec!(0.01)),
    (dec!(100), dec!(0.001), dec!(0.1)),
    (dec!(10), dec!(0.01), dec!(0.1)),
    (dec!(1), dec!(0.1), dec!(1)),
    (dec!(0.01), dec!(1), dec!(10)),
];

/// Steps for assets priced below the lowest tier.
const DUST_STEPS: (Decimal, Decimal) = (dec!(100), dec!(100));

fn steps(price: Decimal) -> Result<(Decimal, Decimal), PrecisionError> {
    if price <= Decimal::ZERO {
        return Err(PrecisionError::InvalidPrice(price));
    }
    Ok(TIERS
        .iter()
        .find(|(floor, _, _)| price >= *floor)
        .map(|(_, spot, contract)| (*spot, *contract))
        .unwrap_or(DUST_STEPS))
}

/// Quantity step for spot orders at `price`.
pub fn spot_step(price: Decimal) -> Result<Decimal, PrecisionError> {
    steps(price).map(|(spot, _)| spot)
}

/// Quantity step for contract orders at `price`.
pub fn contract_step(price: Decimal) -> Result<Decimal, PrecisionError> {
    steps(price).map(|(_, contract)| contract)
}

/// Floor a spot quantity to its tier step. Never rounds up.
pub fn quantize_spot(qty: Decimal, price: Decimal) -> Result<Decimal, PrecisionError> {
    Ok(floor_to_step(qty, spot_step(price)?))
}

/// Floor a contract quantity to its tier step. Never rounds up.
pub fn quantize_contract(qty: Decimal, price: Decimal) -> Result<Decimal, PrecisionError> {
    Ok(floor_to_step(qty, contract_step(price)?))
}

/// Smallest contract quantity worth ordering: [`MIN_ORDER_NOTIONAL`] / price,
/// rounded up to the contract step.
pub fn min_order_size(price: Decimal) -> Result<Decimal, PrecisionError> {
    let step = contract_step(price)?;
    Ok(ceil_to_step(MIN_ORDER_NOTIONAL / price, step))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_shrink_as_price_rises() {
        assert_eq!(spot_step(dec!(60000)).unwrap(), dec!(0.00001));
        assert_eq!(contract_step(dec!(60000)).unwrap(), dec!(0.001));
        assert_eq!(spot_step(dec!(2500)).unwrap(), dec!(0.0001));
        assert_eq!(spot_step(dec!(150)).unwrap(), dec!(0.001));
        assert_eq!(spot_step(dec!(50)).unwrap(), dec!(0.01));
        assert_eq!(contract_step(dec!(50)).unwrap(), dec!(0.1));
        assert_eq!(spot_step(dec!(2)).unwrap(), dec!(0.1));
        assert_eq!(contract_step(dec!(0.5)).unwrap(), dec!(10));
        assert_eq!(spot_step(dec!(0.001)).unwrap(), dec!(100));
    }

    #[test]
    fn test_quantize_floors() {
        assert_eq!(quantize_spot(dec!(0.123456789), dec!(60000)).unwrap(), dec!(0.12345));
        assert_eq!(quantize_contract(dec!(0.123456789), dec!(60000)).unwrap(), dec!(0.123));
        assert_eq!(quantize_contract(dec!(19.99), dec!(50)).unwrap(), dec!(19.9));
        assert_eq!(quantize_contract(dec!(95), dec!(0.2)).unwrap(), dec!(90));
    }

    #[test]
    fn test_invalid_price_is_error() {
        assert_eq!(
            quantize_spot(dec!(1), Decimal::ZERO),
            Err(PrecisionError::InvalidPrice(Decimal::ZERO))
        );
        assert!(quantize_contract(dec!(1), dec!(-3)).is_err());
        assert!(min_order_size(Decimal::ZERO).is_err());
    }

    #[test]
    fn test_min_order_size_rounds_up() {
        // 5 / 60000 = 0.0000833.. -> one contract step
        assert_eq!(min_order_size(dec!(60000)).unwrap(), dec!(0.001));
        // 5 / 50 = 0.1 exactly
        assert_eq!(min_order_size(dec!(50)).unwrap(), dec!(0.1));
        // 5 / 3 = 1.67 -> 2
        assert_eq!(min_order_size(dec!(3)).unwrap(), dec!(2));
    }
}
