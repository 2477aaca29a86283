//! Decimal arithmetic helpers shared by quantization, scoring and sizing.

use rust_decimal::Decimal;

/// Floor a value to a multiple of `step`.
///
/// Negative inputs clamp to zero: a quantity can never be rounded into a
/// short. A zero step leaves the value untouched.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).floor() * step).normalize()
}

/// Round a value up to the next multiple of `step`.
pub fn ceil_to_step(value: Decimal, step: Decimal) -> Decimal {
    if value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).ceil() * step).normalize()
}

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let sum: Decimal = values.iter().copied().sum();
    Some(sum / Decimal::from(values.len()))
}

/// Weighted average over `(value, weight)` pairs.
///
/// Only the weights that are actually present contribute to the
/// denominator, so a caller that drops empty buckets does not dilute the
/// result.
pub fn weighted_average(values: &[(Decimal, Decimal)]) -> Option<Decimal> {
    let (sum, weight_sum) = values.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, weight_sum), (val, weight)| (sum + val * weight, weight_sum + weight),
    );

    if weight_sum <= Decimal::ZERO {
        None
    } else {
        Some(sum / weight_sum)
    }
}

/// Remove duplicates while keeping the first occurrence order.
pub fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(dec!(1.567), dec!(0.001)), dec!(1.567));
        assert_eq!(floor_to_step(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(floor_to_step(dec!(1.567), dec!(0.1)), dec!(1.5));
        assert_eq!(floor_to_step(dec!(17), dec!(10)), dec!(10));
    }

    #[test]
    fn test_floor_to_step_negative_clamps() {
        assert_eq!(floor_to_step(dec!(-1.5), dec!(0.1)), Decimal::ZERO);
    }

    #[test]
    fn test_ceil_to_step() {
        assert_eq!(ceil_to_step(dec!(0.00011), dec!(0.0001)), dec!(0.0002));
        assert_eq!(ceil_to_step(dec!(0.5), dec!(1)), dec!(1));
        assert_eq!(ceil_to_step(dec!(2), dec!(1)), dec!(2));
    }

    #[test]
    fn test_weighted_average_ignores_missing_buckets() {
        // Only one bucket realised: the result is its own value.
        let values = vec![(dec!(0.001), dec!(0.5))];
        assert_eq!(weighted_average(&values), Some(dec!(0.001)));

        let values = vec![(dec!(100), dec!(2)), (dec!(200), dec!(1))];
        let avg = weighted_average(&values).unwrap();
        assert!(avg > dec!(133) && avg < dec!(134));
    }

    #[test]
    fn test_weighted_average_empty() {
        assert_eq!(weighted_average(&[]), None);
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[dec!(1), dec!(2), dec!(3)]), Some(dec!(2)));
        assert_eq!(mean(&[]), None);
    }

    #[test]
    fn test_dedup_preserving_order() {
        let items = vec!["ETHUSDT", "BTCUSDT", "ETHUSDT", "SOLUSDT", "BTCUSDT"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            dedup_preserving_order(items),
            vec!["ETHUSDT", "BTCUSDT", "SOLUSDT"]
        );
    }
}
