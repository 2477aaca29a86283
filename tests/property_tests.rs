//! Property-based tests for the sizing and ranking math.
//!
//! These tests verify invariants hold under random inputs.

use funding_hedger::config::{BalanceConfig, PositionConfig, ScoringConfig};
use funding_hedger::exchange::BookLevel;
use funding_hedger::strategy::{
    assess, quantize_contract, quantize_spot, rank_histories, size_at_price, target_notional,
    MarketInputs,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

// Strategies for generating test data
fn price_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..10_000_000_000i64).prop_map(|x| Decimal::new(x, 4)) // $0.0001 to $1,000,000
}

fn qty_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..1_000_000_000i64).prop_map(|x| Decimal::new(x, 5)) // 0 to 10,000
}

fn rate_strategy() -> impl Strategy<Value = Decimal> {
    (-200i64..=200i64).prop_map(|x| Decimal::new(x, 5)) // -0.2% to +0.2%
}

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

proptest! {
    /// Quantizing never rounds up and is idempotent
    #[test]
    fn quantize_floors_and_is_idempotent(qty in qty_strategy(), price in price_strategy()) {
        let spot = quantize_spot(qty, price).unwrap();
        prop_assert!(spot <= qty);
        prop_assert_eq!(quantize_spot(spot, price).unwrap(), spot);

        let contract = quantize_contract(qty, price).unwrap();
        prop_assert!(contract <= qty);
        prop_assert_eq!(quantize_contract(contract, price).unwrap(), contract);
    }

    /// Scaled notional stays within [min, max] and grows with |score|
    #[test]
    fn notional_bounded_and_monotone(a in rate_strategy(), b in rate_strategy()) {
        let config = scaling_config();
        let (low, high) = if a.abs() <= b.abs() { (a, b) } else { (b, a) };

        let n_low = target_notional(&config, low);
        let n_high = target_notional(&config, high);
        prop_assert!(n_low >= config.min_position_value);
        prop_assert!(n_high <= config.max_position_value);
        prop_assert!(n_low <= n_high);
    }

    /// A tradeable size is always within the position limits
    #[test]
    fn sized_value_within_limits(score in rate_strategy(), price in price_strategy()) {
        let config = scaling_config();
        let notional = target_notional(&config, score);
        let target = size_at_price(&config, notional, price).unwrap();
        if target.is_tradeable() {
            prop_assert!(target.value >= config.min_position_value);
            prop_assert!(target.value <= config.max_position_value);
            prop_assert_eq!(target.value, target.quantity * price);
        } else {
            prop_assert_eq!(target.quantity, Decimal::ZERO);
        }
    }

    /// Rankings are sorted by |score|, bounded by top N, and free of
    /// negative funding unless reverse funding is allowed
    #[test]
    fn ranking_sorted_and_bounded(
        histories in proptest::collection::vec(
            proptest::collection::vec(rate_strategy(), 0..30),
            0..12,
        ),
        top in 1usize..6,
    ) {
        let config = ScoringConfig {
            top_pairs_count: top,
            ..Default::default()
        };
        let symbols: Vec<String> = (0..histories.len()).map(|i| format!("S{}USDT", i)).collect();
        let map: HashMap<String, Vec<Decimal>> =
            symbols.iter().cloned().zip(histories).collect();

        let ranked = rank_histories(&symbols, &map, &config);
        prop_assert!(ranked.len() <= top);
        for pair in ranked.windows(2) {
            prop_assert!(pair[0].score.abs() >= pair[1].score.abs());
        }
        for entry in &ranked {
            prop_assert!(entry.latest >= Decimal::ZERO);
            prop_assert!(entry.score > Decimal::ZERO);
        }
    }

    /// Diverged prices or a thin book always block a rebalance
    #[test]
    fn gates_block_balance_regardless_of_imbalance(
        spot_qty in qty_strategy(),
        contract_qty in qty_strategy(),
        price in price_strategy(),
        spread_bps in 10i64..500i64,
        rate in rate_strategy(),
    ) {
        let balance = BalanceConfig::default();
        let position = scaling_config();
        let contract_price = price * (Decimal::ONE + Decimal::new(spread_bps, 4));
        let deep = |p: Decimal| vec![BookLevel::new(p, dec!(1000000000))];

        let diverged = MarketInputs {
            spot_qty,
            contract_qty,
            spot_price: price,
            contract_price,
            spot_asks: deep(price),
            contract_asks: deep(contract_price),
            spot_fee: dec!(0.001),
            contract_fee: dec!(0.00055),
            funding_rate: rate,
        };
        let result = assess(&balance, &position, "XUSDT", &diverged);
        prop_assert!(result.price_diff >= balance.max_price_diff);
        prop_assert!(!result.need_balance);

        // Same prices, but the probe has to walk far past the best ask.
        let thin = MarketInputs {
            contract_price: price,
            spot_asks: vec![
                BookLevel::new(price, Decimal::new(1, 8)),
                BookLevel::new(price * dec!(1.01), dec!(1000000000)),
            ],
            contract_asks: deep(price),
            ..diverged
        };
        let result = assess(&balance, &position, "XUSDT", &thin);
        prop_assert!(result.depth_impact >= balance.max_depth_impact);
        prop_assert!(!result.need_balance);
    }
}
