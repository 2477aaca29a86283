//! Funding ranker: scores candidate perpetuals by weighted historical funding.
//!
//! Each symbol's history (newest first) is averaged over several lookback
//! periods; the period averages are combined with configured weights,
//! normalised by the weight of the periods that actually had samples.

use crate::config::ScoringConfig;
use crate::exchange::Exchange;
use crate::persistence::UnsupportedSymbolStore;
use crate::strategy::settlement::SettlementWindow;
use crate::strategy::universe::CandidateSource;
use crate::utils::decimal::{dedup_preserving_order, mean, weighted_average};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

/// Weighted funding score of one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedScore {
    pub symbol: String,
    /// Signed score; positive means longs pay shorts
    pub score: Decimal,
    /// Most recent funding sample
    pub latest: Decimal,
    /// Mean per lookback period, `None` where the period had no samples
    pub period_averages: Vec<Option<Decimal>>,
}

/// Ranked target set, descending by |score|.
pub type RankedSet = Vec<WeightedScore>;

/// Why a symbol was dropped from the ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoSamples,
    NegativeFunding,
    TrendReversal,
}

/// Score a single funding history.
pub fn score_history(
    symbol: &str,
    samples: &[Decimal],
    periods: &[usize],
    weights: &[Decimal],
) -> Option<WeightedScore> {
    let latest = *samples.first()?;

    let period_averages: Vec<Option<Decimal>> = periods
        .iter()
        .map(|period| mean(&samples[..(*period).min(samples.len())]))
        .collect();

    let realised: Vec<(Decimal, Decimal)> = period_averages
        .iter()
        .zip(weights)
        .filter_map(|(avg, weight)| avg.map(|avg| (avg, *weight)))
        .collect();
    let score = weighted_average(&realised)?;

    trace!(%symbol, %score, %latest, "Scored funding history");

    Some(WeightedScore {
        symbol: symbol.to_string(),
        score,
        latest,
        period_averages,
    })
}

/// Apply the eligibility filters to a scored symbol.
pub fn check_eligibility(
    score: &WeightedScore,
    reverse_funding_rate: bool,
) -> Result<(), RejectReason> {
    if !reverse_funding_rate && (score.latest < Decimal::ZERO || score.score < Decimal::ZERO) {
        return Err(RejectReason::NegativeFunding);
    }
    // A score on the other side of zero from the latest sample is a stale trend.
    if score.score.is_zero() || score.score * score.latest < Decimal::ZERO {
        return Err(RejectReason::TrendReversal);
    }
    Ok(())
}

/// Score, filter, sort and truncate. Ties keep candidate order.
pub fn rank_histories(
    candidates: &[String],
    histories: &HashMap<String, Vec<Decimal>>,
    config: &ScoringConfig,
) -> RankedSet {
    let mut ranked: RankedSet = candidates
        .iter()
        .filter_map(|symbol| {
            let samples = histories.get(symbol).map(Vec::as_slice).unwrap_or_default();
            let verdict = score_history(symbol, samples, &config.periods, &config.weights)
                .ok_or(RejectReason::NoSamples)
                .and_then(|score| {
                    check_eligibility(&score, config.reverse_funding_rate).map(|_| score)
                });
            match verdict {
                Ok(score) => Some(score),
                Err(reason) => {
                    debug!(%symbol, ?reason, "Symbol rejected from ranking");
                    None
                }
            }
        })
        .collect();

    ranked.sort_by(|a, b| b.score.abs().cmp(&a.score.abs()));
    ranked.truncate(config.top_pairs_count);
    ranked
}

/// Ranks the candidate universe and caches the result between settlements.
pub struct FundingRanker {
    exchange: Arc<dyn Exchange>,
    source: Box<dyn CandidateSource>,
    fallback: Vec<String>,
    unsupported: Arc<dyn UnsupportedSymbolStore>,
    config: ScoringConfig,
    window: SettlementWindow,
    cached: RankedSet,
}

impl FundingRanker {
    /// `fallback` is used whenever `source` fails.
    pub fn new(
        exchange: Arc<dyn Exchange>,
        source: Box<dyn CandidateSource>,
        fallback: Vec<String>,
        unsupported: Arc<dyn UnsupportedSymbolStore>,
        config: ScoringConfig,
    ) -> Result<Self> {
        let window =
            SettlementWindow::new(&config.settlement_times_utc, config.pre_settlement_minutes)?;
        Ok(Self {
            exchange,
            source,
            fallback,
            unsupported,
            config,
            window,
            cached: Vec::new(),
        })
    }

    pub fn settlement_window(&self) -> &SettlementWindow {
        &self.window
    }

    /// Current cached ranking (possibly empty).
    pub fn cached(&self) -> &RankedSet {
        &self.cached
    }

    /// Drop a symbol from the cached ranking.
    pub fn evict(&mut self, symbol: &str) {
        self.cached.retain(|s| s.symbol != symbol);
    }

    /// Return the ranking, recomputing only if the cache is empty or a
    /// settlement is near.
    ///
    /// An error means funding data could not be fetched; the cache is left
    /// as it was. An empty `Ok` means no candidate is eligible.
    pub async fn rank(&mut self, now: DateTime<Utc>) -> Result<RankedSet> {
        if self.cached.is_empty() || self.window.is_near(now) {
            self.cached = self.refresh().await?;
        } else {
            debug!(count = self.cached.len(), "Using cached ranking");
        }
        Ok(self.cached.clone())
    }

    /// Unconditionally recompute the ranking.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<RankedSet> {
        let candidates = self.candidate_universe().await;
        if candidates.is_empty() {
            warn!("Candidate universe is empty");
            return Ok(Vec::new());
        }

        let limit = self.config.periods.iter().copied().max().unwrap_or(1);
        let histories = self
            .exchange
            .funding_history(&candidates, limit)
            .await
            .context("Failed to fetch funding histories")?;

        let ranked = rank_histories(&candidates, &histories, &self.config);
        info!(
            candidates = candidates.len(),
            ranked = ranked.len(),
            top = ?ranked.iter().map(|s| s.symbol.as_str()).collect::<Vec<_>>(),
            "Funding ranking refreshed"
        );
        Ok(ranked)
    }

    /// Candidates from the source (or fallback), de-duplicated, minus
    /// unsupported symbols.
    pub async fn candidate_universe(&self) -> Vec<String> {
        let candidates = match self.source.candidates().await {
            Ok(candidates) if !candidates.is_empty() => candidates,
            Ok(_) => {
                warn!("Candidate source returned nothing, using static pair list");
                self.fallback.clone()
            }
            Err(e) => {
                warn!(error = %e, "Candidate source failed, using static pair list");
                self.fallback.clone()
            }
        };

        let unsupported = match self.unsupported.unsupported_symbols() {
            Ok(set) => set,
            Err(e) => {
                warn!(error = %e, "Failed to load unsupported symbols");
                Default::default()
            }
        };

        dedup_preserving_order(candidates)
            .into_iter()
            .filter(|symbol| !unsupported.contains(symbol))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FailurePoint, MockExchange};
    use crate::persistence::SqliteStore;
    use crate::strategy::universe::{MockCandidateSource, StaticCandidates};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn scoring() -> ScoringConfig {
        ScoringConfig {
            periods: vec![8, 24, 72],
            weights: vec![dec!(0.5), dec!(0.3), dec!(0.2)],
            top_pairs_count: 3,
            ..Default::default()
        }
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    // =========================================================================
    // Scoring
    // =========================================================================

    #[test]
    fn test_identical_samples_score_equals_sample() {
        let samples = vec![dec!(0.001); 8];
        let score = score_history("AUSDT", &samples, &[8, 24, 72], &[dec!(0.5), dec!(0.3), dec!(0.2)])
            .unwrap();
        assert_eq!(score.score, dec!(0.001));
        assert!(check_eligibility(&score, false).is_ok());
    }

    #[test]
    fn test_periods_weighted_by_realised_weight() {
        // 8 samples of 0.002 followed by 16 of 0.0005: period 8 avg 0.002,
        // period 24 avg 0.001, period 72 (only 24 samples) also 0.001.
        let mut samples = vec![dec!(0.002); 8];
        samples.extend(vec![dec!(0.0005); 16]);
        let score = score_history("X", &samples, &[8, 24, 72], &[dec!(0.5), dec!(0.3), dec!(0.2)])
            .unwrap();
        assert_eq!(score.period_averages[0], Some(dec!(0.002)));
        assert_eq!(score.period_averages[1], Some(dec!(0.001)));
        // 0.5*0.002 + 0.3*0.001 + 0.2*0.001 = 0.0015
        assert_eq!(score.score, dec!(0.0015));
    }

    #[test]
    fn test_empty_history_has_no_score() {
        assert!(score_history("X", &[], &[8], &[dec!(1)]).is_none());
    }

    #[test]
    fn test_negative_latest_rejected_without_reverse_policy() {
        let samples = vec![dec!(-0.0001), dec!(0.001), dec!(0.001)];
        let score = score_history("X", &samples, &[8], &[dec!(1)]).unwrap();
        assert_eq!(
            check_eligibility(&score, false),
            Err(RejectReason::NegativeFunding)
        );
        // With reverse funding allowed, the positive average still disagrees.
        assert_eq!(
            check_eligibility(&score, true),
            Err(RejectReason::TrendReversal)
        );
    }

    #[test]
    fn test_sign_disagreement_rejected() {
        let samples = vec![dec!(0.0001), dec!(-0.002), dec!(-0.002)];
        let score = score_history("X", &samples, &[8], &[dec!(1)]).unwrap();
        assert!(score.score < Decimal::ZERO);
        assert_eq!(check_eligibility(&score, false), Err(RejectReason::NegativeFunding));
        assert_eq!(check_eligibility(&score, true), Err(RejectReason::TrendReversal));
    }

    #[test]
    fn test_rank_sorts_by_abs_score_and_truncates() {
        let mut histories = HashMap::new();
        histories.insert("AUSDT".to_string(), vec![dec!(0.0001); 10]);
        histories.insert("BUSDT".to_string(), vec![dec!(0.0005); 10]);
        histories.insert("CUSDT".to_string(), vec![dec!(-0.0009); 10]);
        histories.insert("DUSDT".to_string(), vec![dec!(0.0003); 10]);
        let mut config = scoring();
        config.top_pairs_count = 2;
        config.reverse_funding_rate = true;

        let ranked = rank_histories(
            &symbols(&["AUSDT", "BUSDT", "CUSDT", "DUSDT", "EUSDT"]),
            &histories,
            &config,
        );
        let order: Vec<_> = ranked.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(order, vec!["CUSDT", "BUSDT"]);
    }

    // =========================================================================
    // Ranker with exchange and store
    // =========================================================================

    fn ranker_with(source: Box<dyn CandidateSource>, mock: Arc<MockExchange>) -> FundingRanker {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.add_unsupported_symbol("BADUSDT").unwrap();
        FundingRanker::new(mock, source, symbols(&["BTCUSDT"]), store, scoring()).unwrap()
    }

    #[tokio::test]
    async fn test_failing_symbol_is_skipped() {
        let mock = Arc::new(MockExchange::default());
        mock.set_funding_history("BTCUSDT", vec![dec!(0.0001); 10]).await;
        mock.set_funding_history("ETHUSDT", vec![dec!(0.0002); 10]).await;
        mock.fail("ETHUSDT", FailurePoint::FundingHistory).await;

        let source = Box::new(StaticCandidates::new(symbols(&["BTCUSDT", "ETHUSDT"])));
        let ranker = ranker_with(source, mock);
        let ranked = ranker.refresh().await.unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn test_unsupported_and_duplicates_removed() {
        let mock = Arc::new(MockExchange::default());
        let source = Box::new(StaticCandidates::new(symbols(&[
            "ETHUSDT", "BADUSDT", "ETHUSDT", "SOLUSDT",
        ])));
        let ranker = ranker_with(source, mock);
        assert_eq!(ranker.candidate_universe().await, vec!["ETHUSDT", "SOLUSDT"]);
    }

    #[tokio::test]
    async fn test_source_failure_falls_back_to_static_list() {
        let mock = Arc::new(MockExchange::default());
        let mut source = MockCandidateSource::new();
        source
            .expect_candidates()
            .times(1)
            .returning(|| Err(anyhow::anyhow!("listings unavailable")));

        let ranker = ranker_with(Box::new(source), mock);
        assert_eq!(ranker.candidate_universe().await, vec!["BTCUSDT"]);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_error_not_empty_ranking() {
        let mock = Arc::new(MockExchange::default());
        mock.set_funding_history("BTCUSDT", vec![dec!(-0.001); 10]).await;
        let source = Box::new(StaticCandidates::new(symbols(&["BTCUSDT"])));
        let mut ranker = ranker_with(source, mock.clone());
        let midday = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        // Every candidate filtered out is a valid, empty ranking.
        assert!(ranker.rank(midday).await.unwrap().is_empty());

        mock.fail("BTCUSDT", FailurePoint::FundingHistory).await;
        assert!(ranker.rank(midday).await.is_err());
    }

    #[tokio::test]
    async fn test_cache_reused_away_from_settlement() {
        let mock = Arc::new(MockExchange::default());
        mock.set_funding_history("BTCUSDT", vec![dec!(0.0001); 10]).await;
        let source = Box::new(StaticCandidates::new(symbols(&["BTCUSDT", "ETHUSDT"])));
        let mut ranker = ranker_with(source, mock.clone());

        let midday = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let first = ranker.rank(midday).await.unwrap();
        assert_eq!(first.len(), 1);

        // New data appears, but the cache holds until a settlement window.
        mock.set_funding_history("ETHUSDT", vec![dec!(0.0009); 10]).await;
        assert_eq!(ranker.rank(midday).await.unwrap(), first);

        let near = Utc.with_ymd_and_hms(2024, 3, 1, 15, 50, 0).unwrap();
        let refreshed = ranker.rank(near).await.unwrap();
        assert_eq!(refreshed[0].symbol, "ETHUSDT");
        assert_eq!(refreshed.len(), 2);
    }
}
