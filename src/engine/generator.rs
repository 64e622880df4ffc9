use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::aggregator;
use super::extractor;
use super::snapshot::CommittedSnapshot;
use crate::config::EngineConfig;
use crate::data::{CandleFeed, SignalSink};
use crate::domain::{ContributionStatus, Signal, StoreKey, TimeframeContribution};

/// Online inference over committed snapshots.
///
/// Holds one [`CommittedSnapshot`] per (coin, timeframe). Snapshots are only
/// replaced wholesale by [`SignalGenerator::reload`], so a cycle never sees a
/// store that a trainer is still writing.
pub struct SignalGenerator {
    config: EngineConfig,
    snapshots: HashMap<StoreKey, CommittedSnapshot>,
}

impl SignalGenerator {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            snapshots: HashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Use an in-memory snapshot instead of the one on disk.
    pub fn insert_snapshot(&mut self, snapshot: CommittedSnapshot) {
        self.snapshots.insert(snapshot.key().clone(), snapshot);
    }

    pub fn snapshot(&self, key: &StoreKey) -> Option<&CommittedSnapshot> {
        self.snapshots.get(key)
    }

    /// Re-read the committed snapshots of `coin` for every configured
    /// timeframe. Corrupt snapshots are replaced by empty (untrained) ones.
    pub fn reload(&mut self, coin: &str) {
        for &timeframe in &self.config.timeframes {
            let key = StoreKey::new(coin, timeframe);
            let path = key.snapshot_path(&self.config.paths.models_dir);
            let (snapshot, warning) =
                CommittedSnapshot::open(&path, key.clone(), self.config.store.clone());
            if let Some(warning) = warning {
                tracing::warn!(store = %key, %warning, "Serving timeframe as untrained");
            }
            self.snapshots.insert(key, snapshot);
        }
    }

    fn contribution(
        &self,
        key: &StoreKey,
        feed: &dyn CandleFeed,
        now: DateTime<Utc>,
    ) -> TimeframeContribution {
        let timeframe = key.timeframe;
        let Some(snapshot) = self
            .snapshots
            .get(key)
            .filter(|s| s.committed_at().is_some())
        else {
            return TimeframeContribution::neutral(
                timeframe,
                ContributionStatus::Untrained,
                None,
                true,
            );
        };

        let committed_at = snapshot.committed_at();
        let stale = snapshot.is_stale(now, self.config.freshness_window());
        if stale {
            tracing::warn!(store = %key, committed_at = ?committed_at, "Snapshot is stale");
        }

        let n = self.config.window_len;
        let vector = feed
            .candles(&key.coin, timeframe, Some(n + 1))
            .and_then(|candles| extractor::extract(&candles, n));
        let vector = match vector {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(store = %key, error = %e, "Timeframe unavailable this cycle");
                return TimeframeContribution::neutral(
                    timeframe,
                    ContributionStatus::Unavailable,
                    committed_at,
                    stale,
                );
            }
        };

        let store = snapshot.store();
        let candidates =
            store.lookup_candidates(&vector, &self.config.matcher, self.config.matcher.top_k);
        tracing::debug!(
            store = %key,
            candidates = candidates.len(),
            best = ?candidates.first().map(|c| c.distance),
            "Matched"
        );

        aggregator::score_timeframe(
            timeframe,
            &candidates,
            store.config().weight_span(),
            &self.config.aggregator,
            now,
            committed_at,
            stale,
        )
    }

    /// Build the signal for `coin` from the snapshots currently held.
    pub fn generate(&self, coin: &str, feed: &dyn CandleFeed, now: DateTime<Utc>) -> Signal {
        let contributions: Vec<TimeframeContribution> = self
            .config
            .timeframes
            .iter()
            .map(|&tf| self.contribution(&StoreKey::new(coin, tf), feed, now))
            .collect();

        let signal = aggregator::aggregate(coin, contributions, &self.config.aggregator, now);
        tracing::info!(
            coin = %signal.coin,
            kind = ?signal.kind,
            long = signal.long.strength,
            short = signal.short.strength,
            confidence = signal.confidence,
            staleness = signal.staleness,
            "Signal generated"
        );
        signal
    }

    /// One inference cycle: reload, generate and publish for every coin.
    /// Publishing failures are logged and do not stop the other coins.
    pub fn run_cycle(
        &mut self,
        coins: &[String],
        feed: &dyn CandleFeed,
        sink: &dyn SignalSink,
        now: DateTime<Utc>,
    ) -> Vec<Signal> {
        let mut signals = Vec::with_capacity(coins.len());
        for coin in coins {
            self.reload(coin);
            let signal = self.generate(coin, feed, now);
            if let Err(e) = sink.publish(&signal) {
                tracing::warn!(coin = %signal.coin, error = %e, "Failed to publish signal");
            }
            signals.push(signal);
        }
        signals
    }
}
