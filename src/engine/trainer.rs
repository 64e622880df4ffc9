use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

use super::extractor::{self, ChangeVector};
use super::lifecycle::ModelLifecycle;
use super::snapshot::StoreWriter;
use super::store::{InsertOutcome, Outcome, Pattern};
use crate::config::EngineConfig;
use crate::data::CandleFeed;
use crate::domain::{Candle, StoreKey};
use crate::error::{PatternError, Result, Severity};

// ── Training state ─────────────────────────────────────────────────────────────

/// Counters for one trainer run over one (coin, timeframe). Owned by the
/// trainer and discarded with it.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub key: StoreKey,
    pub candles_processed: u64,
    /// New fingerprints seeded into the store.
    pub patterns_learned: u64,
    /// Existing patterns reinforced by a realized outcome.
    pub patterns_updated: u64,
    pub hits: u64,
    pub successes: u64,
    pub evictions: u64,
    pub skipped_windows: u64,
    pub checkpoints_written: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TrainingState {
    pub fn new(key: StoreKey) -> Self {
        Self {
            key,
            candles_processed: 0,
            patterns_learned: 0,
            patterns_updated: 0,
            hits: 0,
            successes: 0,
            evictions: 0,
            skipped_windows: 0,
            checkpoints_written: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Running success rate of reinforced predictions.
    pub fn success_rate(&self) -> f64 {
        if self.hits == 0 {
            0.0
        } else {
            self.successes as f64 / self.hits as f64
        }
    }

    pub fn duration_secs(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    pub fn candles_per_second(&self) -> f64 {
        let secs = self.duration_secs();
        if secs > 0.0 {
            self.candles_processed as f64 / secs
        } else {
            0.0
        }
    }
}

/// A window seen at `entry_index`, waiting for its outcome horizon.
#[derive(Debug, Clone)]
struct PendingObservation {
    entry_index: usize,
    vector: ChangeVector,
    /// Best match in the store as it was at the entry candle.
    matched: Option<String>,
}

// ── Trainer ────────────────────────────────────────────────────────────────────

/// Sliding-window batch learner for one (coin, timeframe).
///
/// Each step extracts the latest window, matches it against the store and
/// queues it. Once `outcome_horizon` further candles exist the realized move
/// is applied: the matched pattern is reinforced, or a new pattern is seeded
/// at neutral weight. The store is checkpointed every `checkpoint_interval`
/// steps and always once more at the end, including after cancellation.
pub struct Trainer {
    config: EngineConfig,
    state: TrainingState,
}

impl Trainer {
    pub fn new(key: StoreKey, config: EngineConfig) -> Self {
        Self {
            config,
            state: TrainingState::new(key),
        }
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn into_state(self) -> TrainingState {
        self.state
    }

    /// Train over `candles` (oldest first).
    ///
    /// Returns the final state on completion. On cancellation the final
    /// checkpoint is written and `TrainerInterrupted` is returned; the state
    /// stays readable through [`Trainer::state`]. A failed final checkpoint is
    /// `CheckpointFailed`. An invalid config fails with `Config` before any
    /// candle is touched.
    pub fn run(
        &mut self,
        writer: &mut StoreWriter,
        candles: &[Candle],
        cancel: &CancellationToken,
    ) -> Result<TrainingState> {
        self.config.validate()?;
        let n = self.config.window_len;
        if candles.len() < n + 1 {
            return Err(PatternError::InsufficientData {
                needed: n + 1,
                got: candles.len(),
            });
        }

        let interval = self.config.trainer.checkpoint_interval;
        let top_k = 1;

        tracing::info!(
            store = %self.state.key,
            candles = candles.len(),
            existing_patterns = writer.store().len(),
            "Training started"
        );

        let mut pending: VecDeque<PendingObservation> = VecDeque::new();
        let mut interrupted = false;
        let mut iterations: u64 = 0;

        for (end, window) in extractor::windows(candles, n) {
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }

            self.resolve_pending(writer, candles, &mut pending, end);

            match window {
                Ok(vector) => {
                    let matched = writer
                        .store()
                        .lookup_candidates(&vector, &self.config.matcher, top_k)
                        .into_iter()
                        .next()
                        .map(|c| c.hash);
                    pending.push_back(PendingObservation {
                        entry_index: end,
                        vector,
                        matched,
                    });
                }
                Err(e) if e.severity() == Severity::Skip => {
                    self.state.skipped_windows += 1;
                    tracing::debug!(store = %self.state.key, index = end, error = %e, "Window skipped");
                }
                Err(e) => return Err(e),
            }

            self.state.candles_processed += 1;
            iterations += 1;

            if iterations % interval == 0 {
                match writer.commit() {
                    Ok(_) => {
                        self.state.checkpoints_written += 1;
                        tracing::debug!(
                            store = %self.state.key,
                            candles_processed = self.state.candles_processed,
                            patterns = writer.store().len(),
                            "Checkpoint written"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(store = %self.state.key, error = %e, "Checkpoint failed, continuing");
                    }
                }
            }
        }

        // Final checkpoint: the only failure that aborts the run.
        if let Err(e) = writer.commit() {
            tracing::error!(store = %self.state.key, error = %e, "Final checkpoint failed");
            return Err(PatternError::CheckpointFailed {
                path: writer.path().to_path_buf(),
                source: Box::new(e),
            });
        }
        self.state.checkpoints_written += 1;
        self.state.finished_at = Some(Utc::now());

        tracing::info!(
            store = %self.state.key,
            candles_processed = self.state.candles_processed,
            patterns_learned = self.state.patterns_learned,
            patterns_updated = self.state.patterns_updated,
            success_rate = self.state.success_rate(),
            patterns = writer.store().len(),
            candles_per_second = self.state.candles_per_second(),
            interrupted,
            "Training finished"
        );

        if interrupted {
            return Err(PatternError::TrainerInterrupted {
                candles_processed: self.state.candles_processed,
            });
        }
        Ok(self.state.clone())
    }

    /// Apply outcomes for every queued window whose horizon has elapsed by
    /// candle `current`.
    fn resolve_pending(
        &mut self,
        writer: &mut StoreWriter,
        candles: &[Candle],
        pending: &mut VecDeque<PendingObservation>,
        current: usize,
    ) {
        let horizon = self.config.trainer.outcome_horizon;
        let scale = self.config.trainer.outcome_scale_pct;

        while let Some(front) = pending.front() {
            let exit_index = front.entry_index + horizon;
            if exit_index > current {
                break;
            }
            let Some(obs) = pending.pop_front() else {
                break;
            };
            let Some(change_pct) = extractor::forward_change(candles, obs.entry_index, exit_index)
            else {
                self.state.skipped_windows += 1;
                continue;
            };
            let outcome = Outcome {
                change_pct,
                observed_at: candles[exit_index].datetime(),
            };

            let store = writer.store_mut();
            let own_hash = obs.vector.fingerprint();
            let target = obs
                .matched
                .filter(|h| store.contains(h))
                .or_else(|| store.contains(&own_hash).then_some(own_hash));

            match target {
                Some(hash) => {
                    if let Some(success) = store.reinforce(&hash, &outcome, scale) {
                        self.state.patterns_updated += 1;
                        self.state.hits += 1;
                        if success {
                            self.state.successes += 1;
                        }
                    }
                }
                None => {
                    let seeded = Pattern::new(
                        store.key().timeframe,
                        obs.vector,
                        store.config().neutral_weight,
                        candles[obs.entry_index].datetime(),
                    );
                    let hash = seeded.hash.clone();
                    if let InsertOutcome::Evicted(victim) = store.insert_or_update(seeded) {
                        self.state.evictions += 1;
                        tracing::trace!(store = %self.state.key, %victim, "Pattern evicted");
                    }
                    store.seed_outcome(&hash, &outcome, scale);
                    self.state.patterns_learned += 1;
                }
            }
        }
    }
}

/// Train one (coin, timeframe) end to end: fetch candles, take the write
/// lease, run the trainer and track the lifecycle transitions.
pub fn train_pair(
    config: &EngineConfig,
    feed: &dyn CandleFeed,
    key: &StoreKey,
    limit: Option<usize>,
    cancel: &CancellationToken,
) -> Result<TrainingState> {
    config.validate()?;
    let candles = feed.candles(&key.coin, key.timeframe, limit)?;
    let path = key.snapshot_path(&config.paths.models_dir);
    let mut writer = StoreWriter::acquire(&path, key.clone(), config.store.clone())?;
    if let Some(warning) = writer.load_warning() {
        tracing::warn!(store = %key, %warning, "Retraining from an empty store");
    }

    let freshness = config.freshness_window();
    let mut lifecycle =
        ModelLifecycle::from_observed(writer.store().committed_at(), false, Utc::now(), freshness);
    let before = lifecycle.state();
    let during = lifecycle.start_run();
    tracing::info!(store = %key, from = %before, to = %during, "Model lifecycle");

    let mut trainer = Trainer::new(key.clone(), config.clone());
    let result = trainer.run(&mut writer, &candles, cancel);

    match &result {
        Ok(_) | Err(PatternError::TrainerInterrupted { .. }) => {
            let at = writer.store().committed_at().unwrap_or_else(Utc::now);
            let after = lifecycle.complete_run(at);
            tracing::info!(store = %key, from = %during, to = %after, "Model lifecycle");
        }
        Err(e) => {
            let after = lifecycle.abort_run(Utc::now());
            tracing::warn!(store = %key, from = %during, to = %after, error = %e, "Training aborted");
        }
    }
    result
}
