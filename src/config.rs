//! Engine configuration.
//!
//! Every tunable the engine consumes lives here and is injectable from the
//! outside: defaults, then an optional TOML file, then `PATMEM__`-style
//! environment overrides (e.g. `PATMEM_STORE__MAX_SIZE=5000`).

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::domain::Timeframe;
use crate::error::{PatternError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeframes trained and aggregated per coin.
    pub timeframes: Vec<Timeframe>,
    /// Change-vector length N (a window needs N + 1 candles).
    pub window_len: usize,
    /// Snapshots older than this are stale.
    pub freshness_window_hours: i64,
    pub store: StoreConfig,
    pub matcher: MatcherConfig,
    pub trainer: TrainerConfig,
    pub aggregator: AggregatorConfig,
    pub paths: PathsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeframes: vec![Timeframe::H1, Timeframe::H4, Timeframe::D1],
            window_len: 10,
            freshness_window_hours: 14 * 24,
            store: StoreConfig::default(),
            matcher: MatcherConfig::default(),
            trainer: TrainerConfig::default(),
            aggregator: AggregatorConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

/// Pattern store bounds and learning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_size: usize,
    /// Exponential blend factor in (0, 1].
    pub learning_rate: f64,
    pub min_weight: f64,
    pub max_weight: f64,
    /// Weight a freshly seeded pattern starts at.
    pub neutral_weight: f64,
    /// Recency half-life used by the eviction value.
    pub recency_half_life_hours: f64,
    /// A writer lease not refreshed by a commit for this long is reclaimed.
    pub lease_timeout_hours: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            learning_rate: 0.25,
            min_weight: -2.0,
            max_weight: 2.0,
            neutral_weight: 0.0,
            recency_half_life_hours: 24.0 * 30.0,
            lease_timeout_hours: 24.0,
        }
    }
}

impl StoreConfig {
    /// Largest absolute weight; used to normalize weights into [-1, 1].
    pub fn weight_span(&self) -> f64 {
        self.max_weight.abs().max(self.min_weight.abs()).max(f64::EPSILON)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Weighted RMS distance (percentage points) beyond which nothing matches.
    pub max_distance: f64,
    pub top_k: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            max_distance: 0.5,
            top_k: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Checkpoint every K iterations.
    pub checkpoint_interval: u64,
    /// Candles between a pattern and its realized outcome.
    pub outcome_horizon: usize,
    /// Move (%) that maps to a full-strength target weight.
    pub outcome_scale_pct: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 100,
            outcome_horizon: 1,
            outcome_scale_pct: 1.0,
        }
    }
}

/// One row of the strength table: the level is granted when at least
/// `min_agreement` of the timeframes agree and the aggregate magnitude is
/// strictly above `min_magnitude`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrengthLevel {
    pub level: u8,
    pub min_agreement: f64,
    pub min_magnitude: f64,
}

impl StrengthLevel {
    pub fn new(level: u8, min_agreement: f64, min_magnitude: f64) -> Self {
        Self {
            level,
            min_agreement,
            min_magnitude,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// A timeframe agrees with a direction when its score is strictly above this.
    pub agreement_threshold: f64,
    pub recency_half_life_hours: f64,
    /// Minimum strength for a directional `SignalKind`.
    pub trade_start_level: u8,
    pub strength_table: Vec<StrengthLevel>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            agreement_threshold: 0.2,
            recency_half_life_hours: 24.0 * 30.0,
            trade_start_level: 3,
            strength_table: vec![
                StrengthLevel::new(1, 0.33, 0.05),
                StrengthLevel::new(2, 0.33, 0.15),
                StrengthLevel::new(3, 0.5, 0.25),
                StrengthLevel::new(4, 0.66, 0.35),
                StrengthLevel::new(5, 0.66, 0.5),
                StrengthLevel::new(6, 1.0, 0.6),
                StrengthLevel::new(7, 1.0, 0.8),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
    pub signals_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            models_dir: PathBuf::from("models"),
            signals_dir: PathBuf::from("signals"),
        }
    }
}

impl EngineConfig {
    /// Load defaults, then `path` (if given), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("PATMEM")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("timeframes")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::hours(self.freshness_window_hours)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(PatternError::Config(msg));

        if self.timeframes.is_empty() {
            return fail("at least one timeframe is required".into());
        }
        if self.window_len == 0 {
            return fail("window_len must be >= 1".into());
        }
        if self.freshness_window_hours <= 0 {
            return fail("freshness_window_hours must be positive".into());
        }

        let s = &self.store;
        if s.max_size == 0 {
            return fail("store.max_size must be >= 1".into());
        }
        if !(s.learning_rate > 0.0 && s.learning_rate <= 1.0) {
            return fail(format!(
                "store.learning_rate must be in (0, 1], got {}",
                s.learning_rate
            ));
        }
        if !(s.min_weight < 0.0 && s.max_weight > 0.0) {
            return fail(format!(
                "store weight bounds must satisfy min < 0 < max, got [{}, {}]",
                s.min_weight, s.max_weight
            ));
        }
        if s.neutral_weight < s.min_weight || s.neutral_weight > s.max_weight {
            return fail("store.neutral_weight must lie within the weight bounds".into());
        }
        if s.recency_half_life_hours <= 0.0 {
            return fail("store.recency_half_life_hours must be positive".into());
        }
        if !(s.lease_timeout_hours > 0.0) {
            return fail("store.lease_timeout_hours must be positive".into());
        }

        if self.matcher.max_distance < 0.0 || self.matcher.top_k == 0 {
            return fail("matcher.max_distance must be >= 0 and matcher.top_k >= 1".into());
        }

        let t = &self.trainer;
        if t.checkpoint_interval == 0 || t.outcome_horizon == 0 || t.outcome_scale_pct <= 0.0 {
            return fail(
                "trainer.checkpoint_interval, outcome_horizon and outcome_scale_pct must be positive"
                    .into(),
            );
        }

        let a = &self.aggregator;
        if a.agreement_threshold < 0.0 || a.agreement_threshold >= 1.0 {
            return fail("aggregator.agreement_threshold must be in [0, 1)".into());
        }
        if a.recency_half_life_hours <= 0.0 {
            return fail("aggregator.recency_half_life_hours must be positive".into());
        }
        if a.trade_start_level > 7 {
            return fail("aggregator.trade_start_level must be <= 7".into());
        }
        for row in &a.strength_table {
            if row.level == 0 || row.level > 7 {
                return fail(format!("strength level {} outside 1..=7", row.level));
            }
            if !(0.0..=1.0).contains(&row.min_agreement) || !(0.0..=1.0).contains(&row.min_magnitude)
            {
                return fail(format!(
                    "strength level {} thresholds must be in [0, 1]",
                    row.level
                ));
            }
        }

        Ok(())
    }
}
