use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::snapshot;
use crate::config::StoreConfig;
use crate::domain::StoreKey;

/// Lifecycle of one (coin, timeframe) model.
///
/// ```text
/// Untrained ──run completes──▶ Trained ──freshness elapses──▶ Stale
///                                 ▲                             │
///                                 └──run completes── Retraining ◀┘ run starts
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Untrained,
    Trained,
    Stale,
    Retraining,
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelState::Untrained => "untrained",
            ModelState::Trained => "trained",
            ModelState::Stale => "stale",
            ModelState::Retraining => "retraining",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelLifecycle {
    state: ModelState,
    last_checkpoint: Option<DateTime<Utc>>,
    freshness: Duration,
}

impl ModelLifecycle {
    pub fn new(freshness: Duration) -> Self {
        Self {
            state: ModelState::Untrained,
            last_checkpoint: None,
            freshness,
        }
    }

    /// Rebuild the state from what is on disk: the last commit time and
    /// whether a writer currently holds the lease.
    pub fn from_observed(
        committed_at: Option<DateTime<Utc>>,
        writer_active: bool,
        now: DateTime<Utc>,
        freshness: Duration,
    ) -> Self {
        let mut lifecycle = Self {
            state: ModelState::Untrained,
            last_checkpoint: committed_at,
            freshness,
        };
        lifecycle.state = lifecycle.settled_state(now);
        if writer_active && lifecycle.state != ModelState::Untrained {
            lifecycle.state = ModelState::Retraining;
        }
        lifecycle
    }

    /// Inspect the snapshot at `path` without taking the lease.
    pub fn inspect(
        path: &Path,
        key: StoreKey,
        config: StoreConfig,
        now: DateTime<Utc>,
        freshness: Duration,
    ) -> Self {
        let loaded = crate::engine::store::PatternStore::load(path, key, config);
        Self::from_observed(
            loaded.store.committed_at(),
            snapshot::is_leased(path),
            now,
            freshness,
        )
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn last_checkpoint(&self) -> Option<DateTime<Utc>> {
        self.last_checkpoint
    }

    fn settled_state(&self, now: DateTime<Utc>) -> ModelState {
        match self.last_checkpoint {
            None => ModelState::Untrained,
            Some(at) if now - at > self.freshness => ModelState::Stale,
            Some(_) => ModelState::Trained,
        }
    }

    /// A trainer run starts. A model that has never been trained stays
    /// `Untrained` until its first run completes.
    pub fn start_run(&mut self) -> ModelState {
        if self.state != ModelState::Untrained {
            self.state = ModelState::Retraining;
        }
        self.state
    }

    /// A trainer run committed its final checkpoint at `at`.
    pub fn complete_run(&mut self, at: DateTime<Utc>) -> ModelState {
        self.last_checkpoint = Some(at);
        self.state = ModelState::Trained;
        self.state
    }

    /// A trainer run ended without a final checkpoint; fall back to whatever
    /// the previous checkpoint supports.
    pub fn abort_run(&mut self, now: DateTime<Utc>) -> ModelState {
        self.state = self.settled_state(now);
        self.state
    }

    /// Apply the passage of time: `Trained` becomes `Stale` once the last
    /// checkpoint is older than the freshness window.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> ModelState {
        if self.state == ModelState::Trained {
            self.state = self.settled_state(now);
        }
        self.state
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.settled_state(now) != ModelState::Trained
    }
}
