use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::extractor::ChangeVector;
use super::matcher::{self, Candidate};
use crate::config::{MatcherConfig, StoreConfig};
use crate::domain::{StoreKey, Timeframe};

// ── Pattern ────────────────────────────────────────────────────────────────────

/// A stored change-vector fingerprint with its learned predictive weight.
///
/// The sign of `weight` is the direction the pattern has historically been
/// followed by (positive = up). `high_weight` / `low_weight` scale the high and
/// low fields in the distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub hash: String,
    pub timeframe: Timeframe,
    pub vector: ChangeVector,
    pub weight: f64,
    pub high_weight: f64,
    pub low_weight: f64,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub hit_count: u64,
    pub success_count: u64,
}

impl Pattern {
    pub fn new(timeframe: Timeframe, vector: ChangeVector, weight: f64, at: DateTime<Utc>) -> Self {
        Self {
            hash: vector.fingerprint(),
            timeframe,
            vector,
            weight,
            high_weight: 1.0,
            low_weight: 1.0,
            created_at: at,
            last_seen: at,
            hit_count: 0,
            success_count: 0,
        }
    }

    pub fn success_rate(&self) -> f64 {
        self.success_count as f64 / self.hit_count.max(1) as f64
    }
}

// ── Outcome ────────────────────────────────────────────────────────────────────

/// A realized forward price move, as seen by the pattern that preceded it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    /// Signed close-to-close change (%).
    pub change_pct: f64,
    pub observed_at: DateTime<Utc>,
}

impl Outcome {
    /// Weight the pattern should move toward: full strength at `scale_pct`,
    /// proportionally less below it.
    pub fn target_weight(&self, cfg: &StoreConfig, scale_pct: f64) -> f64 {
        let s = (self.change_pct.abs() / scale_pct.max(f64::EPSILON)).min(1.0);
        if self.change_pct > 0.0 {
            cfg.max_weight * s
        } else if self.change_pct < 0.0 {
            cfg.min_weight * s
        } else {
            cfg.neutral_weight
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Updated,
    /// Inserted and the named entry was evicted to stay within bounds.
    Evicted(String),
}

// ── PatternStore ───────────────────────────────────────────────────────────────

/// Bounded mapping from fingerprint to pattern for one (coin, timeframe).
///
/// Size never exceeds `config.max_size`; inserting a new fingerprint into a
/// full store evicts exactly one other entry, the one with the lowest
/// retention value.
#[derive(Debug, Clone)]
pub struct PatternStore {
    key: StoreKey,
    config: StoreConfig,
    patterns: HashMap<String, Pattern>,
    committed_at: Option<DateTime<Utc>>,
}

impl PatternStore {
    pub fn new(key: StoreKey, config: StoreConfig) -> Self {
        Self {
            key,
            config,
            patterns: HashMap::new(),
            committed_at: None,
        }
    }

    pub fn key(&self) -> &StoreKey {
        &self.key
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn get(&self, hash: &str) -> Option<&Pattern> {
        self.patterns.get(hash)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.patterns.contains_key(hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.values()
    }

    /// When this store was last committed to disk, if ever.
    pub fn committed_at(&self) -> Option<DateTime<Utc>> {
        self.committed_at
    }

    pub(crate) fn set_committed_at(&mut self, at: Option<DateTime<Utc>>) {
        self.committed_at = at;
    }

    fn clamp_weight(&self, w: f64) -> f64 {
        if !w.is_finite() {
            return self.config.neutral_weight;
        }
        w.clamp(self.config.min_weight, self.config.max_weight)
    }

    fn blend(&self, current: f64, evidence: f64) -> f64 {
        let lr = self.config.learning_rate;
        self.clamp_weight(current + lr * (evidence - current))
    }

    /// Insert a new pattern or fold it into an existing one with the same
    /// fingerprint.
    ///
    /// On collision the existing weights move toward the incoming ones by the
    /// learning rate and `hit_count` grows by one. A new fingerprint is
    /// inserted as-is (weights clamped); if that pushes the store past
    /// `max_size`, the lowest-value other entry is evicted.
    pub fn insert_or_update(&mut self, pattern: Pattern) -> InsertOutcome {
        if let Some(existing) = self.patterns.get(&pattern.hash) {
            let weight = self.blend(existing.weight, pattern.weight);
            let high_weight = blend_field(existing.high_weight, pattern.high_weight, self.config.learning_rate);
            let low_weight = blend_field(existing.low_weight, pattern.low_weight, self.config.learning_rate);

            if let Some(existing) = self.patterns.get_mut(&pattern.hash) {
                existing.weight = weight;
                existing.high_weight = high_weight;
                existing.low_weight = low_weight;
                existing.hit_count += 1;
                existing.success_count =
                    (existing.success_count + pattern.success_count).min(existing.hit_count);
                existing.last_seen = existing.last_seen.max(pattern.last_seen);
            }
            return InsertOutcome::Updated;
        }

        let mut pattern = pattern;
        pattern.weight = self.clamp_weight(pattern.weight);
        pattern.success_count = pattern.success_count.min(pattern.hit_count);
        let hash = pattern.hash.clone();
        self.patterns.insert(hash.clone(), pattern);

        if self.patterns.len() > self.config.max_size {
            if let Some(victim) = self.eviction_candidate(&hash) {
                self.patterns.remove(&victim);
                return InsertOutcome::Evicted(victim);
            }
        }
        InsertOutcome::Inserted
    }

    /// Apply one realized outcome to a stored pattern.
    ///
    /// The weight moves toward the outcome's target by the learning rate
    /// (always within bounds), `hit_count` grows by one and `success_count`
    /// grows when the pre-update weight pointed the same way as the move.
    /// Returns `None` if the pattern is no longer stored, else whether the
    /// prediction succeeded.
    pub fn reinforce(&mut self, hash: &str, outcome: &Outcome, scale_pct: f64) -> Option<bool> {
        let target = outcome.target_weight(&self.config, scale_pct);
        let current = self.patterns.get(hash)?.weight;
        let updated = self.blend(current, target);

        let success = current != 0.0
            && outcome.change_pct != 0.0
            && current.signum() == outcome.change_pct.signum();

        let pattern = self.patterns.get_mut(hash)?;
        pattern.weight = updated;
        pattern.hit_count += 1;
        if success {
            pattern.success_count += 1;
        }
        pattern.last_seen = pattern.last_seen.max(outcome.observed_at);
        Some(success)
    }

    /// Move a pattern's weight toward an outcome without counting a hit. Used
    /// for the first outcome of a freshly seeded pattern.
    pub fn seed_outcome(&mut self, hash: &str, outcome: &Outcome, scale_pct: f64) -> bool {
        let target = outcome.target_weight(&self.config, scale_pct);
        let Some(current) = self.patterns.get(hash).map(|p| p.weight) else {
            return false;
        };
        let updated = self.blend(current, target);
        if let Some(pattern) = self.patterns.get_mut(hash) {
            pattern.weight = updated;
            pattern.last_seen = pattern.last_seen.max(outcome.observed_at);
        }
        true
    }

    /// Up to `top_k` stored patterns within the matcher's distance threshold,
    /// nearest first, ties broken by higher weight.
    pub fn lookup_candidates(
        &self,
        query: &ChangeVector,
        matcher_cfg: &MatcherConfig,
        top_k: usize,
    ) -> Vec<Candidate> {
        matcher::rank(query, self.patterns.values(), matcher_cfg.max_distance, top_k)
    }

    /// Retention value: higher is kept longer.
    ///
    /// `(1 + |w|/span) · (1 + ln(1 + hits)) · 0.5^(age_h / half_life_h)` where
    /// age is measured back from `reference`.
    pub fn retention_value(&self, pattern: &Pattern, reference: DateTime<Utc>) -> f64 {
        let weight_term = 1.0 + pattern.weight.abs() / self.config.weight_span();
        let hit_term = 1.0 + (1.0 + pattern.hit_count as f64).ln();
        let age_hours = (reference - pattern.last_seen).num_seconds().max(0) as f64 / 3600.0;
        let recency = 0.5f64.powf(age_hours / self.config.recency_half_life_hours);
        weight_term * hit_term * recency
    }

    /// Lowest-value entry other than `protected`; ties go to the oldest
    /// `last_seen`, then the smallest hash.
    fn eviction_candidate(&self, protected: &str) -> Option<String> {
        let reference = self.patterns.values().map(|p| p.last_seen).max()?;

        self.patterns
            .values()
            .filter(|p| p.hash != protected)
            .map(|p| (self.retention_value(p, reference), p))
            .min_by(|(va, a), (vb, b)| {
                va.partial_cmp(vb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.last_seen.cmp(&b.last_seen))
                    .then_with(|| a.hash.cmp(&b.hash))
            })
            .map(|(_, p)| p.hash.clone())
    }

    /// Patterns sorted by hash; the order snapshots are written in.
    pub(crate) fn sorted_patterns(&self) -> Vec<&Pattern> {
        let mut all: Vec<&Pattern> = self.patterns.values().collect();
        all.sort_by(|a, b| a.hash.cmp(&b.hash));
        all
    }

    /// Rebuild from loaded patterns, enforcing bounds and counters.
    pub(crate) fn from_patterns(
        key: StoreKey,
        config: StoreConfig,
        patterns: Vec<Pattern>,
        committed_at: Option<DateTime<Utc>>,
    ) -> Self {
        let mut store = Self::new(key, config);
        for mut p in patterns {
            p.success_count = p.success_count.min(p.hit_count);
            store.insert_or_update(p);
        }
        store.committed_at = committed_at;
        store
    }
}

fn blend_field(current: f64, evidence: f64, lr: f64) -> f64 {
    let w = current + lr * (evidence - current);
    if w.is_finite() {
        w.max(0.0)
    } else {
        current
    }
}
