//! Multi-timeframe signal aggregation.
//!
//! Each timeframe is reduced to a signed score in [-1, 1] from its ranked
//! candidates. Scores are then combined per direction into a discrete
//! strength (driven by the configured threshold table) and a confidence.

use chrono::{DateTime, Utc};

use super::matcher::Candidate;
use crate::config::AggregatorConfig;
use crate::domain::{
    ContributionStatus, Direction, DirectionalSignal, Signal, SignalKind, Timeframe,
    TimeframeContribution,
};

// ── Per-timeframe score ────────────────────────────────────────────────────────

/// Score derived from one timeframe's candidates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateScore {
    /// Signed, normalized to [-1, 1]; positive favours long.
    pub score: f64,
    /// Weighted averages of the candidates' leading close/high/low change (%).
    pub predicted_change_pct: f64,
    pub predicted_high_pct: f64,
    pub predicted_low_pct: f64,
}

/// Distance-weighted, recency-decayed average of candidate weights:
///
/// `Σ wᵢ·weightᵢ / Σ wᵢ / weight_span`, `wᵢ = 1/(1+dᵢ) · 0.5^(ageᵢ/half_life)`
///
/// `None` when there are no candidates.
pub fn score_candidates(
    candidates: &[Candidate],
    weight_span: f64,
    half_life_hours: f64,
    now: DateTime<Utc>,
) -> Option<CandidateScore> {
    if candidates.is_empty() {
        return None;
    }

    let mut weighted = 0.0;
    let mut predicted = 0.0;
    let mut predicted_high = 0.0;
    let mut predicted_low = 0.0;
    let mut total = 0.0;
    for c in candidates {
        let age_hours = (now - c.last_seen).num_seconds().max(0) as f64 / 3600.0;
        let w = 1.0 / (1.0 + c.distance.max(0.0)) * 0.5f64.powf(age_hours / half_life_hours);
        weighted += w * c.weight;
        predicted += w * c.leading_close_change;
        predicted_high += w * c.leading_high_change;
        predicted_low += w * c.leading_low_change;
        total += w;
    }

    if total <= 0.0 || !total.is_finite() {
        return Some(CandidateScore {
            score: 0.0,
            predicted_change_pct: 0.0,
            predicted_high_pct: 0.0,
            predicted_low_pct: 0.0,
        });
    }

    let score = (weighted / total / weight_span.max(f64::EPSILON)).clamp(-1.0, 1.0);
    Some(CandidateScore {
        score: if score.is_finite() { score } else { 0.0 },
        predicted_change_pct: predicted / total,
        predicted_high_pct: predicted_high / total,
        predicted_low_pct: predicted_low / total,
    })
}

/// Build the breakdown entry for a timeframe that was matched against its
/// snapshot. No candidates gives a neutral `NoMatch` entry.
pub fn score_timeframe(
    timeframe: Timeframe,
    candidates: &[Candidate],
    weight_span: f64,
    config: &AggregatorConfig,
    now: DateTime<Utc>,
    snapshot_committed_at: Option<DateTime<Utc>>,
    stale: bool,
) -> TimeframeContribution {
    match score_candidates(candidates, weight_span, config.recency_half_life_hours, now) {
        Some(scored) => TimeframeContribution {
            timeframe,
            status: ContributionStatus::Matched,
            score: scored.score,
            matched_patterns: candidates.len(),
            best_distance: candidates.first().map(|c| c.distance),
            predicted_change_pct: Some(scored.predicted_change_pct),
            predicted_high_pct: Some(scored.predicted_high_pct),
            predicted_low_pct: Some(scored.predicted_low_pct),
            snapshot_committed_at,
            stale,
        },
        None => TimeframeContribution::neutral(
            timeframe,
            ContributionStatus::NoMatch,
            snapshot_committed_at,
            stale,
        ),
    }
}

// ── Aggregation ────────────────────────────────────────────────────────────────

/// Intermediate per-direction numbers, exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionSummary {
    pub agreeing: usize,
    /// Agreeing timeframes over all timeframes.
    pub agreement: f64,
    /// Mean signed score over all timeframes (this direction positive),
    /// floored at 0.
    pub magnitude: f64,
    pub signal: DirectionalSignal,
}

pub fn summarize(
    scores: &[f64],
    direction: Direction,
    config: &AggregatorConfig,
) -> DirectionSummary {
    if scores.is_empty() {
        return DirectionSummary {
            agreeing: 0,
            agreement: 0.0,
            magnitude: 0.0,
            signal: DirectionalSignal::default(),
        };
    }

    let total = scores.len() as f64;
    let signed: Vec<f64> = scores.iter().map(|s| s * direction.sign()).collect();
    let agreeing: Vec<f64> = signed
        .iter()
        .copied()
        .filter(|s| *s > config.agreement_threshold)
        .collect();

    let agreement = agreeing.len() as f64 / total;
    let magnitude = (signed.iter().sum::<f64>() / total).max(0.0);

    let strength = config
        .strength_table
        .iter()
        .filter(|row| agreement >= row.min_agreement && magnitude > row.min_magnitude)
        .map(|row| row.level)
        .max()
        .unwrap_or(0);

    let confidence = if agreeing.is_empty() {
        0.0
    } else {
        let mean = agreeing.iter().map(|s| s.abs()).sum::<f64>() / agreeing.len() as f64;
        (agreement * mean).clamp(0.0, 1.0)
    };

    DirectionSummary {
        agreeing: agreeing.len(),
        agreement,
        magnitude,
        signal: DirectionalSignal {
            strength,
            confidence,
        },
    }
}

/// Combine per-timeframe contributions into a signal.
///
/// Pure: the same contributions, configuration and timestamp always give the
/// same signal. Staleness is set when any contribution is stale or when there
/// are no contributions at all.
pub fn aggregate(
    coin: &str,
    contributions: Vec<TimeframeContribution>,
    config: &AggregatorConfig,
    generated_at: DateTime<Utc>,
) -> Signal {
    let scores: Vec<f64> = contributions.iter().map(|c| c.score).collect();
    let long = summarize(&scores, Direction::Long, config);
    let short = summarize(&scores, Direction::Short, config);

    let majority = match long.agreeing.cmp(&short.agreeing) {
        std::cmp::Ordering::Greater => long,
        std::cmp::Ordering::Less => short,
        std::cmp::Ordering::Equal => {
            if short.signal.confidence > long.signal.confidence {
                short
            } else {
                long
            }
        }
    };

    let kind = if long.signal.strength > short.signal.strength
        && long.signal.strength >= config.trade_start_level
    {
        SignalKind::Long
    } else if short.signal.strength > long.signal.strength
        && short.signal.strength >= config.trade_start_level
    {
        SignalKind::Short
    } else {
        SignalKind::Neutral
    };

    let staleness = contributions.is_empty() || contributions.iter().any(|c| c.stale);

    Signal {
        coin: coin.trim().to_uppercase(),
        generated_at,
        long: long.signal,
        short: short.signal,
        confidence: majority.signal.confidence,
        kind,
        staleness,
        breakdown: contributions,
    }
}
