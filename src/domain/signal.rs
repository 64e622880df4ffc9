use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::Timeframe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short. Multiplying a signed score by this turns it
    /// into "support for this direction".
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

/// Overall reading of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Long,
    Short,
    Neutral,
}

/// Strength and confidence for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DirectionalSignal {
    /// Discrete level in 0..=7.
    pub strength: u8,
    /// In [0, 1].
    pub confidence: f64,
}

/// Why a timeframe contributed what it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionStatus {
    Matched,
    /// Nothing within the distance threshold; neutral contribution.
    NoMatch,
    /// Candles missing or too few for a window; neutral contribution.
    Unavailable,
    /// No committed snapshot exists for this timeframe.
    Untrained,
}

/// One timeframe's share of a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeContribution {
    pub timeframe: Timeframe,
    pub status: ContributionStatus,
    /// Signed score in [-1, 1]; positive favours long.
    pub score: f64,
    pub matched_patterns: usize,
    pub best_distance: Option<f64>,
    /// Weighted average of the candidates' leading close change (%).
    pub predicted_change_pct: Option<f64>,
    /// Same average over the leading high and low changes.
    #[serde(default)]
    pub predicted_high_pct: Option<f64>,
    #[serde(default)]
    pub predicted_low_pct: Option<f64>,
    pub snapshot_committed_at: Option<DateTime<Utc>>,
    pub stale: bool,
}

impl TimeframeContribution {
    /// Neutral contribution for a timeframe that could not be scored.
    pub fn neutral(
        timeframe: Timeframe,
        status: ContributionStatus,
        snapshot_committed_at: Option<DateTime<Utc>>,
        stale: bool,
    ) -> Self {
        Self {
            timeframe,
            status,
            score: 0.0,
            matched_patterns: 0,
            best_distance: None,
            predicted_change_pct: None,
            predicted_high_pct: None,
            predicted_low_pct: None,
            snapshot_committed_at,
            stale,
        }
    }
}

/// The artifact published to the execution side. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub coin: String,
    pub generated_at: DateTime<Utc>,
    pub long: DirectionalSignal,
    pub short: DirectionalSignal,
    /// Confidence of the majority direction.
    pub confidence: f64,
    pub kind: SignalKind,
    pub staleness: bool,
    pub breakdown: Vec<TimeframeContribution>,
}

impl Signal {
    pub fn direction(&self, direction: Direction) -> DirectionalSignal {
        match direction {
            Direction::Long => self.long,
            Direction::Short => self.short,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_sign() {
        assert_eq!(Direction::Long.sign(), 1.0);
        assert_eq!(Direction::Short.sign(), -1.0);
    }

    #[test]
    fn test_neutral_contribution() {
        let c = TimeframeContribution::neutral(
            Timeframe::H4,
            ContributionStatus::Unavailable,
            None,
            true,
        );
        assert_eq!(c.score, 0.0);
        assert_eq!(c.matched_patterns, 0);
        assert!(c.best_distance.is_none());
        assert!(c.stale);
    }

    #[test]
    fn test_signal_serializes_status_snake_case() {
        let json = serde_json::to_string(&ContributionStatus::NoMatch).unwrap();
        assert_eq!(json, "\"no_match\"");
        let kind = serde_json::to_string(&SignalKind::Neutral).unwrap();
        assert_eq!(kind, "\"neutral\"");
    }
}
