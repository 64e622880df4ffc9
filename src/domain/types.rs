use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{PatternError, Result};

/// OHLCV candle, oldest-first within a feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket open time in milliseconds since the epoch.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp).unwrap_or_default()
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// Reject candles whose prices cannot produce a percentage change or whose
    /// high/low do not bracket open and close.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| PatternError::InvalidCandle {
            timestamp: self.timestamp,
            reason: reason.to_string(),
        };
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(invalid("prices and volume must be finite"));
        }
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(invalid("prices must be positive"));
        }
        if self.volume < 0.0 {
            return Err(invalid("volume must be non-negative"));
        }
        if self.high < self.low || self.high < self.open || self.high < self.close {
            return Err(invalid("high must be the highest price"));
        }
        if self.low > self.open || self.low > self.close {
            return Err(invalid("low must be the lowest price"));
        }
        Ok(())
    }
}

/// Candle bucket duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
    H2,
    H4,
    H8,
    H12,
    D1,
    W1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 10] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H8,
        Timeframe::H12,
        Timeframe::D1,
        Timeframe::W1,
    ];

    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H2 => Duration::hours(2),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::H8 => Duration::hours(8),
            Timeframe::H12 => Duration::hours(12),
            Timeframe::D1 => Duration::days(1),
            Timeframe::W1 => Duration::weeks(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H8 => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase();
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == normalized)
            .ok_or_else(|| PatternError::Config(format!("unknown timeframe: {}", s)))
    }
}

impl TryFrom<String> for Timeframe {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

/// Identity of one independently trained pattern memory.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey {
    pub coin: String,
    pub timeframe: Timeframe,
}

impl StoreKey {
    pub fn new(coin: &str, timeframe: Timeframe) -> Self {
        Self {
            coin: coin.trim().to_uppercase(),
            timeframe,
        }
    }

    /// `<models_dir>/<COIN>/<timeframe>.store.json`
    pub fn snapshot_path(&self, models_dir: &Path) -> PathBuf {
        models_dir
            .join(&self.coin)
            .join(format!("{}.store.json", self.timeframe))
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.coin, self.timeframe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: 0,
            open,
            high,
            low,
            close,
            volume: 10.0,
        }
    }

    #[test]
    fn test_candle_validate_ok() {
        assert!(candle(100.0, 105.0, 95.0, 102.0).validate().is_ok());
    }

    #[test]
    fn test_candle_validate_rejects_zero_price() {
        let err = candle(0.0, 105.0, 95.0, 102.0).validate().unwrap_err();
        assert!(matches!(err, PatternError::InvalidCandle { .. }));
    }

    #[test]
    fn test_candle_validate_rejects_inverted_range() {
        assert!(candle(100.0, 99.0, 101.0, 100.0).validate().is_err());
        assert!(candle(100.0, 105.0, 101.0, 102.0).validate().is_err());
    }

    #[test]
    fn test_candle_validate_rejects_non_finite() {
        assert!(candle(100.0, 105.0, 95.0, f64::NAN).validate().is_err());
        assert!(candle(100.0, f64::INFINITY, 95.0, 102.0).validate().is_err());
        let mut c = candle(100.0, 105.0, 95.0, 102.0);
        c.volume = f64::NAN;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_candle_bullish() {
        assert!(candle(100.0, 105.0, 95.0, 102.0).is_bullish());
        assert!(!candle(100.0, 105.0, 95.0, 98.0).is_bullish());
    }

    #[test]
    fn test_timeframe_round_trip_str() {
        for tf in Timeframe::ALL {
            let parsed: Timeframe = tf.to_string().parse().unwrap();
            assert_eq!(parsed, tf);
        }
        assert_eq!("4H".parse::<Timeframe>().unwrap(), Timeframe::H4);
        assert!("3h".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_timeframe_serde_uses_short_names() {
        let json = serde_json::to_string(&Timeframe::D1).unwrap();
        assert_eq!(json, "\"1d\"");
        let tf: Timeframe = serde_json::from_str("\"15m\"").unwrap();
        assert_eq!(tf, Timeframe::M15);
    }

    #[test]
    fn test_timeframe_duration() {
        assert_eq!(Timeframe::H4.duration(), Duration::hours(4));
        assert_eq!(Timeframe::W1.duration(), Duration::days(7));
    }

    #[test]
    fn test_store_key_normalizes_coin() {
        let key = StoreKey::new(" btc ", Timeframe::H1);
        assert_eq!(key.coin, "BTC");
        assert_eq!(key.to_string(), "BTC/1h");
        let path = key.snapshot_path(Path::new("/models"));
        assert_eq!(path, PathBuf::from("/models/BTC/1h.store.json"));
    }
}
