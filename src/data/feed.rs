use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::domain::{Candle, Timeframe};
use crate::error::{PatternError, Result};

/// Source of ordered (oldest first) candles per (coin, timeframe).
pub trait CandleFeed: Send + Sync {
    /// The most recent `limit` candles (all of them when `None`). A feed
    /// that cannot answer fails with `MissingData`.
    fn candles(&self, coin: &str, timeframe: Timeframe, limit: Option<usize>)
        -> Result<Vec<Candle>>;
}

fn take_tail(mut candles: Vec<Candle>, limit: Option<usize>) -> Vec<Candle> {
    if let Some(limit) = limit {
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
    }
    candles
}

// ── CSV files ──────────────────────────────────────────────────────────────────

/// Reads `<data_dir>/<coin>_<timeframe>.csv` (lowercase coin), with a header
/// row `timestamp,open,high,low,close,volume` and timestamps in milliseconds.
#[derive(Debug, Clone)]
pub struct CsvCandleFeed {
    data_dir: PathBuf,
}

impl CsvCandleFeed {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn path_for(&self, coin: &str, timeframe: Timeframe) -> PathBuf {
        self.data_dir
            .join(format!("{}_{}.csv", coin.trim().to_lowercase(), timeframe))
    }
}

impl CandleFeed for CsvCandleFeed {
    fn candles(
        &self,
        coin: &str,
        timeframe: Timeframe,
        limit: Option<usize>,
    ) -> Result<Vec<Candle>> {
        let path = self.path_for(coin, timeframe);
        if !path.exists() {
            return Err(PatternError::missing(
                coin,
                timeframe,
                format!("candle file not found: {}", path.display()),
            ));
        }

        let candles = load_candles_csv(&path)
            .map_err(|e| PatternError::missing(coin, timeframe, e.to_string()))?;
        Ok(take_tail(candles, limit))
    }
}

/// Write candles as CSV with a header row.
pub fn save_candles_csv(candles: &[Candle], path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let mut writer = csv::Writer::from_path(path)?;
    for c in candles {
        writer.serialize(c)?;
    }
    writer.flush()?;
    Ok(())
}

/// Load candles from CSV. Rows that fail sanity validation are dropped with a
/// warning; out-of-order timestamps reject the whole file.
pub fn load_candles_csv(path: &Path) -> Result<Vec<Candle>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut candles: Vec<Candle> = Vec::new();
    let mut dropped = 0usize;

    for row in reader.deserialize() {
        let candle: Candle = row?;
        match candle.validate() {
            Ok(()) => candles.push(candle),
            Err(e) => {
                dropped += 1;
                tracing::debug!(path = %path.display(), error = %e, "Dropping invalid candle");
            }
        }
    }
    if dropped > 0 {
        tracing::warn!(path = %path.display(), dropped, "Invalid candles dropped");
    }

    if let Some(i) = (1..candles.len()).find(|&i| candles[i].timestamp <= candles[i - 1].timestamp)
    {
        return Err(PatternError::InvalidCandle {
            timestamp: candles[i].timestamp,
            reason: format!("{} has non-monotonic timestamps", path.display()),
        });
    }

    Ok(candles)
}

// ── In memory ──────────────────────────────────────────────────────────────────

/// Feed backed by candles held in memory; for embedding and replay.
#[derive(Debug, Clone, Default)]
pub struct MemoryCandleFeed {
    series: HashMap<(String, Timeframe), Vec<Candle>>,
}

impl MemoryCandleFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, coin: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.series
            .insert((coin.trim().to_uppercase(), timeframe), candles);
    }
}

impl CandleFeed for MemoryCandleFeed {
    fn candles(
        &self,
        coin: &str,
        timeframe: Timeframe,
        limit: Option<usize>,
    ) -> Result<Vec<Candle>> {
        self.series
            .get(&(coin.trim().to_uppercase(), timeframe))
            .cloned()
            .map(|c| take_tail(c, limit))
            .ok_or_else(|| PatternError::missing(coin, timeframe, "no candles loaded"))
    }
}
