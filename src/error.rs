//! Error taxonomy for the pattern-memory engine.
//!
//! Every failure path is classified as skip, warn or fatal through
//! [`PatternError::severity`], so callers decide what to do with a kind
//! instead of catching everything.

use std::path::PathBuf;
use thiserror::Error;

/// How a caller is expected to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Skip the current cycle and carry on.
    Skip,
    /// Log and continue with a degraded (usually empty) state.
    Warn,
    /// Abort the run.
    Fatal,
}

#[derive(Debug, Error)]
pub enum PatternError {
    /// Fewer candles than the window needs.
    #[error("insufficient data: need {needed} candles, got {got}")]
    InsufficientData { needed: usize, got: usize },

    /// The candle feed could not provide data for a cycle.
    #[error("missing data for {coin} {timeframe}: {reason}")]
    MissingData {
        coin: String,
        timeframe: String,
        reason: String,
    },

    /// A candle with a non-positive price or inconsistent OHLC values.
    #[error("invalid candle at {timestamp}: {reason}")]
    InvalidCandle { timestamp: i64, reason: String },

    /// Snapshot unreadable, unversioned or from another format version.
    #[error("corrupt pattern store at {}: {reason}", path.display())]
    CorruptStore { path: PathBuf, reason: String },

    /// Another trainer holds the write lease for this snapshot.
    #[error("store writer busy: lease {} already held", path.display())]
    WriterBusy { path: PathBuf },

    /// Training was cancelled; the final checkpoint has been written.
    #[error("trainer interrupted after {candles_processed} candles (final checkpoint written)")]
    TrainerInterrupted { candles_processed: u64 },

    /// The final checkpoint of a trainer run could not be written.
    #[error("final checkpoint to {} failed: {source}", path.display())]
    CheckpointFailed {
        path: PathBuf,
        #[source]
        source: Box<PatternError>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<config::ConfigError> for PatternError {
    fn from(err: config::ConfigError) -> Self {
        PatternError::Config(err.to_string())
    }
}

impl PatternError {
    pub fn severity(&self) -> Severity {
        match self {
            PatternError::InsufficientData { .. }
            | PatternError::MissingData { .. }
            | PatternError::InvalidCandle { .. }
            | PatternError::WriterBusy { .. }
            | PatternError::TrainerInterrupted { .. } => Severity::Skip,
            PatternError::CorruptStore { .. }
            | PatternError::Io(_)
            | PatternError::Serialization(_)
            | PatternError::Csv(_) => Severity::Warn,
            PatternError::CheckpointFailed { .. } | PatternError::Config(_) => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    pub(crate) fn missing(coin: &str, timeframe: impl ToString, reason: impl Into<String>) -> Self {
        PatternError::MissingData {
            coin: coin.to_string(),
            timeframe: timeframe.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PatternError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_checkpoint_and_config_are_fatal() {
        let checkpoint = PatternError::CheckpointFailed {
            path: PathBuf::from("/tmp/x.store.json"),
            source: Box::new(PatternError::Io(std::io::Error::other("disk full"))),
        };
        assert!(checkpoint.is_fatal());
        assert!(PatternError::Config("bad".into()).is_fatal());

        let interrupted = PatternError::TrainerInterrupted {
            candles_processed: 10,
        };
        assert!(!interrupted.is_fatal());
        assert_eq!(interrupted.severity(), Severity::Skip);

        let corrupt = PatternError::CorruptStore {
            path: PathBuf::from("/tmp/x"),
            reason: "bad json".into(),
        };
        assert_eq!(corrupt.severity(), Severity::Warn);
    }

    #[test]
    fn test_insufficient_data_message() {
        let err = PatternError::InsufficientData { needed: 11, got: 4 };
        assert_eq!(err.to_string(), "insufficient data: need 11 candles, got 4");
    }

    #[test]
    fn test_missing_helper() {
        let err = PatternError::missing("BTC", "1h", "feed timeout");
        assert!(matches!(err, PatternError::MissingData { .. }));
        assert_eq!(err.severity(), Severity::Skip);
    }
}
