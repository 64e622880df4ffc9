use std::path::PathBuf;
use std::sync::Mutex;

use crate::domain::Signal;
use crate::engine::snapshot::write_atomic;
use crate::error::{PatternError, Result};

/// Destination for emitted signals.
pub trait SignalSink: Send + Sync {
    fn publish(&self, signal: &Signal) -> Result<()>;
}

/// Writes the latest signal per coin to `<dir>/<COIN>.signal.json`, replacing
/// the previous one atomically.
#[derive(Debug, Clone)]
pub struct FileSignalSink {
    dir: PathBuf,
}

impl FileSignalSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, coin: &str) -> PathBuf {
        self.dir
            .join(format!("{}.signal.json", coin.trim().to_uppercase()))
    }

    /// Read back the last published signal for `coin`, if any.
    pub fn latest(&self, coin: &str) -> Result<Option<Signal>> {
        let path = self.path_for(coin);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

impl SignalSink for FileSignalSink {
    fn publish(&self, signal: &Signal) -> Result<()> {
        let path = self.path_for(&signal.coin);
        let bytes = serde_json::to_vec_pretty(signal)?;
        write_atomic(&path, &bytes)?;
        tracing::debug!(coin = %signal.coin, path = %path.display(), "Signal published");
        Ok(())
    }
}

/// Collects signals in memory.
#[derive(Debug, Default)]
pub struct MemorySignalSink {
    signals: Mutex<Vec<Signal>>,
}

impl MemorySignalSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<Signal> {
        match self.signals.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl SignalSink for MemorySignalSink {
    fn publish(&self, signal: &Signal) -> Result<()> {
        self.signals
            .lock()
            .map_err(|_| PatternError::Io(std::io::Error::other("signal buffer poisoned")))?
            .push(signal.clone());
        Ok(())
    }
}
