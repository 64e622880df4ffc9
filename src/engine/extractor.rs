use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::Candle;
use crate::error::{PatternError, Result};

// ── Change vector ──────────────────────────────────────────────────────────────

/// Percentage changes between consecutive candles for close, high and low.
/// All three sequences have the same length N.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeVector {
    close: Vec<f64>,
    high: Vec<f64>,
    low: Vec<f64>,
}

impl ChangeVector {
    /// Build from three equally long sequences.
    pub fn new(close: Vec<f64>, high: Vec<f64>, low: Vec<f64>) -> Result<Self> {
        if close.len() != high.len() || close.len() != low.len() {
            return Err(PatternError::InsufficientData {
                needed: close.len().max(high.len()).max(low.len()),
                got: close.len().min(high.len()).min(low.len()),
            });
        }
        Ok(Self { close, high, low })
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    pub fn close(&self) -> &[f64] {
        &self.close
    }

    pub fn high(&self) -> &[f64] {
        &self.high
    }

    pub fn low(&self) -> &[f64] {
        &self.low
    }

    /// Identity of the pattern: SHA-256 over the values rounded to 2 decimals,
    /// truncated to 16 hex characters. Vectors that agree to 0.01 percentage
    /// points share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (tag, series) in [("c", &self.close), ("h", &self.high), ("l", &self.low)] {
            hasher.update(tag.as_bytes());
            for v in series.iter() {
                let q = quantize(*v);
                hasher.update(q.to_le_bytes());
            }
        }
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }
}

/// Round to 2 decimals as an integer count of hundredths (sign-stable for -0.0).
fn quantize(v: f64) -> i64 {
    (v * 100.0).round() as i64
}

// ── Extraction ─────────────────────────────────────────────────────────────────

fn pct_change(prev: f64, curr: f64, candle: &Candle) -> Result<f64> {
    if prev <= 0.0 || !prev.is_finite() {
        return Err(PatternError::InvalidCandle {
            timestamp: candle.timestamp,
            reason: format!("non-positive reference price {}", prev),
        });
    }
    if !curr.is_finite() {
        return Err(PatternError::InvalidCandle {
            timestamp: candle.timestamp,
            reason: format!("non-finite price {}", curr),
        });
    }
    Ok((curr - prev) / prev * 100.0)
}

/// Derive an N-long change vector from the most recent N + 1 candles.
///
/// `candles` must be oldest first. Element i is
/// `(price[i+1] - price[i]) / price[i] * 100` over the tail window.
pub fn extract(candles: &[Candle], n: usize) -> Result<ChangeVector> {
    let needed = n + 1;
    if n == 0 || candles.len() < needed {
        return Err(PatternError::InsufficientData {
            needed,
            got: candles.len(),
        });
    }

    let window = &candles[candles.len() - needed..];
    let mut close = Vec::with_capacity(n);
    let mut high = Vec::with_capacity(n);
    let mut low = Vec::with_capacity(n);

    for pair in window.windows(2) {
        let (prev, curr) = (&pair[0], &pair[1]);
        close.push(pct_change(prev.close, curr.close, prev)?);
        high.push(pct_change(prev.high, curr.high, prev)?);
        low.push(pct_change(prev.low, curr.low, prev)?);
    }

    Ok(ChangeVector { close, high, low })
}

/// Every (N+1)-candle window in order, as `(end_index, vector)` where
/// `end_index` is the last candle of the window.
pub fn windows(
    candles: &[Candle],
    n: usize,
) -> impl Iterator<Item = (usize, Result<ChangeVector>)> + '_ {
    (n.max(1)..candles.len()).map(move |end| (end, extract(&candles[..=end], n)))
}

/// Close-to-close move (%) from `candles[from]` to `candles[to]`.
/// `None` when either index is out of range or the entry price is not positive.
pub fn forward_change(candles: &[Candle], from: usize, to: usize) -> Option<f64> {
    let entry = candles.get(from)?.close;
    let exit = candles.get(to)?.close;
    if entry <= 0.0 || !entry.is_finite() || !exit.is_finite() {
        return None;
    }
    Some((exit - entry) / entry * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                timestamp: i as i64 * 3_600_000,
                open: c,
                high: c * 1.01,
                low: c * 0.99,
                close: c,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_extract_exact_window_length() {
        let candles = candles_from_closes(&[100.0, 101.0, 99.99, 102.0, 102.0]);
        let v = extract(&candles, 4).unwrap();
        assert_eq!(v.len(), 4);
        assert_eq!(v.close().len(), 4);
        assert_eq!(v.high().len(), 4);
        assert_eq!(v.low().len(), 4);
    }

    #[test]
    fn test_extract_values() {
        let candles = candles_from_closes(&[100.0, 102.0, 99.96]);
        let v = extract(&candles, 2).unwrap();
        assert!((v.close()[0] - 2.0).abs() < 1e-10, "close[0]={}", v.close()[0]);
        assert!((v.close()[1] - (-2.0)).abs() < 1e-10, "close[1]={}", v.close()[1]);
        // High and low scale with close, so the changes match.
        assert!((v.high()[0] - 2.0).abs() < 1e-9);
        assert!((v.low()[1] - (-2.0)).abs() < 1e-9);
    }

    #[test]
    fn test_extract_rejects_non_finite_price() {
        let mut candles = candles_from_closes(&[100.0, 101.0, 102.0]);
        candles[2].close = f64::NAN;
        let err = extract(&candles, 2).unwrap_err();
        assert!(matches!(err, PatternError::InvalidCandle { .. }));
        assert_eq!(forward_change(&candles, 1, 2), None);
    }

    #[test]
    fn test_extract_insufficient_data() {
        let candles = candles_from_closes(&[100.0, 101.0, 102.0]);
        let err = extract(&candles, 3).unwrap_err();
        match err {
            PatternError::InsufficientData { needed, got } => {
                assert_eq!(needed, 4);
                assert_eq!(got, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_extract_uses_most_recent_window() {
        let candles = candles_from_closes(&[50.0, 100.0, 110.0]);
        let v = extract(&candles, 1).unwrap();
        assert!((v.close()[0] - 10.0).abs() < 1e-10);
    }

    #[test]
    fn test_extract_rejects_zero_price() {
        let mut candles = candles_from_closes(&[100.0, 101.0, 102.0]);
        candles[1].close = 0.0;
        let err = extract(&candles, 2).unwrap_err();
        assert!(matches!(err, PatternError::InvalidCandle { .. }));
    }

    #[test]
    fn test_extract_is_deterministic() {
        let candles = candles_from_closes(&[100.0, 100.5, 99.7, 101.2, 100.9, 102.3]);
        let a = extract(&candles, 5).unwrap();
        let b = extract(&candles, 5).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_groups_close_values() {
        let a = ChangeVector::new(vec![1.001], vec![0.5], vec![-0.5]).unwrap();
        let b = ChangeVector::new(vec![1.004], vec![0.5], vec![-0.5]).unwrap();
        let c = ChangeVector::new(vec![1.02], vec![0.5], vec![-0.5]).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);
    }

    #[test]
    fn test_fingerprint_distinguishes_fields() {
        let a = ChangeVector::new(vec![1.0], vec![2.0], vec![3.0]).unwrap();
        let b = ChangeVector::new(vec![1.0], vec![3.0], vec![2.0]).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_change_vector_rejects_ragged_input() {
        assert!(ChangeVector::new(vec![1.0, 2.0], vec![1.0], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn test_windows_slide_one_candle() {
        let candles = candles_from_closes(&[100.0, 101.0, 102.0, 103.0, 104.0]);
        let ends: Vec<usize> = windows(&candles, 3)
            .map(|(end, v)| {
                assert_eq!(v.unwrap().len(), 3);
                end
            })
            .collect();
        assert_eq!(ends, vec![3, 4]);
        assert_eq!(windows(&candles, 5).count(), 0);
    }

    #[test]
    fn test_forward_change() {
        let candles = candles_from_closes(&[100.0, 102.0, 103.0]);
        assert!((forward_change(&candles, 0, 2).unwrap() - 3.0).abs() < 1e-10);
        assert!(forward_change(&candles, 1, 5).is_none());
    }
}
