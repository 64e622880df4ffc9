use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use super::extractor::ChangeVector;
use super::store::Pattern;

/// Per-field weights for the distance. Close always counts 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldWeights {
    pub high: f64,
    pub low: f64,
}

impl FieldWeights {
    pub const UNIFORM: FieldWeights = FieldWeights {
        high: 1.0,
        low: 1.0,
    };

    fn sanitized(self) -> (f64, f64) {
        let clamp = |w: f64| if w.is_finite() { w.max(0.0) } else { 0.0 };
        (clamp(self.high), clamp(self.low))
    }
}

/// Field-weighted RMS difference between two change vectors, in percentage
/// points:
///
/// `sqrt( Σ (Δc² + hw·Δh² + lw·Δl²) / (N · (1 + hw + lw)) )`
///
/// Symmetric in `a` and `b`. Vectors of different length are infinitely far
/// apart.
pub fn distance(a: &ChangeVector, b: &ChangeVector, weights: FieldWeights) -> f64 {
    if a.len() != b.len() {
        return f64::INFINITY;
    }
    if a.is_empty() {
        return 0.0;
    }
    let (hw, lw) = weights.sanitized();

    let sq = |x: &[f64], y: &[f64]| -> f64 {
        x.iter().zip(y.iter()).map(|(p, q)| (p - q) * (p - q)).sum()
    };
    let total = sq(a.close(), b.close()) + hw * sq(a.high(), b.high()) + lw * sq(a.low(), b.low());
    let norm = a.len() as f64 * (1.0 + hw + lw);
    (total / norm).sqrt()
}

/// Distance from a live query to a stored pattern, using the pattern's own
/// field weights.
pub fn pattern_distance(query: &ChangeVector, pattern: &Pattern) -> f64 {
    distance(
        query,
        &pattern.vector,
        FieldWeights {
            high: pattern.high_weight,
            low: pattern.low_weight,
        },
    )
}

/// A ranked match. Owned copy of the fields callers need, so results never
/// borrow from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub hash: String,
    pub distance: f64,
    pub weight: f64,
    pub last_seen: DateTime<Utc>,
    pub hit_count: u64,
    pub success_count: u64,
    /// The pattern's most recent close change (%), used as its next-move hint.
    pub leading_close_change: f64,
    pub leading_high_change: f64,
    pub leading_low_change: f64,
}

impl Candidate {
    fn from_pattern(pattern: &Pattern, distance: f64) -> Self {
        Self {
            hash: pattern.hash.clone(),
            distance,
            weight: pattern.weight,
            last_seen: pattern.last_seen,
            hit_count: pattern.hit_count,
            success_count: pattern.success_count,
            leading_close_change: pattern.vector.close().last().copied().unwrap_or(0.0),
            leading_high_change: pattern.vector.high().last().copied().unwrap_or(0.0),
            leading_low_change: pattern.vector.low().last().copied().unwrap_or(0.0),
        }
    }

    pub fn success_rate(&self) -> f64 {
        self.success_count as f64 / self.hit_count.max(1) as f64
    }
}

/// Ascending distance, then descending weight, then hash.
fn rank_order(a: &Candidate, b: &Candidate) -> Ordering {
    a.distance
        .partial_cmp(&b.distance)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.weight.partial_cmp(&a.weight).unwrap_or(Ordering::Equal))
        .then_with(|| a.hash.cmp(&b.hash))
}

/// Rank `patterns` against `query`, keeping at most `top_k` within
/// `max_distance`. An empty result means "no match".
pub fn rank<'a, I>(query: &ChangeVector, patterns: I, max_distance: f64, top_k: usize) -> Vec<Candidate>
where
    I: IntoIterator<Item = &'a Pattern>,
{
    if top_k == 0 {
        return Vec::new();
    }

    let mut matches: Vec<Candidate> = patterns
        .into_iter()
        .filter_map(|p| {
            let d = pattern_distance(query, p);
            (d.is_finite() && d <= max_distance).then(|| Candidate::from_pattern(p, d))
        })
        .collect();

    matches.sort_by(rank_order);
    matches.truncate(top_k);
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(close: &[f64], high: &[f64], low: &[f64]) -> ChangeVector {
        ChangeVector::new(close.to_vec(), high.to_vec(), low.to_vec()).unwrap()
    }

    fn pattern(v: ChangeVector, weight: f64) -> Pattern {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut p = Pattern::new(crate::domain::Timeframe::H1, v, weight, now);
        p.weight = weight;
        p
    }

    #[test]
    fn test_distance_identical_is_zero() {
        let a = vector(&[1.0, -0.5, 0.3], &[0.8, -0.2, 0.1], &[1.1, -0.7, 0.2]);
        assert!(distance(&a, &a, FieldWeights::UNIFORM).abs() < 1e-12);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = vector(&[1.0, -0.5, 0.3], &[0.8, -0.2, 0.1], &[1.1, -0.7, 0.2]);
        let b = vector(&[0.4, 0.5, -0.3], &[0.1, 0.2, 0.9], &[-1.0, 0.7, 0.0]);
        let w = FieldWeights { high: 0.7, low: 1.9 };
        let ab = distance(&a, &b, w);
        let ba = distance(&b, &a, w);
        assert!((ab - ba).abs() < 1e-12, "ab={} ba={}", ab, ba);
        assert!(ab > 0.0);
    }

    #[test]
    fn test_distance_known_value() {
        // Only close differs, by 3 and 4 → sum sq 25; N=2, uniform → norm 6.
        let a = vector(&[0.0, 0.0], &[0.0, 0.0], &[0.0, 0.0]);
        let b = vector(&[3.0, 4.0], &[0.0, 0.0], &[0.0, 0.0]);
        let d = distance(&a, &b, FieldWeights::UNIFORM);
        assert!((d - (25.0f64 / 6.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_distance_zero_field_weights_ignore_high_low() {
        let a = vector(&[1.0], &[0.0], &[0.0]);
        let b = vector(&[1.0], &[9.0], &[-9.0]);
        let w = FieldWeights { high: 0.0, low: 0.0 };
        assert_eq!(distance(&a, &b, w), 0.0);
        // Negative weights are treated as zero.
        let neg = FieldWeights { high: -1.0, low: -1.0 };
        assert_eq!(distance(&a, &b, neg), 0.0);
    }

    #[test]
    fn test_distance_length_mismatch_is_infinite() {
        let a = vector(&[1.0], &[1.0], &[1.0]);
        let b = vector(&[1.0, 2.0], &[1.0, 2.0], &[1.0, 2.0]);
        assert!(distance(&a, &b, FieldWeights::UNIFORM).is_infinite());
    }

    #[test]
    fn test_rank_identical_first() {
        let q = vector(&[1.0, 2.0], &[1.0, 2.0], &[1.0, 2.0]);
        let patterns = vec![
            pattern(vector(&[1.1, 2.0], &[1.0, 2.0], &[1.0, 2.0]), 1.5),
            pattern(q.clone(), 0.1),
            pattern(vector(&[1.2, 2.1], &[1.0, 2.0], &[1.0, 2.0]), 2.0),
        ];
        let ranked = rank(&q, &patterns, 1.0, 10);
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].distance, 0.0);
        assert_eq!(ranked[0].hash, q.fingerprint());
        assert!(ranked[1].distance <= ranked[2].distance);
    }

    #[test]
    fn test_rank_excludes_beyond_threshold() {
        let q = vector(&[0.0], &[0.0], &[0.0]);
        let patterns = vec![pattern(vector(&[5.0], &[5.0], &[5.0]), 1.0)];
        assert!(rank(&q, &patterns, 1.0, 10).is_empty());
    }

    #[test]
    fn test_rank_ties_broken_by_weight() {
        let q = vector(&[0.0], &[0.0], &[0.0]);
        let patterns = vec![
            pattern(vector(&[0.5], &[0.0], &[0.0]), 0.2),
            pattern(vector(&[-0.5], &[0.0], &[0.0]), 1.8),
        ];
        let ranked = rank(&q, &patterns, 1.0, 10);
        assert_eq!(ranked.len(), 2);
        assert!((ranked[0].distance - ranked[1].distance).abs() < 1e-12);
        assert_eq!(ranked[0].weight, 1.8);
    }

    #[test]
    fn test_rank_truncates_to_top_k() {
        let q = vector(&[0.0], &[0.0], &[0.0]);
        let patterns: Vec<Pattern> = (0..20)
            .map(|i| pattern(vector(&[i as f64 * 0.01], &[0.0], &[0.0]), 1.0))
            .collect();
        let ranked = rank(&q, &patterns, 10.0, 5);
        assert_eq!(ranked.len(), 5);
        assert_eq!(ranked[0].distance, 0.0);
        assert!(rank(&q, &patterns, 10.0, 0).is_empty());
    }

    #[test]
    fn test_rank_is_stable_across_input_order() {
        let q = vector(&[0.0], &[0.0], &[0.0]);
        let mut patterns: Vec<Pattern> = (0..10)
            .map(|i| pattern(vector(&[(i % 3) as f64 * 0.1], &[0.0], &[0.0]), (i % 4) as f64 * 0.5))
            .collect();
        let a = rank(&q, &patterns, 10.0, 10);
        patterns.reverse();
        let b = rank(&q, &patterns, 10.0, 10);
        let hashes_a: Vec<_> = a.iter().map(|c| c.hash.clone()).collect();
        let hashes_b: Vec<_> = b.iter().map(|c| c.hash.clone()).collect();
        assert_eq!(hashes_a, hashes_b);
    }
}
