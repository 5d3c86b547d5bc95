//! Mergeable quantile sketch.
//!
//! Exponential (power-of-two) buckets over the magnitude, split by sign,
//! plus exact sum/count/min/max. The contract consumers rely on is
//! `insert`, `merge`, `snapshot → bytes`; the quantile estimator picks the
//! bucket containing the rank and returns its geometric midpoint.

use serde::Serialize;

/// log2 magnitude buckets per sign.
const MAG_BUCKETS: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuantileSketch {
    zero: u64,
    positive: Vec<u64>,
    negative: Vec<u64>,
    count: u64,
    sum: i64,
    min: i64,
    max: i64,
}

impl Default for QuantileSketch {
    fn default() -> Self {
        Self::new()
    }
}

impl QuantileSketch {
    pub fn new() -> Self {
        Self {
            zero: 0,
            positive: vec![0; MAG_BUCKETS],
            negative: vec![0; MAG_BUCKETS],
            count: 0,
            sum: 0,
            min: i64::MAX,
            max: i64::MIN,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn insert(&mut self, value: i64) {
        self.count += 1;
        self.sum = self.sum.wrapping_add(value);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        match value {
            0 => self.zero += 1,
            v if v > 0 => self.positive[magnitude_bucket(v as u64)] += 1,
            v => self.negative[magnitude_bucket(v.unsigned_abs())] += 1,
        }
    }

    pub fn merge(&mut self, other: &QuantileSketch) {
        self.zero += other.zero;
        for (a, b) in self.positive.iter_mut().zip(other.positive.iter()) {
            *a += b;
        }
        for (a, b) in self.negative.iter_mut().zip(other.negative.iter()) {
            *a += b;
        }
        self.count += other.count;
        self.sum = self.sum.wrapping_add(other.sum);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Approximate value at quantile `q` in `[0, 1]`.
    pub fn quantile(&self, q: f64) -> Option<i64> {
        if self.count == 0 {
            return None;
        }
        let rank = ((q.clamp(0.0, 1.0) * self.count as f64).ceil() as u64)
            .clamp(1, self.count);
        let mut seen = 0u64;

        // Negative buckets from most negative up.
        for (i, &c) in self.negative.iter().enumerate().rev() {
            seen += c;
            if seen >= rank {
                return Some(-(bucket_midpoint(i)).max(1));
            }
        }
        seen += self.zero;
        if seen >= rank {
            return Some(0);
        }
        for (i, &c) in self.positive.iter().enumerate() {
            seen += c;
            if seen >= rank {
                return Some(bucket_midpoint(i).clamp(self.min.max(1), self.max));
            }
        }
        Some(self.max)
    }

    /// Compact little-endian serialization for report payloads.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 * (5 + 2 * MAG_BUCKETS));
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.sum.to_le_bytes());
        out.extend_from_slice(&self.min.to_le_bytes());
        out.extend_from_slice(&self.max.to_le_bytes());
        out.extend_from_slice(&self.zero.to_le_bytes());
        for b in &self.negative {
            out.extend_from_slice(&b.to_le_bytes());
        }
        for b in &self.positive {
            out.extend_from_slice(&b.to_le_bytes());
        }
        out
    }
}

fn magnitude_bucket(magnitude: u64) -> usize {
    (63 - magnitude.leading_zeros() as usize).min(MAG_BUCKETS - 1)
}

fn bucket_midpoint(bucket: usize) -> i64 {
    // Geometric midpoint of [2^b, 2^(b+1)).
    let low = 1i64 << bucket.min(62);
    low + (low >> 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sketch() {
        let s = QuantileSketch::new();
        assert!(s.is_empty());
        assert_eq!(s.quantile(0.5), None);
    }

    #[test]
    fn test_insert_and_count() {
        let mut s = QuantileSketch::new();
        s.insert(10);
        s.insert(0);
        s.insert(-5);
        assert_eq!(s.count(), 3);
    }

    #[test]
    fn test_quantile_ordering() {
        let mut s = QuantileSketch::new();
        for v in [1, 2, 4, 8, 1000, 2000, 1_000_000] {
            s.insert(v);
        }
        let p10 = s.quantile(0.1).expect("non-empty");
        let p90 = s.quantile(0.9).expect("non-empty");
        assert!(p10 <= p90);
        assert!(p90 >= 1000);
    }

    #[test]
    fn test_quantile_with_negatives_and_zero() {
        let mut s = QuantileSketch::new();
        for v in [-100, -10, 0, 10, 100] {
            s.insert(v);
        }
        assert!(s.quantile(0.05).expect("non-empty") < 0);
        assert_eq!(s.quantile(0.5), Some(0));
        assert!(s.quantile(0.95).expect("non-empty") > 0);
    }

    #[test]
    fn test_merge_equals_combined_inserts() {
        let mut a = QuantileSketch::new();
        let mut b = QuantileSketch::new();
        let mut combined = QuantileSketch::new();
        for v in [5, 50, 500] {
            a.insert(v);
            combined.insert(v);
        }
        for v in [7, 70, 700] {
            b.insert(v);
            combined.insert(v);
        }
        a.merge(&b);
        assert_eq!(a, combined);
    }

    #[test]
    fn test_snapshot_is_stable_and_sized() {
        let mut s = QuantileSketch::new();
        s.insert(42);
        let bytes = s.snapshot();
        assert_eq!(bytes, s.snapshot());
        assert_eq!(bytes.len(), 8 * (5 + 2 * MAG_BUCKETS));
    }
}
