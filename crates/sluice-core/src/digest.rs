//! Merging t-digest for percentile estimation under bounded memory.
//!
//! Statistics buckets store the serialized centroid list; quantiles are
//! computed at query time by linear interpolation between centroids.
//! Compression parameter delta bounds the centroid count; with small sample
//! counts every point keeps its own centroid and quantiles are near exact.

use serde::{Deserialize, Serialize};

/// One weighted centroid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Centroid {
    pub mean: f64,
    pub weight: f64,
}

/// A t-digest sketch of a value distribution.
///
/// Serializes as `{"compression":…,"centroids":[[mean,weight],…]}`; the
/// count, sum, and extremes are recomputed from the centroid list when
/// loading, so the stored form carries nothing redundant (and no
/// non-finite sentinels, which JSON cannot hold).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredDigest", into = "StoredDigest")]
pub struct TDigest {
    compression: f64,
    centroids: Vec<Centroid>,
    count: f64,
    sum: f64,
    min: f64,
    max: f64,
}

/// The persisted shape: compression plus `[mean, weight]` pairs.
#[derive(Serialize, Deserialize)]
struct StoredDigest {
    compression: f64,
    centroids: Vec<(f64, f64)>,
}

impl From<TDigest> for StoredDigest {
    fn from(digest: TDigest) -> Self {
        Self {
            compression: digest.compression,
            centroids: digest
                .centroids
                .iter()
                .map(|c| (c.mean, c.weight))
                .collect(),
        }
    }
}

impl From<StoredDigest> for TDigest {
    fn from(stored: StoredDigest) -> Self {
        let mut digest = TDigest::new(stored.compression);
        for (mean, weight) in stored.centroids {
            if weight <= 0.0 {
                continue;
            }
            digest.count += weight;
            digest.sum += mean * weight;
            digest.min = digest.min.min(mean);
            digest.max = digest.max.max(mean);
            digest.centroids.push(Centroid { mean, weight });
        }
        // Quantile walks assume mean order; stored pairs normally arrive
        // sorted, but do not trust that.
        digest
            .centroids
            .sort_by(|a, b| a.mean.total_cmp(&b.mean));
        digest
    }
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new(100.0)
    }
}

impl TDigest {
    /// An empty digest with the given compression parameter.
    pub fn new(compression: f64) -> Self {
        Self {
            compression: compression.max(1.0),
            centroids: Vec::new(),
            count: 0.0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Build a digest from raw values.
    pub fn from_values(values: &[f64]) -> Self {
        let mut digest = Self::default();
        digest.add_all(values);
        digest
    }

    /// Number of values absorbed.
    pub fn count(&self) -> u64 {
        self.count as u64
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    /// Mean of all absorbed values.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0.0).then(|| self.sum / self.count)
    }

    /// Absorb a batch of raw values, re-compressing once.
    pub fn add_all(&mut self, values: &[f64]) {
        if values.is_empty() {
            return;
        }
        let mut points: Vec<Centroid> = self.centroids.clone();
        points.extend(values.iter().map(|&v| Centroid {
            mean: v,
            weight: 1.0,
        }));
        for &v in values {
            self.count += 1.0;
            self.sum += v;
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.centroids = compress(points, self.count, self.compression);
    }

    /// Merge another digest into this one.
    pub fn merge(&mut self, other: &TDigest) {
        if other.is_empty() {
            return;
        }
        let mut points = self.centroids.clone();
        points.extend_from_slice(&other.centroids);
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.centroids = compress(points, self.count, self.compression);
    }

    /// Estimate the value at quantile `q` in `[0, 1]`.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.centroids.is_empty() {
            return None;
        }
        if q <= 0.0 {
            return Some(self.min);
        }
        if q >= 1.0 {
            return Some(self.max);
        }

        let target = q * self.count;
        let mut prev_mean = self.min;
        let mut prev_mid = 0.0;
        let mut cumulative = 0.0;

        for c in &self.centroids {
            let mid = cumulative + c.weight / 2.0;
            if target <= mid {
                let span = mid - prev_mid;
                let t = if span > 0.0 {
                    (target - prev_mid) / span
                } else {
                    0.0
                };
                return Some(prev_mean + t * (c.mean - prev_mean));
            }
            prev_mean = c.mean;
            prev_mid = mid;
            cumulative += c.weight;
        }

        Some(self.max)
    }
}

/// Merge sorted weighted points into at most O(compression) centroids.
///
/// A centroid at quantile position q may hold at most
/// `4 * n * q * (1 - q) / compression` weight, which keeps the tails
/// fine-grained and the middle coarse.
fn compress(mut points: Vec<Centroid>, total: f64, compression: f64) -> Vec<Centroid> {
    if points.is_empty() {
        return points;
    }
    points.sort_by(|a, b| a.mean.partial_cmp(&b.mean).expect("NaN-free means"));

    let mut merged: Vec<Centroid> = Vec::with_capacity(points.len());
    let mut weight_before = 0.0;

    for p in points {
        match merged.last_mut() {
            Some(last) => {
                let q = (weight_before + last.weight / 2.0) / total;
                let limit = 4.0 * total * q * (1.0 - q) / compression;
                if last.weight + p.weight <= limit {
                    let w = last.weight + p.weight;
                    last.mean = (last.mean * last.weight + p.mean * p.weight) / w;
                    last.weight = w;
                } else {
                    weight_before += last.weight;
                    merged.push(p);
                }
            }
            None => merged.push(p),
        }
    }

    merged
}
