//! # KNN - Distance-Weighted Nearest Neighbors
//!
//! Stores (features, label, target) records and answers queries by letting
//! the k closest records vote. Each vote is `weight / (distance + ε)`.
//!
//! The store is bounded: once it grows past `max_records` it keeps only the
//! newest `retain_fraction` of that maximum, ordered by record timestamp.
//! Large stores are scanned in parallel with rayon.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use oracle_core::config::{DistanceMetric, KnnConfig};
use oracle_core::error::{OracleError, OracleResult};

/// One stored observation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnnRecord<L> {
    pub features: Vec<f32>,
    /// Class voted on by `predict`
    pub label: L,
    /// Numeric outcome averaged by `regress`
    pub target: Vec<f32>,
    /// Vote multiplier
    pub weight: f32,
    /// Logical time of insertion, used for eviction
    pub timestamp: u64,
}

/// A record selected for a query
#[derive(Clone, Debug)]
pub struct Neighbor<'a, L> {
    pub record: &'a KnnRecord<L>,
    pub distance: f32,
    pub vote: f32,
}

/// Winning label and its share of the vote mass
#[derive(Clone, Debug, PartialEq)]
pub struct Vote<L> {
    pub label: L,
    pub confidence: f32,
}

/// Vote-weighted mean of neighbor targets
#[derive(Clone, Debug, PartialEq)]
pub struct Regression {
    pub target: Vec<f32>,
    /// Winning-label vote share among the same neighbors
    pub confidence: f32,
}

/// Store statistics
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KnnStats {
    pub records: usize,
    pub total_added: u64,
    pub total_evicted: u64,
}

/// Bounded nearest-neighbor store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnnPredictor<L> {
    config: KnnConfig,
    dims: usize,
    records: Vec<KnnRecord<L>>,
    total_added: u64,
    total_evicted: u64,
}

impl<L> KnnPredictor<L>
where
    L: Clone + PartialEq + Send + Sync,
{
    /// Create an empty store for `dims`-wide feature vectors
    pub fn new(config: KnnConfig, dims: usize) -> Self {
        Self {
            config,
            dims,
            records: Vec::new(),
            total_added: 0,
            total_evicted: 0,
        }
    }

    pub fn config(&self) -> &KnnConfig {
        &self.config
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[KnnRecord<L>] {
        &self.records
    }

    pub fn set_metric(&mut self, metric: DistanceMetric) {
        self.config.metric = metric;
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn stats(&self) -> KnnStats {
        KnnStats {
            records: self.records.len(),
            total_added: self.total_added,
            total_evicted: self.total_evicted,
        }
    }

    /// Store a record, evicting the oldest ones if the store overflows.
    ///
    /// `weight` must be positive and finite.
    pub fn add(
        &mut self,
        features: Vec<f32>,
        label: L,
        target: Vec<f32>,
        weight: f32,
        timestamp: u64,
    ) -> OracleResult<()> {
        OracleError::check_width("knn record", self.dims, features.len())?;
        if !(weight > 0.0 && weight.is_finite()) {
            return Err(OracleError::invalid_input(format!(
                "knn record weight must be positive, got {}",
                weight
            )));
        }

        self.records.push(KnnRecord {
            features,
            label,
            target,
            weight,
            timestamp,
        });
        self.total_added += 1;

        if self.records.len() > self.config.max_records {
            self.evict();
        }
        Ok(())
    }

    fn evict(&mut self) {
        let max = self.config.max_records.max(1);
        let keep = ((max as f32 * self.config.retain_fraction).floor() as usize).clamp(1, max);
        if self.records.len() <= keep {
            return;
        }

        self.records.sort_by_key(|r| r.timestamp);
        let dropped = self.records.len() - keep;
        self.records.drain(..dropped);
        self.total_evicted += dropped as u64;

        tracing::debug!("KNN evicted {} records, {} kept", dropped, keep);
    }

    fn distances(&self, features: &[f32]) -> Vec<(usize, f32)> {
        let metric = &self.config.metric;
        let eps = self.config.epsilon;
        if self.records.len() >= self.config.parallel_threshold {
            self.records
                .par_iter()
                .enumerate()
                .map(|(i, r)| (i, distance(metric, features, &r.features, eps)))
                .collect()
        } else {
            self.records
                .iter()
                .enumerate()
                .map(|(i, r)| (i, distance(metric, features, &r.features, eps)))
                .collect()
        }
    }

    /// The `min(k, len)` closest records, nearest first.
    /// Equal distances keep insertion order.
    pub fn neighbors(&self, features: &[f32]) -> OracleResult<Vec<Neighbor<'_, L>>> {
        OracleError::check_width("knn query", self.dims, features.len())?;

        let mut scored = self.distances(features);
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let k = self.config.k.max(1).min(scored.len());
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(i, distance)| {
                let record = &self.records[i];
                Neighbor {
                    record,
                    distance,
                    vote: record.weight / (distance + self.config.epsilon),
                }
            })
            .collect())
    }

    fn tally(neighbors: &[Neighbor<'_, L>]) -> Option<Vote<L>> {
        let mut tallies: Vec<(L, f32)> = Vec::new();
        for n in neighbors {
            match tallies.iter_mut().find(|(label, _)| *label == n.record.label) {
                Some((_, mass)) => *mass += n.vote,
                None => tallies.push((n.record.label.clone(), n.vote)),
            }
        }

        let total: f32 = tallies.iter().map(|(_, m)| m).sum();
        let mut best: Option<(L, f32)> = None;
        for (label, mass) in tallies {
            if best.as_ref().map_or(true, |(_, m)| mass > *m) {
                best = Some((label, mass));
            }
        }

        best.map(|(label, mass)| Vote {
            label,
            confidence: if total > 0.0 && total.is_finite() {
                (mass / total).clamp(0.0, 1.0)
            } else {
                0.0
            },
        })
    }

    /// Winning label and vote share, `None` if the store is empty
    pub fn vote(&self, features: &[f32]) -> OracleResult<Option<Vote<L>>> {
        let neighbors = self.neighbors(features)?;
        Ok(Self::tally(&neighbors))
    }

    pub fn predict(&self, features: &[f32]) -> OracleResult<Option<L>> {
        Ok(self.vote(features)?.map(|v| v.label))
    }

    /// Winning vote share, 0 if the store is empty
    pub fn confidence(&self, features: &[f32]) -> OracleResult<f32> {
        Ok(self.vote(features)?.map_or(0.0, |v| v.confidence))
    }

    /// Vote-weighted mean of the neighbors' targets
    pub fn regress(&self, features: &[f32]) -> OracleResult<Option<Regression>> {
        let neighbors = self.neighbors(features)?;
        let Some(vote) = Self::tally(&neighbors) else {
            return Ok(None);
        };

        let width = neighbors.iter().map(|n| n.record.target.len()).max().unwrap_or(0);
        let mut target = vec![0.0; width];
        let mut mass = 0.0;
        for n in &neighbors {
            for (acc, v) in target.iter_mut().zip(&n.record.target) {
                *acc += v * n.vote;
            }
            mass += n.vote;
        }

        if mass > 0.0 && mass.is_finite() {
            target.iter_mut().for_each(|v| *v /= mass);
        } else {
            // Zero-weight neighbors: fall back to the nearest record
            target = neighbors[0].record.target.clone();
        }

        Ok(Some(Regression {
            target,
            confidence: vote.confidence,
        }))
    }
}

/// Distance between two equal-width vectors under `metric`
pub fn distance(metric: &DistanceMetric, a: &[f32], b: &[f32], epsilon: f32) -> f32 {
    match metric {
        DistanceMetric::Euclidean => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f32>()
            .sqrt(),
        DistanceMetric::Manhattan => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
        DistanceMetric::Cosine => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            (1.0 - dot / (na * nb + epsilon)).max(0.0)
        }
        DistanceMetric::WeightedEuclidean { weights } => a
            .iter()
            .zip(b)
            .enumerate()
            .map(|(i, (x, y))| weights.get(i).copied().unwrap_or(1.0) * (x - y).powi(2))
            .sum::<f32>()
            .sqrt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_records: usize) -> KnnPredictor<&'static str> {
        KnnPredictor::new(
            KnnConfig {
                max_records,
                ..KnnConfig::default()
            },
            2,
        )
    }

    #[test]
    fn test_empty_store() {
        let knn = store(10);
        assert_eq!(knn.predict(&[0.0, 0.0]).unwrap(), None);
        assert_eq!(knn.confidence(&[0.0, 0.0]).unwrap(), 0.0);
        assert!(knn.regress(&[0.0, 0.0]).unwrap().is_none());
    }

    #[test]
    fn test_single_record() {
        let mut knn = store(10);
        knn.add(vec![1.0, 1.0], "circle", vec![3.0, 4.0], 1.0, 0).unwrap();

        assert_eq!(knn.predict(&[9.0, -4.0]).unwrap(), Some("circle"));
        assert_eq!(knn.confidence(&[9.0, -4.0]).unwrap(), 1.0);
        assert_eq!(knn.regress(&[0.0, 0.0]).unwrap().unwrap().target, vec![3.0, 4.0]);
    }

    #[test]
    fn test_nearest_votes_dominate() {
        let mut knn = store(10);
        knn.add(vec![0.0, 0.0], "near", vec![], 1.0, 0).unwrap();
        knn.add(vec![10.0, 10.0], "far", vec![], 1.0, 1).unwrap();
        knn.add(vec![11.0, 10.0], "far", vec![], 1.0, 2).unwrap();

        assert_eq!(knn.predict(&[0.1, 0.0]).unwrap(), Some("near"));
        let confidence = knn.confidence(&[0.1, 0.0]).unwrap();
        assert!(confidence > 0.9 && confidence <= 1.0);
    }

    #[test]
    fn test_k_is_capped_by_store_size() {
        let mut knn = store(10);
        knn.add(vec![0.0, 0.0], "a", vec![], 1.0, 0).unwrap();
        knn.add(vec![1.0, 0.0], "b", vec![], 1.0, 1).unwrap();
        assert_eq!(knn.neighbors(&[0.0, 0.0]).unwrap().len(), 2);
    }

    #[test]
    fn test_eviction_keeps_newest() {
        let mut knn = store(10);
        // Timestamps deliberately out of insertion order
        let stamps = [5u64, 1, 9, 3, 7, 0, 8, 2, 6, 4, 10];
        for (i, ts) in stamps.iter().enumerate() {
            knn.add(vec![i as f32, 0.0], "x", vec![], 1.0, *ts).unwrap();
            assert!(knn.len() <= 10);
        }

        // 11 > 10 triggers eviction down to floor(10 * 0.75) = 7
        assert_eq!(knn.len(), 7);
        let mut kept: Vec<u64> = knn.records().iter().map(|r| r.timestamp).collect();
        kept.sort();
        assert_eq!(kept, vec![4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(knn.stats().total_evicted, 4);
    }

    #[test]
    fn test_non_positive_weight_is_rejected() {
        let mut knn = store(10);
        for weight in [0.0, -1.0, f32::NAN] {
            assert!(matches!(
                knn.add(vec![1.0, 2.0], "x", vec![], weight, 0),
                Err(OracleError::InvalidInput(_))
            ));
        }
        assert!(knn.is_empty());

        knn.add(vec![1.0, 2.0], "x", vec![], 0.25, 0).unwrap();
        assert_eq!(knn.confidence(&[0.0, 0.0]).unwrap(), 1.0);
    }

    #[test]
    fn test_width_mismatch_fails() {
        let mut knn = store(10);
        assert!(knn.add(vec![1.0], "x", vec![], 1.0, 0).is_err());
        assert!(knn.predict(&[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_metrics() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        assert!((distance(&DistanceMetric::Euclidean, &a, &b, 1e-6) - 2f32.sqrt()).abs() < 1e-6);
        assert_eq!(distance(&DistanceMetric::Manhattan, &a, &b, 1e-6), 2.0);
        assert!((distance(&DistanceMetric::Cosine, &a, &b, 1e-6) - 1.0).abs() < 1e-5);
        assert!(distance(&DistanceMetric::Cosine, &a, &a, 1e-6) < 1e-5);

        let weighted = DistanceMetric::WeightedEuclidean { weights: vec![4.0] };
        // Second weight missing counts as 1
        assert!((distance(&weighted, &a, &b, 1e-6) - 5f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_parallel_scan_matches_sequential() {
        let mut sequential = store(100);
        for i in 0..40 {
            let label = if i % 3 == 0 { "a" } else { "b" };
            sequential
                .add(vec![i as f32 * 0.5, (i % 7) as f32], label, vec![i as f32], 1.0, i)
                .unwrap();
        }
        let mut parallel = sequential.clone();
        parallel.config.parallel_threshold = 1;

        let query = [7.3, 2.0];
        assert_eq!(sequential.vote(&query).unwrap(), parallel.vote(&query).unwrap());
        assert_eq!(sequential.regress(&query).unwrap(), parallel.regress(&query).unwrap());
    }

    #[test]
    fn test_regress_weights_by_distance() {
        let mut knn = store(10);
        knn.add(vec![0.0, 0.0], "x", vec![0.0], 1.0, 0).unwrap();
        knn.add(vec![4.0, 0.0], "x", vec![10.0], 1.0, 1).unwrap();
        let result = knn.regress(&[1.0, 0.0]).unwrap().unwrap();
        // Votes 1 and 1/3: (0·1 + 10·⅓) / (4/3) = 2.5
        assert!((result.target[0] - 2.5).abs() < 1e-3);
        assert_eq!(result.confidence, 1.0);
    }
}
