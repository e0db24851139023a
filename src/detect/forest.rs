//! Isolation forest (Liu, Ting & Zhou 2008).
//!
//! Anomalies are few and different, so random axis-aligned splits isolate
//! them in fewer steps than normal points. The score is
//! `2^(-E[h(x)] / c(psi))`: close to 1 for anomalies, around 0.5 or below for
//! normal points.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use super::features::{FeatureVector, FEATURE_DIM};
use super::ModelFitError;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;
const MIN_SPREAD: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct ForestParams {
    pub trees: usize,
    pub subsample_size: usize,
    pub min_samples: usize,
    pub seed: Option<u64>,
}

#[derive(Debug)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug)]
pub struct IsolationForest {
    trees: Vec<Node>,
    /// c(psi): average path length of an unsuccessful BST search.
    norm: f64,
}

/// Average path length of an unsuccessful search in a BST of `n` nodes.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

impl IsolationForest {
    /// Fit a forest on `samples`. `cancel` is checked between trees.
    pub fn fit(
        samples: &[FeatureVector],
        params: &ForestParams,
        cancel: &CancellationToken,
    ) -> Result<Self, ModelFitError> {
        let needed = params.min_samples.max(2);
        if samples.len() < needed {
            return Err(ModelFitError::InsufficientSamples {
                needed,
                have: samples.len(),
            });
        }

        let all: Vec<usize> = (0..samples.len()).collect();
        if splittable_features(samples, &all).is_empty() {
            return Err(ModelFitError::DegenerateVariance);
        }

        let mut rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let psi = params.subsample_size.clamp(2, samples.len());
        let height_limit = (psi as f64).log2().ceil() as usize;

        let mut trees = Vec::with_capacity(params.trees);
        for _ in 0..params.trees {
            if cancel.is_cancelled() {
                return Err(ModelFitError::Cancelled);
            }
            let subsample = index::sample(&mut rng, samples.len(), psi).into_vec();
            trees.push(build_tree(samples, subsample, 0, height_limit, &mut rng));
        }

        Ok(Self {
            trees,
            norm: average_path_length(psi),
        })
    }

    /// Anomaly score in (0, 1].
    pub fn score(&self, x: &FeatureVector) -> f64 {
        if self.trees.is_empty() || self.norm <= 0.0 {
            return 0.5;
        }
        let total: f64 = self.trees.iter().map(|t| path_length(t, x, 0)).sum();
        let mean_path = total / self.trees.len() as f64;
        2f64.powf(-mean_path / self.norm)
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }
}

fn splittable_features(samples: &[FeatureVector], idx: &[usize]) -> Vec<(usize, f64, f64)> {
    (0..FEATURE_DIM)
        .filter_map(|dim| {
            let (lo, hi) = idx.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                let v = samples[i].get(dim);
                (lo.min(v), hi.max(v))
            });
            (hi - lo > MIN_SPREAD).then_some((dim, lo, hi))
        })
        .collect()
}

fn build_tree(
    samples: &[FeatureVector],
    idx: Vec<usize>,
    depth: usize,
    height_limit: usize,
    rng: &mut StdRng,
) -> Node {
    if depth >= height_limit || idx.len() <= 1 {
        return Node::Leaf { size: idx.len() };
    }
    let candidates = splittable_features(samples, &idx);
    if candidates.is_empty() {
        return Node::Leaf { size: idx.len() };
    }

    let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
    let threshold = rng.gen_range(lo..hi);
    let (left, right): (Vec<usize>, Vec<usize>) = idx
        .into_iter()
        .partition(|&i| samples[i].get(feature) < threshold);

    Node::Split {
        feature,
        threshold,
        left: Box::new(build_tree(samples, left, depth + 1, height_limit, rng)),
        right: Box::new(build_tree(samples, right, depth + 1, height_limit, rng)),
    }
}

fn path_length(node: &Node, x: &FeatureVector, depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            if x.get(*feature) < *threshold {
                path_length(left, x, depth + 1)
            } else {
                path_length(right, x, depth + 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(min_samples: usize) -> ForestParams {
        ForestParams {
            trees: 100,
            subsample_size: 128,
            min_samples,
            seed: Some(11),
        }
    }

    fn cluster(n: usize) -> Vec<FeatureVector> {
        let mut rng = StdRng::seed_from_u64(3);
        (0..n)
            .map(|_| {
                let v = 22.0 + rng.gen_range(-0.3..0.3);
                FeatureVector([v, v - 22.0, rng.gen_range(-0.05..0.05)])
            })
            .collect()
    }

    #[test]
    fn test_outlier_scores_higher_than_inlier() {
        let forest = IsolationForest::fit(&cluster(256), &params(32), &CancellationToken::new()).unwrap();
        let inlier = forest.score(&FeatureVector([22.0, 0.0, 0.0]));
        let outlier = forest.score(&FeatureVector([40.0, 18.0, 3.0]));
        assert!(outlier > 0.6, "outlier={}", outlier);
        assert!(inlier < 0.55, "inlier={}", inlier);
        assert!(outlier > inlier + 0.1, "inlier={} outlier={}", inlier, outlier);
    }

    #[test]
    fn test_insufficient_samples() {
        let err = IsolationForest::fit(&cluster(10), &params(64), &CancellationToken::new()).unwrap_err();
        assert_eq!(err, ModelFitError::InsufficientSamples { needed: 64, have: 10 });
    }

    #[test]
    fn test_constant_snapshot_is_degenerate() {
        let samples = vec![FeatureVector([21.0, 0.0, 0.0]); 100];
        let err = IsolationForest::fit(&samples, &params(10), &CancellationToken::new()).unwrap_err();
        assert_eq!(err, ModelFitError::DegenerateVariance);
    }

    #[test]
    fn test_cancelled_fit() {
        let token = CancellationToken::new();
        token.cancel();
        let err = IsolationForest::fit(&cluster(100), &params(10), &token).unwrap_err();
        assert_eq!(err, ModelFitError::Cancelled);
    }

    #[test]
    fn test_seeded_fit_is_deterministic() {
        let data = cluster(200);
        let a = IsolationForest::fit(&data, &params(10), &CancellationToken::new()).unwrap();
        let b = IsolationForest::fit(&data, &params(10), &CancellationToken::new()).unwrap();
        let x = FeatureVector([23.0, 1.0, 0.2]);
        assert_eq!(a.score(&x), b.score(&x));
        assert_eq!(a.tree_count(), 100);
    }

    #[test]
    fn test_average_path_length_small_cases() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert!(average_path_length(256) > average_path_length(128));
    }
}
