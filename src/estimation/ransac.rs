//! Generic RANSAC over a minimal-solver trait.
//!
//! The engine's robust estimators (essential matrix, projective
//! resection) share this loop: sample a minimal set, fit, count inliers
//! against a residual threshold, keep the best consensus, and stop early
//! once the adaptive iteration bound drops below the iteration count.

use rand::rngs::StdRng;
use rand::{seq::index::sample, SeedableRng};
use serde::{Deserialize, Serialize};

/// Minimal solver plugged into [`ransac`].
pub trait Estimator {
    type Datum;
    type Model: Clone;

    /// Sample size of the minimal problem.
    const MIN_SAMPLES: usize;

    /// Fit a model to the given sample; `None` on degeneracy.
    fn fit(&self, data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model>;

    /// Residual of one datum under a model, in the same unit as the
    /// RANSAC threshold.
    fn residual(&self, model: &Self::Model, datum: &Self::Datum) -> f64;

    /// Optional least-squares refit on the consensus set.
    fn refit(&self, _data: &[Self::Datum], _inliers: &[usize]) -> Option<Self::Model> {
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RansacOptions {
    pub max_iterations: usize,
    /// Inlier threshold on the estimator's residual.
    pub threshold: f64,
    /// Target probability of having seen one all-inlier sample.
    pub confidence: f64,
    /// Seed for the sampling RNG; fixed for reproducible runs.
    pub seed: u64,
}

impl Default for RansacOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1024,
            threshold: 4.0,
            confidence: 0.999,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacResult<M> {
    pub model: M,
    pub inliers: Vec<usize>,
    pub iterations: usize,
}

/// Run RANSAC; `None` when no model reaches `MIN_SAMPLES + 1` inliers.
pub fn ransac<E: Estimator>(
    estimator: &E,
    data: &[E::Datum],
    options: &RansacOptions,
) -> Option<RansacResult<E::Model>> {
    if data.len() < E::MIN_SAMPLES {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut best: Option<(E::Model, Vec<usize>)> = None;
    let mut iteration_bound = options.max_iterations;
    let mut iteration = 0;

    while iteration < iteration_bound.min(options.max_iterations) {
        iteration += 1;
        let indices = sample(&mut rng, data.len(), E::MIN_SAMPLES).into_vec();
        let model = match estimator.fit(data, &indices) {
            Some(m) => m,
            None => continue,
        };

        let inliers: Vec<usize> = data
            .iter()
            .enumerate()
            .filter(|(_, d)| estimator.residual(&model, d) < options.threshold)
            .map(|(i, _)| i)
            .collect();

        if best.as_ref().map_or(true, |(_, b)| inliers.len() > b.len()) {
            let ratio = inliers.len() as f64 / data.len() as f64;
            iteration_bound = adaptive_bound(ratio, options.confidence, E::MIN_SAMPLES)
                .min(options.max_iterations);
            best = Some((model, inliers));
        }
    }

    let (model, inliers) = best?;
    if inliers.len() <= E::MIN_SAMPLES {
        return None;
    }

    // Refit on the full consensus set when the solver supports it, then
    // re-derive the inlier set under the refined model.
    let (model, inliers) = match estimator.refit(data, &inliers) {
        Some(refined) => {
            let refined_inliers: Vec<usize> = data
                .iter()
                .enumerate()
                .filter(|(_, d)| estimator.residual(&refined, d) < options.threshold)
                .map(|(i, _)| i)
                .collect();
            if refined_inliers.len() >= inliers.len() {
                (refined, refined_inliers)
            } else {
                (model, inliers)
            }
        }
        None => (model, inliers),
    };

    Some(RansacResult {
        model,
        inliers,
        iterations: iteration,
    })
}

/// Iterations needed to hit `confidence` given the observed inlier ratio.
fn adaptive_bound(inlier_ratio: f64, confidence: f64, sample_size: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let p_good = inlier_ratio.powi(sample_size as i32);
    if p_good < 1e-12 {
        return usize::MAX;
    }
    let denom = (1.0 - p_good).ln();
    if denom >= 0.0 {
        return 1;
    }
    ((1.0 - confidence).ln() / denom).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1D line-offset estimator: model is the offset, datum is (x, y)
    /// with y = x + offset for inliers.
    struct OffsetEstimator;

    impl Estimator for OffsetEstimator {
        type Datum = (f64, f64);
        type Model = f64;
        const MIN_SAMPLES: usize = 1;

        fn fit(&self, data: &[Self::Datum], sample: &[usize]) -> Option<f64> {
            let (x, y) = data[sample[0]];
            Some(y - x)
        }

        fn residual(&self, model: &f64, datum: &Self::Datum) -> f64 {
            (datum.1 - datum.0 - model).abs()
        }
    }

    #[test]
    fn test_finds_majority_offset() {
        let mut data: Vec<(f64, f64)> = (0..80).map(|i| (i as f64, i as f64 + 3.0)).collect();
        // 20 gross outliers.
        data.extend((0..20).map(|i| (i as f64, -50.0 - i as f64)));

        let result = ransac(
            &OffsetEstimator,
            &data,
            &RansacOptions {
                threshold: 0.5,
                ..Default::default()
            },
        )
        .unwrap();
        assert!((result.model - 3.0).abs() < 1e-9);
        assert_eq!(result.inliers.len(), 80);
    }

    #[test]
    fn test_too_few_data_fails() {
        let result = ransac(&OffsetEstimator, &[], &RansacOptions::default());
        assert!(result.is_none());
    }

    #[test]
    fn test_deterministic_under_fixed_seed() {
        let data: Vec<(f64, f64)> = (0..50).map(|i| (i as f64, i as f64 + 1.0)).collect();
        let opts = RansacOptions {
            threshold: 0.1,
            seed: 7,
            ..Default::default()
        };
        let a = ransac(&OffsetEstimator, &data, &opts).unwrap();
        let b = ransac(&OffsetEstimator, &data, &opts).unwrap();
        assert_eq!(a.inliers, b.inliers);
        assert_eq!(a.model, b.model);
    }
}
