//! # Single-block Bayesian logistic fit
//!
//! [`fit`] turns a finished [`Dataset`] plus sparse prior overrides into a
//! posterior mode. Sparse maps are keyed by feature key; any feature absent
//! from a map takes the bundle's default. Keys that the dataset never saw
//! have no data support: they pass straight through to the output with
//! their prior mean (and prior variance, when variances are requested).
//!
//! The intercept is exchanged under [`INTERCEPT_NAME`] and maps to the
//! dataset's bias slot.

use itertools::Itertools;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::dataset::{Dataset, DatasetError};
use crate::linalg::{Cholesky, LinalgError};
use crate::minimize::{
    MinimizeError, MinimizeOptions, MinimizeReport, Minimizer, QuasiNewton, TrustRegionNewton,
};
use crate::model::{INTERCEPT_NAME, LinearModel};
use crate::objective::{LogisticObjective, LossWeights};

#[derive(Debug, Error)]
pub enum FitError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("prior variance for '{key}' must be positive and finite, got {value}")]
    InvalidPriorVariance { key: String, value: f64 },

    #[error(
        "minimizer failed on a block of {instances} instances and {features} features: {source}\nparameters: {parameters}"
    )]
    Diverged {
        #[source]
        source: MinimizeError,
        instances: usize,
        features: usize,
        parameters: String,
    },

    #[error("posterior covariance: {0}")]
    Covariance(#[from] LinalgError),
}

/// Which minimizer drives the fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Solver {
    #[default]
    TrustRegion,
    Bfgs,
}

/// Which posterior (co)variance to compute after the fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PosteriorKind {
    #[default]
    None,
    /// `1 / diag(H)`.
    Diagonal,
    /// `H^{-1}` from a Cholesky factorization of the dense Hessian.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOptions {
    pub epsilon: f64,
    pub max_iterations: usize,
    pub positive_weight: f64,
    pub negative_weight: f64,
    pub multiplier: f64,
    pub solver: Solver,
    pub posterior: PosteriorKind,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epsilon: 0.01,
            max_iterations: 1000,
            positive_weight: 1.0,
            negative_weight: 1.0,
            multiplier: 1.0,
            solver: Solver::TrustRegion,
            posterior: PosteriorKind::None,
        }
    }
}

/// Sparse prior overrides with their defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorBundle {
    pub mean: HashMap<String, f64>,
    pub variance: HashMap<String, f64>,
    pub default_mean: f64,
    pub default_variance: f64,
}

impl PriorBundle {
    /// Every feature gets `N(0, variance)`.
    pub fn isotropic(variance: f64) -> Self {
        Self {
            mean: HashMap::new(),
            variance: HashMap::new(),
            default_mean: 0.0,
            default_variance: variance,
        }
    }

    pub fn mean_of(&self, key: &str) -> f64 {
        self.mean.get(key).copied().unwrap_or(self.default_mean)
    }

    pub fn variance_of(&self, key: &str) -> f64 {
        self.variance
            .get(key)
            .copied()
            .unwrap_or(self.default_variance)
    }
}

#[derive(Debug, Clone)]
pub struct FitResult {
    pub model: LinearModel,
    /// Marginal posterior variances keyed like the model, intercept included.
    pub variance: Option<HashMap<String, f64>>,
    /// Posterior covariance among observed features, keyed by ordered pairs.
    pub covariance: Option<HashMap<(String, String), f64>>,
    pub report: MinimizeReport,
}

/// Fits one block. `initial` seeds the minimizer; absent keys start at zero.
pub fn fit(
    dataset: &Dataset,
    initial: Option<&HashMap<String, f64>>,
    priors: &PriorBundle,
    options: &FitOptions,
) -> Result<FitResult, FitError> {
    if !dataset.is_finished() {
        return Err(DatasetError::NotFinished.into());
    }
    let n = dataset.n_features();
    let names: Vec<&str> = dataset.feature_names().collect();

    let mut w = Array1::<f64>::zeros(n);
    let mut prior_mean = Array1::<f64>::zeros(n);
    let mut prior_variance = Array1::<f64>::zeros(n);
    for (k, name) in names.iter().enumerate() {
        prior_mean[k] = priors.mean_of(name);
        let variance = priors.variance_of(name);
        if !(variance > 0.0 && variance.is_finite()) {
            return Err(FitError::InvalidPriorVariance {
                key: name.to_string(),
                value: variance,
            });
        }
        prior_variance[k] = variance;
    }
    if let Some(initial) = initial {
        for (key, value) in initial {
            if let Some(index) = dataset.feature_index(key) {
                w[index - 1] = *value;
            }
        }
    }

    let (positive, negative) = dataset.class_counts();
    let l = dataset.n_instances().max(1) as f64;
    let tolerance = options.epsilon * positive.min(negative).max(1) as f64 / l;
    let minimize_options = MinimizeOptions {
        tolerance,
        max_iterations: options.max_iterations,
    };
    let weights = LossWeights {
        positive: options.positive_weight,
        negative: options.negative_weight,
        multiplier: options.multiplier,
    };
    let mut objective = LogisticObjective::new(dataset, prior_mean, &prior_variance, weights)?;

    let outcome = match options.solver {
        Solver::TrustRegion => {
            TrustRegionNewton::default().minimize(&mut objective, &mut w, &minimize_options)
        }
        Solver::Bfgs => QuasiNewton.minimize(&mut objective, &mut w, &minimize_options),
    };
    let report = match outcome {
        Ok(report) => report,
        Err(source) => {
            let parameters = names
                .iter()
                .zip(w.iter())
                .map(|(name, value)| format!("{name}={value}"))
                .join(" ");
            log::error!(
                "Fit failed on {} instances ({} positive) with {} features: {source}",
                dataset.n_instances(),
                positive,
                n
            );
            log::error!("Parameters at failure: {parameters}");
            return Err(FitError::Diverged {
                source,
                instances: dataset.n_instances(),
                features: n,
                parameters,
            });
        }
    };
    log::debug!(
        "Fit {} instances x {} features: {} iterations, f = {:.6e}, |g| = {:.3e}, converged = {}",
        dataset.n_instances(),
        n,
        report.iterations,
        report.value,
        report.gradient_norm,
        report.converged
    );

    let mut coefficients: HashMap<String, f64> = names
        .iter()
        .zip(w.iter())
        .map(|(name, value)| (name.to_string(), *value))
        .collect();
    for (key, value) in &priors.mean {
        if dataset.feature_index(key).is_none() {
            coefficients.insert(key.clone(), *value);
        }
    }
    let intercept = coefficients.remove(INTERCEPT_NAME).unwrap_or(0.0);
    let model = LinearModel::with_coefficients(intercept, coefficients);

    let (variance, covariance) = match options.posterior {
        PosteriorKind::None => (None, None),
        PosteriorKind::Diagonal => {
            let diagonal = objective.hessian_diagonal(w.view());
            let mut variance = prior_only_variances(dataset, priors);
            for (name, h) in names.iter().zip(diagonal.iter()) {
                variance.insert(name.to_string(), 1.0 / h);
            }
            (Some(variance), None)
        }
        PosteriorKind::Full => {
            let inverse = objective.full_hessian(w.view()).cholesky()?.inverse();
            let mut variance = prior_only_variances(dataset, priors);
            let mut covariance = HashMap::with_capacity(n * n);
            for (i, row) in names.iter().enumerate() {
                variance.insert(row.to_string(), inverse[[i, i]]);
                for (j, col) in names.iter().enumerate() {
                    covariance.insert((row.to_string(), col.to_string()), inverse[[i, j]]);
                }
            }
            (Some(variance), Some(covariance))
        }
    };

    Ok(FitResult {
        model,
        variance,
        covariance,
        report,
    })
}

fn prior_only_variances(dataset: &Dataset, priors: &PriorBundle) -> HashMap<String, f64> {
    priors
        .variance
        .iter()
        .filter(|(key, _)| dataset.feature_index(key).is_none())
        .map(|(key, value)| (key.clone(), *value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Instance;
    use crate::minimize::Objective;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn simulated(seed: u64, n: usize) -> Result<Dataset, DatasetError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut dataset = Dataset::new(1.0);
        for _ in 0..n {
            let a: f64 = rng.gen_range(-1.0..1.0);
            let b: f64 = rng.gen_range(-1.0..1.0);
            let eta = -0.3 + 1.2 * a - 0.8 * b;
            let p = 1.0 / (1.0 + (-eta).exp());
            let label = if rng.r#gen::<f64>() < p { 1 } else { -1 };
            let features = vec![("a".to_string(), a), ("b".to_string(), b)];
            dataset.add_instance(&Instance::new(label, features))?;
        }
        dataset.finish()?;
        Ok(dataset)
    }

    #[test]
    fn bfgs_iteration_cap_is_reported_not_raised() -> Result<(), Box<dyn std::error::Error>> {
        let dataset = simulated(8, 200)?;
        let options = FitOptions {
            solver: Solver::Bfgs,
            max_iterations: 1,
            epsilon: 1e-12,
            ..FitOptions::default()
        };
        let result = fit(&dataset, None, &PriorBundle::isotropic(1.0), &options)?;
        assert!(!result.report.converged);
        assert!(result.report.value.is_finite());
        Ok(())
    }

    #[test]
    fn unfinished_dataset_is_a_state_error() {
        let dataset = Dataset::new(1.0);
        let result = fit(&dataset, None, &PriorBundle::isotropic(1.0), &FitOptions::default());
        assert!(matches!(result, Err(FitError::Dataset(DatasetError::NotFinished))));
    }

    #[test]
    fn fitted_mode_has_vanishing_gradient() -> Result<(), Box<dyn std::error::Error>> {
        let dataset = simulated(42, 400)?;
        let priors = PriorBundle::isotropic(4.0);
        let options = FitOptions {
            epsilon: 1e-6,
            ..FitOptions::default()
        };
        let result = fit(&dataset, None, &priors, &options)?;
        assert!(result.report.converged);

        let n = dataset.n_features();
        let mut objective = LogisticObjective::new(
            &dataset,
            Array1::zeros(n),
            &Array1::from_elem(n, 4.0),
            LossWeights::default(),
        )?;
        let mut w = Array1::zeros(n);
        for (k, name) in dataset.feature_names().enumerate() {
            w[k] = if name == INTERCEPT_NAME {
                result.model.intercept()
            } else {
                result.model.coefficient(name)
            };
        }
        let mut g = Array1::zeros(n);
        objective.gradient(w.view(), g.view_mut());
        assert!(g.iter().all(|v| v.abs() < 1e-3));
        assert!(result.model.coefficient("a") > 0.0);
        assert!(result.model.coefficient("b") < 0.0);
        Ok(())
    }

    #[test]
    fn solvers_agree() -> Result<(), Box<dyn std::error::Error>> {
        let dataset = simulated(9, 300)?;
        let priors = PriorBundle::isotropic(2.0);
        let tight = FitOptions {
            epsilon: 1e-8,
            ..FitOptions::default()
        };
        let newton = fit(&dataset, None, &priors, &tight)?;
        let bfgs = fit(
            &dataset,
            None,
            &priors,
            &FitOptions {
                solver: Solver::Bfgs,
                epsilon: 1e-5,
                ..tight
            },
        )?;
        assert_abs_diff_eq!(newton.model.intercept(), bfgs.model.intercept(), epsilon = 1e-3);
        for key in ["a", "b"] {
            assert_abs_diff_eq!(
                newton.model.coefficient(key),
                bfgs.model.coefficient(key),
                epsilon = 1e-3
            );
        }
        Ok(())
    }

    #[test]
    fn prior_only_features_pass_through() -> Result<(), Box<dyn std::error::Error>> {
        let dataset = simulated(5, 100)?;
        let mut priors = PriorBundle::isotropic(1.0);
        priors.mean.insert("ghost".to_string(), 0.7);
        priors.variance.insert("ghost".to_string(), 0.25);
        let options = FitOptions {
            posterior: PosteriorKind::Diagonal,
            ..FitOptions::default()
        };
        let result = fit(&dataset, None, &priors, &options)?;
        assert_eq!(result.model.coefficient("ghost"), 0.7);
        let variance = result.variance.ok_or("variance requested")?;
        assert_eq!(variance["ghost"], 0.25);
        assert!(variance["a"] > 0.0 && variance["a"] < 1.0);
        Ok(())
    }

    #[test]
    fn full_covariance_diagonal_bounds_the_marginals() -> Result<(), Box<dyn std::error::Error>> {
        let dataset = simulated(8, 200)?;
        let priors = PriorBundle::isotropic(1.0);
        let diagonal = fit(
            &dataset,
            None,
            &priors,
            &FitOptions {
                posterior: PosteriorKind::Diagonal,
                ..FitOptions::default()
            },
        )?;
        let full = fit(
            &dataset,
            None,
            &priors,
            &FitOptions {
                posterior: PosteriorKind::Full,
                ..FitOptions::default()
            },
        )?;
        let diag_var = diagonal.variance.ok_or("diagonal variance")?;
        let full_var = full.variance.ok_or("full variance")?;
        let covariance = full.covariance.ok_or("covariance")?;
        for key in ["a", "b", INTERCEPT_NAME] {
            // The inverse of the diagonal never exceeds the diagonal of the inverse.
            assert!(diag_var[key] <= full_var[key] + 1e-12);
        }
        let ab = covariance[&("a".to_string(), "b".to_string())];
        let ba = covariance[&("b".to_string(), "a".to_string())];
        assert_eq!(ab, ba);
        Ok(())
    }

    #[test]
    fn non_positive_prior_variance_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dataset = simulated(1, 20)?;
        let mut priors = PriorBundle::isotropic(1.0);
        priors.variance.insert("a".to_string(), 0.0);
        let result = fit(&dataset, None, &priors, &FitOptions::default());
        assert!(matches!(result, Err(FitError::InvalidPriorVariance { .. })));
        Ok(())
    }

    #[test]
    fn initial_point_skips_unknown_keys() -> Result<(), Box<dyn std::error::Error>> {
        let dataset = simulated(4, 150)?;
        let priors = PriorBundle::isotropic(1.0);
        let options = FitOptions {
            epsilon: 1e-8,
            ..FitOptions::default()
        };
        let cold = fit(&dataset, None, &priors, &options)?;
        let start = HashMap::from([
            ("a".to_string(), 0.5),
            ("missing".to_string(), 3.0),
            (INTERCEPT_NAME.to_string(), -0.1),
        ]);
        let warm = fit(&dataset, Some(&start), &priors, &options)?;
        assert_eq!(warm.model.coefficient("missing"), 0.0);
        assert_abs_diff_eq!(cold.model.coefficient("a"), warm.model.coefficient("a"), epsilon = 1e-4);
        Ok(())
    }
}
