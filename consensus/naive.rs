//! Naive divide-and-average training.
//!
//! Every `(lambda, block)` pair is fitted once, alone, under a plain ridge
//! prior. The per-block models are kept and, optionally, averaged per lambda
//! into one model. This is the one-shot baseline ADMM is compared against.

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use super::executor::PartitionExecutor;
use super::state::{Lambda, PartitionKey};
use crate::dataset::Dataset;
use crate::fitter::{FitError, FitOptions, PriorBundle, fit};
use crate::model::{INTERCEPT_NAME, LinearModel};

/// Prior variance of an unpenalized intercept.
pub const UNPENALIZED_INTERCEPT_VARIANCE: f64 = 1e5;

#[derive(Debug, Error)]
pub enum NaiveError {
    #[error("invalid naive training settings: {0}")]
    InvalidSettings(String),

    #[error("fit of block {key} failed: {source}")]
    Fit {
        key: String,
        #[source]
        source: FitError,
    },

    #[error("lambda {lambda}: {found} of {expected} block fits came back")]
    LostFits {
        lambda: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NaiveSettings {
    pub lambdas: Vec<f64>,
    /// Prior mean of every feature without an explicit one.
    pub prior_mean: f64,
    pub penalize_intercept: bool,
    /// Per-feature lambdas keyed by feature key.
    pub lambda_overrides: HashMap<String, f64>,
    /// Blocks with fewer instances are not fitted.
    pub min_instances: usize,
    pub fit: FitOptions,
}

impl Default for NaiveSettings {
    fn default() -> Self {
        Self {
            lambdas: vec![1.0],
            prior_mean: 0.0,
            penalize_intercept: false,
            lambda_overrides: HashMap::new(),
            min_instances: 0,
            fit: FitOptions {
                epsilon: 1e-3,
                ..FitOptions::default()
            },
        }
    }
}

impl NaiveSettings {
    pub fn validate(&self) -> Result<(), NaiveError> {
        if self.lambdas.is_empty() {
            return Err(NaiveError::InvalidSettings("at least one lambda is required".to_string()));
        }
        if let Some(lambda) = self
            .lambdas
            .iter()
            .chain(self.lambda_overrides.values())
            .find(|l| !(l.is_finite() && **l > 0.0))
        {
            return Err(NaiveError::InvalidSettings(format!(
                "lambdas must be positive and finite, got {lambda}"
            )));
        }
        if !self.prior_mean.is_finite() {
            return Err(NaiveError::InvalidSettings(format!(
                "prior mean must be finite, got {}",
                self.prior_mean
            )));
        }
        Ok(())
    }
}

/// `N(mean, 1/lambda)` for every feature, the overrides' own lambdas where
/// given, and a flat prior on the intercept unless it is penalized.
pub fn ridge_priors(
    lambda: f64,
    mean: f64,
    overrides: &HashMap<String, f64>,
    penalize_intercept: bool,
) -> PriorBundle {
    let mut variance: HashMap<String, f64> = overrides
        .iter()
        .map(|(feature, lambda)| (feature.clone(), 1.0 / lambda))
        .collect();
    if !penalize_intercept {
        variance.insert(INTERCEPT_NAME.to_string(), UNPENALIZED_INTERCEPT_VARIANCE);
    }
    PriorBundle {
        mean: HashMap::new(),
        variance,
        default_mean: mean,
        default_variance: 1.0 / lambda,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NaiveOutcome {
    /// One model per fitted `(lambda, block)` pair.
    pub models: BTreeMap<PartitionKey, LinearModel>,
    /// Per lambda, the average of the fitted block models.
    pub means: BTreeMap<Lambda, LinearModel>,
    /// Blocks left out for holding fewer than `min_instances` instances.
    pub skipped: Vec<u32>,
}

/// Fits every block under every lambda and averages the fits per lambda.
pub fn train_naive<E: PartitionExecutor>(
    settings: &NaiveSettings,
    blocks: &BTreeMap<u32, Dataset>,
    executor: &E,
) -> Result<NaiveOutcome, NaiveError> {
    settings.validate()?;
    let mut lambdas: Vec<Lambda> = settings.lambdas.iter().map(|l| Lambda::new(*l)).collect();
    lambdas.sort();
    lambdas.dedup();

    let skipped: Vec<u32> = blocks
        .iter()
        .filter(|(_, dataset)| dataset.n_instances() < settings.min_instances)
        .map(|(partition, _)| *partition)
        .collect();
    for partition in &skipped {
        log::info!(
            "Block {partition} has fewer than {} instances; not fitted",
            settings.min_instances
        );
    }
    let keys: Vec<PartitionKey> = lambdas
        .iter()
        .flat_map(|lambda| {
            blocks
                .keys()
                .filter(|p| !skipped.contains(p))
                .map(move |p| PartitionKey::new(lambda.clone(), *p))
        })
        .collect();
    let expected = keys.len() / lambdas.len();
    log::info!(
        "Naive training of {expected} blocks over {} lambdas",
        lambdas.len()
    );

    let results = executor.execute(keys, |key: PartitionKey| -> Result<(PartitionKey, LinearModel), NaiveError> {
        let fit_error = |source: FitError| NaiveError::Fit {
            key: key.to_string(),
            source,
        };
        let dataset = blocks.get(&key.partition).ok_or_else(|| NaiveError::InvalidSettings(format!(
            "no dataset for partition {}",
            key.partition
        )))?;
        let priors = ridge_priors(
            key.lambda.value(),
            settings.prior_mean,
            &settings.lambda_overrides,
            settings.penalize_intercept,
        );
        let result = fit(dataset, None, &priors, &settings.fit).map_err(fit_error)?;
        if !result.report.converged {
            log::warn!("Block {key} stopped at the iteration cap");
        }
        Ok((key, result.model))
    });
    let models = results
        .into_iter()
        .collect::<Result<BTreeMap<PartitionKey, LinearModel>, NaiveError>>()?;

    let mut means = BTreeMap::new();
    for lambda in &lambdas {
        let fitted: Vec<&LinearModel> = models
            .iter()
            .filter(|(key, _)| key.lambda == *lambda)
            .map(|(_, model)| model)
            .collect();
        if fitted.len() != expected {
            return Err(NaiveError::LostFits {
                lambda: lambda.to_string(),
                expected,
                found: fitted.len(),
            });
        }
        let mut mean = LinearModel::default();
        for model in &fitted {
            mean.linear_combine(1.0, 1.0, model);
        }
        if !fitted.is_empty() {
            mean.rescale(1.0 / fitted.len() as f64);
        }
        means.insert(lambda.clone(), mean);
    }

    Ok(NaiveOutcome {
        models,
        means,
        skipped,
    })
}
