//! Job configuration for `agora train` and `agora train-naive`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::consensus::admm::{AdmmSettings, Regularizer};
use crate::consensus::naive::NaiveSettings;
use crate::consensus::partition::PartitionPolicy;
use crate::dataset::FeatureEncoding;
use crate::fitter::{FitOptions, Solver};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A full ADMM training job. Every optional key has a serde default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub train_path: PathBuf,
    #[serde(default)]
    pub test_path: Option<PathBuf>,
    pub output_path: PathBuf,
    pub num_blocks: u32,
    pub lambdas: Vec<f64>,
    /// One rho per lambda; omitted means rho = 1 for lambda <= 100, else 10.
    #[serde(default)]
    pub rhos: Option<Vec<f64>>,
    #[serde(default)]
    pub regularizer: Regularizer,
    #[serde(default = "defaults::num_iterations")]
    pub num_iterations: usize,
    #[serde(default = "defaults::epsilon")]
    pub epsilon: f64,
    #[serde(default)]
    pub penalize_intercept: bool,
    /// JSON lines of `{name, term, lambda}`.
    #[serde(default)]
    pub lambda_map_path: Option<PathBuf>,
    #[serde(default)]
    pub binary_features: bool,
    #[serde(default)]
    pub short_feature_index: bool,
    #[serde(default)]
    pub aggressive_tolerance_decay: bool,
    #[serde(default = "defaults::one")]
    pub num_click_replicates: u32,
    #[serde(default)]
    pub initialize_boost_rate: f64,
    #[serde(default)]
    pub rho_adapt_coefficient: f64,
    #[serde(default)]
    pub partition_by_key: bool,
    #[serde(default)]
    pub partition_seed: u64,
    #[serde(default)]
    pub remove_intermediate: bool,
    #[serde(default)]
    pub solver: Solver,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default = "defaults::max_test_events")]
    pub max_test_events: usize,
    #[serde(default = "defaults::initial_tolerance")]
    pub initial_tolerance: f64,
    #[serde(default = "defaults::tolerance_floor")]
    pub tolerance_floor: f64,
    /// Prior mean of every feature in naive block fits.
    #[serde(default)]
    pub prior_mean: f64,
    /// Naive training skips blocks with fewer instances.
    #[serde(default)]
    pub min_block_instances: usize,
    /// Solver tolerance of naive block fits.
    #[serde(default = "defaults::fit_epsilon")]
    pub fit_epsilon: f64,
}

mod defaults {
    pub fn num_iterations() -> usize {
        50
    }
    pub fn epsilon() -> f64 {
        1e-4
    }
    pub fn one() -> u32 {
        1
    }
    pub fn max_test_events() -> usize {
        1_000_000
    }
    pub fn initial_tolerance() -> f64 {
        0.01
    }
    pub fn tolerance_floor() -> f64 {
        1e-5
    }
    pub fn fit_epsilon() -> f64 {
        1e-3
    }
}

impl JobConfig {
    /// Reads, parses and validates a config file. Relative paths inside it
    /// are taken relative to the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.admm_settings(HashMap::new())
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.short_feature_index && !self.binary_features {
            return Err(ConfigError::Invalid(
                "short_feature_index requires binary_features".to_string(),
            ));
        }
        if self.threads == Some(0) {
            return Err(ConfigError::Invalid("threads must be positive".to_string()));
        }
        if !(self.fit_epsilon.is_finite() && self.fit_epsilon > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "fit_epsilon must be positive, got {}",
                self.fit_epsilon
            )));
        }
        if !self.prior_mean.is_finite() {
            return Err(ConfigError::Invalid("prior_mean must be finite".to_string()));
        }
        if self.max_test_events == 0 {
            return Err(ConfigError::Invalid("max_test_events must be positive".to_string()));
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.train_path);
        resolve(&mut self.output_path);
        if let Some(path) = self.test_path.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.lambda_map_path.as_mut() {
            resolve(path);
        }
    }

    pub fn admm_settings(&self, lambda_overrides: HashMap<String, f64>) -> AdmmSettings {
        AdmmSettings {
            num_blocks: self.num_blocks,
            lambdas: self.lambdas.clone(),
            rhos: self.rhos.clone(),
            regularizer: self.regularizer,
            max_iterations: self.num_iterations,
            epsilon: self.epsilon,
            penalize_intercept: self.penalize_intercept,
            lambda_overrides,
            aggressive_tolerance_decay: self.aggressive_tolerance_decay,
            initial_tolerance: self.initial_tolerance,
            tolerance_floor: self.tolerance_floor,
            click_replicates: self.num_click_replicates,
            initialize_boost_rate: self.initialize_boost_rate,
            rho_adapt_coefficient: self.rho_adapt_coefficient,
            max_test_events: self.max_test_events,
            fit: FitOptions {
                solver: self.solver,
                ..FitOptions::default()
            },
        }
    }

    pub fn naive_settings(&self, lambda_overrides: HashMap<String, f64>) -> NaiveSettings {
        NaiveSettings {
            lambdas: self.lambdas.clone(),
            prior_mean: self.prior_mean,
            penalize_intercept: self.penalize_intercept,
            lambda_overrides,
            min_instances: self.min_block_instances,
            fit: FitOptions {
                epsilon: self.fit_epsilon,
                solver: self.solver,
                ..FitOptions::default()
            },
        }
    }

    pub fn partition_policy(&self) -> PartitionPolicy {
        if self.partition_by_key {
            PartitionPolicy::ByKey
        } else {
            PartitionPolicy::Random {
                seed: self.partition_seed,
            }
        }
    }

    pub fn feature_encoding(&self) -> FeatureEncoding {
        match (self.binary_features, self.short_feature_index) {
            (false, _) => FeatureEncoding::Real,
            (true, false) => FeatureEncoding::Binary,
            (true, true) => FeatureEncoding::BinaryShort,
        }
    }
}
