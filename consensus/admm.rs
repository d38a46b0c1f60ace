//! The ADMM driver.
//!
//! [`train`] walks the state machine `Init -> Iterate(1) -> Iterate(2) ...`
//! until the consensus stops moving or the iteration budget runs out. Each
//! iteration is a barrier: every `(lambda, block)` fit must publish before
//! `z` and `u` are rebuilt and republished as a whole.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

use super::evaluate::{BestModel, BestModelTracker, TrajectoryRow, mean_log_likelihood};
use super::executor::PartitionExecutor;
use super::naive::ridge_priors;
use super::schedule::{RhoSchedule, ToleranceSchedule, default_rho};
use super::state::{ConsensusState, Lambda, PartitionKey, PartitionOutput};
use super::update::{
    Incomplete, Penalty, block_means, l1_consensus, l2_consensus, max_abs_change, recentre_duals,
};
use crate::dataset::{Dataset, DatasetError, FeatureEncoding, Instance};
use crate::fitter::{FitError, FitOptions, PriorBundle, fit};
use crate::model::{INTERCEPT_NAME, LinearModel};
use crate::shared::records::RecordError;

#[derive(Debug, Error)]
pub enum AdmmError {
    #[error("partition {partition}: {source}")]
    Dataset {
        partition: u32,
        #[source]
        source: DatasetError,
    },

    #[error("fit of block {key} failed: {source}")]
    Fit {
        key: String,
        #[source]
        source: FitError,
    },

    #[error(
        "iteration {iteration}, lambda {lambda}: expected outputs from {expected} partitions, found {found}"
    )]
    IncompleteIteration {
        iteration: usize,
        lambda: String,
        expected: usize,
        found: usize,
    },

    #[error("invalid ADMM settings: {0}")]
    InvalidSettings(String),

    #[error(transparent)]
    Observer(#[from] RecordError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regularizer {
    L1,
    #[default]
    L2,
}

impl fmt::Display for Regularizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regularizer::L1 => f.write_str("l1"),
            Regularizer::L2 => f.write_str("l2"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdmmSettings {
    pub num_blocks: u32,
    pub lambdas: Vec<f64>,
    /// One rho per lambda; `None` picks [`default_rho`] for each.
    pub rhos: Option<Vec<f64>>,
    pub regularizer: Regularizer,
    pub max_iterations: usize,
    pub epsilon: f64,
    pub penalize_intercept: bool,
    /// Per-feature lambdas keyed by feature key.
    pub lambda_overrides: HashMap<String, f64>,
    pub aggressive_tolerance_decay: bool,
    pub initial_tolerance: f64,
    pub tolerance_floor: f64,
    pub click_replicates: u32,
    /// Rho multiplier for the first iteration after mean-model
    /// initialization. Zero disables the warm start.
    pub initialize_boost_rate: f64,
    pub rho_adapt_coefficient: f64,
    pub max_test_events: usize,
    pub fit: FitOptions,
}

impl Default for AdmmSettings {
    fn default() -> Self {
        Self {
            num_blocks: 1,
            lambdas: vec![1.0],
            rhos: None,
            regularizer: Regularizer::L2,
            max_iterations: 50,
            epsilon: 1e-4,
            penalize_intercept: false,
            lambda_overrides: HashMap::new(),
            aggressive_tolerance_decay: false,
            initial_tolerance: 0.01,
            tolerance_floor: 1e-5,
            click_replicates: 1,
            initialize_boost_rate: 0.0,
            rho_adapt_coefficient: 0.0,
            max_test_events: 1_000_000,
            fit: FitOptions::default(),
        }
    }
}

impl AdmmSettings {
    pub fn validate(&self) -> Result<(), AdmmError> {
        let invalid = |message: String| -> Result<(), AdmmError> {
            Err(AdmmError::InvalidSettings(message))
        };
        if self.num_blocks == 0 {
            return invalid("num_blocks must be positive".to_string());
        }
        if self.lambdas.is_empty() {
            return invalid("at least one lambda is required".to_string());
        }
        if let Some(lambda) = self.lambdas.iter().find(|l| !(l.is_finite() && **l > 0.0)) {
            return invalid(format!("lambda must be positive and finite, got {lambda}"));
        }
        let mut sorted = self.lambdas.clone();
        sorted.sort_by(f64::total_cmp);
        if sorted.windows(2).any(|pair| pair[0] == pair[1]) {
            return invalid("lambdas must be distinct".to_string());
        }
        if let Some(rhos) = &self.rhos {
            if rhos.len() != self.lambdas.len() {
                return invalid(format!(
                    "{} rhos given for {} lambdas",
                    rhos.len(),
                    self.lambdas.len()
                ));
            }
            if let Some(rho) = rhos.iter().find(|r| !(r.is_finite() && **r > 0.0)) {
                return invalid(format!("rho must be positive and finite, got {rho}"));
            }
        }
        if let Some((key, lambda)) = self
            .lambda_overrides
            .iter()
            .find(|(_, l)| !(l.is_finite() && **l > 0.0))
        {
            return invalid(format!("lambda override for '{key}' must be positive, got {lambda}"));
        }
        if !(self.epsilon > 0.0) {
            return invalid(format!("epsilon must be positive, got {}", self.epsilon));
        }
        if !(self.initial_tolerance > 0.0 && self.tolerance_floor >= 0.0) {
            return invalid(format!(
                "tolerance schedule {} -> {} is not valid",
                self.initial_tolerance, self.tolerance_floor
            ));
        }
        if self.click_replicates == 0 {
            return invalid("click replicates must be at least 1".to_string());
        }
        if !(self.initialize_boost_rate >= 0.0) {
            return invalid(format!(
                "initialize boost rate must be non-negative, got {}",
                self.initialize_boost_rate
            ));
        }
        Ok(())
    }

    /// `(lambda, base rho)` pairs in lambda order.
    pub fn lambda_rho_table(&self) -> Vec<(Lambda, f64)> {
        let mut table: Vec<(Lambda, f64)> = self
            .lambdas
            .iter()
            .enumerate()
            .map(|(i, &lambda)| {
                let rho = self
                    .rhos
                    .as_ref()
                    .and_then(|rhos| rhos.get(i).copied())
                    .unwrap_or_else(|| default_rho(lambda));
                (Lambda::new(lambda), rho)
            })
            .collect();
        table.sort_by(|a, b| a.0.cmp(&b.0));
        table
    }

    fn warm_start(&self) -> bool {
        self.initialize_boost_rate > 0.0 && self.regularizer == Regularizer::L2
    }
}

/// Where the loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Iterate(usize),
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Termination {
    Converged { iteration: usize },
    BudgetExhausted { iterations: usize },
}

impl Termination {
    pub fn iterations(&self) -> usize {
        match *self {
            Termination::Converged { iteration } => iteration,
            Termination::BudgetExhausted { iterations } => iterations,
        }
    }
}

/// What an observer sees after each iteration; iteration 0 is the warm start.
#[derive(Debug)]
pub struct IterationReport<'a> {
    pub state: &'a ConsensusState,
    pub rhos: &'a BTreeMap<Lambda, f64>,
    pub tolerance: f64,
    pub max_diff: f64,
    pub min_diff: f64,
    pub log_likelihood: &'a BTreeMap<Lambda, f64>,
    pub best: Option<&'a BestModel>,
    /// Whether `best` was replaced by this iteration.
    pub best_improved: bool,
}

/// Hooks for persisting or displaying progress. Every method defaults to a
/// no-op.
pub trait IterationObserver {
    fn on_start(&mut self, lambda_rho: &[(Lambda, f64)]) -> Result<(), RecordError> {
        let _ = lambda_rho;
        Ok(())
    }
    fn on_iteration(&mut self, report: &IterationReport<'_>) -> Result<(), RecordError> {
        let _ = report;
        Ok(())
    }
    fn on_finish(&mut self, outcome: &AdmmOutcome) -> Result<(), RecordError> {
        let _ = outcome;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl IterationObserver for NoopObserver {}

#[derive(Debug, Clone)]
pub struct AdmmOutcome {
    /// Final consensus and duals.
    pub state: ConsensusState,
    pub termination: Termination,
    pub best: Option<BestModel>,
    pub trajectory: Vec<TrajectoryRow>,
    pub lambda_rho: Vec<(Lambda, f64)>,
}

impl AdmmOutcome {
    pub fn model(&self, lambda: &Lambda) -> Option<&LinearModel> {
        self.state.z.get(lambda)
    }
}

/// Interns every block once, with a unit bias column. Blocks are reused by
/// every iteration and every lambda.
pub fn build_datasets(
    blocks: BTreeMap<u32, Vec<Instance>>,
    encoding: FeatureEncoding,
) -> Result<BTreeMap<u32, Dataset>, AdmmError> {
    blocks
        .into_iter()
        .map(|(partition, instances)| {
            let wrap = |source: DatasetError| {
                log::error!("Partition {partition} cannot be used: {source}");
                AdmmError::Dataset { partition, source }
            };
            let mut dataset = match encoding {
                FeatureEncoding::Real => Dataset::new(1.0),
                FeatureEncoding::Binary => Dataset::binary(1.0, false).map_err(wrap)?,
                FeatureEncoding::BinaryShort => Dataset::binary(1.0, true).map_err(wrap)?,
            };
            for instance in &instances {
                dataset.add_instance(instance).map_err(wrap)?;
            }
            dataset.finish().map_err(wrap)?;
            log::debug!(
                "Partition {partition}: {} instances, {} features",
                dataset.n_instances(),
                dataset.n_features()
            );
            Ok((partition, dataset))
        })
        .collect()
}

/// Runs ADMM consensus training over `blocks`, which must hold a finished
/// dataset for every id in `0..num_blocks`.
pub fn train<E, O>(
    settings: &AdmmSettings,
    blocks: &BTreeMap<u32, Dataset>,
    test: Option<&[Instance]>,
    executor: &E,
    observer: &mut O,
) -> Result<AdmmOutcome, AdmmError>
where
    E: PartitionExecutor,
    O: IterationObserver + ?Sized,
{
    settings.validate()?;
    for partition in 0..settings.num_blocks {
        match blocks.get(&partition) {
            Some(dataset) if dataset.is_finished() => {}
            Some(_) => {
                return Err(AdmmError::Dataset {
                    partition,
                    source: DatasetError::NotFinished,
                });
            }
            None => {
                return Err(AdmmError::InvalidSettings(format!(
                    "no dataset for partition {partition} of {}",
                    settings.num_blocks
                )));
            }
        }
    }

    let lambda_rho = settings.lambda_rho_table();
    let lambdas: Vec<Lambda> = lambda_rho.iter().map(|(lambda, _)| lambda.clone()).collect();
    // The consensus weight uses the configured rho; the boosted or adapted
    // rho only shapes the block priors.
    let base_rhos: BTreeMap<Lambda, f64> = lambda_rho.iter().cloned().collect();
    observer.on_start(&lambda_rho)?;
    log::info!(
        "ADMM over {} partitions, {} regularizer, lambdas [{}]",
        settings.num_blocks,
        settings.regularizer,
        lambdas.iter().map(Lambda::label).collect::<Vec<_>>().join(", ")
    );

    let rho_schedule = RhoSchedule {
        adapt_coefficient: settings.rho_adapt_coefficient,
        boost_rate: settings.initialize_boost_rate,
    };
    let mut tolerance = ToleranceSchedule::new(
        settings.initial_tolerance,
        settings.tolerance_floor,
        settings.aggressive_tolerance_decay,
    );
    let boosted = settings.warm_start();
    let mut state = ConsensusState::initial(&lambdas, settings.num_blocks);
    let mut tracker = BestModelTracker::default();
    let mut trajectory = Vec::new();
    let mut last_mindiff = None;
    let mut phase = Phase::Init;

    let termination = loop {
        match phase {
            Phase::Init => {
                if boosted {
                    state.z = mean_model(settings, &lambdas, blocks, executor)?;
                    let max_diff = lambdas
                        .iter()
                        .map(|lambda| state.consensus(lambda).max_abs_value())
                        .fold(0.0, f64::max);
                    let rhos = BTreeMap::new();
                    let log_likelihood = held_out(settings, &state, test);
                    for lambda in &lambdas {
                        trajectory.push(TrajectoryRow {
                            iteration: 0,
                            lambda: lambda.label().to_string(),
                            rho: 0.0,
                            tolerance: settings.initial_tolerance,
                            max_diff,
                            log_likelihood: log_likelihood.get(lambda).copied(),
                        });
                    }
                    observer.on_iteration(&IterationReport {
                        state: &state,
                        rhos: &rhos,
                        tolerance: settings.initial_tolerance,
                        max_diff,
                        min_diff: max_diff,
                        log_likelihood: &log_likelihood,
                        best: tracker.best(),
                        best_improved: false,
                    })?;
                }
                phase = Phase::Iterate(1);
            }
            Phase::Iterate(iteration) if iteration > settings.max_iterations => {
                break Termination::BudgetExhausted {
                    iterations: settings.max_iterations,
                };
            }
            Phase::Iterate(iteration) => {
                let tolerance_now = tolerance.advance(iteration, last_mindiff);
                let rhos: BTreeMap<Lambda, f64> = lambda_rho
                    .iter()
                    .map(|(lambda, base)| {
                        (lambda.clone(), rho_schedule.effective(*base, iteration, boosted))
                    })
                    .collect();

                let outputs = fit_blocks(
                    settings,
                    &lambdas,
                    &state,
                    blocks,
                    &rhos,
                    tolerance_now,
                    executor,
                )?;
                let means = block_means(&lambdas, settings.num_blocks, &outputs, &state.u).map_err(
                    |Incomplete {
                         lambda,
                         expected,
                         found,
                     }| AdmmError::IncompleteIteration {
                        iteration,
                        lambda: lambda.to_string(),
                        expected,
                        found,
                    },
                )?;

                let mut consensus = BTreeMap::new();
                let mut max_diff = f64::NEG_INFINITY;
                let mut min_diff = f64::INFINITY;
                for (lambda, mean) in &means {
                    let penalty = Penalty {
                        lambda: lambda.value(),
                        rho: base_rhos.get(lambda).copied().unwrap_or(1.0),
                        num_blocks: settings.num_blocks,
                        overrides: &settings.lambda_overrides,
                        penalize_intercept: settings.penalize_intercept,
                    };
                    let z = match settings.regularizer {
                        Regularizer::L2 => l2_consensus(mean, &penalty),
                        Regularizer::L1 => l1_consensus(mean, &penalty),
                    };
                    let diff = max_abs_change(&z, &state.consensus(lambda));
                    max_diff = max_diff.max(diff);
                    min_diff = min_diff.min(diff);
                    consensus.insert(lambda.clone(), z);
                }
                let duals = recentre_duals(&outputs, &consensus);
                state = ConsensusState {
                    iteration,
                    z: consensus,
                    u: duals,
                };

                let log_likelihood = held_out(settings, &state, test);
                let mut best_improved = false;
                for lambda in &lambdas {
                    let ll = log_likelihood.get(lambda).copied();
                    if let Some(ll) = ll {
                        best_improved |= tracker.offer(lambda, iteration, ll, &state.consensus(lambda));
                        log::info!("Iteration {iteration}, lambda {lambda}: test log-likelihood {ll:.6}");
                    }
                    trajectory.push(TrajectoryRow {
                        iteration,
                        lambda: lambda.label().to_string(),
                        rho: rhos.get(lambda).copied().unwrap_or(0.0),
                        tolerance: tolerance_now,
                        max_diff,
                        log_likelihood: ll,
                    });
                }
                log::info!(
                    "Iteration {iteration}: tolerance {tolerance_now:.1e}, maxdiff {max_diff:.3e}, mindiff {min_diff:.3e}"
                );
                for (lambda, rho) in &rhos {
                    log::debug!("Iteration {iteration}, lambda {lambda}: rho {rho}");
                }

                observer.on_iteration(&IterationReport {
                    state: &state,
                    rhos: &rhos,
                    tolerance: tolerance_now,
                    max_diff,
                    min_diff,
                    log_likelihood: &log_likelihood,
                    best: tracker.best(),
                    best_improved,
                })?;

                if max_diff < settings.epsilon && tolerance.at_floor() {
                    break Termination::Converged { iteration };
                }
                last_mindiff = Some(min_diff);
                phase = Phase::Iterate(iteration + 1);
            }
        }
    };

    match termination {
        Termination::Converged { iteration } => {
            log::info!("ADMM converged after {iteration} iterations")
        }
        Termination::BudgetExhausted { iterations } => {
            log::warn!("ADMM stopped at the iteration budget ({iterations}) before converging")
        }
    }

    let outcome = AdmmOutcome {
        state,
        termination,
        best: tracker.into_best(),
        trajectory,
        lambda_rho,
    };
    observer.on_finish(&outcome)?;
    Ok(outcome)
}

fn block_keys(lambdas: &[Lambda], num_blocks: u32) -> Vec<PartitionKey> {
    lambdas
        .iter()
        .flat_map(|lambda| (0..num_blocks).map(move |p| PartitionKey::new(lambda.clone(), p)))
        .collect()
}

fn block_dataset(blocks: &BTreeMap<u32, Dataset>, partition: u32) -> Result<&Dataset, AdmmError> {
    blocks
        .get(&partition)
        .ok_or_else(|| AdmmError::InvalidSettings(format!("no dataset for partition {partition}")))
}

/// One ADMM x-step for every `(lambda, block)` pair.
fn fit_blocks<E: PartitionExecutor>(
    settings: &AdmmSettings,
    lambdas: &[Lambda],
    state: &ConsensusState,
    blocks: &BTreeMap<u32, Dataset>,
    rhos: &BTreeMap<Lambda, f64>,
    tolerance: f64,
    executor: &E,
) -> Result<Vec<PartitionOutput>, AdmmError> {
    let options = FitOptions {
        epsilon: tolerance,
        ..settings.fit
    };
    let keys = block_keys(lambdas, settings.num_blocks);
    let results = executor.execute(keys, |key: PartitionKey| -> Result<PartitionOutput, AdmmError> {
        let dataset = block_dataset(blocks, key.partition)?;
        let rho = rhos.get(&key.lambda).copied().unwrap_or(1.0);
        let priors = PriorBundle {
            mean: state.prior_mean(&key).to_map(INTERCEPT_NAME),
            variance: HashMap::new(),
            default_mean: 0.0,
            default_variance: 1.0 / rho,
        };
        let initial = state.consensus(&key.lambda).to_map(INTERCEPT_NAME);
        let result = fit(dataset, Some(&initial), &priors, &options).map_err(|source| AdmmError::Fit {
            key: key.to_string(),
            source,
        })?;
        let mut u_plus_x = state.dual(&key);
        u_plus_x.linear_combine(1.0, 1.0, &result.model);
        Ok(PartitionOutput {
            key,
            x: result.model,
            u_plus_x,
        })
    });
    let mut outputs = results.into_iter().collect::<Result<Vec<_>, AdmmError>>()?;
    outputs.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(outputs)
}

/// Naive divide-and-average warm start: every block is fitted alone under
/// the plain ridge prior and the fits are averaged per lambda.
fn mean_model<E: PartitionExecutor>(
    settings: &AdmmSettings,
    lambdas: &[Lambda],
    blocks: &BTreeMap<u32, Dataset>,
    executor: &E,
) -> Result<BTreeMap<Lambda, LinearModel>, AdmmError> {
    log::info!("Mean-model initialization over {} partitions", settings.num_blocks);
    let options = FitOptions {
        epsilon: settings.initial_tolerance,
        ..settings.fit
    };
    let keys = block_keys(lambdas, settings.num_blocks);
    let results = executor.execute(keys, |key: PartitionKey| -> Result<PartitionOutput, AdmmError> {
        let dataset = block_dataset(blocks, key.partition)?;
        let priors = ridge_priors(
            key.lambda.value(),
            0.0,
            &settings.lambda_overrides,
            settings.penalize_intercept,
        );
        let result = fit(dataset, None, &priors, &options).map_err(|source| AdmmError::Fit {
            key: key.to_string(),
            source,
        })?;
        Ok(PartitionOutput {
            key,
            u_plus_x: result.model.clone(),
            x: result.model,
        })
    });
    let outputs = results.into_iter().collect::<Result<Vec<_>, AdmmError>>()?;
    let means = block_means(lambdas, settings.num_blocks, &outputs, &BTreeMap::new()).map_err(
        |Incomplete {
             lambda,
             expected,
             found,
         }| AdmmError::IncompleteIteration {
            iteration: 0,
            lambda: lambda.to_string(),
            expected,
            found,
        },
    )?;
    Ok(means.into_iter().map(|(lambda, mean)| (lambda, mean.x)).collect())
}

fn held_out(
    settings: &AdmmSettings,
    state: &ConsensusState,
    test: Option<&[Instance]>,
) -> BTreeMap<Lambda, f64> {
    let Some(test) = test else {
        return BTreeMap::new();
    };
    state
        .z
        .iter()
        .filter_map(|(lambda, z)| {
            mean_log_likelihood(z, test, settings.click_replicates, settings.max_test_events)
                .map(|ll| (lambda.clone(), ll))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::executor::SequentialExecutor;

    fn blocks(num_blocks: u32) -> Result<BTreeMap<u32, Dataset>, AdmmError> {
        let mut grouped: BTreeMap<u32, Vec<Instance>> = BTreeMap::new();
        for i in 0..40u32 {
            let x = f64::from(i % 10) / 5.0 - 1.0;
            let label = if (i * 7) % 10 < 6 { 1 } else { -1 };
            let instance = Instance::new(label, vec![("x".to_string(), x)]);
            grouped.entry(i % num_blocks).or_default().push(instance);
        }
        build_datasets(grouped, FeatureEncoding::Real)
    }

    #[test]
    fn settings_reject_mismatched_rhos() {
        let settings = AdmmSettings {
            lambdas: vec![1.0, 2.0],
            rhos: Some(vec![1.0]),
            ..AdmmSettings::default()
        };
        assert!(matches!(settings.validate(), Err(AdmmError::InvalidSettings(_))));
    }

    #[test]
    fn lambda_table_uses_the_auto_rho_policy() {
        let settings = AdmmSettings {
            lambdas: vec![500.0, 1.0],
            ..AdmmSettings::default()
        };
        let table = settings.lambda_rho_table();
        assert_eq!(table[0].0.value(), 1.0);
        assert_eq!(table[0].1, 1.0);
        assert_eq!(table[1].1, 10.0);
    }

    #[test]
    fn zero_budget_exhausts_immediately() -> Result<(), AdmmError> {
        let settings = AdmmSettings {
            num_blocks: 2,
            max_iterations: 0,
            ..AdmmSettings::default()
        };
        let data = blocks(2)?;
        let outcome = train(&settings, &data, None, &SequentialExecutor, &mut NoopObserver)?;
        assert_eq!(outcome.termination, Termination::BudgetExhausted { iterations: 0 });
        assert!(outcome.trajectory.is_empty());
        Ok(())
    }

    #[test]
    fn missing_partition_dataset_is_rejected() -> Result<(), AdmmError> {
        let settings = AdmmSettings {
            num_blocks: 3,
            ..AdmmSettings::default()
        };
        let data = blocks(2)?;
        let result = train(&settings, &data, None, &SequentialExecutor, &mut NoopObserver);
        assert!(matches!(result, Err(AdmmError::InvalidSettings(_))));
        Ok(())
    }

    #[test]
    fn budget_bounds_the_iterations() -> Result<(), AdmmError> {
        let settings = AdmmSettings {
            num_blocks: 2,
            max_iterations: 3,
            ..AdmmSettings::default()
        };
        let data = blocks(2)?;
        let outcome = train(&settings, &data, None, &SequentialExecutor, &mut NoopObserver)?;
        assert_eq!(outcome.termination, Termination::BudgetExhausted { iterations: 3 });
        assert_eq!(outcome.state.iteration, 3);
        assert_eq!(outcome.trajectory.len(), 3);
        assert_eq!(outcome.state.u.len(), 2);
        Ok(())
    }

    #[test]
    fn warm_start_fills_the_consensus_before_iterating() -> Result<(), AdmmError> {
        let settings = AdmmSettings {
            num_blocks: 2,
            max_iterations: 1,
            initialize_boost_rate: 2.0,
            ..AdmmSettings::default()
        };
        let data = blocks(2)?;
        let lambdas = [Lambda::new(1.0)];
        let z = mean_model(&settings, &lambdas, &data, &SequentialExecutor)?;
        assert!(z[&lambdas[0]].coefficient("x") != 0.0);

        let test: Vec<Instance> = (0..5)
            .map(|i| Instance::new(if i % 2 == 0 { 1 } else { -1 }, vec![("x".to_string(), 0.5)]))
            .collect();
        let outcome = train(&settings, &data, Some(&test), &SequentialExecutor, &mut NoopObserver)?;
        assert_eq!(outcome.trajectory[0].iteration, 0);
        assert!(outcome.trajectory[0].log_likelihood.is_some());
        assert_eq!(outcome.best.map(|b| b.iteration), Some(1));
        Ok(())
    }
}
