//! Held-out log-likelihood and best-model bookkeeping.

use serde::Serialize;

use super::state::Lambda;
use crate::dataset::Instance;
use crate::model::LinearModel;
use crate::objective::log1p_exp_neg;

/// `log P(y | x)` for one instance under `model`, intercept corrected for
/// click replication. Offsets shift the linear predictor.
pub fn instance_log_likelihood(model: &LinearModel, instance: &Instance, click_replicates: u32) -> f64 {
    let y = if instance.label > 0 { 1.0 } else { -1.0 };
    let score = instance.offset
        + model.eval(
            instance.features.iter().map(|(key, value)| (key.as_str(), *value)),
            click_replicates,
        );
    -log1p_exp_neg(y * score)
}

/// Weighted mean log-likelihood over the first `max_events` instances.
/// `None` when there is nothing to score.
pub fn mean_log_likelihood(
    model: &LinearModel,
    instances: &[Instance],
    click_replicates: u32,
    max_events: usize,
) -> Option<f64> {
    let (total, weight) = instances
        .iter()
        .take(max_events)
        .fold((0.0, 0.0), |(total, weight), instance| {
            (
                total + instance.weight * instance_log_likelihood(model, instance, click_replicates),
                weight + instance.weight,
            )
        });
    (weight > 0.0).then(|| total / weight)
}

/// The best consensus model seen on held-out data.
#[derive(Debug, Clone, PartialEq)]
pub struct BestModel {
    pub lambda: Lambda,
    pub iteration: usize,
    pub log_likelihood: f64,
    pub model: LinearModel,
}

/// Keeps a single global best across lambdas and iterations.
#[derive(Debug, Clone, Default)]
pub struct BestModelTracker {
    best: Option<BestModel>,
}

impl BestModelTracker {
    /// Records a candidate. Iteration 0 (initialization) never qualifies and
    /// a candidate must strictly beat the incumbent. Returns whether it did.
    pub fn offer(&mut self, lambda: &Lambda, iteration: usize, log_likelihood: f64, model: &LinearModel) -> bool {
        if iteration == 0 || !log_likelihood.is_finite() {
            return false;
        }
        if self
            .best
            .as_ref()
            .is_some_and(|best| log_likelihood <= best.log_likelihood)
        {
            return false;
        }
        self.best = Some(BestModel {
            lambda: lambda.clone(),
            iteration,
            log_likelihood,
            model: model.clone(),
        });
        true
    }

    pub fn best(&self) -> Option<&BestModel> {
        self.best.as_ref()
    }

    pub fn into_best(self) -> Option<BestModel> {
        self.best
    }
}

/// One row of the per-iteration trajectory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrajectoryRow {
    pub iteration: usize,
    pub lambda: String,
    pub rho: f64,
    pub tolerance: f64,
    pub max_diff: f64,
    pub log_likelihood: Option<f64>,
}
