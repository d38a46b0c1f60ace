//! Per-item models.
//!
//! Records are grouped by their item key and every item gets its own
//! Bayesian logistic fit for each point of an intercept-lambda by
//! default-lambda grid. Models are published as `<grid>#<item>` where the
//! grid label is `<intercept lambda>:<default lambda>`.
//!
//! Scoring looks up the model of a record's item for each grid label and
//! aggregates a weighted mean log-likelihood per label.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

use super::executor::PartitionExecutor;
use super::state::Lambda;
use crate::dataset::{Dataset, DatasetError, FeatureEncoding, Instance};
use crate::fitter::{FitError, FitOptions, PosteriorKind, PriorBundle, fit};
use crate::model::{INTERCEPT_NAME, LinearModel};
use crate::objective::log1p_exp_neg;

#[derive(Debug, Error)]
pub enum ItemError {
    #[error("invalid item training settings: {0}")]
    InvalidSettings(String),

    #[error("record {record} has no item key")]
    MissingKey { record: usize },

    #[error("item {item}: {source}")]
    Dataset {
        item: String,
        #[source]
        source: DatasetError,
    },

    #[error("fit of item model {key} failed: {source}")]
    Fit {
        key: String,
        #[source]
        source: FitError,
    },
}

/// One point of the lambda grid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GridPoint {
    pub intercept: Lambda,
    pub default: Lambda,
}

impl GridPoint {
    pub fn new(intercept: f64, default: f64) -> Self {
        Self {
            intercept: Lambda::new(intercept),
            default: Lambda::new(default),
        }
    }

    pub fn model_key(&self, item: &str) -> String {
        format!("{self}#{item}")
    }
}

impl fmt::Display for GridPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.intercept, self.default)
    }
}

/// Splits a published key into its grid label and item.
pub fn split_model_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('#')
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemSettings {
    pub intercept_lambdas: Vec<f64>,
    pub default_lambdas: Vec<f64>,
    /// Intercept prior mean of items missing from `intercept_prior_means`.
    pub intercept_default_prior_mean: f64,
    /// Intercept prior mean per item key.
    pub intercept_prior_means: HashMap<String, f64>,
    /// Per-feature lambdas keyed by feature key.
    pub lambda_overrides: HashMap<String, f64>,
    /// Also return the diagonal posterior variance of every model.
    pub compute_variance: bool,
    pub encoding: FeatureEncoding,
    pub fit: FitOptions,
}

impl Default for ItemSettings {
    fn default() -> Self {
        Self {
            intercept_lambdas: vec![1.0],
            default_lambdas: vec![1.0],
            intercept_default_prior_mean: 0.0,
            intercept_prior_means: HashMap::new(),
            lambda_overrides: HashMap::new(),
            compute_variance: false,
            encoding: FeatureEncoding::Real,
            fit: FitOptions {
                epsilon: 1e-3,
                ..FitOptions::default()
            },
        }
    }
}

impl ItemSettings {
    pub fn validate(&self) -> Result<(), ItemError> {
        if self.intercept_lambdas.is_empty() || self.default_lambdas.is_empty() {
            return Err(ItemError::InvalidSettings(
                "both the intercept and the default lambda lists need a value".to_string(),
            ));
        }
        if let Some(lambda) = self
            .intercept_lambdas
            .iter()
            .chain(&self.default_lambdas)
            .chain(self.lambda_overrides.values())
            .find(|l| !(l.is_finite() && **l > 0.0))
        {
            return Err(ItemError::InvalidSettings(format!(
                "lambdas must be positive and finite, got {lambda}"
            )));
        }
        if let Some((item, mean)) = self
            .intercept_prior_means
            .iter()
            .find(|(_, mean)| !mean.is_finite())
        {
            return Err(ItemError::InvalidSettings(format!(
                "intercept prior mean of item {item} is {mean}"
            )));
        }
        Ok(())
    }

    /// The crossed grid in label order.
    pub fn grid(&self) -> Vec<GridPoint> {
        let mut grid: Vec<GridPoint> = self
            .intercept_lambdas
            .iter()
            .flat_map(|i| self.default_lambdas.iter().map(move |d| GridPoint::new(*i, *d)))
            .collect();
        grid.sort();
        grid.dedup();
        grid
    }

    /// Intercept `N(m_item, 1/lambda_I)`, features `N(0, 1/lambda_D)` with
    /// per-feature overrides.
    pub fn priors(&self, item: &str, point: &GridPoint) -> PriorBundle {
        let intercept_mean = self
            .intercept_prior_means
            .get(item)
            .copied()
            .unwrap_or(self.intercept_default_prior_mean);
        let mut variance: HashMap<String, f64> = self
            .lambda_overrides
            .iter()
            .map(|(feature, lambda)| (feature.clone(), 1.0 / lambda))
            .collect();
        variance.insert(INTERCEPT_NAME.to_string(), 1.0 / point.intercept.value());
        PriorBundle {
            mean: HashMap::from([(INTERCEPT_NAME.to_string(), intercept_mean)]),
            variance,
            default_mean: 0.0,
            default_variance: 1.0 / point.default.value(),
        }
    }
}

/// A trained per-item model.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemModel {
    pub item: String,
    pub grid: GridPoint,
    pub model: LinearModel,
    /// Diagonal posterior variance, keyed like the model.
    pub variance: Option<LinearModel>,
}

impl ItemModel {
    pub fn key(&self) -> String {
        self.grid.model_key(&self.item)
    }
}

/// Groups keyed records by item, keeping each item's records in input order.
pub fn group_by_item<I>(records: I) -> Result<BTreeMap<String, Vec<Instance>>, ItemError>
where
    I: IntoIterator<Item = (Option<String>, Instance)>,
{
    let mut items: BTreeMap<String, Vec<Instance>> = BTreeMap::new();
    for (record, (key, instance)) in records.into_iter().enumerate() {
        let key = key.ok_or(ItemError::MissingKey { record })?;
        items.entry(key).or_default().push(instance);
    }
    Ok(items)
}

fn item_dataset(item: &str, instances: &[Instance], encoding: FeatureEncoding) -> Result<Dataset, ItemError> {
    let wrap = |source: DatasetError| ItemError::Dataset {
        item: item.to_string(),
        source,
    };
    let mut dataset = match encoding {
        FeatureEncoding::Real => Dataset::new(1.0),
        FeatureEncoding::Binary => Dataset::binary(1.0, false).map_err(wrap)?,
        FeatureEncoding::BinaryShort => Dataset::binary(1.0, true).map_err(wrap)?,
    };
    for instance in instances {
        dataset.add_instance(instance).map_err(wrap)?;
    }
    dataset.finish().map_err(wrap)?;
    Ok(dataset)
}

/// Fits every item at every grid point. Items run on `executor`; the grid
/// points of one item share its dataset. Output is ordered by item, then
/// grid point.
pub fn train_items<E: PartitionExecutor>(
    settings: &ItemSettings,
    items: BTreeMap<String, Vec<Instance>>,
    executor: &E,
) -> Result<Vec<ItemModel>, ItemError> {
    settings.validate()?;
    let grid = settings.grid();
    let options = FitOptions {
        posterior: if settings.compute_variance {
            PosteriorKind::Diagonal
        } else {
            PosteriorKind::None
        },
        ..settings.fit
    };
    log::info!(
        "Training {} items over {} grid points",
        items.len(),
        grid.len()
    );

    let tasks: Vec<(String, Vec<Instance>)> = items.into_iter().collect();
    let results = executor.execute(tasks, |(item, instances)| -> Result<Vec<ItemModel>, ItemError> {
        let dataset = item_dataset(&item, &instances, settings.encoding)?;
        if settings.intercept_prior_means.contains_key(&item) {
            log::debug!("Item {item}: intercept prior mean from the map");
        }
        grid.iter()
            .map(|point| -> Result<ItemModel, ItemError> {
                let priors = settings.priors(&item, point);
                let result = fit(&dataset, None, &priors, &options).map_err(|source| {
                    log::error!(
                        "Item {item}: {} instances, {} features",
                        dataset.n_instances(),
                        dataset.n_features()
                    );
                    ItemError::Fit {
                        key: point.model_key(&item),
                        source,
                    }
                })?;
                let variance = result.variance.map(|mut map| {
                    let intercept = map.remove(INTERCEPT_NAME).unwrap_or(0.0);
                    LinearModel::with_coefficients(intercept, map)
                });
                Ok(ItemModel {
                    item: item.clone(),
                    grid: point.clone(),
                    model: result.model,
                    variance,
                })
            })
            .collect()
    });

    let mut models = Vec::new();
    for result in results {
        models.extend(result?);
    }
    models.sort_by(|a, b| (&a.item, &a.grid).cmp(&(&b.item, &b.grid)));
    Ok(models)
}

/// Scores of one record under every requested grid label.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemPrediction {
    pub item: String,
    pub label: i32,
    pub weight: f64,
    /// Linear predictor per grid label.
    pub scores: BTreeMap<String, f64>,
}

/// Scores every keyed record with its item's model for each of `labels`.
/// A record whose item has no model at a label scores with an empty model,
/// that is its offset alone.
pub fn predict_items(
    models: &HashMap<String, LinearModel>,
    labels: &[String],
    records: &[(Option<String>, Instance)],
) -> Result<Vec<ItemPrediction>, ItemError> {
    let empty = LinearModel::default();
    let mut missing = 0_usize;
    let predictions = records
        .iter()
        .enumerate()
        .map(|(record, (key, instance))| -> Result<ItemPrediction, ItemError> {
            let item = key.as_deref().ok_or(ItemError::MissingKey { record })?;
            let scores = labels
                .iter()
                .map(|label| {
                    let model = models.get(&format!("{label}#{item}")).unwrap_or_else(|| {
                        missing += 1;
                        &empty
                    });
                    let features = instance.features.iter().map(|(k, v)| (k.as_str(), *v));
                    (label.clone(), instance.offset + model.eval(features, 1))
                })
                .collect();
            Ok(ItemPrediction {
                item: item.to_string(),
                label: instance.label,
                weight: instance.weight,
                scores,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if missing > 0 {
        log::warn!("{missing} record scores used an empty model; their item had none at that grid point");
    }
    Ok(predictions)
}

/// Weighted mean log-likelihood of one grid label.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelLoglik {
    pub log_likelihood: f64,
    pub weight: f64,
}

/// Aggregates predictions into a weighted mean log-likelihood per label.
pub fn loglik_by_label(predictions: &[ItemPrediction]) -> BTreeMap<String, LabelLoglik> {
    let mut sums: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for prediction in predictions {
        let y = if prediction.label > 0 { 1.0 } else { -1.0 };
        for (label, score) in &prediction.scores {
            let entry = sums.entry(label.clone()).or_insert((0.0, 0.0));
            entry.0 -= prediction.weight * log1p_exp_neg(y * score);
            entry.1 += prediction.weight;
        }
    }
    sums.into_iter()
        .filter(|(_, (_, weight))| *weight > 0.0)
        .map(|(label, (total, weight))| {
            (
                label,
                LabelLoglik {
                    log_likelihood: total / weight,
                    weight,
                },
            )
        })
        .collect()
}
