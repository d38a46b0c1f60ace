use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::model::LinearModel;

/// A regularization strength together with the label it is published under.
#[derive(Debug, Clone)]
pub struct Lambda {
    value: f64,
    label: String,
}

impl Lambda {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            label: format!("{value}"),
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl PartialEq for Lambda {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Lambda {}

impl PartialOrd for Lambda {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Lambda {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.total_cmp(&other.value)
    }
}

impl fmt::Display for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Identifies one block fit: published as `lambda#partition`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartitionKey {
    pub lambda: Lambda,
    pub partition: u32,
}

impl PartitionKey {
    pub fn new(lambda: Lambda, partition: u32) -> Self {
        Self { lambda, partition }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.lambda, self.partition)
    }
}

/// What one block fit publishes for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionOutput {
    pub key: PartitionKey,
    /// Posterior mode of the block.
    pub x: LinearModel,
    /// `u + x`, reconciled into the next dual once `z` is known.
    pub u_plus_x: LinearModel,
}

/// The broadcast state of one iteration. Read-only while fits run and
/// replaced wholesale between iterations.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusState {
    pub iteration: usize,
    pub z: BTreeMap<Lambda, LinearModel>,
    pub u: BTreeMap<PartitionKey, LinearModel>,
}

impl ConsensusState {
    /// Zero consensus and zero duals for every `(lambda, partition)` pair.
    pub fn initial(lambdas: &[Lambda], num_blocks: u32) -> Self {
        let z = lambdas
            .iter()
            .map(|lambda| (lambda.clone(), LinearModel::default()))
            .collect();
        let u = lambdas
            .iter()
            .flat_map(|lambda| {
                (0..num_blocks).map(move |p| (PartitionKey::new(lambda.clone(), p), LinearModel::default()))
            })
            .collect();
        Self { iteration: 0, z, u }
    }

    /// Consensus for `lambda`; an unknown lambda reads as the zero model.
    pub fn consensus(&self, lambda: &Lambda) -> LinearModel {
        self.z.get(lambda).cloned().unwrap_or_default()
    }

    /// Dual for `key`; an unknown key reads as the zero model.
    pub fn dual(&self, key: &PartitionKey) -> LinearModel {
        self.u.get(key).cloned().unwrap_or_default()
    }

    /// The shifted target `z - u` that block `key` is pulled toward.
    pub fn prior_mean(&self, key: &PartitionKey) -> LinearModel {
        let mut prior = self.consensus(&key.lambda);
        prior.linear_combine(1.0, -1.0, &self.dual(key));
        prior
    }
}
