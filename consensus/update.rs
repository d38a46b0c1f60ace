//! Consensus and dual updates.
//!
//! Reductions walk their inputs in key order, so the floating-point sums do
//! not depend on the order in which block fits finished.

use std::collections::{BTreeMap, HashMap};

use super::state::{Lambda, PartitionKey, PartitionOutput};
use crate::model::LinearModel;

/// Block averages of one lambda.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlockMeans {
    pub x: LinearModel,
    pub u: LinearModel,
}

/// Outputs missing from a lambda at the aggregation barrier.
#[derive(Debug, Clone, PartialEq)]
pub struct Incomplete {
    pub lambda: Lambda,
    pub expected: usize,
    pub found: usize,
}

/// Averages `x` and the duals `u` that produced it across blocks, per lambda.
///
/// Every lambda must have exactly one output from each of the `num_blocks`
/// partitions; anything less is refused so that partial iterations never
/// reach `z`.
pub fn block_means(
    lambdas: &[Lambda],
    num_blocks: u32,
    outputs: &[PartitionOutput],
    duals: &BTreeMap<PartitionKey, LinearModel>,
) -> Result<BTreeMap<Lambda, BlockMeans>, Incomplete> {
    let mut by_key: BTreeMap<&PartitionKey, &PartitionOutput> = BTreeMap::new();
    for output in outputs {
        by_key.insert(&output.key, output);
    }

    let scale = 1.0 / f64::from(num_blocks);
    let mut means = BTreeMap::new();
    for lambda in lambdas {
        let published: Vec<&PartitionOutput> = by_key
            .iter()
            .filter(|(key, _)| key.lambda == *lambda)
            .map(|(_, output)| *output)
            .collect();
        let complete = published.len() == num_blocks as usize
            && published
                .iter()
                .zip(0..num_blocks)
                .all(|(output, p)| output.key.partition == p);
        if !complete {
            return Err(Incomplete {
                lambda: lambda.clone(),
                expected: num_blocks as usize,
                found: published.len(),
            });
        }

        let mut mean = BlockMeans::default();
        for output in &published {
            mean.x.linear_combine(1.0, 1.0, &output.x);
            if let Some(u) = duals.get(&output.key) {
                mean.u.linear_combine(1.0, 1.0, u);
            }
        }
        mean.x.rescale(scale);
        mean.u.rescale(scale);
        means.insert(lambda.clone(), mean);
    }
    Ok(means)
}

/// Penalty configuration shared by both consensus rules.
#[derive(Debug, Clone, Copy)]
pub struct Penalty<'a> {
    pub lambda: f64,
    pub rho: f64,
    pub num_blocks: u32,
    /// Per-feature replacements for `lambda`.
    pub overrides: &'a HashMap<String, f64>,
    pub penalize_intercept: bool,
}

/// Ridge consensus: `z = w * (mean(x) + mean(u))` with
/// `w = B rho / (lambda + B rho)`, the lambda replaced per feature where an
/// override exists. An unpenalized intercept is the plain average.
pub fn l2_consensus(means: &BlockMeans, penalty: &Penalty<'_>) -> LinearModel {
    let block_rho = f64::from(penalty.num_blocks) * penalty.rho;
    let weight = block_rho / (penalty.lambda + block_rho);
    let per_key: HashMap<String, f64> = penalty
        .overrides
        .iter()
        .map(|(key, lambda)| (key.clone(), block_rho / (lambda + block_rho)))
        .collect();

    let mut z = LinearModel::default();
    z.linear_combine_weighted(1.0, weight, &means.x, &per_key);
    z.linear_combine_weighted(1.0, weight, &means.u, &per_key);
    if !penalty.penalize_intercept {
        z.set_intercept(means.x.intercept() + means.u.intercept());
    }
    z
}

/// `sign(v) * max(|v| - threshold, 0)`.
pub fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

/// Lasso consensus: `mean(x) + mean(u)` soft-thresholded at
/// `lambda / (rho B)`. Coefficients that shrink to zero are removed. The
/// intercept is never thresholded.
pub fn l1_consensus(means: &BlockMeans, penalty: &Penalty<'_>) -> LinearModel {
    let block_rho = f64::from(penalty.num_blocks) * penalty.rho;
    let threshold = penalty.lambda / block_rho;

    let mut z = means.x.clone();
    z.linear_combine(1.0, 1.0, &means.u);
    z.shrink_coefficients(|key, value| {
        let t = penalty
            .overrides
            .get(key)
            .map_or(threshold, |lambda| lambda / block_rho);
        soft_threshold(value, t)
    });
    z
}

/// Next duals: `u = (u + x) - z` for every published block.
pub fn recentre_duals(
    outputs: &[PartitionOutput],
    consensus: &BTreeMap<Lambda, LinearModel>,
) -> BTreeMap<PartitionKey, LinearModel> {
    outputs
        .iter()
        .map(|output| {
            let mut u = output.u_plus_x.clone();
            if let Some(z) = consensus.get(&output.key.lambda) {
                u.linear_combine(1.0, -1.0, z);
            }
            (output.key.clone(), u)
        })
        .collect()
}

/// `max_k |a_k - b_k|`, the intercept included.
pub fn max_abs_change(current: &LinearModel, previous: &LinearModel) -> f64 {
    let mut difference = current.clone();
    difference.linear_combine(1.0, -1.0, previous);
    difference.max_abs_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn output(lambda: &Lambda, partition: u32, coefficient: f64) -> PartitionOutput {
        let mut x = LinearModel::new(0.1 * f64::from(partition));
        x.set_coefficient("f", coefficient);
        PartitionOutput {
            key: PartitionKey::new(lambda.clone(), partition),
            u_plus_x: x.clone(),
            x,
        }
    }

    #[test]
    fn ridge_step_applies_the_shrinkage_weight() -> Result<(), String> {
        let lambda = Lambda::new(1.0);
        let outputs = vec![output(&lambda, 0, 0.5), output(&lambda, 1, 0.5)];
        let means = block_means(&[lambda.clone()], 2, &outputs, &BTreeMap::new())
            .map_err(|e| format!("{e:?}"))?;
        let overrides = HashMap::new();
        let penalty = Penalty {
            lambda: 1.0,
            rho: 1.0,
            num_blocks: 2,
            overrides: &overrides,
            penalize_intercept: false,
        };
        let z = l2_consensus(&means[&lambda], &penalty);
        let weight = (2.0 * 1.0) / (1.0 + 2.0 * 1.0);
        assert_eq!(z.coefficient("f"), weight * 0.5);
        assert_abs_diff_eq!(z.intercept(), 0.05, epsilon = 1e-15);
        Ok(())
    }

    #[test]
    fn ridge_overrides_use_their_own_lambda() {
        let mut x = LinearModel::new(0.0);
        x.set_coefficient("plain", 1.0);
        x.set_coefficient("heavy", 1.0);
        let means = BlockMeans {
            x,
            u: LinearModel::default(),
        };
        let overrides = HashMap::from([("heavy".to_string(), 9.0)]);
        let penalty = Penalty {
            lambda: 1.0,
            rho: 1.0,
            num_blocks: 1,
            overrides: &overrides,
            penalize_intercept: true,
        };
        let z = l2_consensus(&means, &penalty);
        assert_eq!(z.coefficient("plain"), 0.5);
        assert_eq!(z.coefficient("heavy"), 0.1);
    }

    #[test]
    fn soft_threshold_never_grows_and_zeroes_inside_the_band() {
        let values = [-3.0, -1.0, -0.2, 0.0, 0.05, 0.7, 2.5];
        let thresholds = [0.0, 0.1, 0.5, 1.0, 3.0];
        for value in values {
            let mut last = f64::INFINITY;
            for threshold in thresholds {
                let shrunk = soft_threshold(value, threshold);
                assert!(shrunk.abs() <= last);
                assert!(shrunk.abs() <= value.abs());
                if value.abs() < threshold {
                    assert_eq!(shrunk, 0.0);
                }
                last = shrunk.abs();
            }
        }
    }

    #[test]
    fn lasso_step_removes_small_coefficients() {
        let mut x = LinearModel::new(0.3);
        x.set_coefficient("big", 2.0);
        x.set_coefficient("small", 0.1);
        let mut u = LinearModel::new(0.1);
        u.set_coefficient("small", 0.05);
        let means = BlockMeans { x, u };
        let overrides = HashMap::new();
        let penalty = Penalty {
            lambda: 1.0,
            rho: 1.0,
            num_blocks: 2,
            overrides: &overrides,
            penalize_intercept: false,
        };
        let z = l1_consensus(&means, &penalty);
        assert_eq!(z.coefficient("big"), 1.5);
        assert!(!z.coefficients().contains_key("small"));
        assert_abs_diff_eq!(z.intercept(), 0.4, epsilon = 1e-15);
    }

    #[test]
    fn lasso_step_never_thresholds_the_intercept() {
        let mut x = LinearModel::new(0.2);
        x.set_coefficient("f", 0.2);
        let means = BlockMeans {
            x,
            u: LinearModel::new(0.1),
        };
        let overrides = HashMap::new();
        let penalty = Penalty {
            lambda: 10.0,
            rho: 1.0,
            num_blocks: 2,
            overrides: &overrides,
            penalize_intercept: true,
        };
        let z = l1_consensus(&means, &penalty);
        assert!(z.coefficients().is_empty());
        assert_abs_diff_eq!(z.intercept(), 0.3, epsilon = 1e-15);
    }

    #[test]
    fn missing_partition_blocks_aggregation() {
        let lambda = Lambda::new(1.0);
        let outputs = vec![output(&lambda, 0, 0.5), output(&lambda, 2, 0.5)];
        let result = block_means(&[lambda.clone()], 3, &outputs, &BTreeMap::new());
        assert_eq!(
            result,
            Err(Incomplete {
                lambda,
                expected: 3,
                found: 2
            })
        );
    }

    #[test]
    fn wrong_partition_ids_block_aggregation() {
        let lambda = Lambda::new(1.0);
        let outputs = vec![output(&lambda, 0, 0.5), output(&lambda, 5, 0.5)];
        assert!(block_means(&[lambda], 2, &outputs, &BTreeMap::new()).is_err());
    }

    #[test]
    fn duals_recentre_on_the_new_consensus() {
        let lambda = Lambda::new(1.0);
        let outputs = vec![output(&lambda, 0, 0.8)];
        let mut z = LinearModel::new(0.0);
        z.set_coefficient("f", 0.5);
        let consensus = BTreeMap::from([(lambda.clone(), z.clone())]);
        let duals = recentre_duals(&outputs, &consensus);
        let u = &duals[&PartitionKey::new(lambda, 0)];
        assert_abs_diff_eq!(u.coefficient("f"), 0.3, epsilon = 1e-15);
        assert_abs_diff_eq!(max_abs_change(&z, &LinearModel::default()), 0.5, epsilon = 0.0);
    }
}
