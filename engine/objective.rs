//! # Gaussian-prior logistic objective
//!
//! For a frozen [`Dataset`] with labels `y_i` in `{-1, +1}`, instance
//! weights, offsets, and a diagonal Gaussian prior `N(mean_k, var_k)` on each
//! weight, the objective is
//!
//! ```text
//! f(w) = m * [ 1/2 sum_k (w_k - mean_k)^2 / var_k
//!            + sum_i c_i log(1 + exp(-y_i z_i)) ]
//! ```
//!
//! with `z_i = w . x_i + offset_i`, `c_i = weight_i * Cp` for positives and
//! `weight_i * Cn` for negatives, and `m` a global multiplier. Curvature
//! terms (Hessian-vector product, diagonal, dense Hessian) carry the same
//! multiplier so that posterior variances stay on the scale of the value.

use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1, Zip};

use crate::dataset::{Dataset, DatasetError};
use crate::minimize::Objective;

/// Class weights and the global multiplier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeights {
    pub positive: f64,
    pub negative: f64,
    pub multiplier: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            positive: 1.0,
            negative: 1.0,
            multiplier: 1.0,
        }
    }
}

/// `log(1 + exp(-t))` without overflow for large `|t|`.
#[inline]
pub fn log1p_exp_neg(t: f64) -> f64 {
    if t >= 0.0 {
        (-t).exp().ln_1p()
    } else {
        -t + t.exp().ln_1p()
    }
}

#[inline]
fn sigmoid(t: f64) -> f64 {
    1.0 / (1.0 + (-t).exp())
}

pub struct LogisticObjective<'a> {
    data: &'a Dataset,
    y: ArrayView1<'a, f64>,
    offset: ArrayView1<'a, f64>,
    instance_weight: Array1<f64>,
    prior_mean: Array1<f64>,
    prior_precision: Array1<f64>,
    multiplier: f64,
    scores: Array1<f64>,
    curvature: Array1<f64>,
    scored_at: Option<Array1<f64>>,
}

impl<'a> LogisticObjective<'a> {
    /// Binds the objective to a finished dataset and a dense prior of
    /// dimension `n_features`.
    pub fn new(
        data: &'a Dataset,
        prior_mean: Array1<f64>,
        prior_variance: &Array1<f64>,
        weights: LossWeights,
    ) -> Result<Self, DatasetError> {
        let arrays = data.arrays()?;
        let n = data.n_features();
        for (what, found) in [
            ("prior mean", prior_mean.len()),
            ("prior variance", prior_variance.len()),
        ] {
            if found != n {
                return Err(DatasetError::LengthMismatch {
                    what,
                    expected: n,
                    found,
                });
            }
        }
        let instance_weight = Zip::from(&arrays.y)
            .and(&arrays.weight)
            .map_collect(|&y, &w| {
                if y > 0.0 {
                    w * weights.positive
                } else {
                    w * weights.negative
                }
            });
        let l = data.n_instances();
        Ok(Self {
            data,
            y: arrays.y.view(),
            offset: arrays.offset.view(),
            instance_weight,
            prior_mean,
            prior_precision: prior_variance.mapv(|v| 1.0 / v),
            multiplier: weights.multiplier,
            scores: Array1::zeros(l),
            curvature: Array1::zeros(l),
            scored_at: None,
        })
    }

    fn score(&mut self, w: ArrayView1<f64>) {
        let fresh = self
            .scored_at
            .as_ref()
            .is_some_and(|cached| cached.view() == w);
        if fresh {
            return;
        }
        self.data.product(&w, &mut self.scores);
        self.scores += &self.offset;
        self.scored_at = Some(w.to_owned());
    }

    /// `c_i * p_i * (1 - p_i)` at `w`, where `p_i = sigmoid(y_i z_i)`.
    fn curvature_at(&mut self, w: ArrayView1<f64>) -> Array1<f64> {
        self.score(w);
        Zip::from(&self.scores)
            .and(&self.y)
            .and(&self.instance_weight)
            .map_collect(|&z, &y, &c| {
                let p = sigmoid(y * z);
                c * p * (1.0 - p)
            })
    }

    /// Diagonal of the Hessian at `w`.
    pub fn hessian_diagonal(&mut self, w: ArrayView1<f64>) -> Array1<f64> {
        let d = self.curvature_at(w);
        let mut diagonal = self.prior_precision.clone();
        self.data.accumulate_squares(&d, &mut diagonal);
        diagonal *= self.multiplier;
        diagonal
    }

    /// Dense symmetric Hessian at `w`.
    pub fn full_hessian(&mut self, w: ArrayView1<f64>) -> Array2<f64> {
        let d = self.curvature_at(w);
        let n = self.dimension();
        let mut hessian = Array2::<f64>::zeros((n, n));
        self.data.accumulate_lower(&d, &mut hessian);
        for i in 0..n {
            hessian[[i, i]] += self.prior_precision[i];
            for j in 0..i {
                hessian[[j, i]] = hessian[[i, j]];
            }
        }
        hessian *= self.multiplier;
        hessian
    }
}

impl Objective for LogisticObjective<'_> {
    fn dimension(&self) -> usize {
        self.prior_mean.len()
    }

    fn value(&mut self, w: ArrayView1<f64>) -> f64 {
        self.score(w);
        let prior = Zip::from(&w)
            .and(&self.prior_mean)
            .and(&self.prior_precision)
            .fold(0.0, |acc, &w, &m, &p| acc + (w - m) * (w - m) * p);
        let loss = Zip::from(&self.scores)
            .and(&self.y)
            .and(&self.instance_weight)
            .fold(0.0, |acc, &z, &y, &c| acc + c * log1p_exp_neg(y * z));
        self.multiplier * (0.5 * prior + loss)
    }

    fn gradient(&mut self, w: ArrayView1<f64>, mut g: ArrayViewMut1<f64>) {
        self.score(w);
        let mut residual = Array1::<f64>::zeros(self.scores.len());
        Zip::from(&mut residual)
            .and(&mut self.curvature)
            .and(&self.scores)
            .and(&self.y)
            .and(&self.instance_weight)
            .for_each(|r, d, &z, &y, &c| {
                let p = sigmoid(y * z);
                *d = c * p * (1.0 - p);
                *r = c * (p - 1.0) * y;
            });
        Zip::from(&mut g)
            .and(&w)
            .and(&self.prior_mean)
            .and(&self.prior_precision)
            .for_each(|g, &w, &m, &p| *g = (w - m) * p);
        self.data.transpose_product(&residual, &mut g);
        g *= self.multiplier;
    }

    fn hessian_vector_product(&self, s: ArrayView1<f64>, mut hs: ArrayViewMut1<f64>) {
        let mut xs = Array1::<f64>::zeros(self.curvature.len());
        self.data.product(&s, &mut xs);
        xs *= &self.curvature;
        Zip::from(&mut hs)
            .and(&s)
            .and(&self.prior_precision)
            .for_each(|h, &s, &p| *h = s * p);
        self.data.transpose_product(&xs, &mut hs);
        hs *= self.multiplier;
    }
}
