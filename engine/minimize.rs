//! # Unconstrained minimizers
//!
//! The fitter hands an [`Objective`] to a [`Minimizer`]. Two are provided:
//!
//! - [`TrustRegionNewton`]: a trust-region Newton method whose subproblem is
//!   solved by conjugate gradients using only Hessian-vector products. This
//!   is the default and never forms a dense Hessian.
//! - [`QuasiNewton`]: BFGS with a Wolfe line search from `wolfe_bfgs`, for
//!   objectives where curvature products are unreliable.
//!
//! Hitting the iteration cap is reported through
//! [`MinimizeReport::converged`]; only numerical breakdown is an error.

use ndarray::{Array1, ArrayView1, ArrayViewMut1};
use std::cell::RefCell;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsError, BfgsSolution};

/// Contract between an objective and the minimizers.
///
/// Calls arrive in the order `value(w)`, `gradient(w)`, then any number of
/// `hessian_vector_product(s)` evaluated at the `w` of the latest gradient.
pub trait Objective {
    fn dimension(&self) -> usize;
    fn value(&mut self, w: ArrayView1<f64>) -> f64;
    fn gradient(&mut self, w: ArrayView1<f64>, g: ArrayViewMut1<f64>);
    fn hessian_vector_product(&self, s: ArrayView1<f64>, hs: ArrayViewMut1<f64>);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinimizeOptions {
    /// Relative gradient-norm reduction that counts as converged.
    pub tolerance: f64,
    pub max_iterations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinimizeReport {
    pub iterations: usize,
    pub value: f64,
    pub gradient_norm: f64,
    pub converged: bool,
}

#[derive(Debug, Error)]
pub enum MinimizeError {
    #[error("starting point has {found} entries, objective expects {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("objective value became non-finite ({value}) at iteration {iteration}")]
    NonFiniteValue { iteration: usize, value: f64 },

    #[error("gradient became non-finite at iteration {iteration}")]
    NonFiniteGradient { iteration: usize },

    #[error("BFGS failed: {0}")]
    Bfgs(String),
}

pub trait Minimizer {
    /// Minimizes `objective` starting from `w`, leaving the solution in `w`.
    fn minimize<O: Objective>(
        &self,
        objective: &mut O,
        w: &mut Array1<f64>,
        options: &MinimizeOptions,
    ) -> Result<MinimizeReport, MinimizeError>;
}

/// Trust-region Newton with a truncated conjugate-gradient inner solver.
#[derive(Debug, Clone, Copy)]
pub struct TrustRegionNewton {
    /// Reductions below `eta0` of the prediction reject the step.
    pub eta0: f64,
    pub eta1: f64,
    pub eta2: f64,
    pub sigma1: f64,
    pub sigma2: f64,
    pub sigma3: f64,
}

impl Default for TrustRegionNewton {
    fn default() -> Self {
        Self {
            eta0: 1e-4,
            eta1: 0.25,
            eta2: 0.75,
            sigma1: 0.25,
            sigma2: 0.5,
            sigma3: 4.0,
        }
    }
}

fn norm(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}

impl TrustRegionNewton {
    /// Approximately solves `min g.s + s.H.s / 2` subject to `|s| <= delta`.
    /// Returns the step, the final residual `-(g + H s)`, and the CG count.
    fn conjugate_gradient<O: Objective>(
        &self,
        objective: &O,
        delta: f64,
        g: &Array1<f64>,
    ) -> (Array1<f64>, Array1<f64>, usize) {
        let n = g.len();
        let mut s = Array1::<f64>::zeros(n);
        let mut r = -g;
        let mut d = r.clone();
        let mut hd = Array1::<f64>::zeros(n);
        let cg_tolerance = 0.1 * norm(g);
        let mut r_norm_sq = r.dot(&r);
        let mut steps = 0;

        while r_norm_sq.sqrt() > cg_tolerance {
            steps += 1;
            objective.hessian_vector_product(d.view(), hd.view_mut());
            let curvature = d.dot(&hd);
            if !(curvature > 0.0) {
                log::debug!("CG met non-positive curvature after {steps} steps");
                break;
            }
            let alpha = r_norm_sq / curvature;
            s.scaled_add(alpha, &d);
            if norm(&s) > delta {
                log::debug!("CG reached the trust-region boundary after {steps} steps");
                s.scaled_add(-alpha, &d);
                let std = s.dot(&d);
                let sts = s.dot(&s);
                let dtd = d.dot(&d);
                let dsq = delta * delta;
                let rad = (std * std + dtd * (dsq - sts)).sqrt();
                let alpha = if std >= 0.0 {
                    (dsq - sts) / (std + rad)
                } else {
                    (rad - std) / dtd
                };
                s.scaled_add(alpha, &d);
                r.scaled_add(-alpha, &hd);
                break;
            }
            r.scaled_add(-alpha, &hd);
            let next = r.dot(&r);
            let beta = next / r_norm_sq;
            d.mapv_inplace(|x| beta * x);
            d += &r;
            r_norm_sq = next;
        }
        (s, r, steps)
    }
}

impl Minimizer for TrustRegionNewton {
    fn minimize<O: Objective>(
        &self,
        objective: &mut O,
        w: &mut Array1<f64>,
        options: &MinimizeOptions,
    ) -> Result<MinimizeReport, MinimizeError> {
        let n = objective.dimension();
        if w.len() != n {
            return Err(MinimizeError::DimensionMismatch {
                expected: n,
                found: w.len(),
            });
        }

        let mut g = Array1::<f64>::zeros(n);
        let mut f = objective.value(w.view());
        if !f.is_finite() {
            return Err(MinimizeError::NonFiniteValue {
                iteration: 0,
                value: f,
            });
        }
        objective.gradient(w.view(), g.view_mut());
        let initial_norm = norm(&g);
        if !initial_norm.is_finite() {
            return Err(MinimizeError::NonFiniteGradient { iteration: 0 });
        }
        let mut gradient_norm = initial_norm;
        let mut delta = initial_norm;
        let mut iteration = 1;
        let mut converged = gradient_norm <= options.tolerance * initial_norm;

        while !converged && iteration <= options.max_iterations {
            let (s, r, cg_steps) = self.conjugate_gradient(objective, delta, &g);
            let candidate = &*w + &s;
            let gs = g.dot(&s);
            let predicted = -0.5 * (gs - s.dot(&r));
            let f_new = objective.value(candidate.view());
            if !f_new.is_finite() {
                return Err(MinimizeError::NonFiniteValue {
                    iteration,
                    value: f_new,
                });
            }
            let actual = f - f_new;
            let step_norm = norm(&s);
            if iteration == 1 {
                delta = delta.min(step_norm);
            }

            let alpha = if f_new - f - gs <= 0.0 {
                self.sigma3
            } else {
                self.sigma1.max(-0.5 * (gs / (f_new - f - gs)))
            };
            delta = if actual < self.eta0 * predicted {
                (alpha.max(self.sigma1) * step_norm).min(self.sigma2 * delta)
            } else if actual < self.eta1 * predicted {
                (self.sigma1 * delta).max((alpha * step_norm).min(self.sigma2 * delta))
            } else if actual < self.eta2 * predicted {
                (self.sigma1 * delta).max((alpha * step_norm).min(self.sigma3 * delta))
            } else {
                delta.max((alpha * step_norm).min(self.sigma3 * delta))
            };

            log::debug!(
                "iter {iteration:3} act {actual:.3e} pre {predicted:.3e} delta {delta:.3e} f {f:.6e} |g| {gradient_norm:.3e} CG {cg_steps}"
            );

            if actual > self.eta0 * predicted {
                iteration += 1;
                *w = candidate;
                f = f_new;
                objective.gradient(w.view(), g.view_mut());
                gradient_norm = norm(&g);
                if !gradient_norm.is_finite() {
                    return Err(MinimizeError::NonFiniteGradient { iteration });
                }
                if gradient_norm <= options.tolerance * initial_norm {
                    converged = true;
                    break;
                }
            }
            if f < -1.0e32 {
                log::warn!("objective fell below -1e32; stopping");
                break;
            }
            if actual.abs() <= 0.0 && predicted <= 0.0 {
                log::warn!("actual and predicted reductions are not positive; stopping");
                break;
            }
            if actual.abs() <= 1.0e-12 * f.abs() && predicted.abs() <= 1.0e-12 * f.abs() {
                log::warn!("actual and predicted reductions are negligible; stopping");
                break;
            }
        }

        if !converged && iteration > options.max_iterations {
            log::warn!(
                "trust-region Newton stopped at the iteration cap ({}) with |g| = {gradient_norm:.3e}",
                options.max_iterations
            );
        }
        Ok(MinimizeReport {
            iterations: iteration - 1,
            value: f,
            gradient_norm,
            converged,
        })
    }
}

/// BFGS with a Wolfe line search.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuasiNewton;

impl Minimizer for QuasiNewton {
    fn minimize<O: Objective>(
        &self,
        objective: &mut O,
        w: &mut Array1<f64>,
        options: &MinimizeOptions,
    ) -> Result<MinimizeReport, MinimizeError> {
        let n = objective.dimension();
        if w.len() != n {
            return Err(MinimizeError::DimensionMismatch {
                expected: n,
                found: w.len(),
            });
        }

        // Match the trust-region convention: tolerance is relative to |g(w0)|.
        let mut grad = Array1::zeros(n);
        objective.value(w.view());
        objective.gradient(w.view(), grad.view_mut());
        let initial_norm = norm(&grad);
        if !initial_norm.is_finite() {
            return Err(MinimizeError::NonFiniteGradient { iteration: 0 });
        }

        let cell = RefCell::new(objective);
        // Lowest finite value seen, returned when the iteration cap is hit.
        let best: RefCell<Option<(f64, Array1<f64>)>> = RefCell::new(None);
        let cost_and_grad = |x: &Array1<f64>| -> (f64, Array1<f64>) {
            let mut objective = cell.borrow_mut();
            let value = objective.value(x.view());
            let mut grad = Array1::zeros(x.len());
            objective.gradient(x.view(), grad.view_mut());
            let mut best = best.borrow_mut();
            if value.is_finite() && best.as_ref().is_none_or(|(seen, _)| value < *seen) {
                *best = Some((value, x.clone()));
            }
            (value, grad)
        };

        let tolerance = options.tolerance * initial_norm;
        let outcome = Bfgs::new(w.clone(), cost_and_grad)
            .with_tolerance(tolerance)
            .with_max_iterations(options.max_iterations)
            .run();
        let (final_point, iterations) = match outcome {
            Ok(BfgsSolution {
                final_point,
                iterations,
                ..
            }) => (final_point, iterations),
            Err(BfgsError::MaxIterationsReached { .. }) => match best.take() {
                Some((_, point)) => {
                    log::debug!(
                        "BFGS stopped at the iteration cap ({})",
                        options.max_iterations
                    );
                    (point, options.max_iterations)
                }
                None => {
                    return Err(MinimizeError::Bfgs(
                        "iteration cap reached without a finite value".to_string(),
                    ));
                }
            },
            Err(e) => return Err(MinimizeError::Bfgs(format!("{e:?}"))),
        };

        let mut objective = cell.borrow_mut();
        let value = objective.value(final_point.view());
        objective.gradient(final_point.view(), grad.view_mut());
        let gradient_norm = norm(&grad);
        if !value.is_finite() {
            return Err(MinimizeError::NonFiniteValue { iteration: iterations, value });
        }
        *w = final_point;
        Ok(MinimizeReport {
            iterations,
            value,
            gradient_norm,
            converged: gradient_norm <= tolerance,
        })
    }
}
