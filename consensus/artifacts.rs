//! On-disk layout of a training run.
//!
//! ```text
//! <root>/lambda-rho.jsonl
//! <root>/iter-<i>/z.jsonl      consensus per lambda
//! <root>/iter-<i>/u.jsonl      duals per lambda#partition
//! <root>/best-model.jsonl
//! <root>/final-model.jsonl
//! <root>/test-loglik.tsv
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use super::admm::{AdmmOutcome, IterationObserver, IterationReport};
use super::state::Lambda;
use crate::shared::records::{LambdaRho, ModelRecord, RecordError, write_jsonl, write_trajectory};

/// Persists every iteration of a run under one directory.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
    remove_intermediate: bool,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>, remove_intermediate: bool) -> Self {
        Self {
            root: root.into(),
            remove_intermediate,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn iteration_dir(&self, iteration: usize) -> PathBuf {
        self.root.join(format!("iter-{iteration}"))
    }

    fn remove_iteration(&self, iteration: usize) -> Result<(), RecordError> {
        let dir = self.iteration_dir(iteration);
        if dir.is_dir() {
            fs::remove_dir_all(&dir).map_err(|source| RecordError::Io { path: dir, source })?;
        }
        Ok(())
    }
}

impl IterationObserver for ArtifactWriter {
    fn on_start(&mut self, lambda_rho: &[(Lambda, f64)]) -> Result<(), RecordError> {
        let table: Vec<LambdaRho> = lambda_rho
            .iter()
            .map(|(lambda, rho)| LambdaRho {
                lambda: lambda.value(),
                rho: *rho,
            })
            .collect();
        write_jsonl(&self.root.join("lambda-rho.jsonl"), &table)
    }

    fn on_iteration(&mut self, report: &IterationReport<'_>) -> Result<(), RecordError> {
        let iteration = report.state.iteration;
        let dir = self.iteration_dir(iteration);
        let z: Vec<ModelRecord> = report
            .state
            .z
            .iter()
            .map(|(lambda, model)| ModelRecord::new(lambda.label(), model))
            .collect();
        write_jsonl(&dir.join("z.jsonl"), &z)?;
        let u: Vec<ModelRecord> = report
            .state
            .u
            .iter()
            .map(|(key, model)| ModelRecord::new(key.to_string(), model))
            .collect();
        write_jsonl(&dir.join("u.jsonl"), &u)?;

        if report.best_improved {
            if let Some(best) = report.best {
                let record = ModelRecord::new(best.lambda.label(), &best.model);
                write_jsonl(&self.root.join("best-model.jsonl"), [&record])?;
                log::info!(
                    "Best held-out model so far: lambda {} at iteration {} ({:.6})",
                    best.lambda,
                    best.iteration,
                    best.log_likelihood
                );
            }
        }

        if self.remove_intermediate && iteration > 0 {
            self.remove_iteration(iteration - 1)?;
        }
        Ok(())
    }

    fn on_finish(&mut self, outcome: &AdmmOutcome) -> Result<(), RecordError> {
        let finals: Vec<ModelRecord> = outcome
            .state
            .z
            .iter()
            .map(|(lambda, model)| ModelRecord::new(lambda.label(), model))
            .collect();
        write_jsonl(&self.root.join("final-model.jsonl"), &finals)?;
        write_trajectory(&self.root.join("test-loglik.tsv"), &outcome.trajectory)
    }
}
