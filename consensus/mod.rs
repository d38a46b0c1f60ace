//! # ADMM consensus training
//!
//! Data is split into blocks. Each iteration fits every `(lambda, block)`
//! pair independently against the shifted prior `z - u`, then reduces the
//! block solutions into a new consensus `z` per lambda and recentres the
//! scaled duals `u`. Iterations are strictly sequential; the fits inside
//! one iteration are independent and run on a [`executor::PartitionExecutor`].
//!
//! The same executor runs the one-shot baselines: [`naive`] block fits
//! averaged per lambda, and [`items`] models fitted per item key.

pub mod admm;
pub mod artifacts;
pub mod evaluate;
pub mod executor;
pub mod items;
pub mod naive;
pub mod partition;
pub mod schedule;
pub mod state;
pub mod update;

pub use admm::{
    AdmmError, AdmmOutcome, AdmmSettings, IterationObserver, IterationReport, NoopObserver,
    Regularizer, Termination, build_datasets, train,
};
pub use state::{ConsensusState, Lambda, PartitionKey, PartitionOutput};
