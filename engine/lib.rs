#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod dataset;
pub mod fitter;
pub mod linalg;
pub mod minimize;
pub mod model;
pub mod objective;

#[path = "../shared/records.rs"]
pub mod shared_records;
#[path = "../shared/config.rs"]
pub mod shared_config;
pub mod shared {
    pub use super::shared_config as config;
    pub use super::shared_records as records;
}

#[path = "../consensus/mod.rs"]
pub mod consensus;
