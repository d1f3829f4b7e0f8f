//! Configuration module
//!
//! Loads the run configuration used by the `ptyx` binary.

mod run_config;

pub use run_config::*;
