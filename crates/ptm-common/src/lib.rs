//! # ptm-common
//!
//! Shared utilities and types for the physical topology manager.
//!
//! This crate provides common functionality used across all ptm crates:
//! - The error taxonomy
//! - Standard filesystem paths
//! - Settings loaded once per process
//! - Bounded readiness polling
//! - Host and device name validation

#![warn(missing_docs)]

pub mod error;
pub mod names;
pub mod paths;
pub mod retry;
pub mod settings;

pub use error::{PtmError, PtmResult};
pub use paths::PtmPaths;
pub use retry::RetryPolicy;
pub use settings::PtmSettings;
