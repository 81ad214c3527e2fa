//! Test support utilities
//!
//! Mock providers, recorders, and store wrappers for exercising the pipeline
//! without external services.

pub mod mocks;
