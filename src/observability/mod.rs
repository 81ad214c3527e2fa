//! Observability setup
//!
//! Structured logging for the pipeline. Step attempts, transitions, and
//! analytics outcomes are emitted as tracing events by the components
//! themselves; this module only wires up the subscriber.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};
