//! Core data backplane and process-coordination primitives for Hermes:
//! the shared-memory segment, the frame barrier, the signal registry, the
//! wire router, configuration, and telemetry frame encoding.
pub mod barrier;
pub mod config;
pub mod error;
pub mod health;
pub mod ipc;
pub mod registry;
pub mod segment;
pub mod spawn;
pub mod sync;
pub mod telemetry;
pub mod wire;

pub use error::{HermesError, HermesErrorKind, HermesResult, ResultExt};
