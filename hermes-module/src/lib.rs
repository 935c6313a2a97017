//! Module-side runtime library (§4.4): the part of the module protocol an
//! external-executable module links against to attach to a Hermes backplane
//! and speak the stage/step/reset/terminate protocol.
pub mod attach;
pub mod runtime;

pub use attach::AttachParams;
pub use runtime::{run_module, ModuleLogic};
