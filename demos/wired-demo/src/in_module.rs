//! Drives the writable `in.u` signal to a fixed value at stage time (§8.4 S3).
use hermes_core::error::HermesResult;
use hermes_core::segment::BackplaneSegment;
use hermes_core::spawn::MODULE_NAME_ENV;
use hermes_module::{run_module, ModuleLogic};

const DRIVE_VALUE: f64 = 5.0;

struct Driver {
    signal: String,
}

impl ModuleLogic for Driver {
    fn stage(&mut self, segment: &BackplaneSegment) -> HermesResult<()> {
        segment.set_f64(&self.signal, DRIVE_VALUE)
    }

    fn step(&mut self, _segment: &BackplaneSegment) -> HermesResult<()> {
        Ok(())
    }
}

fn main() {
    pretty_env_logger::init();
    let module_name = std::env::var(MODULE_NAME_ENV).unwrap_or_else(|_| "in".to_string());
    let driver = Driver {
        signal: format!("{module_name}.u"),
    };
    std::process::exit(run_module(driver));
}
