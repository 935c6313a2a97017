//! Copies `y = x` each step, where `x` is fed by the wire router (§8.4 S3).
use hermes_core::error::HermesResult;
use hermes_core::segment::BackplaneSegment;
use hermes_core::spawn::MODULE_NAME_ENV;
use hermes_module::{run_module, ModuleLogic};

struct Phys {
    x: String,
    y: String,
}

impl ModuleLogic for Phys {
    fn stage(&mut self, segment: &BackplaneSegment) -> HermesResult<()> {
        segment.set_f64(&self.x, 0.0)
    }

    fn step(&mut self, segment: &BackplaneSegment) -> HermesResult<()> {
        let x = segment.get_f64(&self.x)?;
        segment.set_f64(&self.y, x)
    }
}

fn main() {
    pretty_env_logger::init();
    let module_name = std::env::var(MODULE_NAME_ENV).unwrap_or_else(|_| "phys".to_string());
    let phys = Phys {
        x: format!("{module_name}.x"),
        y: format!("{module_name}.y"),
    };
    std::process::exit(run_module(phys));
}
