//! Minimal module demonstrating the one-module step loop (§8.4 S2): writes
//! `<name>.v = frame` on every step.
use hermes_core::error::HermesResult;
use hermes_core::segment::BackplaneSegment;
use hermes_core::spawn::MODULE_NAME_ENV;
use hermes_module::{run_module, ModuleLogic};

struct Echo {
    signal: String,
    frame: u64,
}

impl ModuleLogic for Echo {
    fn stage(&mut self, segment: &BackplaneSegment) -> HermesResult<()> {
        self.frame = 0;
        segment.set_f64(&self.signal, 0.0)
    }

    fn step(&mut self, segment: &BackplaneSegment) -> HermesResult<()> {
        self.frame += 1;
        segment.set_f64(&self.signal, self.frame as f64)
    }
}

fn main() {
    pretty_env_logger::init();

    let module_name = std::env::var(MODULE_NAME_ENV).unwrap_or_else(|_| "echo".to_string());
    let echo = Echo {
        signal: format!("{module_name}.v"),
        frame: 0,
    };

    std::process::exit(run_module(echo));
}
