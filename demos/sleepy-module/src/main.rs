//! Demo module that never returns from `step`, to exercise the coordinator's
//! barrier timeout (§8.4 S4).
use hermes_core::error::HermesResult;
use hermes_core::segment::BackplaneSegment;
use hermes_module::{run_module, ModuleLogic};

struct Sleepy;

impl ModuleLogic for Sleepy {
    fn stage(&mut self, _segment: &BackplaneSegment) -> HermesResult<()> {
        Ok(())
    }

    fn step(&mut self, _segment: &BackplaneSegment) -> HermesResult<()> {
        loop {
            std::thread::sleep(std::time::Duration::from_secs(3600));
        }
    }
}

fn main() {
    pretty_env_logger::init();
    std::process::exit(run_module(Sleepy));
}
