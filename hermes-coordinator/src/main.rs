#[macro_use]
extern crate log;

use clap::Parser;
use hermes_coordinator::cli::Cli;
use log::LevelFilter;

#[quit::main]
fn main() {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    std::env::set_var("RUST_LOG", &level);

    pretty_env_logger::formatted_builder()
        .parse_filters(&level)
        .filter_module("polling", LevelFilter::Off)
        .format_timestamp_secs()
        .init();
    log_panics::init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("building tokio runtime: {e}");
            quit::with_code(1);
        }
    };

    match runtime.block_on(hermes_coordinator::cli::run(cli.command)) {
        Ok(()) => {}
        Err(e) => {
            error!("{e}");
            quit::with_code(1);
        }
    }
}
