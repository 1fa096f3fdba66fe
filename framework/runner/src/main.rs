use std::process::ExitCode;

use blaster_runner::prelude::{init, run};

fn main() -> ExitCode {
    let (cli, sinks) = match init() {
        Ok(init) => init,
        Err(e) => {
            eprintln!("Failed to start pcap-blaster: {e:?}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli, sinks) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("An error occurred: {e:?}");
            ExitCode::FAILURE
        }
    }
}
