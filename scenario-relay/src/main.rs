// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use color_eyre::Result;
use scenario_relay::ScenarioRelayApp;

fn main() -> Result<()> {
    color_eyre::install()?;

    let app = ScenarioRelayApp::parse();
    let output = app.init_output();

    match app.exec(output) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error.display_to_stderr(&output.stderr_styles());
            std::process::exit(error.process_exit_code())
        }
    }
}
