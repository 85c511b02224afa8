// Copyright (c) The Sailfish Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `sailfish-watch`: follows a live Sailfish test report from the terminal.

mod dispatch;
mod errors;
mod output;
mod reporter;

use clap::Parser;
use color_eyre::Result;
use dispatch::SailfishWatchApp;

fn main() -> Result<()> {
    color_eyre::install()?;

    let opts = SailfishWatchApp::parse();
    let output = opts.init_output();

    match opts.exec(output) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error.display_to_stderr(&output.stderr_styles());
            std::process::exit(error.process_exit_code())
        }
    }
}
