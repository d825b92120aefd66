// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Binary entrypoint: connect one split device, stream records, report.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;
use splitdev::Config;

#[derive(Parser, Debug)]
#[command(name = "splitdevd", about = "Host split-device daemon")]
struct Cli {
    /// TOML configuration; built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of records to send after connecting.
    #[arg(long, default_value_t = 8)]
    messages: usize,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = match cli.config.as_deref().map(Config::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };
    match splitdevd::run(&config, cli.messages) {
        Ok(report) => {
            println!("{report}");
            if report.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
