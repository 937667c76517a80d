// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod detector;

#[derive(Parser, Debug)]
#[command(version, about = "BGP hijack detection daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the detection pipeline.
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Configuration document to load and watch for changes.
    #[arg(long)]
    pub config: PathBuf,

    /// JSON-lines update files to replay through the pipeline.
    #[arg(long = "replay")]
    pub replay: Vec<PathBuf>,

    /// Number of classifier worker threads.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// File alert records are appended to; stdout when omitted.
    #[arg(long)]
    pub alerts_out: Option<PathBuf>,

    /// Log to this file instead of stdout.
    #[arg(long)]
    pub log_file: Option<String>,

    /// Accept arbitrarily old update timestamps (archived feeds).
    #[arg(long)]
    pub historic: bool,

    /// Seconds between checks of the configuration file.
    #[arg(long, default_value_t = 30)]
    pub config_poll_secs: u64,

    /// Seconds between auto-ignore sweeps.
    #[arg(long, default_value_t = 60)]
    pub autoignore_secs: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    match args.command {
        Commands::Run(run) => detector::run(run),
    }
}
