/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example scalebench.toml to the current directory
    Init,

    /// Build (and push) the client and server images
    Build {
        #[arg(short, long, default_value = "scalebench.toml")]
        config: PathBuf,

        /// Rebuild images that already exist locally
        #[arg(short, long)]
        force: bool,

        /// Only build images for these variants
        #[arg(long)]
        variant: Vec<String>,
    },

    /// Run the benchmark matrix
    Run {
        #[arg(short, long, default_value = "scalebench.toml")]
        config: PathBuf,

        /// Keep results from previous runs and append to them
        #[arg(long)]
        keep_data: bool,

        /// Use the images already in the registry
        #[arg(long)]
        skip_build: bool,

        /// Only run these variants
        #[arg(long)]
        variant: Vec<String>,
    },

    /// Print host resource usage and the configured slot limits as JSON
    ///
    /// This reports the host only: it runs as a separate process, so the active slot counts
    /// of a benchmark running elsewhere are not visible and always show as 0.
    Status {
        #[arg(short, long, default_value = "scalebench.toml")]
        config: PathBuf,
    },
}

pub fn parse() -> Args {
    Args::parse()
}
