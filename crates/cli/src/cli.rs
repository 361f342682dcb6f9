use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "smss")]
#[command(
    about = "Session manager - start subsystems and session programs from a boot configuration"
)]
#[command(version)]
pub struct Cli {
    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the startup sequence against the simulated host and print a report
    Boot {
        /// Boot configuration (JSON)
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Also start this session after the control session
        #[arg(short, long, value_name = "N")]
        session: Option<u32>,
    },

    /// Validate a boot configuration and summarize its directives
    Check {
        /// Boot configuration (JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}
