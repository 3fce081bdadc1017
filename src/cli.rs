//! Command surface: a single executable multiplexed by a mode selector
//! (spec.md §6). Only the two core modes are implemented; the other modes
//! listed in spec.md (parse, load, report) are out of scope.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "sql-replay", about = "Replay captured SQL workloads against a target database")]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Batch replay from a pre-parsed file of per-statement records.
    Replay {
        /// Path to a TOML config file (see `FileModeConfig`).
        #[arg(long)]
        config: String,
    },
    /// Realtime replay from a Kafka-style streaming message queue.
    ReplayStream {
        /// Path to a TOML config file (see `StreamModeConfig`).
        #[arg(long)]
        config: String,
    },
}
