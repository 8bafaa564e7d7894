//! Command-line interface for sqlforge.
//!
//! Provides the `run` and `export` commands.

mod commands;

pub use commands::{filter_by_schema_length, parse_cli, run, run_with_cli, Cli, Commands};
