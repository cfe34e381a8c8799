//! CLI subcommands.

pub mod config_check;
pub mod flux_check;
