//! Command-line argument parsing for the M2M agent.
//!
//! The process is long-running and mostly configured from the on-disk
//! `dataplicity.conf`-style file (see [`crate::config`]); the flags here
//! exist to override where that file lives, to tune logging, and to let a
//! development box point at a non-default broker URL without editing config.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// On-device agent that multiplexes a remote terminal and port forwards over
/// a single M2M WebSocket link.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path to the agent's configuration file.
    #[arg(short = 'c', long, default_value = crate::defaults::CONFIG_PATH)]
    pub config: PathBuf,

    /// Override the `[m2m] url` setting from the configuration file.
    #[arg(long)]
    pub url: Option<String>,

    /// Where to write detailed logs ("stderr" for no file logging).
    ///
    /// A terse colorized summary always goes to stderr; this controls the
    /// more detailed secondary log.
    #[arg(long, default_value = "stderr")]
    pub log_file: String,

    /// Increase diagnostic log verbosity.
    ///
    ///  -v: debug
    ///  -vv and more: trace
    /// By default, only INFO and above are shown.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
