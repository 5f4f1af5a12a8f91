//! The command-line surface described in spec §6.
//!
//! An excluded external collaborator per spec §1 ("the argument parser");
//! the core never reads `std::env::args` itself, it only consumes the
//! [`Cli`] struct `main.rs` builds from it. Grounded on the original's
//! `ArgParser` flag set in `examples/original_source/src/main.cpp`
//! (`--torrent`, `--listening-port`/`-p`, `--log-level`, `--dump-torrent`,
//! `--dump-config`, `--help`/`-h`), expressed with `clap`'s derive API —
//! already a teacher dependency — instead of a hand-rolled parser.
use clap::Parser;
use std::path::PathBuf;

/// Recognized `--log-level` values, matching spec §6 and the original's
/// spdlog levels.
pub const LOG_LEVELS: &[&str] = &[
    "trace", "debug", "info", "warning", "error", "critical", "off",
];

#[derive(Debug, Parser)]
#[command(name = "zit-rs", about = "A BitTorrent (BEP 3) peer/piece engine")]
pub struct Cli {
    /// Path to the `.torrent` file to download.
    #[arg(long)]
    pub torrent: PathBuf,

    /// TCP/UDP port to listen on for incoming peers; also announced to
    /// the tracker.
    #[arg(short = 'p', long = "listening-port", default_value_t = 0)]
    pub listening_port: u16,

    /// Log level: trace, debug, info, warning, error, critical, or off.
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Parse and print the torrent's metadata, then exit.
    #[arg(long)]
    pub dump_torrent: bool,

    /// Print the effective configuration, then exit.
    #[arg(long)]
    pub dump_config: bool,
}

impl Cli {
    /// Validates `--log-level` against [`LOG_LEVELS`], if given.
    pub fn validate_log_level(&self) -> Result<(), String> {
        match &self.log_level {
            Some(level) if !LOG_LEVELS.contains(&level.as_str()) => {
                Err(format!("unknown log level: {level}"))
            }
            _ => Ok(()),
        }
    }
}
