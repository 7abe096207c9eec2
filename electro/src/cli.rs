use clap::Parser;
use std::path::PathBuf;

use crate::log::Level;

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    /// Human-readable single-line logs (default).
    #[default]
    Compact,
    /// One JSON object per line, for machine consumption.
    Json,
}

#[derive(Parser, Debug)]
#[command(
    version,
    color = clap::ColorChoice::Auto,
    about = "Run an electro app in development mode, rebuilding and restarting it on change"
)]
pub struct Cli {
    #[arg(
        short,
        long,
        env = "ELECTRO_CONFIG",
        default_value = "electro.yaml",
        help = "Path to the app manifest."
    )]
    pub config: PathBuf,

    #[arg(long, help = "Only start the renderer dev server.")]
    pub renderer_only: bool,

    #[arg(short, long, help = "Enable additional debug logs.")]
    pub verbose: bool,

    #[arg(short, long, conflicts_with = "verbose", help = "Silence all logs")]
    pub quiet: bool,

    #[arg(
        long,
        value_enum,
        env = "ELECTRO_LOG_FORMAT",
        default_value_t,
        help = "Log output format."
    )]
    pub log_format: LogFormat,
}

impl Cli {
    pub fn level(&self) -> Level {
        if self.quiet {
            Level::Silent
        } else if self.verbose {
            Level::Debug
        } else {
            Level::default()
        }
    }
}
