//! Command-line interface definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Queue-driven product image compression worker.
#[derive(Parser, Debug)]
#[command(name = "image-processor", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(
        short,
        long,
        default_value = "/config/image-processor.yaml",
        env = "CONFIG_PATH",
        global = true
    )]
    pub config: PathBuf,

    /// Increase logging verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Returns the log level based on verbosity flags.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consume image tasks until interrupted.
    Run,

    /// Validate the configuration file without starting.
    #[command(name = "config-validate")]
    ConfigValidate,

    /// Display the effective configuration, including environment overrides.
    #[command(name = "config-show")]
    ConfigShow,

    /// Publish an image task for a product.
    Enqueue {
        /// Product whose images should be processed.
        product_id: u64,

        /// Source image URLs, in display order.
        #[arg(required = true)]
        images: Vec<String>,
    },

    /// Show dead-lettered tasks without removing them.
    #[command(name = "dlq-list")]
    DlqList {
        /// Maximum number of records to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}
