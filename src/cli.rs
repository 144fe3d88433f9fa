//! Command-line interface definitions.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Priority email queue with retries and dead-letter alerting.
#[derive(Parser, Debug)]
#[command(name = "mailq", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "mailq.yaml", env = "CONFIG_PATH", global = true)]
    pub config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv).
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
    /// Start both worker pools and process emails until interrupted.
    Run(RunArgs),

    /// Validate the configuration file without starting.
    #[command(name = "config-validate")]
    ConfigValidate,

    /// Display the effective configuration.
    #[command(name = "config-show")]
    ConfigShow,

    /// Print job counts of the email and dead-letter queues.
    #[command(name = "queue-stats")]
    QueueStats,

    /// Enqueue a password reset email.
    #[command(name = "send-reset")]
    SendReset {
        /// Recipient address.
        email: String,
        /// Reset token embedded in the link.
        token: String,
    },

    /// List entries of the dead-letter queue.
    #[command(name = "dead-letter-list")]
    DeadLetterList {
        /// Maximum entries per state.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// Arguments for the run subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Log emails and alerts instead of sending them.
    #[arg(long, default_value = "false")]
    pub dry_run: bool,
}
