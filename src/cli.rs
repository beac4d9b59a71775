//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use forkfut::logging::LogFormat;
use forkfut::{MemorySize, OrchestratorConfig};
use std::path::PathBuf;

/// Run closures in forked worker processes and collect their results.
#[derive(Parser, Debug)]
#[command(name = "forkfut")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Shared memory segment size (e.g. "16M", "512k"; plain numbers are MiB).
    #[arg(long, env = "FORKFUT_SEGMENT_SIZE", default_value = "16M")]
    pub segment_size: MemorySize,

    /// Number of result slots in the segment.
    #[arg(long, env = "FORKFUT_SLOT_CAPACITY", default_value_t = forkfut::config::DEFAULT_SLOT_CAPACITY)]
    pub slot_capacity: usize,

    /// Stable token file the segment key is derived from.
    #[arg(long, env = "FORKFUT_TOKEN_PATH")]
    pub token_path: Option<PathBuf>,

    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log output format.
    #[arg(long, env = "FORKFUT_LOG_FORMAT", default_value = "compact")]
    pub log_format: LogFormat,

    /// Also write logs to this file.
    #[arg(long, env = "FORKFUT_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Do not drain workers and remove the segment on Ctrl+C.
    #[arg(long)]
    pub no_drain: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Orchestrator settings selected on the command line.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::new()
            .with_env_overrides()
            .with_segment_size(self.segment_size)
            .with_slot_capacity(self.slot_capacity)
            .with_drain_on_interrupt(!self.no_drain);
        if let Some(path) = &self.token_path {
            config = config.with_token_path(path);
        }
        config
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch sleeping workers and print results as they complete.
    Sample(SampleArgs),

    /// Have a worker return a random range of integers.
    Range(RangeArgs),

    /// Have a worker return a structured record.
    Object,

    /// Show how failing and panicking tasks resolve.
    Fail,

    /// Run a batch of tasks and print segment usage.
    Stats(StatsArgs),
}

/// Arguments for the sample command.
#[derive(Parser, Debug)]
pub struct SampleArgs {
    /// Number of workers to launch.
    #[arg(short, long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..=64))]
    pub tasks: u32,

    /// Sleep unit in milliseconds; worker i sleeps (tasks - i) units.
    #[arg(long, default_value_t = 100)]
    pub step_ms: u64,
}

/// Arguments for the range command.
#[derive(Parser, Debug)]
pub struct RangeArgs {
    /// Largest possible range length.
    #[arg(long, default_value_t = 20)]
    pub max_len: u32,
}

/// Arguments for the stats command.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Number of tasks in the batch.
    #[arg(short, long, default_value_t = 8)]
    pub tasks: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_sample_defaults() {
        let args = Cli::try_parse_from(["forkfut", "sample"]).unwrap();
        match args.command {
            Commands::Sample(sample) => {
                assert_eq!(sample.tasks, 5);
                assert_eq!(sample.step_ms, 100);
            }
            _ => panic!("Expected Sample command"),
        }
    }

    #[test]
    fn test_sample_task_bounds() {
        assert!(Cli::try_parse_from(["forkfut", "sample", "--tasks", "0"]).is_err());
        assert!(Cli::try_parse_from(["forkfut", "sample", "--tasks", "65"]).is_err());
        assert!(Cli::try_parse_from(["forkfut", "sample", "-t", "3"]).is_ok());
    }

    #[test]
    fn test_global_options() {
        let args = Cli::try_parse_from([
            "forkfut",
            "--segment-size",
            "2M",
            "--slot-capacity",
            "32",
            "--no-drain",
            "-vv",
            "object",
        ])
        .unwrap();

        assert_eq!(args.segment_size.as_mib(), 2);
        assert_eq!(args.slot_capacity, 32);
        assert_eq!(args.verbose, 2);
        assert!(matches!(args.command, Commands::Object));

        let config = args.orchestrator_config();
        assert_eq!(config.slot_capacity, 32);
        assert!(!config.drain_on_interrupt);
    }

    #[test]
    fn test_invalid_segment_size() {
        assert!(Cli::try_parse_from(["forkfut", "--segment-size", "lots", "fail"]).is_err());
    }

    #[test]
    fn test_log_format() {
        let args = Cli::try_parse_from(["forkfut", "--log-format", "json", "fail"]).unwrap();
        assert_eq!(args.log_format, LogFormat::Json);
    }
}
