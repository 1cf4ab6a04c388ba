//! CLI argument definitions.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

// ============================================================================
// Root CLI
// ============================================================================

/// Record/replay service virtualization server.
#[derive(Parser, Debug)]
#[command(name = "tapedeck", author, version, about)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all non-error output.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Color output control.
    #[arg(long, default_value = "auto", global = true, env = "TAPEDECK_COLOR")]
    pub color: ColorChoice,

    /// Log output format.
    #[arg(long, default_value = "human", global = true, env = "TAPEDECK_LOG_FORMAT")]
    pub log_format: LogFormatArg,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the virtualization server.
    Serve(ServeArgs),

    /// Check P4 scripts or tape files without starting the server.
    Check(CheckArgs),

    /// Display version information.
    Version(VersionArgs),
}

// ============================================================================
// Subcommand Arguments
// ============================================================================

/// Arguments for `serve`. Flags override the configuration file.
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Path to YAML configuration file.
    #[arg(short, long, env = "TAPEDECK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen on `[host:]port`.
    #[arg(long, env = "TAPEDECK_BIND")]
    pub bind: Option<String>,

    /// Directory holding tape files.
    #[arg(long, env = "TAPEDECK_TAPES_DIR")]
    pub tapes_dir: Option<PathBuf>,

    /// Expose Prometheus metrics on `127.0.0.1:<port>`.
    #[arg(long, env = "TAPEDECK_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Serve tapes as-is: never record, create or save.
    #[arg(long, env = "TAPEDECK_READ_ONLY")]
    pub read_only: bool,
}

/// Arguments for `check`.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Files to check: `*.json` as tapes, anything else as P4 scripts.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,

    /// Treat round-trip drift as an error.
    #[arg(long)]
    pub strict: bool,
}

/// Arguments for `version`.
#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,
}

// ============================================================================
// CLI-Local Enums
// ============================================================================

/// Color output choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorChoice {
    /// Auto-detect terminal support.
    #[default]
    Auto,
    /// Always use color.
    Always,
    /// Never use color.
    Never,
}

/// Log format flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormatArg {
    /// Human-readable lines.
    #[default]
    Human,
    /// Newline-delimited JSON.
    Json,
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output.
    #[default]
    Human,
    /// JSON output.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_with_overrides() {
        let cli = Cli::try_parse_from([
            "tapedeck",
            "serve",
            "--config",
            "tapedeck.yaml",
            "--bind",
            ":9000",
            "--tapes-dir",
            "fixtures",
            "--metrics-port",
            "9100",
            "--read-only",
        ])
        .unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.bind.as_deref(), Some(":9000"));
        assert_eq!(args.tapes_dir, Some(PathBuf::from("fixtures")));
        assert_eq!(args.metrics_port, Some(9100));
        assert!(args.read_only);
    }

    #[test]
    fn check_requires_files() {
        assert!(Cli::try_parse_from(["tapedeck", "check"]).is_err());
        assert!(Cli::try_parse_from(["tapedeck", "check", "a.p4", "b.json", "--strict"]).is_ok());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["tapedeck", "version", "-vv", "--color", "never"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.color, ColorChoice::Never);
    }

    #[test]
    fn help_output() {
        let err = Cli::try_parse_from(["tapedeck", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
