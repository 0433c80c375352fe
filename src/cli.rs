//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Keep local reference database files current.
///
/// refsync checks the distribution service for new versions of the
/// configured editions and atomically replaces the local files that
/// changed. It is designed to run unattended from a scheduler.
#[derive(Parser, Debug)]
#[command(name = "refsync")]
#[command(author, version, about)]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(short = 'f', long, default_value = "/etc/refsync/refsync.json")]
    pub config_file: PathBuf,

    /// Override the database directory from the configuration file
    #[arg(short = 'd', long)]
    pub database_directory: Option<PathBuf>,

    /// Override the maximum number of parallel edition updates (1-32)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub parallelism: Option<u8>,

    /// Update only these editions instead of the configured list (repeatable)
    #[arg(long = "edition", value_name = "EDITION_ID")]
    pub editions: Vec<String>,

    /// Print the machine-readable JSON report after the run
    #[arg(short = 'o', long)]
    pub output: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["refsync"]).unwrap();
        assert_eq!(args.config_file, PathBuf::from("/etc/refsync/refsync.json"));
        assert!(args.database_directory.is_none());
        assert!(args.parallelism.is_none());
        assert!(args.editions.is_empty());
        assert!(!args.output);
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["refsync", "-v"]).unwrap();
        assert_eq!(args.verbose, 1);

        let args = Args::try_parse_from(["refsync", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_config_file_flag() {
        let args = Args::try_parse_from(["refsync", "-f", "/tmp/refsync.json"]).unwrap();
        assert_eq!(args.config_file, PathBuf::from("/tmp/refsync.json"));
    }

    #[test]
    fn test_cli_editions_are_repeatable() {
        let args = Args::try_parse_from([
            "refsync",
            "--edition",
            "edition-1",
            "--edition",
            "edition-2",
        ])
        .unwrap();
        assert_eq!(args.editions, ["edition-1", "edition-2"]);
    }

    #[test]
    fn test_cli_parallelism_range() {
        let args = Args::try_parse_from(["refsync", "--parallelism", "8"]).unwrap();
        assert_eq!(args.parallelism, Some(8));

        let result = Args::try_parse_from(["refsync", "--parallelism", "0"]);
        assert!(result.is_err());

        let result = Args::try_parse_from(["refsync", "--parallelism", "33"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_output_flag() {
        let args = Args::try_parse_from(["refsync", "-o"]).unwrap();
        assert!(args.output);
    }

    #[test]
    fn test_cli_invalid_flag_returns_error() {
        let result = Args::try_parse_from(["refsync", "--invalid-flag"]);
        assert!(result.is_err());
    }
}
