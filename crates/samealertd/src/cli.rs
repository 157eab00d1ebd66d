use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use clap::{error::ErrorKind, value_parser, CommandFactory, Parser};

/// Standard input filename
const STDIN_FILE: &str = "-";

const USAGE_SHORT: &str = r#"
This program reads decoded SAME headers, one per line, and stores each new alert in a SQLite database. The most recent alert is also written to a JSON --snapshot file.

    samedec -r 22050 | samealertd --db alerts.db

See --help for more details.
"#;

const USAGE_LONG: &str = r#"
This program reads decoded SAME headers, one per line, and stores each new alert in a SQLite database. The most recent alert is also written to a JSON --snapshot file.

Pipe the output of a SAME decoder into this program:

    rtl_fm -f 162.55M -s 22050 \
        | samedec -r 22050 \
        | samealertd --db alerts.db --snapshot last_message.json

Lines which are not SAME headers are ignored. Each SAME header is transmitted three times; repeats which arrive within the --dedup-window are stored only once.

samealertd can also run as a samedec child process. samedec sets the SAMEDEC_MSG environment variable for its children, and samealertd stores that one message and exits:

    samedec -r 22050 -- samealertd --db alerts.db

The reference tables in --data-dir are CSV files:

  eas_events.csv     (code,description)
  originators.csv    (code,name)
  fips_states.csv    (code,name)
  fips_counties.csv  (fips,county)

Exits with status 0 when the input ends. Exits with a non-zero status if the database cannot be opened or migrated, if an alert cannot be stored, or if the input cannot be read.
"#;

const TUNING: &str = "Ingestion Options";

/// Top-level program arguments
#[derive(Parser, Clone, Debug)]
#[command(author = "samealert developers")]
#[command(version)]
#[command(about, long_about = None)]
#[command(after_help = USAGE_SHORT, after_long_help = USAGE_LONG)]
#[command(max_term_width = 100)]
pub struct Args {
    /// Verbosity level (-vvv for more)
    #[arg(short, long, default_value_t = 0, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print NOTHING, not even errors in the log
    #[arg(short, long)]
    pub quiet: bool,

    /// Alert database
    ///
    /// Created if it does not exist. Older databases are upgraded
    /// to the current schema, after making a backup.
    #[arg(long, env = "SAMEALERT_DB", default_value = "alerts.db")]
    pub db: PathBuf,

    /// Latest-alert JSON snapshot
    #[arg(long, env = "SAMEALERT_SNAPSHOT", default_value = "last_message.json")]
    pub snapshot: PathBuf,

    /// Do not write the --snapshot
    #[arg(long)]
    pub no_snapshot: bool,

    /// Directory containing reference tables
    #[arg(long, env = "SAMEALERT_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Input file (or "-" for stdin)
    ///
    /// The input is text: one decoded SAME header per line.
    #[arg(long, default_value_t = STDIN_FILE.to_string())]
    pub file: String,

    /// Store this one message and exit
    ///
    /// Set automatically by samedec for its child processes.
    #[arg(long, env = "SAMEDEC_MSG")]
    pub message: Option<String>,

    /// Suppress repeats of an alert for this long (seconds)
    #[arg(long, default_value_t = 300)]
    #[arg(help_heading = TUNING)]
    pub dedup_window: u32,

    /// Remember at most this many alerts for suppression
    #[arg(long, default_value_t = 64)]
    #[arg(value_parser = value_parser!(u32).range(1..))]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = TUNING)]
    pub dedup_capacity: u32,

    /// Accept issue times up to this far in the future (days)
    #[arg(long, default_value_t = 3)]
    #[arg(value_parser = value_parser!(u32).range(0..=180))]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = TUNING)]
    pub rollover_tolerance_days: u32,

    /// Attempts to store each alert when the database is busy
    #[arg(long, default_value_t = 5)]
    #[arg(value_parser = value_parser!(u32).range(1..))]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = TUNING)]
    pub store_retries: u32,

    /// Delay before the first retry (ms), doubling each time
    #[arg(long, default_value_t = 100)]
    #[arg(hide_short_help = true)]
    #[arg(help_heading = TUNING)]
    pub store_backoff_ms: u64,
}

impl Args {
    /// Return true if the user requests input from stdin
    pub fn input_is_stdin(&self) -> bool {
        self.file == STDIN_FILE
    }

    /// Snapshot path, unless disabled
    pub fn snapshot_path(&self) -> Option<&PathBuf> {
        if self.no_snapshot {
            None
        } else {
            Some(&self.snapshot)
        }
    }

    /// Delay before the first store retry
    pub fn store_backoff(&self) -> StdDuration {
        StdDuration::from_millis(self.store_backoff_ms)
    }
}

/// A program-level error with exit code
#[derive(Debug)]
pub struct CliError {
    error: anyhow::Error,
    exit_code: i32,
}

impl CliError {
    /// Create new error with a custom exit code
    pub fn new(error: anyhow::Error, code: i32) -> CliError {
        CliError {
            error,
            exit_code: code,
        }
    }

    /// Print this error to the terminal
    ///
    /// Errors from clap are printed verbatim. Other types of errors
    /// are printed indirectly via clap's fancy formatter.
    pub fn print(&self) -> std::io::Result<()> {
        if let Some(e) = self.error.downcast_ref::<clap::Error>() {
            e.print()
        } else {
            Args::command()
                .error(ErrorKind::Format, self.to_string())
                .print()
        }
    }

    /// Print this error to the terminal and exit
    pub fn exit(&self) -> ! {
        drop(self.print());
        std::process::exit(self.exit_code);
    }

    /// Process exit code
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.error)
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> CliError {
        CliError::new(err, 1)
    }
}

impl From<clap::Error> for CliError {
    fn from(err: clap::Error) -> CliError {
        let code = if err.use_stderr() { 1 } else { 0 };
        CliError::new(err.into(), code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clap() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from([
            "samealertd",
            "--db",
            "/tmp/a.db",
            "--no-snapshot",
            "--dedup-window",
            "60",
        ])
        .unwrap();
        assert!(args.input_is_stdin());
        assert_eq!(PathBuf::from("/tmp/a.db"), args.db);
        assert_eq!(None, args.snapshot_path());
        assert_eq!(60, args.dedup_window);
        assert_eq!(StdDuration::from_millis(100), args.store_backoff());

        let err = Args::try_parse_from(["samealertd", "--store-retries", "0"]).unwrap_err();
        assert_eq!(1, CliError::from(err).exit_code());
    }
}
