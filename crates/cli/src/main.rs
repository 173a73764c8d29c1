// TidyGrid CLI - drive an engine session headlessly

mod commands;
mod exit_codes;
mod output;
mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tidygrid_client::{ClientError, SessionConfig};
use tidygrid_config::Settings;
use tidygrid_protocol::CorrectionStrategy;
use tracing_subscriber::EnvFilter;

use exit_codes::{client_exit_code, EXIT_ERROR, EXIT_INVALID_CELLS, EXIT_SUCCESS, EXIT_USAGE};
use run::{RunOptions, TypeOverride};

#[derive(Parser)]
#[command(name = "tidygrid")]
#[command(about = "Validate and clean tabular data through the TidyGrid engine")]
#[command(long_version = long_version())]
#[command(version)]
#[command(subcommand_required = false)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG wins.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress progress lines on stderr
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Have the engine answer rows keyed by column name
    #[arg(long, global = true)]
    keyed: bool,

    /// Settings file (default: <config_dir>/tidygrid/settings.json)
    #[arg(long, global = true, env = "TIDYGRID_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Input file plus schema overrides, shared by session-backed commands.
#[derive(Args)]
struct Input {
    /// CSV file with a header row
    file: PathBuf,

    /// Override an inferred column type before validation. Repeatable.
    /// Examples: 'qty=Integer', '3=Date'
    #[arg(long = "type", short = 't', value_name = "COL=TYPE")]
    types: Vec<TypeOverride>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate every column and print per-column error counts
    #[command(after_help = "\
Examples:
  tidygrid check people.csv
  tidygrid check people.csv --type qty=Integer --type joined=Date
  tidygrid check people.csv --json

Exits 3 when any cell is invalid.")]
    Check {
        #[command(flatten)]
        input: Input,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply a column-wide correction and report before/after counts
    #[command(after_help = "\
Examples:
  tidygrid fix people.csv --column email --strategy trim
  tidygrid fix people.csv --column qty --strategy fill --value 0 -o clean.csv")]
    Fix {
        #[command(flatten)]
        input: Input,

        /// Column name or zero-based index
        #[arg(long, short = 'c')]
        column: String,

        #[arg(long, short = 's', value_enum)]
        strategy: Strategy,

        /// Replacement for invalid cells (required by --strategy fill)
        #[arg(long, required_if_eq("strategy", "fill"))]
        value: Option<String>,

        /// Write the corrected dataset as CSV
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// List the engine's suggested fixes for a column
    #[command(after_help = "\
Examples:
  tidygrid suggest people.csv --column phone
  tidygrid suggest people.csv --column phone --apply 1 -o clean.csv")]
    Suggest {
        #[command(flatten)]
        input: Input,

        /// Column name or zero-based index
        #[arg(long, short = 'c')]
        column: String,

        /// Apply the Nth suggestion (1-based, as listed)
        #[arg(long, value_name = "N")]
        apply: Option<usize>,

        /// Write the dataset as CSV after applying
        #[arg(long, short = 'o', requires = "apply")]
        output: Option<PathBuf>,
    },

    /// Replace a substring in every cell, chunk by chunk
    #[command(after_help = "\
Examples:
  tidygrid replace people.csv --find N/A --replace ''
  tidygrid replace people.csv --find ' ,' --replace , --no-revalidate")]
    Replace {
        #[command(flatten)]
        input: Input,

        #[arg(long)]
        find: String,

        #[arg(long)]
        replace: String,

        /// Skip revalidating columns after the replace
        #[arg(long)]
        no_revalidate: bool,

        /// Write the dataset as CSV after replacing
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Overwrite one cell
    Set {
        #[command(flatten)]
        input: Input,

        /// Zero-based data row
        #[arg(long)]
        row: usize,

        /// Column name or zero-based index
        #[arg(long, short = 'c')]
        column: String,

        #[arg(long)]
        value: String,

        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Page rows through the client cache and print them as CSV
    #[command(after_help = "\
Examples:
  tidygrid peek people.csv
  tidygrid peek people.csv --start 1000 --count 50 --mark")]
    Peek {
        #[command(flatten)]
        input: Input,

        #[arg(long, default_value_t = 0)]
        start: usize,

        #[arg(long, default_value_t = 20)]
        count: usize,

        /// Suffix invalid cells with '!'
        #[arg(long)]
        mark: bool,
    },

    /// Print the settings path and effective values
    Config,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Strategy {
    /// Trim whitespace where that makes a cell valid
    Trim,
    /// Blank out invalid cells
    Clear,
    /// Replace invalid cells with --value
    Fill,
    /// Mask emails, SSNs, card numbers and IPv4 addresses
    Redact,
}

impl Strategy {
    fn into_correction(self, value: Option<String>) -> CorrectionStrategy {
        match self {
            Strategy::Trim => CorrectionStrategy::TrimWhitespace,
            Strategy::Clear => CorrectionStrategy::ClearInvalid,
            Strategy::Fill => CorrectionStrategy::FillInvalid { value: value.unwrap_or_default() },
            Strategy::Redact => CorrectionStrategy::RedactPii,
        }
    }
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("GIT_COMMIT_HASH"), ")",
        "\nengine:   tidygrid-engine ", env!("CARGO_PKG_VERSION"),
        "\nprotocol: v1",
        "\ntarget:   ", env!("TARGET"),
    )
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // Also installs the `log` bridge, which is what the library crates emit through.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

fn load_settings(path: Option<&PathBuf>) -> Settings {
    match path {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = load_settings(cli.config.as_ref());
    let opts = RunOptions {
        config: SessionConfig::from(&settings),
        keyed: cli.keyed,
        quiet: cli.quiet,
    };

    let result = match cli.command {
        None => {
            eprintln!("Usage: tidygrid <command> [options]");
            eprintln!("       tidygrid --help for more information");
            Ok(())
        }
        Some(Commands::Check { input, json }) => commands::check(&input.file, &input.types, &opts, json),
        Some(Commands::Fix { input, column, strategy, value, output }) => commands::fix(
            &input.file,
            &input.types,
            &opts,
            &column,
            strategy.into_correction(value),
            output.as_deref(),
        ),
        Some(Commands::Suggest { input, column, apply, output }) => {
            commands::suggest(&input.file, &input.types, &opts, &column, apply, output.as_deref())
        }
        Some(Commands::Replace { input, find, replace, no_revalidate, output }) => {
            let mut opts = opts.clone();
            if no_revalidate {
                opts.config.revalidate_after_replace = false;
            }
            commands::replace(&input.file, &input.types, &opts, &find, &replace, output.as_deref())
        }
        Some(Commands::Set { input, row, column, value, output }) => {
            commands::set(&input.file, &input.types, &opts, row, &column, &value, output.as_deref())
        }
        Some(Commands::Peek { input, start, count, mark }) => {
            commands::peek(&input.file, &input.types, &opts, start, count, mark)
        }
        Some(Commands::Config) => commands::config(cli.config.as_deref(), &settings),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn args(msg: impl Into<String>) -> Self {
        Self { code: EXIT_USAGE, message: msg.into(), hint: None }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { code: EXIT_ERROR, message: msg.into(), hint: None }
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        Self { code: EXIT_ERROR, message: msg.into(), hint: None }
    }

    /// Silent exit: the report already went to stdout.
    pub fn invalid_cells() -> Self {
        Self { code: EXIT_INVALID_CELLS, message: String::new(), hint: None }
    }

    /// Create error from a session error with the matching exit code.
    pub fn client(err: ClientError) -> Self {
        let code = client_exit_code(&err);
        let hint = match &err {
            ClientError::Timeout { kind: "init", .. } => {
                Some("engine did not signal ready; raise engine.readyTimeoutMs".to_string())
            }
            ClientError::Timeout { .. } => {
                Some("raise engine.callTimeoutMs or lower the chunk sizes in settings".to_string())
            }
            ClientError::Decode(_) => Some("engine and client disagree on protocol v1".to_string()),
            _ => None,
        };
        Self { code, message: err.to_string(), hint }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<csv::Error> for CliError {
    fn from(err: csv::Error) -> Self {
        CliError::io(err.to_string())
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::io(err.to_string())
    }
}
