//! # docparse CLI
//!
//! The `docparse` binary drives the extraction and structuring pipeline
//! against a SQLite database named in the config file.
//!
//! ## Usage
//!
//! ```bash
//! docparse --config ./config/docparse.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docparse extract` | Ingest a directory into `{table}_metadata` / `{table}_contents` |
//! | `docparse parse` | Structure an existing text table into a parsed table |
//! | `docparse pipeline` | Extract, then parse the freshly extracted text |
//! | `docparse stats` | Summarise a collection and its parse runs |
//! | `docparse get <id>` | Show one document, its text, and its parsed records |
//! | `docparse check` | Verify the database and completion settings |
//! | `docparse completions <shell>` | Print a shell completion script |
//!
//! ## Examples
//!
//! ```bash
//! # Ingest every PDF under ./claims
//! docparse extract --dir ./claims --table claims
//!
//! # Structure ten reproducibly sampled documents
//! docparse parse --schema member.json --origin claims_contents \
//!     --destination claims_parsed --sample 10 --seed 7
//!
//! # Both stages in one go
//! docparse pipeline --dir ./claims --table claims --schema member.json
//! ```

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use docparse::pipeline::ParseOptions;
use docparse::progress::ProgressMode;
use docparse::{check, config, get, pipeline, stats};

/// docparse: extract document text and structure it against a JSON schema.
///
/// All commands except `completions` read a TOML configuration file given
/// by `--config`. See `config/docparse.example.toml` for every setting.
#[derive(Parser)]
#[command(
    name = "docparse",
    about = "Extract document text into SQLite and structure it with a language model",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docparse.toml")]
    config: PathBuf,

    /// Log run progress and per-document failures to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Progress output on stderr. Defaults to `human` on a terminal, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest every matching file under a directory.
    ///
    /// Files already present (same content fingerprint) are skipped. A
    /// file whose text cannot be extracted is recorded as failed.
    Extract {
        /// Directory to scan recursively.
        #[arg(long)]
        dir: PathBuf,

        /// Collection base name; tables `<table>_metadata` and `<table>_contents`.
        #[arg(long)]
        table: String,
    },

    /// Structure the rows of a text table against a schema.
    ///
    /// Appends one record per selected row to the destination table,
    /// including rows whose structuring failed.
    Parse {
        /// JSON schema file describing the target shape.
        #[arg(long)]
        schema: PathBuf,

        /// Text table to read, e.g. `claims_contents`.
        #[arg(long)]
        origin: String,

        /// Table to append parsed records to.
        #[arg(long)]
        destination: String,

        /// Name recorded with each record. Defaults to the schema's file name.
        #[arg(long)]
        schema_name: Option<String>,

        /// Structure a random sample of at most N rows.
        #[arg(long)]
        sample: Option<usize>,

        /// Seed for a reproducible sample.
        #[arg(long, requires = "sample")]
        seed: Option<u64>,
    },

    /// Extract a directory, then parse the extracted text.
    Pipeline {
        /// Directory to scan recursively.
        #[arg(long)]
        dir: PathBuf,

        /// Collection base name.
        #[arg(long)]
        table: String,

        /// JSON schema file describing the target shape.
        #[arg(long)]
        schema: PathBuf,

        /// Table to append parsed records to. Defaults to `<table>_parsed`.
        #[arg(long)]
        destination: Option<String>,

        /// Name recorded with each record. Defaults to the schema's file name.
        #[arg(long)]
        schema_name: Option<String>,

        /// Structure a random sample of at most N rows.
        #[arg(long)]
        sample: Option<usize>,

        /// Seed for a reproducible sample.
        #[arg(long, requires = "sample")]
        seed: Option<u64>,
    },

    /// Show document and parse counts for a collection.
    Stats {
        /// Collection base name.
        #[arg(long)]
        table: String,

        /// Parsed table to report on. Defaults to `<table>_parsed`.
        #[arg(long)]
        destination: Option<String>,
    },

    /// Show one document with its text and parsed records.
    Get {
        /// Collection base name.
        #[arg(long)]
        table: String,

        /// Document id.
        id: i64,

        /// Parsed table to read records from. Defaults to `<table>_parsed`.
        #[arg(long)]
        destination: Option<String>,
    },

    /// Verify the database and completion provider configuration.
    Check,

    /// Print a shell completion script to stdout.
    Completions {
        /// Target shell.
        shell: clap_complete::Shell,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "docparse=info" } else { "docparse=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "docparse", &mut std::io::stdout());
        return Ok(());
    }

    dotenvy::dotenv().ok();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Extract { dir, table } => {
            pipeline::run_extract(&cfg, &dir, &table, progress).await?;
        }
        Commands::Parse {
            schema,
            origin,
            destination,
            schema_name,
            sample,
            seed,
        } => {
            pipeline::run_parse(
                &cfg,
                &schema,
                schema_name.as_deref(),
                &origin,
                &destination,
                ParseOptions { sample, seed },
                progress,
            )
            .await?;
        }
        Commands::Pipeline {
            dir,
            table,
            schema,
            destination,
            schema_name,
            sample,
            seed,
        } => {
            pipeline::run_pipeline(
                &cfg,
                &dir,
                &table,
                &schema,
                schema_name.as_deref(),
                destination.as_deref(),
                ParseOptions { sample, seed },
                progress,
            )
            .await?;
        }
        Commands::Stats { table, destination } => {
            stats::run_stats(&cfg, &table, destination.as_deref()).await?;
        }
        Commands::Get {
            table,
            id,
            destination,
        } => {
            get::run_get(&cfg, &table, id, destination.as_deref()).await?;
        }
        Commands::Check => {
            check::run_check(&cfg).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
