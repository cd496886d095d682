use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sediment::storage::StorageType;
use sediment::{Config, Engine};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "sediment")]
#[command(about = "Sediment CLI - segment and source store tools")]
#[command(version)]
struct Cli {
    /// TOML config file
    #[arg(short, long, env = "SEDIMENT_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long)]
    data_path: Option<PathBuf>,

    /// Storage type of the index being operated on (disk or kv)
    #[arg(long)]
    storage_type: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage segments of an index
    Segments {
        #[command(subcommand)]
        action: SegmentAction,
    },

    /// Manage source documents of an index
    Doc {
        #[command(subcommand)]
        action: DocAction,
    },

    /// Print the effective configuration as TOML
    ConfigShow,
}

#[derive(Subcommand, Debug)]
enum SegmentAction {
    /// List live segments, optionally bounded by time
    List {
        index: String,
        #[arg(long, default_value = "0")]
        time_min: i64,
        #[arg(long, default_value = "0")]
        time_max: i64,
    },

    /// Show segment count and on-disk bytes
    Stats { index: String },

    /// Store a file as a new segment
    Add {
        index: String,
        /// File holding the segment payload
        #[arg(short, long)]
        input: PathBuf,
        #[arg(long, default_value = "0")]
        time_min: i64,
        #[arg(long, default_value = "0")]
        time_max: i64,
    },

    /// Write a segment's payload to a file, or stdout
    Get {
        index: String,
        /// Segment id in hex
        id: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Remove a segment from the live set
    Remove {
        index: String,
        /// Segment id in hex
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum DocAction {
    Get {
        index: String,
        id: String,
    },
    /// Store a JSON document, read from the argument or stdin
    Put {
        index: String,
        id: String,
        json: Option<String>,
    },
    Delete {
        index: String,
        id: String,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sediment=debug".into()),
    );
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())
        .with_context(|| format!("Failed to load config {:?}", cli.config))?;
    if let Some(data_path) = cli.data_path {
        config.data_path = sediment::config::expand_tilde(&data_path)?;
    }
    if let Some(storage_type) = cli.storage_type.as_deref() {
        config.default_storage_type = StorageType::from_name(storage_type);
    }

    if let Commands::ConfigShow = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let engine = Engine::open(config).context("Failed to open engine")?;
    let result = run(&engine, cli.command);
    let shutdown = engine.shutdown().context("Failed to shut down cleanly");
    result.and(shutdown)
}

fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Segments { action } => match action {
            SegmentAction::List {
                index,
                time_min,
                time_max,
            } => commands::list_segments(engine, &index, time_min, time_max),
            SegmentAction::Stats { index } => commands::segment_stats(engine, &index),
            SegmentAction::Add {
                index,
                input,
                time_min,
                time_max,
            } => commands::add_segment(engine, &index, &input, time_min, time_max),
            SegmentAction::Get { index, id, output } => {
                commands::get_segment(engine, &index, &id, output.as_deref())
            }
            SegmentAction::Remove { index, id } => commands::remove_segment(engine, &index, &id),
        },
        Commands::Doc { action } => match action {
            DocAction::Get { index, id } => commands::get_doc(engine, &index, &id),
            DocAction::Put { index, id, json } => {
                commands::put_doc(engine, &index, &id, json.as_deref())
            }
            DocAction::Delete { index, id } => commands::delete_doc(engine, &index, &id),
        },
        Commands::ConfigShow => Ok(()),
    }
}
