use clap::{Parser, Subcommand, ValueEnum};
use shelfdb::{Codec, Compression, ShelfError, Store, StoreConfig};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "shelfdb", version, about = "Inspect a shelfdb store file")]
struct Cli {
    /// Path to the store database file
    #[arg(long, global = true, default_value = "store.db")]
    path: PathBuf,

    /// Optional YAML connection config
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// List collections that hold at least one record
    Collections,

    /// Count the records of a collection
    Count {
        collection: String,
    },

    /// List the keys of a collection in key order
    Keys {
        collection: String,
    },

    /// Show one record, decoded to JSON
    Get {
        collection: String,
        key: String,
        /// Payloads were written with LZ4 compression
        #[arg(long)]
        lz4: bool,
    },

    /// Show stored view bookkeeping
    Extensions,

    /// Show store status
    Status,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => StoreConfig::from_yaml_file(path)?,
        None => StoreConfig::default(),
    };
    if !cli.path.exists() {
        return Err(format!("store file '{}' does not exist", cli.path.display()).into());
    }
    let store = Store::open_with(&cli.path, config)?;
    let connection = store.connection("shelfdb.cli")?;

    match cli.command {
        Command::Collections => {
            let names = store.collection_names()?;
            print_output(&serde_json::json!(names), &cli.format)?;
        }

        Command::Count { collection } => {
            let count = connection.read(|tx| tx.count(&collection))?;
            print_output(
                &serde_json::json!({ "collection": collection, "count": count }),
                &cli.format,
            )?;
        }

        Command::Keys { collection } => {
            let keys = connection.read(|tx| tx.keys(&collection))?;
            print_output(&serde_json::json!(keys), &cli.format)?;
        }

        Command::Get {
            collection,
            key,
            lz4,
        } => {
            let record = connection
                .read(|tx| tx.get_raw(&collection, &key))?
                .ok_or_else(|| ShelfError::NotFound {
                    collection: collection.clone(),
                    key: key.clone(),
                })?;
            let codec = Codec::new(if lz4 { Compression::Lz4 } else { Compression::None });
            let object: serde_json::Value = codec.decode(&record.object)?;
            let metadata: Option<serde_json::Value> = match &record.metadata {
                Some(bytes) => Some(codec.decode(bytes)?),
                None => None,
            };
            print_output(
                &serde_json::json!({
                    "collection": collection,
                    "key": key,
                    "object": object,
                    "metadata": metadata,
                }),
                &cli.format,
            )?;
        }

        Command::Extensions => {
            let extensions = store.extensions()?;
            print_output(&serde_json::to_value(extensions)?, &cli.format)?;
        }

        Command::Status => {
            let snapshot = store.snapshot()?;
            let counts = connection.read(|tx| {
                let mut counts = serde_json::Map::new();
                for name in tx.collection_names()? {
                    let count = tx.count(&name)?;
                    counts.insert(name, serde_json::json!(count));
                }
                Ok(counts)
            })?;
            let extensions: Vec<String> = store.extensions()?.into_iter().map(|e| e.name).collect();
            print_output(
                &serde_json::json!({
                    "path": store.path().display().to_string(),
                    "snapshot": snapshot,
                    "collections": counts,
                    "extensions": extensions,
                }),
                &cli.format,
            )?;
        }
    }

    Ok(())
}

fn print_output(value: &serde_json::Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}
