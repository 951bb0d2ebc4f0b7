//! dostore CLI - Storage Root Administration
//!
//! This binary operates directly on a storage root: it inspects objects,
//! moves element payloads in and out, exports and imports object archives
//! and migrates legacy objects.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dostore_common::{ByteRange, WriteOptions};
use dostore_storage::{HashedStorage, ObjectStorage, StorageOptions};
use serde::Deserialize;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Parser, Debug)]
#[command(name = "dostore-cli")]
#[command(about = "dostore storage administration")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/dostore/cli.toml")]
    config: String,

    /// Storage root directory
    #[arg(short, long, env = "DOSTORE_ROOT")]
    root: Option<PathBuf>,

    /// Open the storage root read-only (still needs exclusive access: fails
    /// while a server or another instance has the root open)
    #[arg(long)]
    read_only: bool,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List existing objects
    List,
    /// Print the hashed directory of objects
    Path {
        /// Object IDs
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Print the metadata record of objects as JSON
    Metadata {
        /// Object IDs
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// List the elements of an object
    Elements {
        /// Object ID
        id: String,
    },
    /// Write an element (or a range of it) to stdout
    Get {
        /// Object ID
        id: String,
        /// Element ID
        element: String,
        /// First byte to read
        #[arg(long, default_value_t = 0)]
        start: u64,
        /// Number of bytes to read (default: to the end)
        #[arg(long)]
        len: Option<u64>,
    },
    /// Store an element from a file (`-` reads stdin)
    Put {
        /// Object ID
        id: String,
        /// Element ID
        element: String,
        /// Input file
        file: String,
        /// Append to the existing payload
        #[arg(short, long)]
        append: bool,
    },
    /// Create an object (an ID is generated when none is given)
    Create {
        /// Object ID
        id: Option<String>,
    },
    /// Delete an object
    Delete {
        /// Object ID
        id: String,
    },
    /// Export an object archive
    Export {
        /// Object ID
        id: String,
        /// Output file
        file: PathBuf,
    },
    /// Replace an object with the contents of an archive
    Import {
        /// Object ID
        id: String,
        /// Archive file
        file: PathBuf,
    },
    /// Move a legacy object's small element files into the element store
    Migrate {
        /// Object IDs
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfig {
    #[serde(default)]
    root: Option<PathBuf>,
    #[serde(default)]
    id_prefix: String,
    #[serde(default)]
    read_only: bool,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn load_config(path: &str) -> Config {
    if !Path::new(path).exists() {
        return Config::default();
    }
    match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file {path}: {e}");
            Config::default()
        }),
        Err(e) => {
            eprintln!("Warning: Failed to read config file {path}: {e}");
            Config::default()
        }
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = load_config(&args.config);

    // Merge CLI args with config file (CLI takes precedence)
    let log_level = args.log_level.unwrap_or(config.logging.level);
    let read_only = args.read_only || config.storage.read_only;
    let root = args
        .root
        .or(config.storage.root)
        .context("no storage root given (use --root, DOSTORE_ROOT or the config file)")?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let mut options = StorageOptions::default().with_id_prefix(config.storage.id_prefix);
    if read_only {
        options = options.read_only();
    }
    let storage = HashedStorage::open(&root, options)
        .with_context(|| format!("Failed to open storage root {}", root.display()))?;
    debug!("Opened {}", root.display());

    run(&storage, args.command)
}

fn run(storage: &HashedStorage, command: Commands) -> Result<()> {
    let opts = WriteOptions::default();
    let stdout = io::stdout();

    match command {
        Commands::List => {
            let mut out = stdout.lock();
            let mut count = 0usize;
            for id in storage.list_objects()? {
                writeln!(out, "{}", id?)?;
                count += 1;
            }
            info!("Listed {} objects", count);
        }
        Commands::Path { ids } => {
            for id in ids {
                println!("{}\t{}", id, storage.object_dir(&id).display());
            }
        }
        Commands::Metadata { ids } => {
            for id in ids {
                let md = storage.object_metadata(&id)?;
                println!("{}", serde_json::to_string_pretty(&md)?);
            }
        }
        Commands::Elements { id } => {
            if !storage.object_exists(&id)? {
                anyhow::bail!("Object {id} does not exist");
            }
            for element in storage.list_elements(&id)? {
                let attributes = storage.get_attributes(&id, Some(&element))?;
                let size = attributes
                    .get(dostore_storage::object::SIZE_ATTRIBUTE)
                    .map_or("-", String::as_str);
                println!("{element:<40} {size:>12}");
            }
        }
        Commands::Get {
            id,
            element,
            start,
            len,
        } => {
            let range = match len {
                Some(len) => ByteRange::new(start, len),
                None => ByteRange::starting_at(start),
            };
            let mut reader = storage
                .get_element(&id, &element, range)?
                .with_context(|| format!("Element {id}/{element} does not exist"))?;
            let mut out = stdout.lock();
            io::copy(&mut reader, &mut out)?;
            out.flush()?;
        }
        Commands::Put {
            id,
            element,
            file,
            append,
        } => {
            let mut input: Box<dyn Read> = if file == "-" {
                Box::new(io::stdin().lock())
            } else {
                Box::new(BufReader::new(
                    File::open(&file).with_context(|| format!("Failed to open {file}"))?,
                ))
            };
            storage.put_element(&id, &element, &mut input, append, &opts)?;
            info!("Stored {}/{}", id, element);
        }
        Commands::Create { id } => {
            let id = storage.create_object(id.as_deref(), &opts)?;
            println!("{id}");
        }
        Commands::Delete { id } => {
            storage.delete_object(&id, &opts)?;
            info!("Deleted {}", id);
        }
        Commands::Export { id, file } => {
            let mut out = BufWriter::new(
                File::create(&file)
                    .with_context(|| format!("Failed to create {}", file.display()))?,
            );
            storage.serialize_object(&id, &mut out)?;
            out.flush()?;
            info!("Exported {} to {}", id, file.display());
        }
        Commands::Import { id, file } => {
            let mut input = BufReader::new(
                File::open(&file).with_context(|| format!("Failed to open {}", file.display()))?,
            );
            storage.deserialize_object(&id, &mut input, &opts)?;
            info!("Imported {} from {}", id, file.display());
        }
        Commands::Migrate { ids } => {
            for id in ids {
                if storage.ensure_migrated(&id)? {
                    println!("{id}: migrated");
                } else {
                    println!("{id}: already migrated");
                }
            }
        }
    }
    Ok(())
}
