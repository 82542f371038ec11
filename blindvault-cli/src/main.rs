//! `BlindVault` CLI tool for key management, record access and key rotation.

#![warn(clippy::pedantic, clippy::nursery)]

use anyhow::{bail, Context};
use blindvault::config::Config;
use blindvault::key_store::{KeyConfigStore, LogNotifier, Notifier};
use blindvault::keys::ActiveKeys;
use blindvault::rotation::{RotationError, RotationPipeline};
use blindvault::schema::FieldRegistry;
use blindvault::store::RecordId;
use blindvault::vault::{DecryptedRecord, RecordVault};
use blindvault_key_file::{read_key_file, FileCheckpoint, FileKeyStore, OfflineBackupNotifier};
use blindvault_sqlite::SqliteStore;
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blindvault")]
#[command(about = "BlindVault searchable encryption CLI", long_about = None)]
struct Cli {
    /// Log filter used when `RUST_LOG` is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Database, configuration and key file shared by the data commands.
#[derive(Args)]
struct VaultArgs {
    /// SQLite database file
    #[arg(long, default_value = "./blindvault.db")]
    db: PathBuf,
    /// Configuration file declaring the fields
    #[arg(long, default_value = "./blindvault.toml")]
    config: PathBuf,
    /// Key file
    #[arg(long, default_value = "./keys/keys.toml")]
    keys: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new key file
    Keygen {
        /// Output path for the key file
        #[arg(short, long, default_value = "./keys/keys.toml")]
        output: PathBuf,
    },
    /// Show the fingerprint of a key file
    Fingerprint {
        /// Key file to inspect
        #[arg(default_value = "./keys/keys.toml")]
        keys: PathBuf,
    },
    /// Write a record from plaintext field values
    Put {
        #[command(flatten)]
        vault: VaultArgs,
        /// Record id
        #[arg(long)]
        id: RecordId,
        /// Entity type of the record
        #[arg(long)]
        entity: String,
        /// Field value as `name=value` (repeatable)
        #[arg(long = "set", value_parser = parse_assignment)]
        fields: Vec<(String, String)>,
    },
    /// Read and decrypt a record
    Get {
        #[command(flatten)]
        vault: VaultArgs,
        /// Record id
        id: RecordId,
    },
    /// Prefix search over an indexed field
    Search {
        #[command(flatten)]
        vault: VaultArgs,
        /// Entity type to search
        #[arg(long)]
        entity: String,
        /// Indexed field to search
        #[arg(long)]
        field: String,
        /// Maximum number of results (defaults to the configured limit)
        #[arg(long)]
        limit: Option<usize>,
        /// Search text
        query: String,
    },
    /// Re-encrypt and re-index every record under a new key pair
    Rotate {
        #[command(flatten)]
        vault: VaultArgs,
        /// Key file holding the new pair. When omitted, a pair is generated
        /// into `<keys stem>.pending.toml` and reused until a rotation completes.
        #[arg(long)]
        new_keys: Option<PathBuf>,
        /// Records per batch (defaults to the configured size)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Directory receiving the new keys and report for offline backup
        #[arg(long)]
        backup_dir: Option<PathBuf>,
        /// Checkpoint file (defaults to `rotation.checkpoint.toml` next to the key file)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name=value, got {s:?}"))
}

struct Opened {
    config: Config,
    registry: FieldRegistry,
    store: Arc<SqliteStore>,
    key_store: FileKeyStore,
}

fn open(args: &VaultArgs) -> anyhow::Result<Opened> {
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    let registry = config.registry()?;
    let store = SqliteStore::open(&args.db)
        .with_context(|| format!("failed to open database {}", args.db.display()))?;
    let key_store = FileKeyStore::new(&args.keys)?;
    Ok(Opened { config, registry, store: Arc::new(store), key_store })
}

fn open_vault(args: &VaultArgs) -> anyhow::Result<(Config, RecordVault<SqliteStore>)> {
    let opened = open(args)?;
    let keys = ActiveKeys::new(opened.key_store.load()?);
    Ok((opened.config, RecordVault::new(opened.store, opened.registry, keys)))
}

fn print_record(record: &DecryptedRecord) {
    println!("#{} ({})", record.id, record.entity_type);
    for (name, value) in &record.fields {
        println!("  {name}: {}", value.display_text());
    }
}

fn default_checkpoint(keys: &Path) -> PathBuf {
    keys.with_file_name("rotation.checkpoint.toml")
}

fn rotate(
    args: &VaultArgs,
    new_keys: Option<&Path>,
    batch_size: Option<usize>,
    backup_dir: Option<PathBuf>,
    checkpoint: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let opened = open(args)?;
    let old = opened.key_store.load()?;
    // The target pair is on disk before the first record is rotated to it.
    let (new, new_keys_path) = match new_keys {
        Some(path) => {
            let keys = read_key_file(path)
                .with_context(|| format!("failed to read new keys {}", path.display()))?;
            (keys, path.to_path_buf())
        }
        None => {
            let keys = opened.key_store.pending_keys().with_context(|| {
                format!("failed to prepare new keys {}", opened.key_store.pending_path().display())
            })?;
            (keys, opened.key_store.pending_path())
        }
    };

    let mut options = opened.config.rotation;
    if let Some(batch_size) = batch_size {
        options.batch_size = batch_size;
    }

    let checkpoint = FileCheckpoint::new(checkpoint.unwrap_or_else(|| default_checkpoint(&args.keys)));
    let notifier: Box<dyn Notifier> = match backup_dir {
        Some(dir) => Box::new(OfflineBackupNotifier::new(dir)),
        None => Box::new(LogNotifier),
    };

    let result = RotationPipeline::new(opened.store.as_ref(), &opened.registry, &opened.key_store)
        .with_options(options)
        .with_checkpoint(&checkpoint)
        .with_notifier(notifier.as_ref())
        .rotate(&old, &new);

    let report = match result {
        Ok(report) => report,
        Err(RotationError::ConfigWrite { source, report }) => {
            eprintln!("{report}");
            bail!(
                "records were rotated but the key configuration could not be updated ({source}); \
                 the new key pair is in {}. Fix {} and rerun `rotate --new-keys {}` to resume",
                new_keys_path.display(),
                args.keys.display(),
                new_keys_path.display()
            );
        }
        Err(e) => return Err(e.into()),
    };
    if new_keys.is_none() {
        if let Err(err) = opened.key_store.clear_pending() {
            warn!(error = %err, path = %new_keys_path.display(), "could not remove pending key file");
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }
    if !report.is_clean() {
        bail!("{} field(s) or record(s) failed to rotate: {:?}", report.errors, report.failed_ids());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Keygen { output } => {
            let store = FileKeyStore::init(&output)?;
            println!("Generated keys in {}", store.path().display());
            println!("Fingerprint: {}", store.load()?.fingerprint());
        }
        Commands::Fingerprint { keys } => {
            println!("{}", read_key_file(&keys)?.fingerprint());
        }
        Commands::Put { vault, id, entity, fields } => {
            let (_, vault) = open_vault(&vault)?;
            let fields: BTreeMap<_, _> = fields.into_iter().collect();
            vault.write_record(id, &entity, &fields)?;
            println!("Wrote record #{id}");
        }
        Commands::Get { vault, id } => {
            let (_, vault) = open_vault(&vault)?;
            match vault.read_record(id)? {
                Some(record) => print_record(&record),
                None => bail!("record #{id} not found"),
            }
        }
        Commands::Search { vault, entity, field, limit, query } => {
            let (config, vault) = open_vault(&vault)?;
            let limit = limit.unwrap_or(config.search.default_limit);
            let results = vault.search(&entity, &field, &query, limit)?;
            if results.is_empty() {
                println!("No matches");
            }
            for record in &results {
                print_record(record);
            }
        }
        Commands::Rotate { vault, new_keys, batch_size, backup_dir, checkpoint, json } => {
            rotate(&vault, new_keys.as_deref(), batch_size, backup_dir, checkpoint, json)?;
        }
    }
    Ok(())
}
