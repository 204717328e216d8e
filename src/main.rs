//! Contact Hub CLI
//!
//! Opens the contact store, runs one command and prints JSON on stdout.
//! Logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! # Reconcile an observation
//! contact-hub identify --email doc@hillvalley.edu --phone 123456
//!
//! # Read-only projections
//! contact-hub contacts
//! contact-hub groups
//! contact-hub hierarchy
//! contact-hub stats
//!
//! # Check the store's linkage invariants
//! contact-hub audit
//!
//! # Use a specific database
//! contact-hub --database /data/contacts.db stats
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use contact_hub::services::events::{join_listener, spawn_logging_listener};
use contact_hub::{Config, ContactDb, IdentifyResponse, Services, StorageError};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "contact-hub")]
#[command(about = "Contact identity reconciliation")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Database file (overrides storage_dir/database_file)
    #[arg(long, env = "CONTACT_HUB_DB")]
    database: Option<PathBuf>,

    /// Attempts per identify call on lock contention
    #[arg(long)]
    max_attempts: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile an (email, phone number) observation
    Identify {
        #[arg(short, long)]
        email: Option<String>,

        #[arg(short, long = "phone")]
        phone_number: Option<String>,
    },

    /// List all contacts, primaries first
    Contacts,

    /// List primaries with their secondaries
    Groups,

    /// Hierarchy with consolidated emails and phone numbers
    Hierarchy,

    /// Contact statistics
    Stats,

    /// Report invariant violations
    Audit,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(db) = args.database {
        config.database_file = db;
    }
    if let Some(n) = args.max_attempts {
        config.max_attempts = n;
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    std::fs::create_dir_all(&config.storage_dir)?;

    let config_path = config.config_path();
    if args.config.is_none() && !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = Arc::new(ContactDb::open(&config.database_path(), config.busy_timeout())?);
    let services = Services::new(Arc::clone(&db), config.retry_policy());
    let listener = spawn_logging_listener(Arc::clone(&services.events));

    let contacts = Arc::clone(&services.contacts);
    let outcome = tokio::task::spawn_blocking(move || -> Result<serde_json::Value, StorageError> {
        match args.command {
            Command::Identify { email, phone_number } => {
                json(&IdentifyResponse::from(contacts.identify(email, phone_number)?))
            }
            Command::Contacts => json(&contacts.list_contacts()?),
            Command::Groups => json(&contacts.list_groups()?),
            Command::Hierarchy => json(&contacts.hierarchy()?),
            Command::Stats => json(&contacts.stats()?),
            Command::Audit => {
                let violations = contacts.audit()?;
                Ok(serde_json::json!({ "ok": violations.is_empty(), "violations": violations }))
            }
        }
    })
    .await?;

    // Closing the bus lets the listener drain and exit
    drop(services);
    join_listener(listener).await;

    let exit = match outcome {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body)?);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            println!("{}", serde_json::json!({ "error": e.public_message() }));
            ExitCode::FAILURE
        }
    };

    match Arc::try_unwrap(db) {
        Ok(db) => db.close()?,
        Err(_) => info!("Database handle still shared at shutdown"),
    }

    Ok(exit)
}

fn json<T: Serialize>(value: &T) -> Result<serde_json::Value, StorageError> {
    Ok(serde_json::to_value(value)?)
}
