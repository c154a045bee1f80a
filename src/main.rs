//! Command line interface for operating the payment gate. Supports
//! initialization, serving the claim API, managing price listings, and
//! auditing stored receipts.

mod config;
mod event;
mod fetch;
mod invoice;
mod ledger;
mod lnurl;
mod price;
mod server;
mod zap;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::bail;
use clap::{Parser, Subcommand};
use config::Settings;
use ledger::{ContentRef, Ledger};
use price::{Listing, PriceBook};

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "zapgate",
    author,
    version,
    about = "Zap-paid purchase ledger",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the directory tree at `STORE_ROOT`.
    Init,
    /// Launch the claim and purchase HTTP API.
    Serve,
    /// Manage canonical price listings.
    Price {
        #[command(subcommand)]
        action: PriceAction,
    },
    /// Re-verify receipt artifacts for a random sample of purchases.
    Audit {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
}

/// Operations available under `zapgate price`.
#[derive(Subcommand)]
enum PriceAction {
    /// Publish or replace a listing.
    Set {
        #[arg(long)]
        course: Option<String>,
        #[arg(long)]
        resource: Option<String>,
        /// Price in sats; omit for a free listing.
        #[arg(long)]
        sats: Option<u64>,
        /// Hex pubkey zaps must be addressed to.
        #[arg(long)]
        owner: String,
        /// Nostr event id of the published content.
        #[arg(long)]
        event: Option<String>,
    },
    /// Remove a listing.
    Unset {
        #[arg(long)]
        course: Option<String>,
        #[arg(long)]
        resource: Option<String>,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let ledger = Ledger::new(cfg.store_root.clone());
    match cli.command {
        Commands::Init => {
            ledger.init()?;
        }
        Commands::Serve => {
            ledger.init()?;
            let state = Arc::new(server::HttpState::new(cfg.clone()));
            server::serve_http(&cfg.bind_http, state, std::future::pending()).await?;
        }
        Commands::Price { action } => {
            let book = PriceBook::new(cfg.store_root.clone());
            handle_price(action, &book)?;
        }
        Commands::Audit { sample } => {
            let audited = ledger.audit_sample(sample)?;
            println!("audited {audited} purchases");
        }
    }
    Ok(())
}

fn handle_price(action: PriceAction, book: &PriceBook) -> anyhow::Result<()> {
    match action {
        PriceAction::Set {
            course,
            resource,
            sats,
            owner,
            event,
        } => {
            let content = content_ref(course, resource)?;
            book.set(
                &content,
                &Listing {
                    price_sats: sats,
                    owner_pubkey: owner.to_lowercase(),
                    event_id: event.map(|e| e.to_lowercase()),
                },
            )?;
        }
        PriceAction::Unset { course, resource } => {
            let content = content_ref(course, resource)?;
            book.unset(&content)?;
        }
    }
    Ok(())
}

fn content_ref(course: Option<String>, resource: Option<String>) -> anyhow::Result<ContentRef> {
    match (course, resource) {
        (Some(c), None) => Ok(ContentRef::Course(c)),
        (None, Some(r)) => Ok(ContentRef::Resource(r)),
        _ => bail!("exactly one of --course or --resource is required"),
    }
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("zapgate-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", display_path(&store_root)));
    content.push_str("BIND_HTTP=127.0.0.1:7777\n");
    content.push_str("DEFAULT_RELAYS=\n");
    content.push_str("RECEIPT_MAX_AGE_SECS=600\n");
    content.push_str("CLAIM_PAST_MAX_AGE_SECS=31536000\n");
    content.push_str("FUTURE_SKEW_SECS=300\n");
    content.push_str("FETCH_ATTEMPTS=6\n");
    content.push_str("FETCH_INTERVAL_MS=800\n");
    content.push_str("LNURL_CHECK=0\n");
    content.push_str("ADMIN_TOKEN=\n");
    content.push_str("TOR_SOCKS=\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    run(cli).await
}
