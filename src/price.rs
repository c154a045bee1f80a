//! Canonical price listings, one JSON file per content item.

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ledger::ContentRef;

/// A published listing for one piece of content.
///
/// `price_sats == None` or `Some(0)` means the content is free; zap claims
/// against it are refused so stray payments never mint entitlements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub price_sats: Option<u64>,
    /// Pubkey expected in the zap request's `p` tag, lowercase hex.
    pub owner_pubkey: String,
    /// Nostr event id of the published content, if any.
    pub event_id: Option<String>,
}

impl Listing {
    /// Whether the listing names a payable price.
    pub fn payable(&self) -> bool {
        self.price_sats.unwrap_or(0) > 0
    }
}

/// File-backed listing store under `<root>/prices/`.
#[derive(Clone)]
pub struct PriceBook {
    root: PathBuf,
}

impl PriceBook {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, content: &ContentRef) -> PathBuf {
        self.root
            .join("prices")
            .join(format!("{}.json", content.file_stem()))
    }

    /// Load the listing for `content`, if one is published.
    pub fn resolve(&self, content: &ContentRef) -> Result<Option<Listing>> {
        let path = self.path(content);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)?;
        let listing = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(listing))
    }

    /// Publish or replace the listing for `content`.
    pub fn set(&self, content: &ContentRef, listing: &Listing) -> Result<()> {
        let path = self.path(content);
        let parent = path.parent().context("listing path has no parent")?;
        fs::create_dir_all(parent)?;
        let tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&tmp, listing)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        info!(
            content = %content.file_stem(),
            price = ?listing.price_sats,
            "listing written"
        );
        Ok(())
    }

    /// Remove the listing for `content`. Removing a missing listing is fine.
    pub fn unset(&self, content: &ContentRef) -> Result<()> {
        let path = self.path(content);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(content = %content.file_stem(), "listing removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
