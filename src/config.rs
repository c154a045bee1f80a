//! Configuration loading from `.env` files.

use std::{env, path::PathBuf};

use anyhow::{Context, Result};

use crate::fetch::RetryPolicy;
use crate::zap::Freshness;

/// Seconds a receipt may lag behind `now` on an ordinary claim.
pub const DEFAULT_RECEIPT_MAX_AGE_SECS: u64 = 600;
/// Widened lag window for claims flagged as historical, one year.
pub const DEFAULT_CLAIM_PAST_MAX_AGE_SECS: u64 = 31_536_000;
/// Tolerated clock skew into the future.
pub const DEFAULT_FUTURE_SKEW_SECS: u64 = 300;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for all storage.
    pub store_root: PathBuf,
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// Relays queried for receipts when a claim names none.
    pub default_relays: Vec<String>,
    /// Lag window for ordinary claims, seconds.
    pub receipt_max_age_secs: u64,
    /// Lag window when the caller asks for a historical claim, seconds.
    pub claim_past_max_age_secs: u64,
    /// Tolerated future clock skew, seconds.
    pub future_skew_secs: u64,
    /// Relay fetch attempts per receipt id.
    pub fetch_attempts: u32,
    /// Pause between fetch attempts, milliseconds.
    pub fetch_interval_ms: u64,
    /// Enable the optional LNURL provider cross-check.
    pub lnurl_check: bool,
    /// Shared secret for administrative claims; absent disables them.
    pub admin_token: Option<String>,
    /// Optional Tor SOCKS proxy (host:port) for relay connections.
    pub tor_socks: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT")?);
        let bind_http = env::var("BIND_HTTP")?;
        let default_relays = csv_strings(env::var("DEFAULT_RELAYS").unwrap_or_default());
        let receipt_max_age_secs =
            env_u64("RECEIPT_MAX_AGE_SECS", DEFAULT_RECEIPT_MAX_AGE_SECS);
        let claim_past_max_age_secs =
            env_u64("CLAIM_PAST_MAX_AGE_SECS", DEFAULT_CLAIM_PAST_MAX_AGE_SECS);
        let future_skew_secs = env_u64("FUTURE_SKEW_SECS", DEFAULT_FUTURE_SKEW_SECS);
        let fetch_attempts = env_u64("FETCH_ATTEMPTS", 6) as u32;
        let fetch_interval_ms = env_u64("FETCH_INTERVAL_MS", 800);
        let lnurl_check = env::var("LNURL_CHECK").unwrap_or_else(|_| "0".into()) == "1";
        let admin_token = env::var("ADMIN_TOKEN").ok().filter(|s| !s.is_empty());
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        Ok(Self {
            store_root,
            bind_http,
            default_relays,
            receipt_max_age_secs,
            claim_past_max_age_secs,
            future_skew_secs,
            fetch_attempts,
            fetch_interval_ms,
            lnurl_check,
            admin_token,
            tor_socks,
        })
    }

    /// Freshness window for a claim, widened when `claim_past` is set.
    pub fn freshness(&self, claim_past: bool) -> Freshness {
        Freshness {
            max_age_secs: if claim_past {
                self.claim_past_max_age_secs
            } else {
                self.receipt_max_age_secs
            },
            future_skew_secs: self.future_skew_secs,
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.fetch_attempts,
            interval: std::time::Duration::from_millis(self.fetch_interval_ms),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}
