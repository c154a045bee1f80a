//! LNURL-pay metadata cross-check for zap providers.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Pay-service metadata relevant to zap attestation (LUD-06 + NIP-57).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PayMetadata {
    /// Whether the service publishes zap receipts at all.
    #[serde(default, rename = "allowsNostr")]
    pub allows_nostr: bool,
    /// Key the service signs zap receipts with, when advertised.
    #[serde(default, rename = "nostrPubkey")]
    pub nostr_pubkey: Option<String>,
}

/// Injected capability to fetch pay-service metadata for an endpoint URL.
#[allow(async_fn_in_trait)]
pub trait LnurlClient {
    async fn pay_metadata(&self, endpoint: &str) -> Result<PayMetadata>;
}

/// HTTP implementation of [`LnurlClient`].
#[derive(Debug, Clone)]
pub struct HttpLnurlClient {
    client: reqwest::Client,
}

impl Default for HttpLnurlClient {
    fn default() -> Self {
        // An unresponsive pay service must not hold a claim open.
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl LnurlClient for HttpLnurlClient {
    async fn pay_metadata(&self, endpoint: &str) -> Result<PayMetadata> {
        let resp = self
            .client
            .get(endpoint)
            .send()
            .await
            .context("lnurl metadata request")?
            .error_for_status()
            .context("lnurl metadata status")?;
        resp.json().await.context("lnurl metadata body")
    }
}

/// Decode a bech32 `lnurl1...` string into its endpoint URL.
pub fn decode_lnurl(lnurl: &str) -> Result<String> {
    let (hrp, data) = bech32::decode(&lnurl.trim().to_lowercase())
        .map_err(|e| anyhow!("invalid lnurl encoding: {e}"))?;
    if !hrp.as_str().eq_ignore_ascii_case("lnurl") {
        return Err(anyhow!("unexpected lnurl prefix: {}", hrp));
    }
    String::from_utf8(data).context("lnurl payload is not utf-8")
}
