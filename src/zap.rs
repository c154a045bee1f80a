//! Zap receipt validation: turns an untrusted payment attestation into a
//! verified payment fact, or a typed rejection.

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::event::{verify_event, Event, KIND_ZAP_RECEIPT, KIND_ZAP_REQUEST};
use crate::fetch::{retry_until_some, EventSource, RetryPolicy};
use crate::invoice;
use crate::lnurl::{decode_lnurl, LnurlClient};

/// A claimed receipt: either an id to look up on relays, or the full event
/// supplied inline. Inline receipts skip the network but no other check.
#[derive(Debug, Clone)]
pub enum ReceiptRef {
    Id(String),
    Inline(Event),
}

/// Freshness window applied to the receipt timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Freshness {
    /// Maximum accepted age in seconds.
    pub max_age_secs: u64,
    /// Tolerated clock skew into the future, in seconds.
    pub future_skew_secs: u64,
}

/// What the zap request must reference for the claim to count.
///
/// Matches either an `e` tag equal to `event_id`, or an `a` tag
/// (`"kind:pubkey:identifier"`) whose identifier segment equals
/// `identifier` (falling back to `event_id` when unset).
#[derive(Debug, Clone, Default)]
pub struct ContentBinding {
    pub event_id: Option<String>,
    pub identifier: Option<String>,
}

/// Everything needed to judge one claimed receipt.
#[derive(Debug, Clone)]
pub struct ZapContext {
    pub receipt: ReceiptRef,
    /// Caller-supplied invoice that must match the receipt's `bolt11`.
    pub invoice_hint: Option<String>,
    /// Pubkey the zap must have been addressed to, when required.
    pub recipient: Option<String>,
    /// Content the zap must reference, when required.
    pub content: Option<ContentBinding>,
    /// Keys the claiming account is allowed to have paid from.
    pub payer_keys: Vec<String>,
    /// Relays to poll for by-id receipts.
    pub relays: Vec<String>,
    pub freshness: Freshness,
    pub retry: RetryPolicy,
    /// Evaluation time (unix seconds); explicit for testability.
    pub now: u64,
}

/// Verified payment fact produced by [`validate`]. Immutable; carries the
/// full receipt and request for audit persistence.
#[derive(Debug, Clone)]
pub struct VerifiedZap {
    pub amount_sats: u64,
    pub invoice: String,
    /// Lowercased receipt event id.
    pub receipt_id: String,
    pub receipt: Event,
    pub request: Event,
}

/// Why a claimed receipt was not accepted. The messages are the stable,
/// caller-visible strings; internal detail stays in the log.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Reject {
    #[error("zap receipt not found on any relay")]
    Unavailable,
    #[error("event is not a zap receipt")]
    WrongKind,
    #[error("zap receipt signature is invalid")]
    BadSignature,
    #[error("zap receipt is too old to claim")]
    Expired,
    #[error("zap receipt is timestamped in the future")]
    FromFuture,
    #[error("zap receipt is missing its bolt11 or description tag")]
    Malformed,
    #[error("supplied invoice does not match the zap receipt")]
    InvoiceMismatch,
    #[error("invoice amount is missing or unreadable")]
    UnreadableAmount,
    #[error("invoice description hash does not commit to the zap request")]
    DescriptionHashMismatch,
    #[error("embedded zap request is not a valid event")]
    MalformedRequest,
    #[error("embedded zap request signature is invalid")]
    BadRequestSignature,
    #[error("zap request amount does not match the invoice")]
    AmountMismatch,
    #[error("zap was addressed to a different recipient")]
    RecipientMismatch,
    #[error("zap does not reference this content")]
    ContentMismatch,
    #[error("no payer keys are linked to the claiming account")]
    NoPayerKeys,
    #[error("zap was not sent by an authorized payer key")]
    PayerNotAuthorized,
    #[error("lnurl pay service does not support zaps")]
    LnurlUnsupported,
    #[error("lnurl pay service signer does not match the receipt")]
    LnurlProviderMismatch,
    #[error("invoice amount rounds down to zero sats")]
    ZeroAmount,
}

impl Reject {
    /// Whether the caller may usefully retry the same claim later.
    pub fn retryable(&self) -> bool {
        matches!(self, Reject::Unavailable)
    }
}

/// Validate one claimed receipt against `ctx`, short-circuiting on the first
/// failed check. Has no side effects beyond fetcher and LNURL lookups.
pub async fn validate<S: EventSource, L: LnurlClient>(
    ctx: &ZapContext,
    source: &S,
    lnurl: Option<&L>,
) -> Result<VerifiedZap, Reject> {
    // 1. Acquire the receipt, polling relays for by-id claims.
    let receipt = match &ctx.receipt {
        ReceiptRef::Inline(ev) => ev.clone(),
        ReceiptRef::Id(id) => {
            retry_until_some(&ctx.retry, || source.fetch_event(id, &ctx.relays))
                .await
                .ok_or(Reject::Unavailable)?
        }
    };

    // 2. Kind.
    if receipt.kind != KIND_ZAP_RECEIPT {
        return Err(Reject::WrongKind);
    }

    // 3. Receipt id and signature.
    if let Err(e) = verify_event(&receipt) {
        debug!(receipt = %receipt.id, error = %e, "receipt signature rejected");
        return Err(Reject::BadSignature);
    }

    // 4. Freshness, both directions.
    if ctx.now.saturating_sub(receipt.created_at) > ctx.freshness.max_age_secs {
        return Err(Reject::Expired);
    }
    if receipt.created_at.saturating_sub(ctx.now) > ctx.freshness.future_skew_secs {
        return Err(Reject::FromFuture);
    }

    // 5. Required tags.
    let bolt11 = receipt.tag_value("bolt11").ok_or(Reject::Malformed)?;
    let description = receipt.tag_value("description").ok_or(Reject::Malformed)?;

    // 6. Invoice hint cross-check.
    if let Some(hint) = &ctx.invoice_hint {
        if !hint.trim().eq_ignore_ascii_case(bolt11.trim()) {
            return Err(Reject::InvoiceMismatch);
        }
    }

    // 7. Decode the invoice; a positive msat amount is mandatory.
    let parsed = invoice::decode(bolt11).ok_or(Reject::UnreadableAmount)?;
    let amount_msats = match parsed.amount_msats {
        Some(msats) if msats > 0 => msats,
        _ => return Err(Reject::UnreadableAmount),
    };

    // 8. Description-hash binding: the invoice must commit to this request.
    if let Some(expected) = &parsed.description_hash {
        let computed = hex::encode(Sha256::digest(description.as_bytes()));
        if !computed.eq_ignore_ascii_case(expected) {
            return Err(Reject::DescriptionHashMismatch);
        }
    }

    // 9. Embedded zap request: valid JSON, correct kind, separately signed.
    let request: Event =
        serde_json::from_str(description).map_err(|_| Reject::MalformedRequest)?;
    if request.kind != KIND_ZAP_REQUEST {
        return Err(Reject::MalformedRequest);
    }
    if let Err(e) = verify_event(&request) {
        debug!(receipt = %receipt.id, error = %e, "zap request signature rejected");
        return Err(Reject::BadRequestSignature);
    }

    // 10. Declared amount, when present, must equal the invoice amount.
    if let Some(declared) = request.tag_value("amount") {
        if declared.parse::<u64>().ok() != Some(amount_msats) {
            return Err(Reject::AmountMismatch);
        }
    }

    // 11. Recipient binding.
    if let Some(expected) = &ctx.recipient {
        match request.tag_value("p") {
            Some(p) if p.eq_ignore_ascii_case(expected) => {}
            _ => return Err(Reject::RecipientMismatch),
        }
    }

    // 12. Content binding via `e` or `a` tags.
    if let Some(binding) = &ctx.content {
        if !content_matches(&request, binding) {
            return Err(Reject::ContentMismatch);
        }
    }

    // 13. Payer authorization: signer or anonymous `P` payer must be linked.
    if ctx.payer_keys.is_empty() {
        return Err(Reject::NoPayerKeys);
    }
    let authorized = std::iter::once(request.pubkey.as_str())
        .chain(request.tag_values("P"))
        .any(|candidate| {
            ctx.payer_keys
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(candidate))
        });
    if !authorized {
        return Err(Reject::PayerNotAuthorized);
    }

    // 14. Optional LNURL provider cross-check.
    if let (Some(client), Some(tag)) = (lnurl, request.tag_value("lnurl")) {
        let endpoint = decode_lnurl(tag).map_err(|e| {
            debug!(receipt = %receipt.id, error = %e, "lnurl tag undecodable");
            Reject::LnurlUnsupported
        })?;
        let meta = client.pay_metadata(&endpoint).await.map_err(|e| {
            debug!(receipt = %receipt.id, error = %e, "lnurl metadata fetch failed");
            Reject::LnurlUnsupported
        })?;
        if !meta.allows_nostr {
            return Err(Reject::LnurlUnsupported);
        }
        if let Some(signer) = &meta.nostr_pubkey {
            if !signer.eq_ignore_ascii_case(&receipt.pubkey) {
                return Err(Reject::LnurlProviderMismatch);
            }
        }
    }

    // 15. Final amount in whole sats.
    let amount_sats = amount_msats / 1000;
    if amount_sats == 0 {
        return Err(Reject::ZeroAmount);
    }

    Ok(VerifiedZap {
        amount_sats,
        invoice: bolt11.to_string(),
        receipt_id: receipt.id.to_lowercase(),
        receipt,
        request,
    })
}

/// True when the request references the bound content by `e` or `a` tag.
fn content_matches(request: &Event, binding: &ContentBinding) -> bool {
    if binding.event_id.is_none() && binding.identifier.is_none() {
        return true;
    }
    if let Some(event_id) = binding.event_id.as_deref() {
        if request
            .tag_values("e")
            .any(|v| v.eq_ignore_ascii_case(event_id))
        {
            return true;
        }
    }
    let identifier = binding
        .identifier
        .as_deref()
        .or(binding.event_id.as_deref());
    if let Some(identifier) = identifier {
        if request.tag_values("a").any(|addr| {
            addr.splitn(3, ':')
                .nth(2)
                .is_some_and(|segment| segment.eq_ignore_ascii_case(identifier))
        }) {
            return true;
        }
    }
    false
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Signed zap fixtures shared by validator and server tests.

    use secp256k1::{Keypair, Message, Secp256k1};

    use crate::event::{event_hash, Event, Tag, KIND_ZAP_RECEIPT, KIND_ZAP_REQUEST};
    use crate::invoice::tests::test_invoice;

    pub const NOW: u64 = 1_700_000_500;

    pub fn keypair(seed: u8) -> Keypair {
        let secp = Secp256k1::new();
        Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap()
    }

    pub fn pubkey_hex(kp: &Keypair) -> String {
        hex::encode(kp.x_only_public_key().0.serialize())
    }

    pub fn sign(ev: &mut Event, kp: &Keypair) {
        let secp = Secp256k1::new();
        let hash = event_hash(ev).unwrap();
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash).unwrap();
        ev.sig = hex::encode(secp.sign_schnorr_no_aux_rand(&msg, kp).as_ref());
    }

    /// Signed kind-9734 zap request.
    pub fn zap_request(payer: &Keypair, tags: Vec<Tag>) -> Event {
        let mut ev = Event {
            id: String::new(),
            pubkey: pubkey_hex(payer),
            kind: KIND_ZAP_REQUEST,
            created_at: NOW - 10,
            tags,
            content: String::new(),
            sig: String::new(),
        };
        sign(&mut ev, payer);
        ev
    }

    /// Signed kind-9735 receipt embedding `request`, paying `amount_msats`.
    pub fn zap_receipt(
        wallet: &Keypair,
        request: &Event,
        amount_msats: u64,
        created_at: u64,
    ) -> Event {
        let request_json = serde_json::to_string(request).unwrap();
        let bolt11 = test_invoice(amount_msats, &request_json);
        let mut ev = Event {
            id: String::new(),
            pubkey: pubkey_hex(wallet),
            kind: KIND_ZAP_RECEIPT,
            created_at,
            tags: vec![
                Tag(vec!["bolt11".into(), bolt11]),
                Tag(vec!["description".into(), request_json]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        sign(&mut ev, wallet);
        ev
    }
}
