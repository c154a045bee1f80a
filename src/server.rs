//! HTTP boundary: claim submission, purchase lookup, health.

use std::{future::Future, sync::Arc, time::{SystemTime, UNIX_EPOCH}};

use anyhow::Result;
use axum::{
    extract::{Query as AxumQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Settings;
use crate::fetch::RelaySource;
use crate::ledger::{Claim, ContentRef, Ledger, LedgerError, PaymentType, Purchase};
use crate::lnurl::HttpLnurlClient;
use crate::price::{Listing, PriceBook};
use crate::zap::{self, ContentBinding, ReceiptRef, Reject, VerifiedZap, ZapContext};

pub struct HttpState {
    pub ledger: Ledger,
    pub prices: PriceBook,
    pub settings: Settings,
    pub source: RelaySource,
    pub lnurl: HttpLnurlClient,
}

impl HttpState {
    pub fn new(settings: Settings) -> Self {
        let ledger = Ledger::new(settings.store_root.clone());
        let prices = PriceBook::new(settings.store_root.clone());
        let source = RelaySource {
            tor_socks: settings.tor_socks.clone(),
            ..RelaySource::default()
        };
        Self {
            ledger,
            prices,
            settings,
            source,
            lnurl: HttpLnurlClient::default(),
        }
    }
}

/// Start the HTTP server on `addr` until `shutdown` resolves.
pub async fn serve_http(
    addr: &str,
    state: Arc<HttpState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "http listening");
    let app = router(state);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/healthz", get(healthz))
        .route("/claim", post(claim))
        .route("/purchase", get(purchase))
        .with_state(state)
}

/// Error the boundary returns to callers: a status and a stable message.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<Reject> for ApiError {
    fn from(reject: Reject) -> Self {
        let status = match &reject {
            Reject::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Reject::NoPayerKeys
            | Reject::PayerNotAuthorized
            | Reject::LnurlUnsupported
            | Reject::LnurlProviderMismatch => StatusCode::FORBIDDEN,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self {
            status,
            message: reject.to_string(),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::ReceiptClaimed(_) | LedgerError::PurchaseExists => StatusCode::CONFLICT,
            LedgerError::MissingReason | LedgerError::EmptyClaim | LedgerError::InvalidId(_) => {
                StatusCode::BAD_REQUEST
            }
            LedgerError::Storage(e) => {
                warn!(error = %e, "storage failure at the boundary");
                return Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "internal storage error".into(),
                };
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        warn!(error = %e, "internal failure at the boundary");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal storage error".into(),
        }
    }
}

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

#[derive(Serialize, Deserialize)]
struct ServiceInfo {
    name: String,
    version: String,
}

async fn service_info() -> impl IntoResponse {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(ServiceInfo {
            name: "zapgate".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }),
    )
}

/// `POST /claim` request body. The caller states its own identity and
/// linked keys explicitly; there is no ambient session.
#[derive(Debug, Deserialize)]
pub struct ClaimBody {
    pub payer_id: String,
    #[serde(default)]
    pub payer_pubkeys: Vec<String>,
    pub course: Option<String>,
    pub resource: Option<String>,
    #[serde(default)]
    pub payment_type: PaymentType,
    /// Receipt ids to look up on relays.
    #[serde(default)]
    pub receipt_ids: Vec<String>,
    /// Full receipt events supplied inline; validated before the ids.
    #[serde(default)]
    pub receipts: Vec<crate::event::Event>,
    /// Invoice the caller believes it paid; must match the receipt.
    pub invoice: Option<String>,
    #[serde(default)]
    pub relays: Vec<String>,
    /// Select the long freshness tier for old receipts.
    #[serde(default)]
    pub claim_past: bool,
    /// Administrative claims only.
    pub amount_sats: Option<u64>,
    pub reason: Option<String>,
}

impl ClaimBody {
    fn content(&self) -> Result<ContentRef, ApiError> {
        match (&self.course, &self.resource) {
            (Some(c), None) => Ok(ContentRef::Course(c.clone())),
            (None, Some(r)) => Ok(ContentRef::Resource(r.clone())),
            _ => Err(ApiError::bad_request(
                "exactly one of course or resource is required",
            )),
        }
    }
}

#[derive(Serialize)]
struct ClaimResponse {
    outcome: &'static str,
    unlocked: bool,
    purchase: Purchase,
}

async fn claim(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(body): Json<ClaimBody>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let content = body.content()?;
    crate::ledger::ensure_segment(&body.payer_id)?;
    crate::ledger::ensure_segment(content.id())?;
    let now = unix_now();

    let outcome = if body.payment_type.is_zap() {
        // The price recorded on the purchase is the same listing the
        // receipts were validated against, read once.
        let (facts, listing) = verify_receipts(&state, &body, &content, now).await?;
        state
            .ledger
            .claim(
                &body.payer_id,
                &content,
                listing.price_sats,
                Claim::Zap(facts),
                now,
            )
            .await?
    } else {
        require_admin(&state.settings, &headers)?;
        let amount_sats = body
            .amount_sats
            .ok_or_else(|| ApiError::bad_request("amount_sats is required for this payment type"))?;
        let reason = body
            .reason
            .clone()
            .ok_or_else(|| ApiError::bad_request("reason is required for this payment type"))?;
        let price = state.prices.resolve(&content)?.and_then(|l| l.price_sats);
        state
            .ledger
            .claim(
                &body.payer_id,
                &content,
                price,
                Claim::Admin {
                    payment_type: body.payment_type,
                    amount_sats,
                    reason,
                },
                now,
            )
            .await?
    };

    let purchase = outcome.purchase().clone();
    Ok(Json(ClaimResponse {
        outcome: outcome.label(),
        unlocked: purchase.unlocked(),
        purchase,
    }))
}

/// Caller relay hints widen the configured pool rather than replace it,
/// hints first. A receipt only published to a default relay still resolves
/// when the caller supplies its own (possibly wrong) hints.
fn merge_relays(hints: &[String], defaults: &[String]) -> Vec<String> {
    let mut relays: Vec<String> = Vec::with_capacity(hints.len() + defaults.len());
    for relay in hints.iter().chain(defaults) {
        if !relays.iter().any(|r| r == relay) {
            relays.push(relay.clone());
        }
    }
    relays
}

/// Validate every claimed receipt, inline ones first. One rejection aborts
/// the whole claim, so a batch never half-applies. Returns the listing the
/// receipts were checked against so the caller records that exact price.
async fn verify_receipts(
    state: &HttpState,
    body: &ClaimBody,
    content: &ContentRef,
    now: u64,
) -> Result<(Vec<VerifiedZap>, Listing), ApiError> {
    // Price-bypass guard: unpriced content cannot be bought, whatever the
    // receipt says.
    let listing = state
        .prices
        .resolve(content)?
        .filter(|l| l.payable())
        .ok_or_else(|| ApiError {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: "price unavailable for this content".into(),
        })?;

    let mut refs: Vec<ReceiptRef> = body
        .receipts
        .iter()
        .cloned()
        .map(ReceiptRef::Inline)
        .collect();
    refs.extend(body.receipt_ids.iter().cloned().map(ReceiptRef::Id));
    if refs.is_empty() {
        return Err(ApiError::bad_request(
            "a zap claim needs receipts or receipt_ids",
        ));
    }

    let relays = merge_relays(&body.relays, &state.settings.default_relays);

    let mut facts = Vec::with_capacity(refs.len());
    for receipt in refs {
        let ctx = ZapContext {
            receipt,
            invoice_hint: body.invoice.clone(),
            recipient: Some(listing.owner_pubkey.clone()),
            content: Some(ContentBinding {
                event_id: listing.event_id.clone(),
                identifier: Some(content.id().to_string()),
            }),
            payer_keys: body.payer_pubkeys.clone(),
            relays: relays.clone(),
            freshness: state.settings.freshness(body.claim_past),
            retry: state.settings.retry(),
            now,
        };
        let lnurl = state.settings.lnurl_check.then_some(&state.lnurl);
        facts.push(zap::validate(&ctx, &state.source, lnurl).await?);
    }
    Ok((facts, listing))
}

/// Non-zap payment types need the shared admin token.
fn require_admin(settings: &Settings, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = settings.admin_token.as_deref().ok_or(ApiError {
        status: StatusCode::FORBIDDEN,
        message: "administrative claims are disabled".into(),
    })?;
    let supplied = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if supplied != expected {
        return Err(ApiError {
            status: StatusCode::FORBIDDEN,
            message: "invalid admin token".into(),
        });
    }
    Ok(())
}

#[derive(Deserialize)]
struct PurchaseParams {
    payer: String,
    course: Option<String>,
    resource: Option<String>,
}

#[derive(Serialize)]
struct PurchaseResponse {
    unlocked: bool,
    purchase: Purchase,
}

async fn purchase(
    State(state): State<Arc<HttpState>>,
    AxumQuery(params): AxumQuery<PurchaseParams>,
) -> Result<Json<PurchaseResponse>, ApiError> {
    let content = match (&params.course, &params.resource) {
        (Some(c), None) => ContentRef::Course(c.clone()),
        (None, Some(r)) => ContentRef::Resource(r.clone()),
        _ => {
            return Err(ApiError::bad_request(
                "exactly one of course or resource is required",
            ))
        }
    };
    crate::ledger::ensure_segment(&params.payer)?;
    crate::ledger::ensure_segment(content.id())?;
    let purchase = state
        .ledger
        .get(&params.payer, &content)?
        .ok_or(ApiError {
            status: StatusCode::NOT_FOUND,
            message: "no purchase recorded".into(),
        })?;
    Ok(Json(PurchaseResponse {
        unlocked: purchase.unlocked(),
        purchase,
    }))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
