//! File-backed purchase ledger: records verified payments exactly once.

use std::{
    collections::HashSet,
    fs,
    io::Write,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use rand::{seq::SliceRandom, thread_rng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::event::{verify_event, Event};
use crate::zap::VerifiedZap;

/// The purchased content: exactly one of course or resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentRef {
    Course(String),
    Resource(String),
}

impl ContentRef {
    pub fn id(&self) -> &str {
        match self {
            ContentRef::Course(id) | ContentRef::Resource(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ContentRef::Course(_) => "course",
            ContentRef::Resource(_) => "resource",
        }
    }

    /// Stable file stem, e.g. `resource.abc123`.
    pub(crate) fn file_stem(&self) -> String {
        format!("{}.{}", self.kind(), self.id())
    }
}

/// How a purchase was paid for. Non-zap types are administrative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    #[default]
    Zap,
    Manual,
    Comped,
    Refund,
}

impl PaymentType {
    pub fn is_zap(&self) -> bool {
        matches!(self, PaymentType::Zap)
    }
}

/// One verified receipt as persisted inside a purchase, artifacts included
/// so payments can be re-audited offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptEntry {
    /// Lowercased receipt event id.
    pub id: String,
    pub amount_sats: u64,
    pub receipt: Event,
    pub request: Event,
}

impl From<&VerifiedZap> for ReceiptEntry {
    fn from(fact: &VerifiedZap) -> Self {
        ReceiptEntry {
            id: fact.receipt_id.clone(),
            amount_sats: fact.amount_sats,
            receipt: fact.receipt.clone(),
            request: fact.request.clone(),
        }
    }
}

/// Receipt collection as stored on disk. Older records hold a single bare
/// object; everything is normalized to a list at the ledger boundary and
/// new writes always produce the list form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReceiptLog {
    Many(Vec<ReceiptEntry>),
    Single(Box<ReceiptEntry>),
}

impl Default for ReceiptLog {
    fn default() -> Self {
        ReceiptLog::Many(vec![])
    }
}

impl ReceiptLog {
    pub fn entries(&self) -> &[ReceiptEntry] {
        match self {
            ReceiptLog::Many(entries) => entries,
            ReceiptLog::Single(entry) => std::slice::from_ref(&**entry),
        }
    }

    /// Append an entry, collapsing the legacy single form to a list.
    fn push(&mut self, entry: ReceiptEntry) {
        match self {
            ReceiptLog::Many(entries) => entries.push(entry),
            ReceiptLog::Single(single) => {
                *self = ReceiptLog::Many(vec![(**single).clone(), entry]);
            }
        }
    }
}

/// The persisted unit of entitlement for one `(payer, content)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: String,
    pub payer_id: String,
    pub content: ContentRef,
    /// Total verified sats credited so far. Only ever increases.
    pub amount_paid: u64,
    /// Price snapshot taken at first purchase, so later price changes never
    /// lock out a paid buyer.
    pub price_at_purchase: Option<u64>,
    pub payment_type: PaymentType,
    /// Lowercased id of the first credited receipt.
    pub receipt_id: Option<String>,
    pub invoice: Option<String>,
    #[serde(default)]
    pub receipts: ReceiptLog,
    /// Audit reason for administrative entries.
    pub reason: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Purchase {
    /// All receipt ids credited to this purchase, lowercased.
    pub fn receipt_ids(&self) -> HashSet<String> {
        let mut ids: HashSet<String> = self
            .receipts
            .entries()
            .iter()
            .map(|e| e.id.to_lowercase())
            .collect();
        if let Some(primary) = &self.receipt_id {
            ids.insert(primary.to_lowercase());
        }
        ids
    }

    /// Whether the purchase has accumulated its snapshot price.
    pub fn unlocked(&self) -> bool {
        self.amount_paid >= self.price_at_purchase.unwrap_or(0)
    }
}

/// What a claim asks the ledger to record.
#[derive(Debug, Clone)]
pub enum Claim {
    /// Verified zap facts to merge; duplicates within the batch are ignored.
    Zap(Vec<VerifiedZap>),
    /// Administrator-trusted amount, with a mandatory audit reason.
    Admin {
        payment_type: PaymentType,
        amount_sats: u64,
        reason: String,
    },
}

/// Result of a successful claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Created(Purchase),
    Updated(Purchase),
    /// Every submitted receipt was already credited; nothing changed.
    AlreadyOwned(Purchase),
}

impl ClaimOutcome {
    pub fn purchase(&self) -> &Purchase {
        match self {
            ClaimOutcome::Created(p) | ClaimOutcome::Updated(p) | ClaimOutcome::AlreadyOwned(p) => {
                p
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ClaimOutcome::Created(_) => "created",
            ClaimOutcome::Updated(_) => "updated",
            ClaimOutcome::AlreadyOwned(_) => "already_owned",
        }
    }
}

/// Why a claim was not recorded. Messages are the stable caller-visible
/// strings; storage detail is logged, not returned.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("receipt {0} is already claimed by another account")]
    ReceiptClaimed(String),
    #[error("a purchase already exists for this content")]
    PurchaseExists,
    #[error("an audit reason is required for administrative entries")]
    MissingReason,
    #[error("a zap claim needs at least one verified receipt")]
    EmptyClaim,
    #[error("invalid identifier: {0}")]
    InvalidId(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Persistent ledger rooted at `root`.
///
/// Layout: `purchases/<payer>/<kind>.<id>.json` holds one purchase,
/// `receipts/<receipt-id>` maps a credited receipt to its owner, and
/// `log/claims.ndjson` is an append-only audit trail.
#[derive(Clone)]
pub struct Ledger {
    root: PathBuf,
    claim_lock: Arc<Mutex<()>>,
}

impl Ledger {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            claim_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Ensure the on-disk directory structure exists.
    pub fn init(&self) -> Result<()> {
        for d in ["purchases", "receipts", "prices", "log"] {
            fs::create_dir_all(self.root.join(d))?;
        }
        Ok(())
    }

    fn purchase_path(&self, payer_id: &str, content: &ContentRef) -> PathBuf {
        self.root
            .join("purchases")
            .join(payer_id)
            .join(format!("{}.json", content.file_stem()))
    }

    fn receipt_index_path(&self, receipt_id: &str) -> PathBuf {
        self.root.join("receipts").join(receipt_id.to_lowercase())
    }

    /// Load the purchase for `(payer, content)`, if any.
    pub fn get(&self, payer_id: &str, content: &ContentRef) -> Result<Option<Purchase>> {
        let path = self.purchase_path(payer_id, content);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)?;
        let purchase = serde_json::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(purchase))
    }

    /// Record a claim for `(payer, content)`, exactly once per receipt.
    ///
    /// The whole check-then-write sequence runs behind the claim mutex, so
    /// two claims racing on the same receipt or purchase key leave exactly
    /// one effective writer; the `create_new` index files are the storage
    /// backstop should that ever not hold.
    pub async fn claim(
        &self,
        payer_id: &str,
        content: &ContentRef,
        canonical_price: Option<u64>,
        claim: Claim,
        now: u64,
    ) -> Result<ClaimOutcome, LedgerError> {
        ensure_segment(payer_id)?;
        ensure_segment(content.id())?;

        let _guard = self.claim_lock.lock().await;
        let existing = self.get(payer_id, content).map_err(LedgerError::Storage)?;

        let outcome = match claim {
            Claim::Zap(facts) => {
                self.claim_zap(payer_id, content, canonical_price, facts, existing, now)?
            }
            Claim::Admin {
                payment_type,
                amount_sats,
                reason,
            } => self.claim_admin(
                payer_id,
                content,
                canonical_price,
                payment_type,
                amount_sats,
                reason,
                existing,
                now,
            )?,
        };

        self.append_claim_log(&outcome, now);
        Ok(outcome)
    }

    fn claim_zap(
        &self,
        payer_id: &str,
        content: &ContentRef,
        canonical_price: Option<u64>,
        facts: Vec<VerifiedZap>,
        existing: Option<Purchase>,
        now: u64,
    ) -> Result<ClaimOutcome, LedgerError> {
        // Deduplicate within the batch; ids are already lowercased.
        let mut batch: Vec<VerifiedZap> = Vec::with_capacity(facts.len());
        let mut seen = HashSet::new();
        for fact in facts {
            if seen.insert(fact.receipt_id.clone()) {
                batch.push(fact);
            }
        }
        if batch.is_empty() {
            return Err(LedgerError::EmptyClaim);
        }

        // Global reuse check: one payment proof unlocks content for one
        // account, ever. Fast index lookup first, structural scan second.
        for fact in &batch {
            if let Some(owner) = self.receipt_owner(&fact.receipt_id)? {
                if owner != payer_id {
                    warn!(
                        receipt = %fact.receipt_id,
                        claimant = payer_id,
                        owner = %owner,
                        "rejected reuse of a claimed receipt"
                    );
                    return Err(LedgerError::ReceiptClaimed(fact.receipt_id.clone()));
                }
            }
        }

        match existing {
            None => {
                let amount_paid = batch.iter().map(|f| f.amount_sats).sum();
                let purchase = Purchase {
                    id: format!("{}:{}", payer_id, content.file_stem()),
                    payer_id: payer_id.into(),
                    content: content.clone(),
                    amount_paid,
                    price_at_purchase: canonical_price,
                    payment_type: PaymentType::Zap,
                    receipt_id: Some(batch[0].receipt_id.clone()),
                    invoice: Some(batch[0].invoice.clone()),
                    receipts: ReceiptLog::Many(batch.iter().map(ReceiptEntry::from).collect()),
                    reason: None,
                    created_at: now,
                    updated_at: now,
                };
                self.write_purchase(&purchase, true)?;
                self.index_receipts(payer_id, batch.iter().map(|f| f.receipt_id.as_str()))?;
                Ok(ClaimOutcome::Created(purchase))
            }
            Some(mut purchase) => {
                let known = purchase.receipt_ids();
                let fresh: Vec<&VerifiedZap> = batch
                    .iter()
                    .filter(|f| !known.contains(&f.receipt_id))
                    .collect();
                if fresh.is_empty() {
                    // Idempotent no-op: safe to retry blindly.
                    return Ok(ClaimOutcome::AlreadyOwned(purchase));
                }
                let increment: u64 = fresh.iter().map(|f| f.amount_sats).sum();
                for fact in &fresh {
                    purchase.receipts.push(ReceiptEntry::from(*fact));
                }
                purchase.amount_paid += increment;
                if purchase.price_at_purchase.is_none() {
                    purchase.price_at_purchase = canonical_price;
                }
                purchase.updated_at = now;
                self.write_purchase(&purchase, false)?;
                self.index_receipts(payer_id, fresh.iter().map(|f| f.receipt_id.as_str()))?;
                Ok(ClaimOutcome::Updated(purchase))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn claim_admin(
        &self,
        payer_id: &str,
        content: &ContentRef,
        canonical_price: Option<u64>,
        payment_type: PaymentType,
        amount_sats: u64,
        reason: String,
        existing: Option<Purchase>,
        now: u64,
    ) -> Result<ClaimOutcome, LedgerError> {
        if payment_type.is_zap() || reason.trim().is_empty() {
            return Err(LedgerError::MissingReason);
        }
        match existing {
            None => {
                let purchase = Purchase {
                    id: format!("{}:{}", payer_id, content.file_stem()),
                    payer_id: payer_id.into(),
                    content: content.clone(),
                    amount_paid: amount_sats,
                    price_at_purchase: canonical_price,
                    payment_type,
                    receipt_id: None,
                    invoice: None,
                    receipts: ReceiptLog::default(),
                    reason: Some(reason),
                    created_at: now,
                    updated_at: now,
                };
                self.write_purchase(&purchase, true)?;
                Ok(ClaimOutcome::Created(purchase))
            }
            Some(mut purchase) => {
                purchase.amount_paid += amount_sats;
                purchase.payment_type = payment_type;
                purchase.reason = Some(reason);
                if purchase.price_at_purchase.is_none() {
                    purchase.price_at_purchase = canonical_price;
                }
                purchase.updated_at = now;
                self.write_purchase(&purchase, false)?;
                Ok(ClaimOutcome::Updated(purchase))
            }
        }
    }

    /// Which payer currently owns `receipt_id`, if anyone.
    fn receipt_owner(&self, receipt_id: &str) -> Result<Option<String>, LedgerError> {
        let index = self.receipt_index_path(receipt_id);
        if index.exists() {
            let data = fs::read_to_string(&index)
                .with_context(|| format!("reading {}", index.display()))?;
            if let Some(owner) = data.lines().next() {
                return Ok(Some(owner.to_string()));
            }
        }
        self.scan_receipt_owner(receipt_id)
    }

    /// Structural scan over every purchase's receipt collection. Covers
    /// records written before indexing existed and interrupted writes.
    fn scan_receipt_owner(&self, receipt_id: &str) -> Result<Option<String>, LedgerError> {
        let wanted = receipt_id.to_lowercase();
        for entry in walkdir::WalkDir::new(self.root.join("purchases")) {
            let entry = entry.map_err(anyhow::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let data = fs::read_to_string(entry.path())
                .with_context(|| format!("reading {}", entry.path().display()))?;
            let purchase: Purchase = match serde_json::from_str(&data) {
                Ok(p) => p,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "unreadable purchase skipped");
                    continue;
                }
            };
            if purchase.receipt_ids().contains(&wanted) {
                return Ok(Some(purchase.payer_id));
            }
        }
        Ok(None)
    }

    /// Write a purchase atomically; `create` refuses to clobber.
    fn write_purchase(&self, purchase: &Purchase, create: bool) -> Result<(), LedgerError> {
        let path = self.purchase_path(&purchase.payer_id, &purchase.content);
        let parent = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent).map_err(anyhow::Error::from)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent).map_err(anyhow::Error::from)?;
        serde_json::to_writer(&tmp, purchase).map_err(anyhow::Error::from)?;
        if create {
            tmp.persist_noclobber(&path).map_err(|e| {
                if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                    LedgerError::PurchaseExists
                } else {
                    LedgerError::Storage(e.error.into())
                }
            })?;
        } else {
            tmp.persist(&path)
                .map_err(|e| LedgerError::Storage(e.error.into()))?;
        }
        Ok(())
    }

    /// Claim receipt ids for `payer_id` with exclusive-create index files.
    fn index_receipts<'a>(
        &self,
        payer_id: &str,
        ids: impl Iterator<Item = &'a str>,
    ) -> Result<(), LedgerError> {
        for id in ids {
            let path = self.receipt_index_path(id);
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    writeln!(f, "{}", payer_id).map_err(anyhow::Error::from)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let owner = fs::read_to_string(&path).unwrap_or_default();
                    if owner.lines().next() != Some(payer_id) {
                        return Err(LedgerError::ReceiptClaimed(id.to_lowercase()));
                    }
                }
                Err(e) => return Err(LedgerError::Storage(e.into())),
            }
        }
        Ok(())
    }

    /// Append the claim to the newline-delimited audit log.
    fn append_claim_log(&self, outcome: &ClaimOutcome, now: u64) {
        let purchase = outcome.purchase();
        let record = serde_json::json!({
            "ts": now,
            "outcome": outcome.label(),
            "payer_id": purchase.payer_id,
            "content": purchase.content,
            "payment_type": purchase.payment_type,
            "amount_paid": purchase.amount_paid,
            "receipts": purchase.receipt_ids().len(),
        });
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join("log/claims.ndjson"))
            .and_then(|mut f| writeln!(f, "{}", record));
        if let Err(e) = result {
            warn!(error = %e, "claim log append failed");
        } else {
            info!(
                payer = %purchase.payer_id,
                content = %purchase.content.file_stem(),
                outcome = outcome.label(),
                amount = purchase.amount_paid,
                "claim recorded"
            );
        }
    }

    /// Re-verify receipt artifacts for a random sample of stored purchases.
    pub fn audit_sample(&self, sample: usize) -> Result<usize> {
        let mut paths = vec![];
        for entry in walkdir::WalkDir::new(self.root.join("purchases")) {
            let entry = entry?;
            if entry.file_type().is_file() {
                paths.push(entry.into_path());
            }
        }
        let mut rng = thread_rng();
        paths.shuffle(&mut rng);
        let take = sample.min(paths.len());
        for path in paths.iter().take(take) {
            let data = fs::read_to_string(path)?;
            let purchase: Purchase = serde_json::from_str(&data)
                .with_context(|| format!("parsing {}", path.display()))?;
            for entry in purchase.receipts.entries() {
                verify_event(&entry.receipt)
                    .with_context(|| format!("receipt {} in {}", entry.id, path.display()))?;
                verify_event(&entry.request)
                    .with_context(|| format!("request for {} in {}", entry.id, path.display()))?;
            }
        }
        Ok(take)
    }
}

/// Reject identifiers that could escape the store layout.
pub(crate) fn ensure_segment(s: &str) -> Result<(), LedgerError> {
    let ok = !s.is_empty()
        && !s.starts_with('.')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(LedgerError::InvalidId(s.into()))
    }
}
