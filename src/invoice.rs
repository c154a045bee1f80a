//! Bolt11 invoice decoding.

use std::str::FromStr;

use lightning_invoice::{Bolt11Invoice, Bolt11InvoiceDescription};

/// Fields extracted from a bolt11 invoice string.
///
/// Derived on demand, never persisted. Hashes are lowercase hex.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedInvoice {
    /// Invoice amount in millisatoshi, absent for amountless invoices.
    pub amount_msats: Option<u64>,
    /// Description hash committed to by the invoice, when it carries one.
    pub description_hash: Option<String>,
    /// Payment hash the settlement preimage must match.
    pub payment_hash: String,
}

impl ParsedInvoice {
    /// Whole satoshis encoded by the invoice, rounding millisats down.
    pub fn amount_sats(&self) -> u64 {
        self.amount_msats.unwrap_or(0) / 1000
    }
}

/// Decode a bolt11 invoice string.
///
/// Malformed or signature-invalid input yields `None`; callers treat a
/// missing amount as a hard validation failure upstream.
pub fn decode(bolt11: &str) -> Option<ParsedInvoice> {
    let invoice = Bolt11Invoice::from_str(bolt11.trim()).ok()?;
    let description_hash = match invoice.description() {
        Bolt11InvoiceDescription::Hash(hash) => Some(hash.0.to_string()),
        Bolt11InvoiceDescription::Direct(_) => None,
    };
    Some(ParsedInvoice {
        amount_msats: invoice.amount_milli_satoshis(),
        description_hash,
        payment_hash: invoice.payment_hash().to_string(),
    })
}
