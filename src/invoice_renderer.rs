//! Settlement invoice documents.
//!
//! The renderer runs after the settlement commit. It turns a
//! [`SettlementDocument`] into a standalone HTML page and returns a URL the
//! caller can hand to the customer.

use std::path::PathBuf;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::fees::FeeSummary;
use crate::models::ValidatedLine;

/// Everything printed on a settlement invoice.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementDocument {
    pub invoice_id: String,
    pub invoice_number: String,
    pub issue_date: String,
    pub booking_id: String,
    pub booking_number: String,
    pub customer_name: String,
    pub customer_phone: Option<String>,
    pub lines: Vec<ValidatedLine>,
    pub fees: FeeSummary,
    pub payment_method: Option<String>,
    pub notes: Option<String>,
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("invoice document write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invoice document rejected: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait InvoiceRenderer: Send + Sync {
    /// Render the document and return its URL.
    async fn render(&self, doc: &SettlementDocument) -> Result<String, RenderError>;
}

/// Writes `{invoice_number}.html` into a directory and returns a `file://` URL.
pub struct HtmlInvoiceRenderer {
    output_dir: PathBuf,
}

impl HtmlInvoiceRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl InvoiceRenderer for HtmlInvoiceRenderer {
    async fn render(&self, doc: &SettlementDocument) -> Result<String, RenderError> {
        let file_stem = safe_file_stem(&doc.invoice_number)?;
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let path = self.output_dir.join(format!("{file_stem}.html"));
        tokio::fs::write(&path, render_html(doc)).await?;

        let absolute = tokio::fs::canonicalize(&path).await?;
        debug!(invoice_number = %doc.invoice_number, path = %absolute.display(), "invoice rendered");
        Ok(format!("file://{}", absolute.display()))
    }
}

fn safe_file_stem(invoice_number: &str) -> Result<String, RenderError> {
    let stem: String = invoice_number
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if stem.is_empty() {
        return Err(RenderError::Invalid(format!(
            "invoice number '{invoice_number}' has no usable characters"
        )));
    }
    Ok(stem)
}

// ---------------------------------------------------------------------------
// HTML
// ---------------------------------------------------------------------------

fn esc(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn money(value: Decimal) -> String {
    format!("{:.2}", value.round_dp(2))
}

fn line(label: &str, value: &str) -> String {
    format!(
        "<div class=\"line\"><span>{}</span><span>{}</span></div>",
        esc(label),
        esc(value)
    )
}

pub fn render_html(doc: &SettlementDocument) -> String {
    let mut body = String::new();

    body.push_str(&format!(
        "<div class=\"center\"><h2>Settlement Invoice</h2><div>{}</div><div class=\"note\">{}</div></div>",
        esc(&doc.invoice_number),
        esc(&doc.issue_date)
    ));

    body.push_str("<div class=\"section\"><h3>Booking</h3>");
    body.push_str(&line("Booking", &doc.booking_number));
    body.push_str(&line("Customer", &doc.customer_name));
    if let Some(phone) = &doc.customer_phone {
        body.push_str(&line("Phone", phone));
    }
    body.push_str("</div>");

    body.push_str("<div class=\"section\"><h3>Returned items</h3>");
    for l in &doc.lines {
        let b = l.buckets;
        body.push_str(&line(
            &l.product_id,
            &format!(
                "{} out / {} fresh / {} laundry / {} damaged / {} lost",
                l.quantity_delivered, b.fresh, b.used, b.damaged, b.lost
            ),
        ));
    }
    body.push_str("</div>");

    if !doc.fees.lines.is_empty() {
        body.push_str("<div class=\"section\"><h3>Charges</h3>");
        for f in &doc.fees.lines {
            if f.damaged > 0 {
                body.push_str(&line(
                    &format!("{} damaged x{} @ {}", f.product_name, f.damaged, money(f.damage_fee_per_unit)),
                    &money(f.damage_charge),
                ));
            }
            if f.lost > 0 {
                body.push_str(&line(
                    &format!("{} lost x{} @ {}", f.product_name, f.lost, money(f.lost_fee_per_unit)),
                    &money(f.lost_charge),
                ));
            }
        }
        body.push_str("</div>");
    }

    let fees = &doc.fees;
    body.push_str("<div class=\"section\"><h3>Totals</h3>");
    body.push_str(&line("Fees", &money(fees.fee_total)));
    body.push_str(&line("Deposit", &money(fees.deposit)));
    body.push_str(&line("Deposit applied", &money(fees.deposit_applied)));
    if fees.refund_due > Decimal::ZERO {
        body.push_str(&line("Refund due", &money(fees.refund_due)));
    }
    if fees.extra_payable > Decimal::ZERO {
        body.push_str(&line("Amount payable", &money(fees.extra_payable)));
    }
    if let Some(method) = &doc.payment_method {
        body.push_str(&line("Payment method", method));
    }
    body.push_str("</div>");

    if let Some(notes) = doc.notes.as_deref().filter(|n| !n.trim().is_empty()) {
        body.push_str(&format!("<div class=\"section note\">{}</div>", esc(notes)));
    }

    html_shell(&format!("Invoice {}", doc.invoice_number), &body)
}

fn html_shell(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8"/>
<meta name="viewport" content="width=device-width, initial-scale=1.0"/>
<title>{}</title>
<style>
body {{ font-family: system-ui, -apple-system, Segoe UI, sans-serif; margin: 0 auto; max-width: 720px; padding: 24px; color: #111; }}
h2 {{ margin: 0 0 4px 0; }}
.line {{ display: flex; justify-content: space-between; gap: 12px; font-size: 14px; padding: 2px 0; }}
.section {{ margin-top: 16px; border-top: 1px solid #ddd; padding-top: 8px; }}
.section h3 {{ margin: 0 0 6px 0; font-size: 13px; text-transform: uppercase; color: #444; }}
.note {{ color: #666; font-size: 12px; }}
.center {{ text-align: center; }}
</style>
</head>
<body>{}</body>
</html>"#,
        esc(title),
        body
    )
}
