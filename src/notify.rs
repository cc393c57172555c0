//! Customer notifications after a settlement.
//!
//! Notifications are best effort. The settlement tail spawns them and only
//! logs the outcome.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

const WATI_TIMEOUT: Duration = Duration::from_secs(10);
const INVOICE_TEMPLATE: &str = "invoice_sent";

/// What the customer is told about their settled booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceNotice {
    pub phone: Option<String>,
    pub customer_name: String,
    pub booking_number: String,
    pub invoice_number: String,
    pub document_url: Option<String>,
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("customer has no usable phone number")]
    MissingPhone,

    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    Rejected(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send_invoice(&self, notice: &InvoiceNotice) -> Result<(), NotifyError>;
}

// ---------------------------------------------------------------------------
// Disabled
// ---------------------------------------------------------------------------

/// Used when no WhatsApp provider is configured.
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn send_invoice(&self, notice: &InvoiceNotice) -> Result<(), NotifyError> {
        debug!(
            booking_number = %notice.booking_number,
            invoice_number = %notice.invoice_number,
            "notifications disabled, skipping invoice message"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WATI
// ---------------------------------------------------------------------------

pub struct WatiNotifier {
    client: Client,
    base_url: String,
    api_token: Zeroizing<String>,
}

#[derive(Serialize)]
struct TemplateParameter {
    name: String,
    value: String,
}

#[derive(Serialize)]
struct TemplateMessage<'a> {
    #[serde(rename = "whatsappNumber")]
    whatsapp_number: &'a str,
    template_name: &'a str,
    broadcast_name: String,
    parameters: Vec<TemplateParameter>,
}

#[derive(Deserialize)]
struct WatiResponse {
    #[serde(default)]
    result: bool,
    #[serde(default)]
    info: Option<String>,
}

impl WatiNotifier {
    pub fn new(base_url: &str, api_token: Zeroizing<String>) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(WATI_TIMEOUT)
            .build()
            .map_err(|e| NotifyError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_token,
        })
    }
}

#[async_trait]
impl Notifier for WatiNotifier {
    fn name(&self) -> &'static str {
        "wati"
    }

    async fn send_invoice(&self, notice: &InvoiceNotice) -> Result<(), NotifyError> {
        let phone = notice
            .phone
            .as_deref()
            .map(format_phone)
            .filter(|p| !p.is_empty())
            .ok_or(NotifyError::MissingPhone)?;

        let url = format!("{}/api/v1/sendTemplateMessage", self.base_url);
        let body = TemplateMessage {
            whatsapp_number: &phone,
            template_name: INVOICE_TEMPLATE,
            broadcast_name: format!("settlement_{}", notice.invoice_number),
            parameters: template_parameters(&[&notice.customer_name, &notice.booking_number]),
        };

        let resp = self
            .client
            .post(&url)
            .bearer_auth(self.api_token.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(friendly_error(&self.base_url, &e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status_error(status)));
        }

        let parsed: WatiResponse = resp
            .json()
            .await
            .map_err(|e| NotifyError::Transport(format!("Invalid WATI response: {e}")))?;
        if !parsed.result {
            return Err(NotifyError::Rejected(
                parsed
                    .info
                    .unwrap_or_else(|| "Failed to send template message".into()),
            ));
        }

        info!(
            invoice_number = %notice.invoice_number,
            template = INVOICE_TEMPLATE,
            "invoice message sent"
        );
        Ok(())
    }
}

/// Digits only; ten-digit numbers get the `91` country code.
pub fn format_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 10 {
        format!("91{digits}")
    } else {
        digits
    }
}

fn template_parameters(values: &[&str]) -> Vec<TemplateParameter> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| TemplateParameter {
            name: (i + 1).to_string(),
            value: (*v).to_string(),
        })
        .collect()
}

fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach WhatsApp provider at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid WhatsApp provider URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 | 403 => "WhatsApp API token is invalid or expired".to_string(),
        404 => "WhatsApp template endpoint not found".to_string(),
        s if s >= 500 => format!("WhatsApp provider server error (HTTP {s})"),
        s => format!("Unexpected response from WhatsApp provider (HTTP {s})"),
    }
}
