//! Process configuration, read once from the environment at startup.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;
use zeroize::Zeroizing;

use crate::diagnostics;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} is not a valid socket address: {value}")]
    InvalidAddress { name: &'static str, value: String },

    #[error("{name} must start with http:// or https://, got {value}")]
    InvalidUrl { name: &'static str, value: String },

    #[error("{present} is set but {missing} is not")]
    Incomplete {
        present: &'static str,
        missing: &'static str,
    },

    #[error("{0} is set but empty")]
    Empty(&'static str),
}

/// WhatsApp provider credentials. Both halves are required together.
#[derive(Clone)]
pub struct WatiConfig {
    pub base_url: String,
    pub api_token: Zeroizing<String>,
}

impl std::fmt::Debug for WatiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatiConfig")
            .field("base_url", &self.base_url)
            .field("api_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub bind_address: SocketAddr,
    pub log_dir: PathBuf,
    pub invoice_dir: PathBuf,
    pub wati: Option<WatiConfig>,
}

impl AppConfig {
    /// Read `SETTLEMENT_*`, `WATI_*` and `INVOICE_DOCUMENT_DIR`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = var("SETTLEMENT_DATA_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(|| diagnostics::app_data_dir().join("data"));

        let raw_bind = var("SETTLEMENT_BIND_ADDRESS")?.unwrap_or_else(|| DEFAULT_BIND_ADDRESS.into());
        let bind_address = raw_bind
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidAddress {
                name: "SETTLEMENT_BIND_ADDRESS",
                value: raw_bind.clone(),
            })?;

        let log_dir = var("SETTLEMENT_LOG_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(diagnostics::get_log_dir);
        let invoice_dir = var("INVOICE_DOCUMENT_DIR")?
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("invoices"));

        let wati = match (var("WATI_BASE_URL")?, var("WATI_API_TOKEN")?) {
            (Some(base_url), Some(token)) => {
                if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                    return Err(ConfigError::InvalidUrl {
                        name: "WATI_BASE_URL",
                        value: base_url,
                    });
                }
                Some(WatiConfig {
                    base_url,
                    api_token: Zeroizing::new(token),
                })
            }
            (Some(_), None) => {
                return Err(ConfigError::Incomplete {
                    present: "WATI_BASE_URL",
                    missing: "WATI_API_TOKEN",
                })
            }
            (None, Some(_)) => {
                return Err(ConfigError::Incomplete {
                    present: "WATI_API_TOKEN",
                    missing: "WATI_BASE_URL",
                })
            }
            (None, None) => None,
        };

        Ok(Self {
            data_dir,
            bind_address,
            log_dir,
            invoice_dir,
            wati,
        })
    }
}

/// Unset is `None`; set-but-blank is an error.
fn var(name: &'static str) -> Result<Option<String>, ConfigError> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Err(ConfigError::Empty(name)),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(_) => Ok(None),
    }
}
