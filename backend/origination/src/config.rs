//! Application configuration loaded from environment variables.

use crate::errors::{OriginationError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Shared secret expected in `x-webhook-secret` on KYC webhooks
    pub kyc_webhook_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./origination.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .map_err(|_| OriginationError::Config("Invalid API_PORT".to_string()))?,
            kyc_webhook_secret: env_var("KYC_WEBHOOK_SECRET").ok(),
        })
    }
}

/// Endpoints and credentials of the third-party services.
#[derive(Debug, Clone)]
pub struct VendorConfig {
    pub kyc_api_url: Option<String>,
    pub kyc_api_key: Option<String>,
    pub bank_api_url: Option<String>,
    pub bank_client_id: Option<String>,
    pub bank_secret: Option<String>,
    /// When unset, the mock e-signature service is used.
    pub esign_api_url: Option<String>,
    /// When unset, notifications are only logged.
    pub notify_api_url: Option<String>,
    pub notify_api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            kyc_api_url: None,
            kyc_api_key: None,
            bank_api_url: None,
            bank_client_id: None,
            bank_secret: None,
            esign_api_url: None,
            notify_api_url: None,
            notify_api_key: None,
            timeout_secs: 30,
        }
    }
}

impl VendorConfig {
    pub fn from_env() -> Result<Self> {
        Ok(VendorConfig {
            kyc_api_url: env_var("KYC_API_URL").ok(),
            kyc_api_key: env_var("KYC_API_KEY").ok(),
            bank_api_url: env_var("BANK_API_URL").ok(),
            bank_client_id: env_var("BANK_CLIENT_ID").ok(),
            bank_secret: env_var("BANK_SECRET").ok(),
            esign_api_url: env_var("ESIGN_API_URL").ok(),
            notify_api_url: env_var("NOTIFY_API_URL").ok(),
            notify_api_key: env_var("NOTIFY_API_KEY").ok(),
            timeout_secs: env_var("VENDOR_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| OriginationError::Config("Invalid VENDOR_TIMEOUT_SECS".to_string()))?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| OriginationError::Config(format!("Missing env var: {key}")))
}
