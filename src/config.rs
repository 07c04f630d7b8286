//! Configuration file loading for the CLI.
//!
//! Settings live in a JSON file at `$PAY402_CONFIG` or `~/.pay402/config.json`.
//! Budget values of zero are treated as unset and replaced with defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Default WoT scoring endpoint used when none is configured.
pub const DEFAULT_WOT_ENDPOINT: &str = "https://maximumsats.joel-dfd.workers.dev/wot/score";

/// All configuration for the payment router CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cdp: CdpConfig,
    pub lnbits: LnbitsConfig,
    pub wot: WotConfig,
    pub budget: BudgetConfig,
}

/// Coinbase Developer Platform (x402) credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CdpConfig {
    pub api_key_id: String,
    pub api_key_secret: String,
    pub wallet_secret: String,
    pub wallet_name: String,
}

/// LNbits (Lightning/L402) settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LnbitsConfig {
    pub url: String,
    pub admin_key: String,
}

/// Web of Trust scoring settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WotConfig {
    pub enabled: bool,
    pub endpoint: String,
}

/// Spending limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_per_request_usd: f64,
    pub max_session_usd: f64,
}

mod config_defaults {
    pub const MAX_PER_REQUEST_USD: f64 = 1.0;
    pub const MAX_SESSION_USD: f64 = 10.0;
    pub const WALLET_NAME: &str = "pay402";
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config at {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl AppConfig {
    /// Loads configuration from the default path.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(Self::path())
    }

    /// Loads configuration from a specific file.
    pub fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(&path).map_err(|source| ConfigError::FileRead {
            path: path.clone(),
            source,
        })?;
        let mut config: AppConfig = serde_json::from_str(&data)?;
        config.apply_defaults();
        Ok(config)
    }

    /// The config file path: `$PAY402_CONFIG` or `~/.pay402/config.json`.
    pub fn path() -> PathBuf {
        if let Ok(path) = std::env::var("PAY402_CONFIG") {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".pay402").join("config.json")
    }

    fn apply_defaults(&mut self) {
        if self.budget.max_per_request_usd == 0.0 {
            self.budget.max_per_request_usd = config_defaults::MAX_PER_REQUEST_USD;
        }
        if self.budget.max_session_usd == 0.0 {
            self.budget.max_session_usd = config_defaults::MAX_SESSION_USD;
        }
        if self.cdp.wallet_name.is_empty() {
            self.cdp.wallet_name = config_defaults::WALLET_NAME.to_string();
        }
        if self.wot.endpoint.is_empty() {
            self.wot.endpoint = DEFAULT_WOT_ENDPOINT.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "cdp": {"api_key_id": "org/key", "api_key_secret": "s1", "wallet_secret": "s2", "wallet_name": "agent"},
            "lnbits": {"url": "https://lnbits.test", "admin_key": "adm"},
            "wot": {"enabled": true, "endpoint": "https://wot.test/score"},
            "budget": {"max_per_request_usd": 0.5, "max_session_usd": 2.0}
        }"#;
        let mut config: AppConfig = serde_json::from_str(json).unwrap();
        config.apply_defaults();
        assert_eq!(config.cdp.wallet_name, "agent");
        assert_eq!(config.budget.max_per_request_usd, 0.5);
        assert_eq!(config.wot.endpoint, "https://wot.test/score");
    }

    #[test]
    fn test_empty_config_gets_defaults() {
        let mut config: AppConfig = serde_json::from_str("{}").unwrap();
        config.apply_defaults();
        assert_eq!(config.budget.max_per_request_usd, 1.0);
        assert_eq!(config.budget.max_session_usd, 10.0);
        assert_eq!(config.cdp.wallet_name, "pay402");
        assert_eq!(config.wot.endpoint, DEFAULT_WOT_ENDPOINT);
        assert!(config.cdp.api_key_id.is_empty());
    }

    #[test]
    fn test_zero_budget_treated_as_unset() {
        let json = r#"{"budget": {"max_per_request_usd": 0.0, "max_session_usd": 0.0}}"#;
        let mut config: AppConfig = serde_json::from_str(json).unwrap();
        config.apply_defaults();
        assert_eq!(config.budget.max_per_request_usd, 1.0);
        assert_eq!(config.budget.max_session_usd, 10.0);
    }
}
