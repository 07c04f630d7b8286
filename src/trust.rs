//! Web-of-Trust scoring gate consulted before settlement.
//!
//! The checker is advisory: payments below the USD threshold skip it
//! entirely, and any transport or parse failure of the trust service allows
//! the payment through. Only an affirmative low score blocks.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Minimum trust score (0-1) required for payments.
pub const DEFAULT_MIN_SCORE: f64 = 0.001;
/// USD amount at or above which the trust check runs.
pub const DEFAULT_THRESHOLD_USD: f64 = 0.10;

/// A trust score result for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustScore {
    pub pubkey: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
#[error("recipient {recipient} has low trust score ({score:.6} < {min_score:.6} minimum)")]
pub struct TrustError {
    pub recipient: String,
    pub score: f64,
    pub min_score: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum TrustFetchError {
    #[error("trust request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("trust service HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("parse trust score: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Checks trust scores before allowing payments.
#[derive(Debug, Clone)]
pub struct TrustChecker {
    endpoint: Url,
    client: Client,
    pub min_score: f64,
    pub threshold_usd: f64,
}

impl TrustChecker {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("trust HTTP client"),
            min_score: DEFAULT_MIN_SCORE,
            threshold_usd: DEFAULT_THRESHOLD_USD,
        }
    }

    /// Verifies the trust score for a payment recipient.
    ///
    /// Returns `Ok` when the amount is below the threshold, when the trust
    /// service is unreachable, or when the score clears `min_score`.
    pub async fn check_trust(&self, recipient: &str, usd_amount: f64) -> Result<(), TrustError> {
        if usd_amount < self.threshold_usd {
            return Ok(());
        }

        let score = match self.score(recipient).await {
            Ok(score) => score,
            Err(err) => {
                tracing::warn!(recipient, error = %err, "trust service unavailable, allowing payment");
                return Ok(());
            }
        };

        if score.score < self.min_score {
            return Err(TrustError {
                recipient: recipient.to_string(),
                score: score.score,
                min_score: self.min_score,
            });
        }

        Ok(())
    }

    /// Fetches the trust score for an identifier.
    pub async fn score(&self, id: &str) -> Result<TrustScore, TrustFetchError> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[("pubkey", id)])
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if status.as_u16() != 200 {
            return Err(TrustFetchError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(serde_json::from_slice(&body)?)
    }
}
