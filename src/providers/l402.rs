//! Lightning L402 settlement via an LNbits wallet.
//!
//! Cost estimation extracts the amount from the BOLT11 invoice prefix; no
//! further invoice decoding is attempted. Settlement pays the invoice through
//! the LNbits payments API and builds the `Authorization: L402 …` proof.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use crate::protocol::{PaymentChallenge, Protocol};
use crate::provider::{BoxError, CostEstimate, PaymentProvider, ProofHeader};

/// Default price of 1 sat in USD (~$100K/BTC).
pub const DEFAULT_SAT_PRICE_USD: f64 = 0.00001;

#[derive(Debug, thiserror::Error)]
pub enum L402Error {
    #[error("no Lightning invoice")]
    NoInvoice,
    #[error("decode invoice: {0}")]
    Invoice(#[from] Bolt11Error),
    #[error("LNbits pay HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("pay request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("parse pay response: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Bolt11Error {
    #[error("not a valid BOLT11 invoice")]
    InvalidPrefix,
    #[error("no amount in invoice")]
    MissingAmount,
    #[error("invalid amount character: {0}")]
    InvalidAmountChar(char),
    #[error("unknown multiplier: {0}")]
    UnknownMultiplier(char),
}

/// L402 (Lightning) payment provider backed by LNbits.
pub struct L402Provider {
    lnbits_url: String,
    admin_key: String,
    client: Client,
    /// Current price of 1 sat in USD, used for cost estimation.
    pub sat_price_usd: f64,
}

impl L402Provider {
    pub fn new(lnbits_url: impl Into<String>, admin_key: impl Into<String>) -> Self {
        let lnbits_url: String = lnbits_url.into();
        Self {
            lnbits_url: lnbits_url.trim_end_matches('/').to_string(),
            admin_key: admin_key.into(),
            client: Client::new(),
            sat_price_usd: DEFAULT_SAT_PRICE_USD,
        }
    }
}

fn invoice_of(challenge: &PaymentChallenge) -> Result<(&str, Option<&str>), L402Error> {
    match challenge {
        PaymentChallenge::L402 {
            invoice,
            payment_hash,
            ..
        } if !invoice.is_empty() => Ok((invoice, payment_hash.as_deref())),
        _ => Err(L402Error::NoInvoice),
    }
}

#[async_trait]
impl PaymentProvider for L402Provider {
    fn protocol(&self) -> Protocol {
        Protocol::L402
    }

    fn estimate_cost(&self, challenge: &PaymentChallenge) -> Result<CostEstimate, BoxError> {
        let (invoice, _) = invoice_of(challenge)?;
        let sats = decode_bolt11_amount(invoice).map_err(L402Error::Invoice)?;
        let usd = sats as f64 * self.sat_price_usd;
        Ok(CostEstimate {
            usd,
            description: format!("{sats} sats (${usd:.4})"),
        })
    }

    #[instrument(skip_all)]
    async fn pay(&self, challenge: &PaymentChallenge) -> Result<ProofHeader, BoxError> {
        let (invoice, challenge_hash) = invoice_of(challenge)?;

        let response = self
            .client
            .post(format!("{}/api/v1/payments", self.lnbits_url))
            .header("X-Api-Key", &self.admin_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&json!({ "out": true, "bolt11": invoice }))
            .send()
            .await
            .map_err(L402Error::Transport)?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(L402Error::Transport)?;
        if status != 200 && status != 201 {
            return Err(L402Error::Api {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            }
            .into());
        }

        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct PayResponse {
            payment_hash: String,
        }
        let paid: PayResponse = serde_json::from_slice(&body).map_err(L402Error::Parse)?;

        // Proof carries the challenge hash alongside the settled payment hash
        let value = format!(
            "L402 {}:{}",
            challenge_hash.unwrap_or_default(),
            paid.payment_hash
        );
        Ok(ProofHeader {
            name: "Authorization".to_string(),
            value,
        })
    }
}

/// Extracts the amount in sats from a BOLT11 invoice string.
///
/// BOLT11 format: `lnbc<amount><multiplier>1…` — the amount sits between the
/// human-readable prefix and the `1` separator before the data part.
pub fn decode_bolt11_amount(invoice: &str) -> Result<u64, Bolt11Error> {
    let invoice = invoice.to_lowercase();
    let prefix = ["lnbcrt", "lntbs", "lntb", "lnbc"]
        .into_iter()
        .find(|prefix| invoice.starts_with(prefix))
        .ok_or(Bolt11Error::InvalidPrefix)?;

    let rest = &invoice[prefix.len()..];

    // The last '1' separates the amount from the data part
    let sep_idx = rest.rfind('1').ok_or(Bolt11Error::MissingAmount)?;
    if sep_idx < 1 {
        return Err(Bolt11Error::MissingAmount);
    }
    let amount = &rest[..sep_idx];

    let multiplier = amount.as_bytes()[amount.len() - 1] as char;
    let mut num: u64 = 0;
    for c in amount[..amount.len() - 1].chars() {
        let digit = c.to_digit(10).ok_or(Bolt11Error::InvalidAmountChar(c))?;
        num = num.saturating_mul(10).saturating_add(digit as u64);
    }

    // Multipliers: m=milli, u=micro, n=nano, p=pico of 1 BTC (100,000,000 sats)
    match multiplier {
        'm' => Ok(num.saturating_mul(100_000)),
        'u' => Ok(num.saturating_mul(100)),
        'n' => Ok(num / 10),
        'p' => Ok(num / 10_000),
        digit @ '0'..='9' => {
            // No multiplier: the amount is whole BTC
            let num = num
                .saturating_mul(10)
                .saturating_add(digit as u64 - '0' as u64);
            Ok(num.saturating_mul(100_000_000))
        }
        other => Err(Bolt11Error::UnknownMultiplier(other)),
    }
}
