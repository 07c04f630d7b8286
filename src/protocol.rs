//! Payment challenge detection and the parsed requirement model.
//!
//! A 402 response can signal its payment requirement in several encodings.
//! [`detect`] normalizes them into a single [`PaymentChallenge`] value:
//!
//! 1. A `Payment-Required` (or legacy `X-Payment-Required`) header holding
//!    base64-encoded JSON — the x402 protocol.
//! 2. A `WWW-Authenticate` header with an `L402` or `LSAT` challenge — the
//!    Lightning L402 protocol.
//! 3. A JSON body carrying `invoice` (or `pr`) and an optional
//!    `payment_hash` — L402 conveyed in-band.
//!
//! Detection is a pure function of the response headers and the buffered body.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A payment protocol the router can settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// USDC via EIP-3009 authorizations carried in a base64 header.
    X402,
    /// Lightning Network invoice with proof carried as `Authorization: L402 …`.
    L402,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::X402 => write!(f, "x402"),
            Protocol::L402 => write!(f, "L402"),
        }
    }
}

/// A single payment option within an x402 challenge.
///
/// Amounts are decimal strings in base units of `asset`; `network` is a
/// CAIP-2 style `namespace:reference` string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct X402Accept {
    pub scheme: String,
    pub network: String,
    pub max_amount_required: String,
    pub resource: String,
    pub description: String,
    pub mime_type: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    pub asset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// The decoded body of an x402 `Payment-Required` header.
///
/// Order of `accepts` is server-provided and significant: settlement
/// tie-breaks resolve to the earliest entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct X402Requirement {
    #[serde(default)]
    pub accepts: Vec<X402Accept>,
}

/// A parsed 402 challenge, one branch per protocol.
///
/// Constructed only by [`detect`]; each branch keeps the original encoded
/// form in `raw` so providers can forward it verbatim when useful.
#[derive(Debug, Clone)]
pub enum PaymentChallenge {
    X402 {
        raw: String,
        requirement: X402Requirement,
    },
    L402 {
        raw: String,
        invoice: String,
        payment_hash: Option<String>,
    },
}

impl PaymentChallenge {
    pub fn protocol(&self) -> Protocol {
        match self {
            PaymentChallenge::X402 { .. } => Protocol::X402,
            PaymentChallenge::L402 { .. } => Protocol::L402,
        }
    }

    /// The identifier the trust checker scores: the first accept entry's
    /// `payTo` for x402, the payment hash for L402.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            PaymentChallenge::X402 { requirement, .. } => requirement
                .accepts
                .first()
                .map(|accept| accept.pay_to.as_str())
                .filter(|pay_to| !pay_to.is_empty()),
            PaymentChallenge::L402 { payment_hash, .. } => {
                payment_hash.as_deref().filter(|hash| !hash.is_empty())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("unknown payment protocol")]
    UnknownProtocol,
    #[error("parse x402 header: {0}")]
    ParseX402(#[source] serde_json::Error),
    #[error("malformed L402 challenge")]
    MalformedL402,
    #[error("missing invoice in L402 challenge")]
    MissingInvoice,
}

/// Examines a 402 response and determines the payment protocol.
///
/// Pure: reads only the supplied headers and buffered body. First match wins;
/// a body that fails to parse as JSON is not an error, just no match.
pub fn detect(headers: &HeaderMap, body: &[u8]) -> Result<PaymentChallenge, DetectError> {
    // x402: payment-required header (v2) or x-payment-required (v1)
    let payment_header = header_value(headers, "Payment-Required")
        .or_else(|| header_value(headers, "X-Payment-Required"));
    if let Some(header) = payment_header {
        return parse_x402_header(header);
    }

    // L402: WWW-Authenticate header with an LSAT or L402 challenge
    if let Some(auth_header) = header_value(headers, "WWW-Authenticate") {
        if auth_header.starts_with("L402 ") || auth_header.starts_with("LSAT ") {
            return parse_l402_challenge(auth_header);
        }
    }

    // L402-style payment info in the body
    if !body.is_empty() {
        return parse_l402_body(body);
    }

    Err(DetectError::UnknownProtocol)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

fn parse_x402_header(header: &str) -> Result<PaymentChallenge, DetectError> {
    // x402 headers are base64-encoded JSON; fall back to raw JSON
    let decoded = STANDARD
        .decode(header)
        .unwrap_or_else(|_| header.as_bytes().to_vec());

    let requirement = match serde_json::from_slice::<X402Requirement>(&decoded) {
        Ok(requirement) => requirement,
        Err(err) => {
            // Try as a bare array of accept entries
            let accepts = serde_json::from_slice::<Vec<X402Accept>>(&decoded)
                .map_err(|_| DetectError::ParseX402(err))?;
            X402Requirement { accepts }
        }
    };

    Ok(PaymentChallenge::X402 {
        raw: header.to_string(),
        requirement,
    })
}

fn parse_l402_challenge(header: &str) -> Result<PaymentChallenge, DetectError> {
    // Format: LSAT macaroon="...", invoice="..."
    // or: L402 token="...", invoice="..."
    let (_, params) = header.split_once(' ').ok_or(DetectError::MalformedL402)?;
    let params = parse_header_params(params);

    let invoice = params
        .get("invoice")
        .filter(|invoice| !invoice.is_empty())
        .ok_or(DetectError::MissingInvoice)?;

    Ok(PaymentChallenge::L402 {
        raw: header.to_string(),
        invoice: invoice.clone(),
        payment_hash: params
            .get("payment_hash")
            .filter(|hash| !hash.is_empty())
            .cloned(),
    })
}

fn parse_l402_body(body: &[u8]) -> Result<PaymentChallenge, DetectError> {
    #[derive(Deserialize, Default)]
    #[serde(default)]
    struct L402Body {
        invoice: String,
        payment_hash: String,
        pr: String,
    }

    let data: L402Body =
        serde_json::from_slice(body).map_err(|_| DetectError::UnknownProtocol)?;

    let invoice = if !data.invoice.is_empty() {
        data.invoice
    } else if !data.pr.is_empty() {
        data.pr
    } else {
        return Err(DetectError::UnknownProtocol);
    };

    Ok(PaymentChallenge::L402 {
        raw: String::from_utf8_lossy(body).into_owned(),
        invoice,
        payment_hash: if data.payment_hash.is_empty() {
            None
        } else {
            Some(data.payment_hash)
        },
    })
}

/// Parses `key="value"` pairs from a challenge header.
fn parse_header_params(s: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for part in s.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            params.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    params
}
