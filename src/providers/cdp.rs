//! x402 settlement through the Coinbase Developer Platform wallet API.
//!
//! This provider signs EIP-712 typed data directly through the CDP API for
//! EIP-3009 `TransferWithAuthorization`, then encodes the resulting x402
//! payment envelope as the base64 `Payment` header value.
//!
//! CDP requests are authenticated with two ES256 JWTs: a Bearer token on
//! every call, plus a wallet-auth token carrying a hash of the canonicalized
//! body on signing endpoints.

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use rand::rngs::OsRng;
use rand::TryRngCore;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime};
use tracing::instrument;

use crate::chain::ChainId;
use crate::protocol::{PaymentChallenge, Protocol, X402Accept};
use crate::provider::{BoxError, CostEstimate, PaymentProvider, ProofHeader};
use crate::util::canonicalize_bytes;

const DEFAULT_API_BASE: &str = "https://api.cdp.coinbase.com";
/// Chain id assumed when an accept entry's network reference does not parse.
const FALLBACK_CHAIN_ID: u64 = 84532;
/// Authorization validity window.
const VALID_FOR_SECS: u64 = 10 * 60;

#[derive(Debug, thiserror::Error)]
pub enum CdpError {
    #[error("CDP provider not initialized — call init first")]
    NotInitialized,
    #[error("no x402 payment options")]
    NoPaymentOptions,
    #[error("no parseable payment amounts")]
    NoParseableAmounts,
    #[error("no EVM payment option found")]
    NoEvmOption,
    #[error("decode key: {0}")]
    KeyDecode(#[source] base64::DecodeError),
    #[error("invalid P-256 key: {0}")]
    InvalidKey(#[source] p256::ecdsa::Error),
    #[error("CDP API {method} {path}: HTTP {status}: {body}")]
    Api {
        method: String,
        path: String,
        status: u16,
        body: String,
    },
    #[error("CDP request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("parse CDP response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// x402 (USDC) payment provider backed by CDP-managed wallets.
///
/// Requires CDP API credentials from portal.cdp.coinbase.com. The wallet
/// address is resolved by [`CdpProvider::init`] before the first payment.
pub struct CdpProvider {
    api_key_id: String,
    api_key_secret: String,
    wallet_secret: String,
    base_url: String,
    address: Option<String>,
    client: Client,
}

impl CdpProvider {
    pub fn new(
        api_key_id: impl Into<String>,
        api_key_secret: impl Into<String>,
        wallet_secret: impl Into<String>,
    ) -> Self {
        Self {
            api_key_id: api_key_id.into(),
            api_key_secret: api_key_secret.into(),
            wallet_secret: wallet_secret.into(),
            base_url: DEFAULT_API_BASE.to_string(),
            address: None,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("CDP HTTP client"),
        }
    }

    /// Overrides the API base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// The CDP wallet address, once initialized.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Creates or retrieves the CDP EVM account. Must be called before `pay`.
    #[instrument(skip(self))]
    pub async fn init(&mut self, wallet_name: &str) -> Result<(), CdpError> {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct AccountList {
            accounts: Vec<Account>,
        }
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Account {
            address: String,
            name: String,
        }

        // Try to get the existing account first
        let path = format!("/platform/v2/evm/accounts?name={wallet_name}");
        let response = self.api_request(Method::GET, &path, None).await?;
        if let Ok(list) = serde_json::from_slice::<AccountList>(&response) {
            if let Some(account) = list.accounts.into_iter().find(|a| a.name == wallet_name) {
                self.address = Some(account.address);
                return Ok(());
            }
        }

        #[derive(Deserialize)]
        struct Created {
            address: String,
        }
        let response = self
            .api_request(
                Method::POST,
                "/platform/v2/evm/accounts",
                Some(json!({ "name": wallet_name })),
            )
            .await?;
        let created: Created = serde_json::from_slice(&response)?;
        self.address = Some(created.address);
        Ok(())
    }

    /// Requests testnet tokens from the CDP faucet.
    pub async fn request_faucet(&self, network: &str, token: &str) -> Result<(), CdpError> {
        let address = self.address.as_deref().ok_or(CdpError::NotInitialized)?;
        self.api_request(
            Method::POST,
            "/platform/v2/evm/faucet",
            Some(json!({ "address": address, "network": network, "token": token })),
        )
        .await?;
        Ok(())
    }

    /// Makes an authenticated request to the CDP API.
    async fn api_request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Vec<u8>, CdpError> {
        let url = format!("{}{}", self.base_url, path);
        let bearer = self.bearer_jwt(&method, path)?;

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(AUTHORIZATION, format!("Bearer {bearer}"))
            .header(CONTENT_TYPE, "application/json");

        if let Some(body) = &body {
            let body_bytes = serde_json::to_vec(body)?;
            // Signing endpoints additionally require wallet-level auth
            if path.contains("/sign/") {
                let wallet_auth = self.wallet_auth_jwt(&method, path, &body_bytes)?;
                request = request.header("X-Wallet-Auth", wallet_auth);
            }
            request = request.body(body_bytes);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;

        if status >= 400 {
            return Err(CdpError::Api {
                method: method.to_string(),
                path: path.to_string(),
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        Ok(bytes.to_vec())
    }

    /// JWT signed with the API key, sent as `Authorization: Bearer …`.
    fn bearer_jwt(&self, method: &Method, path: &str) -> Result<String, CdpError> {
        let now = unix_now();
        let header = JwtHeader {
            alg: "ES256",
            typ: "JWT",
            kid: Some(&self.api_key_id),
        };
        let claims = JwtClaims {
            sub: &self.api_key_id,
            iss: "cdp",
            aud: ["cdp_service"],
            nbf: now,
            exp: now + 120,
            uris: [format!("{} {}{}", method, self.base_url, path)],
            body_hash: None,
        };
        encode_jwt(&header, &claims, &self.api_key_secret)
    }

    /// JWT for the `X-Wallet-Auth` header, binding a hash of the request body.
    fn wallet_auth_jwt(&self, method: &Method, path: &str, body: &[u8]) -> Result<String, CdpError> {
        let now = unix_now();
        let body_hash = Sha256::digest(canonicalize_bytes(body));
        let header = JwtHeader {
            alg: "ES256",
            typ: "JWT",
            kid: None,
        };
        let claims = JwtClaims {
            sub: &self.api_key_id,
            iss: "cdp",
            aud: ["cdp_service"],
            nbf: now,
            exp: now + 60,
            uris: [format!("{} {}{}", method, self.base_url, path)],
            body_hash: Some(URL_SAFE_NO_PAD.encode(body_hash)),
        };
        encode_jwt(&header, &claims, &self.wallet_secret)
    }
}

#[async_trait]
impl PaymentProvider for CdpProvider {
    fn protocol(&self) -> Protocol {
        Protocol::X402
    }

    fn estimate_cost(&self, challenge: &PaymentChallenge) -> Result<CostEstimate, BoxError> {
        let accepts = x402_accepts(challenge)?;
        let (usd, accept) = cheapest_accept(accepts)?;
        Ok(CostEstimate {
            usd,
            description: format!("${usd:.4} USDC on {} (CDP)", accept.network),
        })
    }

    /// Settles by signing an EIP-712 `TransferWithAuthorization` through CDP.
    ///
    /// Pays the first `eip155:` accept entry, which is not necessarily the
    /// cheapest one `estimate_cost` priced.
    #[instrument(skip_all)]
    async fn pay(&self, challenge: &PaymentChallenge) -> Result<ProofHeader, BoxError> {
        let address = self.address.as_deref().ok_or(CdpError::NotInitialized)?;
        let accepts = x402_accepts(challenge)?;
        let accept = accepts
            .iter()
            .find(|accept| accept.network.starts_with("eip155:"))
            .ok_or(CdpError::NoEvmOption)?;

        let nonce = generate_nonce();
        let valid_after = "0";
        let valid_before = (unix_now() + VALID_FOR_SECS).to_string();
        let chain_id = accept
            .network
            .parse::<ChainId>()
            .ok()
            .and_then(|chain| chain.eip155_reference())
            .unwrap_or(FALLBACK_CHAIN_ID);

        let typed_data = json!({
            "domain": {
                "name": "USD Coin",
                "version": "2",
                "chainId": chain_id,
                "verifyingContract": accept.asset,
            },
            "types": {
                "EIP712Domain": [
                    { "name": "name", "type": "string" },
                    { "name": "version", "type": "string" },
                    { "name": "chainId", "type": "uint256" },
                    { "name": "verifyingContract", "type": "address" },
                ],
                "TransferWithAuthorization": [
                    { "name": "from", "type": "address" },
                    { "name": "to", "type": "address" },
                    { "name": "value", "type": "uint256" },
                    { "name": "validAfter", "type": "uint256" },
                    { "name": "validBefore", "type": "uint256" },
                    { "name": "nonce", "type": "bytes32" },
                ],
            },
            "primaryType": "TransferWithAuthorization",
            "message": {
                "from": address,
                "to": accept.pay_to,
                "value": accept.max_amount_required,
                "validAfter": valid_after,
                "validBefore": valid_before,
                "nonce": nonce,
            },
        });

        let path = format!("/platform/v2/evm/accounts/{address}/sign/typed-data");
        let response = self.api_request(Method::POST, &path, Some(typed_data)).await?;

        #[derive(Deserialize)]
        struct SignResponse {
            signature: String,
        }
        let signed: SignResponse = serde_json::from_slice(&response).map_err(CdpError::Parse)?;

        let envelope = json!({
            "x402Version": 1,
            "scheme": accept.scheme,
            "network": accept.network,
            "payload": {
                "signature": signed.signature,
                "from": address,
                "to": accept.pay_to,
                "value": accept.max_amount_required,
                "validAfter": valid_after,
                "validBefore": valid_before,
                "nonce": nonce,
            },
        });
        let envelope_bytes = serde_json::to_vec(&envelope).map_err(CdpError::Parse)?;

        tracing::debug!(network = %accept.network, value = %accept.max_amount_required, "signed x402 payment envelope");

        Ok(ProofHeader {
            name: "Payment".to_string(),
            value: STANDARD.encode(&envelope_bytes),
        })
    }
}

fn x402_accepts(challenge: &PaymentChallenge) -> Result<&[X402Accept], CdpError> {
    match challenge {
        PaymentChallenge::X402 { requirement, .. } if !requirement.accepts.is_empty() => {
            Ok(&requirement.accepts)
        }
        _ => Err(CdpError::NoPaymentOptions),
    }
}

/// Selects the cheapest accept entry, skipping unparseable amounts.
///
/// USD is `maxAmountRequired / 10^6` (USDC base units). Ties resolve to the
/// earliest entry.
fn cheapest_accept(accepts: &[X402Accept]) -> Result<(f64, &X402Accept), CdpError> {
    let mut cheapest: Option<(f64, &X402Accept)> = None;
    for accept in accepts {
        let Ok(units) = accept.max_amount_required.parse::<u64>() else {
            continue;
        };
        let usd = units as f64 / 1e6;
        if cheapest.as_ref().is_none_or(|(best, _)| usd < *best) {
            cheapest = Some((usd, accept));
        }
    }
    cheapest.ok_or(CdpError::NoParseableAmounts)
}

/// Seconds since the Unix epoch, for JWT `nbf`/`exp` claims and the
/// authorization validity window.
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("SystemTime before UNIX epoch?!?")
        .as_secs()
}

/// Creates a random 32-byte nonce as a `0x`-prefixed hex string.
fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => format!("0x{}", hex::encode(bytes)),
        Err(_) => {
            // Timestamp-derived fallback, still 0x + 64 hex chars
            let nanos = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            format!("0x{nanos:064x}")
        }
    }
}

#[derive(Serialize)]
struct JwtHeader<'a> {
    alg: &'a str,
    typ: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    sub: &'a str,
    iss: &'a str,
    aud: [&'a str; 1],
    nbf: u64,
    exp: u64,
    uris: [String; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    body_hash: Option<String>,
}

fn encode_jwt(
    header: &JwtHeader<'_>,
    claims: &JwtClaims<'_>,
    key_base64: &str,
) -> Result<String, CdpError> {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?);
    let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature = sign_es256(key_base64, signing_input.as_bytes())?;
    Ok(format!(
        "{signing_input}.{}",
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

/// Signs with an ECDSA P-256 key given as base64 of the raw 32-byte scalar.
///
/// The signature is IEEE P1363 `r || s`, 64 bytes.
fn sign_es256(key_base64: &str, data: &[u8]) -> Result<Vec<u8>, CdpError> {
    let key_bytes = STANDARD
        .decode(key_base64)
        .or_else(|_| URL_SAFE_NO_PAD.decode(key_base64))
        .map_err(CdpError::KeyDecode)?;
    let signing_key = SigningKey::from_slice(&key_bytes).map_err(CdpError::InvalidKey)?;
    let signature: Signature = signing_key.sign(data);
    Ok(signature.to_bytes().to_vec())
}
