//! The payment router: send, detect, gate, settle, retry, record.
//!
//! [`Router::fetch`] sends an HTTP request and handles any 402 payment
//! requirement transparently. The request body is buffered up front so the
//! retry replays exactly the same bytes; callers passing an unbounded stream
//! are an explicit non-use-case.

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::ledger::{BudgetError, BudgetLedger, Receipt};
use crate::protocol::{detect, DetectError, PaymentChallenge, Protocol};
use crate::provider::{BoxError, PaymentProvider};
use crate::trust::{TrustChecker, TrustError};

/// Router configuration.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Maximum USD amount allowed per single request. Zero disables the cap.
    pub max_per_request_usd: f64,
    /// Total USD budget for the session. Zero disables the cap.
    pub max_session_usd: f64,
    /// Report what would be paid without settling.
    pub dry_run: bool,
}

/// The final response of a routed fetch.
#[derive(Debug)]
pub struct FetchResponse {
    pub body: Vec<u8>,
    /// Present when a payment was made (or, in dry-run mode, priced).
    pub receipt: Option<Receipt>,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("detect protocol: {0}")]
    Detect(#[from] DetectError),
    #[error("no payment provider configured for {0}")]
    NoProvider(Protocol),
    #[error("estimate cost: {0}")]
    Estimate(#[source] BoxError),
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error("trust check failed: {0}")]
    Trust(#[from] TrustError),
    #[error("{protocol} payment of {amount} failed: {source}")]
    Payment {
        protocol: Protocol,
        amount: String,
        #[source]
        source: BoxError,
    },
    #[error("retry HTTP {status}: {body}")]
    RetryHttp { status: u16, body: String },
}

/// Cross-protocol payment router.
///
/// Safe for concurrent `fetch` calls from multiple tasks; the only shared
/// mutable state is the budget ledger, which serializes itself. Providers are
/// registered before the first fetch; at most one per protocol, last wins.
pub struct Router {
    dry_run: bool,
    providers: HashMap<Protocol, Arc<dyn PaymentProvider>>,
    client: Client,
    trust: Option<TrustChecker>,
    ledger: BudgetLedger,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            dry_run: config.dry_run,
            providers: HashMap::new(),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("router HTTP client"),
            trust: None,
            ledger: BudgetLedger::new(config.max_per_request_usd, config.max_session_usd),
        }
    }

    /// Adds a payment provider for its protocol.
    pub fn register_provider(&mut self, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(provider.protocol(), provider);
    }

    /// Enables trust scoring before payments.
    pub fn set_trust_checker(&mut self, checker: TrustChecker) {
        self.trust = Some(checker);
    }

    /// All payment receipts for this session, in settlement order.
    pub fn receipts(&self) -> Vec<Receipt> {
        self.ledger.receipts()
    }

    /// Total USD spent this session.
    pub fn session_spend(&self) -> f64 {
        self.ledger.session_spend()
    }

    /// Sends an HTTP request, settling any 402 payment requirement.
    ///
    /// `body` is `None` for no body, `Some` for a buffered body that is
    /// replayed byte-identically on the payment retry. The supplied headers
    /// are not mutated; the retry carries exactly one additional
    /// provider-chosen proof header. At most one retry is attempted.
    #[instrument(skip_all, fields(method = %method, url = %url))]
    pub async fn fetch(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        headers: &HeaderMap,
    ) -> Result<FetchResponse, RouterError> {
        // First attempt
        let response = self
            .send(method.clone(), url, body.as_deref(), headers.clone())
            .await?;
        let status = response.status().as_u16();
        let response_headers = response.headers().clone();
        let response_body = response.bytes().await?.to_vec();

        // Not a payment challenge: pass through
        if status != 402 {
            if status >= 400 {
                return Err(RouterError::Http {
                    status,
                    body: String::from_utf8_lossy(&response_body).into_owned(),
                });
            }
            return Ok(FetchResponse {
                body: response_body,
                receipt: None,
            });
        }

        let challenge = detect(&response_headers, &response_body)?;
        let protocol = challenge.protocol();
        tracing::debug!(%protocol, "402 challenge detected");

        let provider = self
            .providers
            .get(&protocol)
            .ok_or(RouterError::NoProvider(protocol))?;

        let estimate = provider
            .estimate_cost(&challenge)
            .map_err(RouterError::Estimate)?;
        self.ledger.check(estimate.usd)?;

        // Trust gate: score the payment recipient before settling
        if let Some(trust) = &self.trust {
            if let Some(recipient) = challenge.recipient() {
                trust.check_trust(recipient, estimate.usd).await?;
            }
        }

        if self.dry_run {
            let receipt = self.receipt_for(url, &challenge, &estimate, "DRY RUN — would pay");
            return Ok(FetchResponse {
                body: response_body,
                receipt: Some(receipt),
            });
        }

        let proof = provider
            .pay(&challenge)
            .await
            .map_err(|source| RouterError::Payment {
                protocol,
                amount: estimate.description.clone(),
                source,
            })?;
        tracing::info!(%protocol, amount = %estimate.description, "payment settled");

        // Retry with payment proof, body replayed from the buffer
        let mut retry_headers = headers.clone();
        let proof_name = HeaderName::from_bytes(proof.name.as_bytes());
        let proof_value = HeaderValue::from_str(&proof.value);
        match (proof_name, proof_value) {
            (Ok(name), Ok(value)) => {
                retry_headers.insert(name, value);
            }
            (Err(err), _) => return Err(self.payment_error(protocol, &estimate, Box::new(err))),
            (_, Err(err)) => return Err(self.payment_error(protocol, &estimate, Box::new(err))),
        }
        let retry_response = self
            .send(method, url, body.as_deref(), retry_headers)
            .await?;
        let retry_status = retry_response.status().as_u16();
        let retry_body = retry_response.bytes().await?.to_vec();

        if retry_status >= 400 {
            return Err(RouterError::RetryHttp {
                status: retry_status,
                body: String::from_utf8_lossy(&retry_body).into_owned(),
            });
        }

        let receipt = self.receipt_for(
            url,
            &challenge,
            &estimate,
            &format!("Paid {} via {}", estimate.description, protocol),
        );
        self.ledger.record(estimate.usd, receipt.clone());

        Ok(FetchResponse {
            body: retry_body,
            receipt: Some(receipt),
        })
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
        headers: HeaderMap,
    ) -> Result<reqwest::Response, RouterError> {
        let mut request = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body.to_vec());
        }
        Ok(request.send().await?)
    }

    fn payment_error(
        &self,
        protocol: Protocol,
        estimate: &crate::provider::CostEstimate,
        source: BoxError,
    ) -> RouterError {
        RouterError::Payment {
            protocol,
            amount: estimate.description.clone(),
            source,
        }
    }

    fn receipt_for(
        &self,
        url: &str,
        challenge: &PaymentChallenge,
        estimate: &crate::provider::CostEstimate,
        description: &str,
    ) -> Receipt {
        Receipt {
            timestamp: Utc::now(),
            url: url.to_string(),
            protocol: challenge.protocol().to_string(),
            amount: estimate.description.clone(),
            usd_cost: estimate.usd,
            description: description.to_string(),
            tx_id: None,
        }
    }
}
