//! End-to-end router tests against loopback HTTP servers.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap as AxumHeaderMap, HeaderValue as AxumHeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::any;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use pay402::protocol::{PaymentChallenge, Protocol, X402Accept, X402Requirement};
use pay402::provider::{BoxError, CostEstimate, PaymentProvider, ProofHeader};
use pay402::router::{Router, RouterConfig, RouterError};
use pay402::trust::TrustChecker;

struct MockProvider {
    protocol: Protocol,
    cost: f64,
    description: String,
    header_name: String,
    header_value: String,
    fail_with: Option<String>,
    pay_calls: AtomicUsize,
}

impl MockProvider {
    fn x402(cost: f64, description: &str) -> Self {
        Self {
            protocol: Protocol::X402,
            cost,
            description: description.to_string(),
            header_name: "Payment-Signature".to_string(),
            header_value: "sig_test_123".to_string(),
            fail_with: None,
            pay_calls: AtomicUsize::new(0),
        }
    }

    fn l402(cost: f64, description: &str) -> Self {
        Self {
            protocol: Protocol::L402,
            cost,
            description: description.to_string(),
            header_name: "Authorization".to_string(),
            header_value: "L402 hash123:preimage123".to_string(),
            fail_with: None,
            pay_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn estimate_cost(&self, _challenge: &PaymentChallenge) -> Result<CostEstimate, BoxError> {
        Ok(CostEstimate {
            usd: self.cost,
            description: self.description.clone(),
        })
    }

    async fn pay(&self, _challenge: &PaymentChallenge) -> Result<ProofHeader, BoxError> {
        self.pay_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(message.clone().into());
        }
        Ok(ProofHeader {
            name: self.header_name.clone(),
            value: self.header_value.clone(),
        })
    }
}

async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn x402_challenge_header(max_amount: &str, pay_to: &str) -> String {
    let requirement = X402Requirement {
        accepts: vec![X402Accept {
            scheme: "exact".to_string(),
            network: "eip155:84532".to_string(),
            max_amount_required: max_amount.to_string(),
            pay_to: pay_to.to_string(),
            asset: "USDC".to_string(),
            ..Default::default()
        }],
    };
    STANDARD.encode(serde_json::to_vec(&requirement).unwrap())
}

/// Target that challenges with x402 until the proof header arrives.
async fn x402_target(calls: Arc<AtomicUsize>, max_amount: &str, pay_to: &str) -> String {
    let challenge = x402_challenge_header(max_amount, pay_to);
    let app = axum::Router::new().route(
        "/",
        any(move |headers: AxumHeaderMap| {
            let calls = calls.clone();
            let challenge = challenge.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if headers.contains_key("Payment-Signature") {
                    return (StatusCode::OK, r#"{"result":"paid content"}"#).into_response();
                }
                let mut response_headers = AxumHeaderMap::new();
                response_headers.insert(
                    "Payment-Required",
                    AxumHeaderValue::from_str(&challenge).unwrap(),
                );
                (StatusCode::PAYMENT_REQUIRED, response_headers, "{}").into_response()
            }
        }),
    );
    serve(app).await
}

fn new_router(per_request: f64, session: f64) -> Router {
    Router::new(RouterConfig {
        max_per_request_usd: per_request,
        max_session_usd: session,
        dry_run: false,
    })
}

#[tokio::test]
async fn returns_body_without_receipt_on_200() {
    let app = axum::Router::new().route(
        "/",
        any(|| async { (StatusCode::OK, r#"{"status":"ok"}"#) }),
    );
    let url = serve(app).await;

    let router = new_router(1.0, 10.0);
    let response = router
        .fetch(Method::GET, &url, None, &HeaderMap::new())
        .await
        .unwrap();

    assert_eq!(response.body, br#"{"status":"ok"}"#);
    assert!(response.receipt.is_none());
    assert_eq!(router.session_spend(), 0.0);
}

#[tokio::test]
async fn non_402_error_status_is_reported() {
    let app = axum::Router::new().route(
        "/",
        any(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    let url = serve(app).await;

    let router = new_router(1.0, 10.0);
    let err = router
        .fetch(Method::GET, &url, None, &HeaderMap::new())
        .await
        .unwrap_err();

    match err {
        RouterError::Http { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("expected HTTP error, got {other:?}"),
    }
}

#[tokio::test]
async fn settles_x402_challenge_and_retries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let url = x402_target(calls.clone(), "10000", "0xabc123").await;

    let mut router = new_router(1.0, 10.0);
    router.register_provider(Arc::new(MockProvider::x402(0.01, "$0.01 USDC")));

    let response = router
        .fetch(Method::GET, &url, None, &HeaderMap::new())
        .await
        .unwrap();

    assert_eq!(response.body, br#"{"result":"paid content"}"#);
    let receipt = response.receipt.expect("expected receipt for 402 response");
    assert_eq!(receipt.protocol, "x402");
    assert_eq!(receipt.amount, "$0.01 USDC");
    assert_eq!(receipt.usd_cost, 0.01);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(router.session_spend(), 0.01);
    assert_eq!(router.receipts().len(), 1);
}

#[tokio::test]
async fn settles_l402_body_challenge() {
    let app = axum::Router::new().route(
        "/",
        any(|headers: AxumHeaderMap| async move {
            let authorized = headers
                .get("Authorization")
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.starts_with("L402"));
            if authorized {
                (StatusCode::OK, r#"{"result":"lightning paid"}"#).into_response()
            } else {
                (
                    StatusCode::PAYMENT_REQUIRED,
                    r#"{"invoice":"lnbc100u1pjtest","payment_hash":"hash123"}"#,
                )
                    .into_response()
            }
        }),
    );
    let url = serve(app).await;

    let mut router = new_router(1.0, 10.0);
    router.register_provider(Arc::new(MockProvider::l402(0.001, "10000 sats")));

    let response = router
        .fetch(Method::GET, &url, None, &HeaderMap::new())
        .await
        .unwrap();

    assert_eq!(response.body, br#"{"result":"lightning paid"}"#);
    assert_eq!(response.receipt.unwrap().protocol, "L402");
}

#[tokio::test]
async fn budget_exceeded_skips_payment() {
    let calls = Arc::new(AtomicUsize::new(0));
    let url = x402_target(calls.clone(), "10000000", "0xabc123").await;

    let mut router = new_router(1.0, 5.0);
    let provider = Arc::new(MockProvider::x402(10.0, "$10.00 USDC"));
    router.register_provider(provider.clone());

    let err = router
        .fetch(Method::GET, &url, None, &HeaderMap::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("budget"), "error: {err}");
    assert_eq!(provider.pay_calls.load(Ordering::SeqCst), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(router.session_spend(), 0.0);
}

#[tokio::test]
async fn session_budget_boundary_is_exact() {
    let calls = Arc::new(AtomicUsize::new(0));
    let url = x402_target(calls.clone(), "10000", "0xabc123").await;

    let mut router = new_router(1.0, 0.05);
    router.register_provider(Arc::new(MockProvider::x402(0.01, "$0.01")));

    // Five $0.01 payments fit the $0.05 session budget exactly
    for i in 0..5 {
        router
            .fetch(Method::GET, &url, None, &HeaderMap::new())
            .await
            .unwrap_or_else(|err| panic!("request {} failed: {err}", i + 1));
    }
    assert_eq!(router.session_spend(), 0.05);

    let err = router
        .fetch(Method::GET, &url, None, &HeaderMap::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("budget"), "error: {err}");
    assert_eq!(router.session_spend(), 0.05);
}

#[tokio::test]
async fn dry_run_prices_without_paying() {
    let calls = Arc::new(AtomicUsize::new(0));
    let url = x402_target(calls.clone(), "10000", "0xabc123").await;

    let mut router = Router::new(RouterConfig {
        max_per_request_usd: 1.0,
        max_session_usd: 10.0,
        dry_run: true,
    });
    let provider = Arc::new(MockProvider::x402(0.01, "$0.01 USDC"));
    router.register_provider(provider.clone());

    let response = router
        .fetch(Method::GET, &url, None, &HeaderMap::new())
        .await
        .unwrap();

    let receipt = response.receipt.expect("expected dry-run receipt");
    assert!(receipt.description.contains("DRY RUN"), "{}", receipt.description);
    assert_eq!(provider.pay_calls.load(Ordering::SeqCst), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(router.session_spend(), 0.0);
    assert!(router.receipts().is_empty());
}

#[tokio::test]
async fn missing_provider_is_an_error() {
    let app = axum::Router::new().route(
        "/",
        any(|| async { (StatusCode::PAYMENT_REQUIRED, r#"{"invoice":"lnbc100u1pjtest"}"#) }),
    );
    let url = serve(app).await;

    let router = new_router(1.0, 10.0);
    let err = router
        .fetch(Method::GET, &url, None, &HeaderMap::new())
        .await
        .unwrap_err();

    match err {
        RouterError::NoProvider(protocol) => assert_eq!(protocol, Protocol::L402),
        other => panic!("expected no-provider error, got {other:?}"),
    }
}

#[tokio::test]
async fn unrecognized_402_challenge_is_unknown_protocol() {
    let app = axum::Router::new().route(
        "/",
        any(|| async { (StatusCode::PAYMENT_REQUIRED, "pay me somehow") }),
    );
    let url = serve(app).await;

    let router = new_router(1.0, 10.0);
    let err = router
        .fetch(Method::GET, &url, None, &HeaderMap::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown payment protocol"), "error: {err}");
}

#[tokio::test]
async fn replays_request_body_on_retry() {
    let bodies: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let challenge = x402_challenge_header("10000", "0xabc123");

    let app = axum::Router::new().route(
        "/",
        any({
            let bodies = bodies.clone();
            move |headers: AxumHeaderMap, body: Bytes| {
                let bodies = bodies.clone();
                let challenge = challenge.clone();
                async move {
                    let content_type = headers
                        .get("Content-Type")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    bodies
                        .lock()
                        .unwrap()
                        .push((String::from_utf8_lossy(&body).into_owned(), content_type));
                    if headers.contains_key("Payment-Signature") {
                        return (StatusCode::OK, r#"{"ok":true}"#).into_response();
                    }
                    let mut response_headers = AxumHeaderMap::new();
                    response_headers.insert(
                        "Payment-Required",
                        AxumHeaderValue::from_str(&challenge).unwrap(),
                    );
                    (StatusCode::PAYMENT_REQUIRED, response_headers, "{}").into_response()
                }
            }
        }),
    );
    let url = serve(app).await;

    let mut router = new_router(1.0, 10.0);
    router.register_provider(Arc::new(MockProvider::x402(0.01, "$0.01")));

    let payload = r#"{"query":"important data"}"#;
    let mut headers = HeaderMap::new();
    headers.insert("Content-Type", "application/json".parse().unwrap());

    let response = router
        .fetch(
            Method::POST,
            &url,
            Some(payload.as_bytes().to_vec()),
            &headers,
        )
        .await
        .unwrap();

    assert_eq!(response.body, br#"{"ok":true}"#);
    let seen = bodies.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, payload);
    assert_eq!(seen[1].0, payload, "body not replayed byte-identically");
    assert_eq!(seen[0].1, "application/json");
    assert_eq!(seen[1].1, "application/json");
}

#[tokio::test]
async fn low_trust_recipient_blocks_payment() {
    let wot_app = axum::Router::new().route(
        "/score",
        any(|| async { (StatusCode::OK, r#"{"pubkey":"0xuntrusted","score":0.0001,"rank":50000}"#) }),
    );
    let wot_url = serve(wot_app).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let url = x402_target(calls.clone(), "10000000", "0xuntrusted").await;

    let mut checker = TrustChecker::new(Url::parse(&format!("{wot_url}/score")).unwrap());
    checker.min_score = 0.001;
    checker.threshold_usd = 0.01;

    let mut router = new_router(100.0, 1000.0);
    let provider = Arc::new(MockProvider::x402(1.0, "$1.00 USDC"));
    router.register_provider(provider.clone());
    router.set_trust_checker(checker);

    let err = router
        .fetch(Method::GET, &url, None, &HeaderMap::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("trust"), "error: {err}");
    assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry after trust failure");
    assert_eq!(provider.pay_calls.load(Ordering::SeqCst), 0);
    assert_eq!(router.session_spend(), 0.0);
}

#[tokio::test]
async fn trusted_recipient_passes_check() {
    let wot_app = axum::Router::new().route(
        "/score",
        any(|| async { (StatusCode::OK, r#"{"pubkey":"0xtrusted","score":0.05,"rank":10}"#) }),
    );
    let wot_url = serve(wot_app).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let url = x402_target(calls.clone(), "10000", "0xtrusted").await;

    let mut checker = TrustChecker::new(Url::parse(&format!("{wot_url}/score")).unwrap());
    checker.min_score = 0.001;
    checker.threshold_usd = 0.001;

    let mut router = new_router(1.0, 10.0);
    router.register_provider(Arc::new(MockProvider::x402(0.01, "$0.01 USDC")));
    router.set_trust_checker(checker);

    let response = router
        .fetch(Method::GET, &url, None, &HeaderMap::new())
        .await
        .unwrap();

    assert_eq!(response.body, br#"{"result":"paid content"}"#);
    assert!(response.receipt.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn payment_failure_carries_protocol_and_amount() {
    let calls = Arc::new(AtomicUsize::new(0));
    let url = x402_target(calls.clone(), "10000", "0xabc123").await;

    let mut router = new_router(1.0, 10.0);
    let mut provider = MockProvider::x402(0.01, "$0.01 USDC");
    provider.fail_with = Some("signer offline".to_string());
    router.register_provider(Arc::new(provider));

    let err = router
        .fetch(Method::GET, &url, None, &HeaderMap::new())
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("x402 payment of $0.01 USDC failed"), "error: {message}");
    assert!(message.contains("signer offline"), "error: {message}");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(router.session_spend(), 0.0);
}

#[tokio::test]
async fn failed_retry_records_no_receipt() {
    let challenge = x402_challenge_header("10000", "0xabc123");
    let app = axum::Router::new().route(
        "/",
        any(move |headers: AxumHeaderMap| {
            let challenge = challenge.clone();
            async move {
                if headers.contains_key("Payment-Signature") {
                    return (StatusCode::INTERNAL_SERVER_ERROR, "settlement not accepted")
                        .into_response();
                }
                let mut response_headers = AxumHeaderMap::new();
                response_headers.insert(
                    "Payment-Required",
                    AxumHeaderValue::from_str(&challenge).unwrap(),
                );
                (StatusCode::PAYMENT_REQUIRED, response_headers, "{}").into_response()
            }
        }),
    );
    let url = serve(app).await;

    let mut router = new_router(1.0, 10.0);
    router.register_provider(Arc::new(MockProvider::x402(0.01, "$0.01")));

    let err = router
        .fetch(Method::GET, &url, None, &HeaderMap::new())
        .await
        .unwrap_err();

    match err {
        RouterError::RetryHttp { status, .. } => assert_eq!(status, 500),
        other => panic!("expected retry HTTP error, got {other:?}"),
    }
    assert_eq!(router.session_spend(), 0.0);
    assert!(router.receipts().is_empty());
}
