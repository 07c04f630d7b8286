//! pay402 CLI entrypoint.
//!
//! Routes HTTP requests through paid APIs automatically. The `fetch` command
//! sends a request; on a 402 response the router detects the payment protocol
//! (x402 or L402), settles through the configured provider, and retries with
//! proof. The response body goes to stdout, receipts and diagnostics to
//! stderr. Exit code is 0 on success and 1 on any router-reported error.

use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::io::Write;
use std::sync::Arc;
use url::Url;

use pay402::config::AppConfig;
use pay402::provider::BoxError;
use pay402::providers::{CdpProvider, L402Provider};
use pay402::router::{Router, RouterConfig};
use pay402::telemetry;
use pay402::trust::TrustChecker;

#[derive(Parser)]
#[command(name = "pay402")]
#[command(about = "Cross-protocol payment router for agents calling paid APIs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a URL, automatically handling 402 payments
    Fetch(FetchArgs),
}

#[derive(Args)]
struct FetchArgs {
    /// Target URL
    url: String,
    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request body
    #[arg(short = 'd', long = "data")]
    data: Option<String>,
    /// HTTP headers (key: value)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Maximum USD to spend per request
    #[arg(long, default_value_t = 1.0)]
    budget: f64,
    /// Preview payment cost without paying
    #[arg(long)]
    dry_run: bool,
    /// Enable Web of Trust scoring before payments
    #[arg(long)]
    wot: bool,
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    telemetry::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Fetch(args) => run_fetch(args).await,
    };

    if let Err(err) = result {
        eprintln!("pay402: {err}");
        std::process::exit(1);
    }
}

async fn run_fetch(args: FetchArgs) -> Result<(), BoxError> {
    let config = AppConfig::load()
        .map_err(|err| format!("{err} (create {} first)", AppConfig::path().display()))?;

    let mut router = Router::new(RouterConfig {
        max_per_request_usd: args.budget,
        max_session_usd: args.budget * 10.0,
        dry_run: args.dry_run,
    });

    if !config.cdp.api_key_id.is_empty() {
        let mut provider = CdpProvider::new(
            &config.cdp.api_key_id,
            &config.cdp.api_key_secret,
            &config.cdp.wallet_secret,
        );
        provider.init(&config.cdp.wallet_name).await?;
        router.register_provider(Arc::new(provider));
    }

    if !config.lnbits.url.is_empty() {
        router.register_provider(Arc::new(L402Provider::new(
            &config.lnbits.url,
            &config.lnbits.admin_key,
        )));
    }

    if args.wot || config.wot.enabled {
        router.set_trust_checker(TrustChecker::new(Url::parse(&config.wot.endpoint)?));
        tracing::info!(endpoint = %config.wot.endpoint, "WoT trust scoring enabled");
    }

    let method = Method::from_bytes(args.method.as_bytes())?;
    let headers = parse_headers(&args.headers)?;
    let body = args.data.map(String::into_bytes);

    let response = router.fetch(method, &args.url, body, &headers).await?;

    if let Some(receipt) = &response.receipt {
        let receipt_json = serde_json::to_string_pretty(receipt)?;
        eprintln!("\n--- Payment Receipt ---\n{receipt_json}\n-----------------------\n");
    }

    std::io::stdout().write_all(&response.body)?;
    Ok(())
}

fn parse_headers(raw: &[String]) -> Result<HeaderMap, BoxError> {
    let mut headers = HeaderMap::new();
    for header in raw {
        if let Some((name, value)) = header.split_once(':') {
            headers.insert(
                HeaderName::from_bytes(name.trim().as_bytes())?,
                HeaderValue::from_str(value.trim())?,
            );
        }
    }
    Ok(headers)
}
