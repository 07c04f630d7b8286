//! The capability a settlement backend must expose to the router.

use async_trait::async_trait;

use crate::protocol::{PaymentChallenge, Protocol};

/// Boxed error type for provider implementations.
///
/// Providers carry their own error enums; the router reports them wrapped in
/// a payment failure together with protocol and amount context.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The price a provider intends to pay if selected.
#[derive(Debug, Clone)]
pub struct CostEstimate {
    /// Estimated cost in USD.
    pub usd: f64,
    /// Human-readable amount, e.g. `"$0.0100 USDC on eip155:84532"`.
    pub description: String,
}

/// The HTTP header the router attaches to the retried request as proof of
/// payment.
#[derive(Debug, Clone)]
pub struct ProofHeader {
    pub name: String,
    pub value: String,
}

/// Settlement backend for one payment protocol.
///
/// Providers are stateless with respect to the router; they may hold their
/// own credentials and HTTP clients.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Which payment protocol this provider handles.
    fn protocol(&self) -> Protocol;

    /// Estimated cost for a challenge. Must not perform network I/O.
    fn estimate_cost(&self, challenge: &PaymentChallenge) -> Result<CostEstimate, BoxError>;

    /// Settles the payment and returns the proof header for the retry.
    async fn pay(&self, challenge: &PaymentChallenge) -> Result<ProofHeader, BoxError>;
}
