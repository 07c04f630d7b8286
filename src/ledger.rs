//! Per-session budget accounting and payment receipts.
//!
//! The ledger is the only mutable state shared between concurrent fetches.
//! Spend totals are kept as [`Decimal`] so repeated small settlements sum
//! exactly; receipts expose USD as `f64` on the wire.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// An immutable record of one completed settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub protocol: String,
    pub amount: String,
    pub usd_cost: f64,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("payment would exceed budget: ${cost:.4} exceeds per-request limit of ${limit:.4}")]
    PerRequest { cost: f64, limit: f64 },
    #[error(
        "payment would exceed budget: ${cost:.4} would bring session total to ${total:.4} (limit ${limit:.4})"
    )]
    Session { cost: f64, total: f64, limit: f64 },
}

#[derive(Debug, Default)]
struct LedgerState {
    spend: Decimal,
    receipts: Vec<Receipt>,
}

/// Budget limits plus session spend and the receipt log.
///
/// A limit of zero (or below) disables that cap. All operations hold the
/// ledger lock for their full duration.
#[derive(Debug)]
pub struct BudgetLedger {
    max_per_request: Option<Decimal>,
    max_session: Option<Decimal>,
    state: Mutex<LedgerState>,
}

fn to_decimal(usd: f64) -> Decimal {
    Decimal::from_f64(usd).unwrap_or_default()
}

fn cap(limit_usd: f64) -> Option<Decimal> {
    (limit_usd > 0.0).then(|| to_decimal(limit_usd))
}

impl BudgetLedger {
    pub fn new(max_per_request_usd: f64, max_session_usd: f64) -> Self {
        Self {
            max_per_request: cap(max_per_request_usd),
            max_session: cap(max_session_usd),
            state: Mutex::new(LedgerState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rejects a cost that would breach the per-request or session cap.
    pub fn check(&self, usd_cost: f64) -> Result<(), BudgetError> {
        let state = self.lock();
        let cost = to_decimal(usd_cost);

        if let Some(limit) = self.max_per_request {
            if cost > limit {
                return Err(BudgetError::PerRequest {
                    cost: usd_cost,
                    limit: limit.to_f64().unwrap_or_default(),
                });
            }
        }
        if let Some(limit) = self.max_session {
            let total = state.spend + cost;
            if total > limit {
                return Err(BudgetError::Session {
                    cost: usd_cost,
                    total: total.to_f64().unwrap_or_default(),
                    limit: limit.to_f64().unwrap_or_default(),
                });
            }
        }
        Ok(())
    }

    /// Appends a receipt and adds its cost to the session spend.
    pub fn record(&self, usd_cost: f64, receipt: Receipt) {
        let mut state = self.lock();
        state.spend += to_decimal(usd_cost);
        state.receipts.push(receipt);
    }

    /// A copy of all receipts recorded this session.
    pub fn receipts(&self) -> Vec<Receipt> {
        self.lock().receipts.clone()
    }

    /// Total USD spent this session.
    pub fn session_spend(&self) -> f64 {
        self.lock().spend.to_f64().unwrap_or_default()
    }
}
