//! Cross-protocol payment router for HTTP 402 Payment Required challenges.
//!
//! This crate lets a calling agent treat paid APIs as ordinary HTTP endpoints.
//! The [`router::Router`] sends a request, and when the server answers with
//! `402 Payment Required` it detects the payment protocol, settles the payment
//! through a registered provider, and retries the request carrying the proof.
//!
//! Two challenge encodings are recognized:
//!
//! - **x402** — a base64-encoded JSON `Payment-Required` header carrying a list
//!   of accepted payment options (signed stablecoin authorizations).
//! - **L402** — a Lightning Network invoice, delivered either in a
//!   `WWW-Authenticate` challenge or in the response body.
//!
//! # Modules
//!
//! - [`chain`] — CAIP-2 style `namespace:reference` chain identifiers.
//! - [`config`] — Configuration file loading for the CLI.
//! - [`ledger`] — Per-session budget accounting and payment receipts.
//! - [`protocol`] — Challenge detection and the parsed requirement model.
//! - [`provider`] — The capability a settlement backend must expose.
//! - [`providers`] — Built-in settlement backends (CDP-signed x402, LNbits L402).
//! - [`router`] — The orchestrator: send, detect, gate, settle, retry, record.
//! - [`trust`] — Optional Web-of-Trust gate consulted before settlement.
//! - [`util`] — Canonical-JSON helper for deterministic request hashing.

pub mod chain;
pub mod config;
pub mod ledger;
pub mod protocol;
pub mod provider;
pub mod providers;
pub mod router;
pub mod telemetry;
pub mod trust;
pub mod util;
