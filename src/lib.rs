//! Client-side implementation of the [x402 protocol](https://www.x402.org) payment session.
//!
//! This crate drives pay-per-use tool invocations against a billing backend:
//! the caller attempts a metered call, receives a structured payment
//! requirement, pays through an external wallet capability, and retries with a
//! proof — while a realtime channel delivers out-of-band billing events and a
//! decimal-exact ledger tracks confirmed spend.
//!
//! # Overview
//!
//! One [`PaymentCoordinator`](coordinator::PaymentCoordinator) runs per user
//! session. It owns the connection state machine, the
//! [`Ledger`](ledger::Ledger), and the currently outstanding
//! [`PaymentRequirement`](types::PaymentRequirement); everything external —
//! the duplex billing channel, the wallet, the verification endpoint — sits
//! behind a trait or an HTTP client. All mutation happens on a single driver
//! task, so the session needs no locks and processes events strictly in
//! delivery order.
//!
//! # Modules
//!
//! - [`channel`] — The reconnecting realtime channel carrying
//!   `payment_required` / `payment_confirmed` events, behind the
//!   [`ChannelTransport`](channel::ChannelTransport) trait.
//! - [`coordinator`] — The [`PaymentCoordinator`](coordinator::PaymentCoordinator)
//!   state machine and its read-only [`SessionSnapshot`](coordinator::SessionSnapshot).
//! - [`ledger`] — Running spend totals and the bounded transaction history.
//! - [`submit`] — The [`BillingClient`](submit::BillingClient) posting payment
//!   witnesses to the verification endpoint.
//! - [`timestamp`] — Unix timestamp type for requirement expiry windows.
//! - [`types`] — The protocol data model and the connection status transition
//!   table.
//! - [`util`] — Decimal-exact money amounts.
//! - [`wallet`] — The opaque external wallet capability
//!   ([`WalletProvider`](wallet::WalletProvider)).
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use x402_session::{PaymentCoordinator, SessionConfig, ToolInvocation};
//!
//! let config = SessionConfig::try_from("https://billing.example")?;
//! let coordinator = PaymentCoordinator::spawn(config, transport, wallet)?;
//! coordinator.open(Some("user-1"));
//!
//! // later, when a payment requirement is showing:
//! let requirement = coordinator.snapshot().current_requirement.unwrap();
//! let invocation = ToolInvocation::new("getAccounts", serde_json::json!({}));
//! coordinator.make_payment(requirement, invocation).await?;
//! ```
//!
//! For the facilitator (server) side of the protocol, see the `x402-rs` crate.

pub mod channel;
pub mod coordinator;
pub mod ledger;
pub mod submit;
pub mod timestamp;
pub mod types;
pub mod util;
pub mod wallet;

pub use coordinator::{PaymentCoordinator, PaymentError, SessionConfig, SessionSnapshot};
pub use types::{ConnectionStatus, PaymentRequirement, ToolInvocation, UsageRecord, UsageStatus};
pub use util::money_amount::MoneyAmount;
pub use wallet::{PaymentWitness, TransferIntent, WalletProvider};
