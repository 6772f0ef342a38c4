//! Core data model for x402 payment sessions.
//!
//! These types mirror the wire format spoken by the billing backend: payment
//! requirements arrive over the realtime channel (or are synthesized locally
//! from a known tool price), usage records accumulate in the
//! [`Ledger`](crate::ledger::Ledger), and [`ConnectionStatus`] is the closed
//! state set of the [`PaymentCoordinator`](crate::coordinator::PaymentCoordinator)
//! with its legal-transition table enforced centrally here.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::timestamp::UnixTimestamp;
use crate::util::money_amount::MoneyAmount;

/// A server-issued instruction describing what must be paid before a tool
/// invocation proceeds.
///
/// Immutable once issued. The whole value is its identity: the coordinator
/// keys in-flight submissions on it, so two `makePayment` calls for the same
/// requirement collapse into a single network submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    /// The payment amount as a decimal string (e.g. `"0.002"`).
    pub amount: MoneyAmount,
    /// The currency symbol (e.g. `"USDC"`).
    pub currency: String,
    /// The settlement network (e.g. `"base"`).
    pub network: String,
    /// The recipient address for payment.
    pub address: String,
    /// Optional free-form memo attached by the backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    /// Optional expiry instant. Strictly in the future at creation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<UnixTimestamp>,
}

impl PaymentRequirement {
    /// Synthesizes a requirement locally for a known tool price.
    pub fn new(
        amount: MoneyAmount,
        currency: impl Into<String>,
        network: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            amount,
            currency: currency.into(),
            network: network.into(),
            address: address.into(),
            memo: None,
            expires_at: None,
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Sets the expiry `secs` seconds from now, keeping the creation-time
    /// invariant that `expires_at` is strictly in the future.
    pub fn expiring_in(mut self, secs: u64) -> Self {
        self.expires_at = Some(UnixTimestamp::now() + secs.max(1));
        self
    }

    /// Whether the expiry instant, if any, has been reached or passed.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at.is_elapsed())
    }
}

/// Lifecycle of a single metered payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Pending,
    Confirmed,
    Failed,
}

/// One metered tool invocation and what it cost.
///
/// Created when a payment is attempted; transitions pending→confirmed on
/// backend confirmation and pending→failed on rejection or expiry. Append-only
/// once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    /// Opaque identifier; backend-supplied or locally generated.
    pub id: String,
    /// The tool (invocation method) that was paid for.
    pub tool: String,
    /// The confirmed or attempted cost.
    pub cost: MoneyAmount,
    /// When the payment attempt was created.
    pub timestamp: UnixTimestamp,
    /// Settlement transaction hash, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub status: UsageStatus,
}

impl UsageRecord {
    /// A fresh pending record for a payment attempt against `tool`.
    pub fn pending(tool: impl Into<String>, cost: MoneyAmount) -> Self {
        Self {
            id: generate_id(),
            tool: tool.into(),
            cost,
            timestamp: UnixTimestamp::now(),
            tx_hash: None,
            status: UsageStatus::Pending,
        }
    }

    /// Marks the record confirmed with the settlement transaction hash.
    pub fn confirmed_with(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self.status = UsageStatus::Confirmed;
        self
    }
}

/// Generates an opaque payment identifier.
pub(crate) fn generate_id() -> String {
    let raw: [u8; 16] = rand::rng().random();
    hex::encode(raw)
}

/// The closed set of coordinator states.
///
/// Exactly one value holds at any instant; the coordinator is the
/// authoritative source, informed by channel lifecycle and submission
/// outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    PaymentRequired,
}

impl ConnectionStatus {
    /// The legal-transition table. Anything not listed is a logic error and is
    /// rejected (and error-logged) by the coordinator rather than applied.
    ///
    /// Beyond the obvious lifecycle rows, three deliberate entries:
    /// `disconnected → connected` completes an autonomous channel reconnect,
    /// `payment_required → disconnected` covers the channel dropping while a
    /// requirement is outstanding, and `connecting ⇄ payment_required` carries
    /// the transient submission state of `makePayment`.
    pub fn may_transition(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Disconnected, Connected)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, PaymentRequired)
                | (Connected, Disconnected)
                | (Connected, Connecting)
                | (Connected, PaymentRequired)
                | (PaymentRequired, Connecting)
                | (PaymentRequired, Connected)
                | (PaymentRequired, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::PaymentRequired => "payment_required",
        };
        write!(f, "{s}")
    }
}

/// The body of a metered tool invocation sent to the verification endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub method: String,
    pub params: serde_json::Value,
}

impl ToolInvocation {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Optional settlement information carried on a 2xx invoke response.
///
/// Backends that settle synchronously include the transaction hash either in
/// the JSON body or in an `X-Payment-Transaction` header; others leave both
/// empty and settle via the realtime channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeReceipt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled: Option<bool>,
}

/// Spend totals reported by `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub total_paid: MoneyAmount,
}

/// Response of the billing backend's `GET /status` endpoint, used only to seed
/// `total_spent` on startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageTotals>,
}
