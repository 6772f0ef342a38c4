//! Wallet capability boundary.
//!
//! The session treats the wallet as an opaque provider: it asks for an
//! identity, hands over a [`TransferIntent`] derived from a payment
//! requirement, and carries back whatever [`PaymentWitness`] the wallet
//! produced. Signing internals (key custody, user approval UI, on-chain
//! submission) live entirely behind this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::timestamp::UnixTimestamp;
use crate::types::PaymentRequirement;
use crate::util::money_amount::MoneyAmount;

/// Failures reported by the external wallet capability, surfaced verbatim to
/// the caller of `make_payment` and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    #[error("wallet unavailable: {0}")]
    Unavailable(String),
    #[error("user rejected the payment")]
    UserRejected,
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

/// The connected wallet's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletIdentity {
    pub address: String,
}

/// What the session asks the wallet to sign: a transfer matching a payment
/// requirement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferIntent {
    pub amount: MoneyAmount,
    pub currency: String,
    pub network: String,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

impl From<&PaymentRequirement> for TransferIntent {
    fn from(requirement: &PaymentRequirement) -> Self {
        Self {
            amount: requirement.amount,
            currency: requirement.currency.clone(),
            network: requirement.network.clone(),
            recipient: requirement.address.clone(),
            memo: requirement.memo.clone(),
        }
    }
}

/// The signed transfer record presented to the verification endpoint as proof
/// of payment. The session only carries it; it never constructs or inspects
/// one in production use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentWitness {
    pub amount: MoneyAmount,
    pub currency: String,
    pub network: String,
    pub sender: String,
    pub recipient: String,
    pub transaction_hash: String,
    pub timestamp: UnixTimestamp,
}

/// The opaque external wallet capability.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Connects the wallet, returning its identity.
    async fn connect(&self) -> Result<WalletIdentity, WalletError>;

    /// Signs a transfer and returns the resulting payment witness.
    async fn sign_transfer(&self, intent: &TransferIntent) -> Result<PaymentWitness, WalletError>;
}
