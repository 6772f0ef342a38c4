//! Utility types for the payment session.
//!
//! - [`money_amount`] - Decimal-exact money amounts for prices, spend totals,
//!   and wire-format decimal strings.

pub mod money_amount;

pub use money_amount::*;
