//! The running, in-memory record of confirmed spend.
//!
//! Pure bookkeeping, no I/O. The ledger is owned exclusively by the
//! coordinator's driver task and mutated only on confirmed settlements (plus a
//! one-time seeding of the lifetime total from the status endpoint); external
//! consumers only ever see cloned [`LedgerSnapshot`]s.

use std::collections::VecDeque;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::types::UsageRecord;
use crate::util::money_amount::MoneyAmount;

/// How many transactions the recent-history window retains.
pub const RECENT_CAPACITY: usize = 10;

/// Running totals and a bounded, newest-first transaction history.
///
/// Totals are monotonically non-decreasing for the lifetime of the owning
/// coordinator; there is no removal or expiry. Eviction from the history is
/// FIFO by insertion, which keeps the window honest even when settlement
/// events are delivered out of timestamp order.
#[derive(Debug, Default)]
pub struct Ledger {
    session_cost: Decimal,
    total_spent: Decimal,
    recent: VecDeque<UsageRecord>,
    last_payment: Option<UsageRecord>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a confirmed settlement: both accumulators grow by the record's
    /// cost, the record is prepended to the history (evicting past capacity),
    /// and it becomes the last payment.
    pub fn record_confirmed(&mut self, record: UsageRecord) {
        let cost = record.cost.as_decimal();
        self.session_cost += cost;
        self.total_spent += cost;
        self.recent.push_front(record.clone());
        self.recent.truncate(RECENT_CAPACITY);
        self.last_payment = Some(record);
    }

    /// One-time startup seed of the lifetime total from `GET /status`.
    /// Takes the max so a stale report can never shrink the total.
    pub fn seed_total_spent(&mut self, reported: MoneyAmount) {
        self.total_spent = self.total_spent.max(reported.as_decimal());
    }

    pub fn session_cost(&self) -> MoneyAmount {
        MoneyAmount(self.session_cost)
    }

    pub fn total_spent(&self) -> MoneyAmount {
        MoneyAmount(self.total_spent)
    }

    pub fn last_payment(&self) -> Option<&UsageRecord> {
        self.last_payment.as_ref()
    }

    /// An immutable view for external consumers.
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            session_cost: self.session_cost(),
            total_spent: self.total_spent(),
            recent_transactions: self.recent.iter().cloned().collect(),
            last_payment: self.last_payment.clone(),
        }
    }
}

/// Point-in-time copy of the ledger, newest transaction first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub session_cost: MoneyAmount,
    pub total_spent: MoneyAmount,
    pub recent_transactions: Vec<UsageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_payment: Option<UsageRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn confirmed(tool: &str, cost: &str) -> UsageRecord {
        UsageRecord::pending(tool, MoneyAmount::parse(cost).unwrap()).confirmed_with("0xfeed")
    }

    #[test]
    fn totals_are_the_sum_of_confirmed_costs() {
        let mut ledger = Ledger::new();
        ledger.record_confirmed(confirmed("getAccounts", "0.002"));
        ledger.record_confirmed(confirmed("getBalance", "0.0010"));
        ledger.record_confirmed(confirmed("getAccounts", "0.25"));

        let expected = Decimal::from_str("0.253").unwrap();
        assert_eq!(ledger.session_cost().as_decimal(), expected);
        assert_eq!(ledger.total_spent().as_decimal(), expected);
    }

    #[test]
    fn trailing_zero_amounts_settle_exactly() {
        let mut ledger = Ledger::new();
        ledger.record_confirmed(confirmed("getAccounts", "0.0010"));
        assert_eq!(
            ledger.session_cost().as_decimal(),
            Decimal::from_str("0.001").unwrap()
        );
    }

    #[test]
    fn history_is_bounded_and_newest_first() {
        let mut ledger = Ledger::new();
        for i in 0..15 {
            ledger.record_confirmed(confirmed(&format!("tool-{i}"), "0.001"));
        }

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.recent_transactions.len(), RECENT_CAPACITY);
        // newest first, oldest five evicted
        assert_eq!(snapshot.recent_transactions[0].tool, "tool-14");
        assert_eq!(snapshot.recent_transactions[9].tool, "tool-5");
        // eviction never touches the totals
        assert_eq!(
            ledger.total_spent().as_decimal(),
            Decimal::from_str("0.015").unwrap()
        );
    }

    #[test]
    fn last_payment_tracks_the_latest_record() {
        let mut ledger = Ledger::new();
        assert!(ledger.last_payment().is_none());
        ledger.record_confirmed(confirmed("getAccounts", "0.002"));
        ledger.record_confirmed(confirmed("getBalance", "0.003"));
        assert_eq!(ledger.last_payment().unwrap().tool, "getBalance");
    }

    #[test]
    fn seeding_never_decreases_the_total() {
        let mut ledger = Ledger::new();
        ledger.seed_total_spent(MoneyAmount::parse("1.5").unwrap());
        assert_eq!(
            ledger.total_spent().as_decimal(),
            Decimal::from_str("1.5").unwrap()
        );

        // a stale, smaller report is ignored
        ledger.seed_total_spent(MoneyAmount::parse("0.2").unwrap());
        assert_eq!(
            ledger.total_spent().as_decimal(),
            Decimal::from_str("1.5").unwrap()
        );

        // session cost is untouched by seeding
        assert_eq!(ledger.session_cost(), MoneyAmount::ZERO);
    }
}
