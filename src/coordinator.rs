//! Payment session coordinator.
//!
//! [`PaymentCoordinator`] is the only entry point external callers use. It
//! ties the realtime channel, the submission client, the wallet capability,
//! and the ledger together behind a single driver task: all mutable state
//! (ledger, connection status, current requirement, in-flight submissions)
//! lives on that task, and every input — handle commands, channel events,
//! submission completions, the expiry tick — is processed strictly in
//! delivery order. No locks, no shared mutation.
//!
//! External consumers get an immutable [`SessionSnapshot`] through a
//! [`tokio::sync::watch`] channel and three actions: `make_payment`,
//! `refresh_status`, and `set_payment_required`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};
use url::Url;

use crate::channel::{ChannelEvent, ChannelTransport, DEFAULT_RECONNECT_DELAY, RealtimeChannel};
use crate::ledger::Ledger;
use crate::submit::{BillingClient, BillingClientError};
use crate::types::{
    ConnectionStatus, InvokeReceipt, PaymentRequirement, StatusResponse, ToolInvocation,
    UsageRecord,
};
use crate::util::money_amount::MoneyAmount;
use crate::wallet::{TransferIntent, WalletError, WalletProvider};

/// How often the requirement expiry countdown is recomputed.
pub const DEFAULT_EXPIRY_TICK: Duration = Duration::from_secs(1);

/// Configuration for a payment session.
///
/// Constructed from the billing backend base URL; the timing knobs default to
/// the reference behavior (3 s reconnect delay, 1 s expiry tick).
#[derive(Clone, Debug)]
pub struct SessionConfig {
    base_url: Url,
    reconnect_delay: Duration,
    expiry_tick: Duration,
    request_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            expiry_tick: DEFAULT_EXPIRY_TICK,
            request_timeout: None,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_expiry_tick(mut self, tick: Duration) -> Self {
        self.expiry_tick = tick;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

impl TryFrom<&str> for SessionConfig {
    type Error = BillingClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut normalized = value.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|e| BillingClientError::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        Ok(Self::new(url))
    }
}

/// Failures surfaced by the session actions, always carrying a
/// human-readable reason. Cloneable so every waiter on a shared in-flight
/// submission receives the same verdict.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PaymentError {
    /// The requirement's expiry elapsed before (or while) submitting.
    #[error("payment requirement expired")]
    RequirementExpired,
    /// The session has no user identity yet; call `open` first.
    #[error("payment session is not open")]
    NotOpen,
    /// The verification endpoint rejected the payment. Not retried.
    #[error("payment verification rejected: {reason}")]
    VerificationRejected { reason: String },
    /// The wallet capability failed; surfaced verbatim, not retried.
    #[error(transparent)]
    Wallet(#[from] WalletError),
    /// The submission could not reach a verdict (transport failure).
    #[error("payment submission failed: {reason}")]
    Submission { reason: String },
    /// The coordinator has been disposed.
    #[error("payment session closed")]
    Closed,
}

impl From<BillingClientError> for PaymentError {
    fn from(err: BillingClientError) -> Self {
        match err {
            BillingClientError::Rejected { reason, .. } => {
                PaymentError::VerificationRejected { reason }
            }
            other => PaymentError::Submission {
                reason: other.to_string(),
            },
        }
    }
}

/// Read-only state for external consumers (e.g. a payment status UI).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub connection_status: ConnectionStatus,
    /// Channel liveness, independent of the transient `connecting` state a
    /// submission passes through.
    pub is_connected: bool,
    pub session_cost: MoneyAmount,
    pub total_spent: MoneyAmount,
    pub recent_transactions: Vec<UsageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_payment: Option<UsageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_requirement: Option<PaymentRequirement>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            connection_status: ConnectionStatus::Disconnected,
            is_connected: false,
            session_cost: MoneyAmount::ZERO,
            total_spent: MoneyAmount::ZERO,
            recent_transactions: Vec::new(),
            last_payment: None,
            current_requirement: None,
        }
    }
}

type PaymentReply = oneshot::Sender<Result<bool, PaymentError>>;
type StatusReply = oneshot::Sender<Result<(), PaymentError>>;

enum Command {
    Open {
        user_id: Option<String>,
    },
    MakePayment {
        requirement: PaymentRequirement,
        invocation: ToolInvocation,
        reply: PaymentReply,
    },
    RefreshStatus {
        reply: StatusReply,
    },
    SetPaymentRequired(bool),
}

enum Internal {
    SubmitResolved {
        requirement: PaymentRequirement,
        record: UsageRecord,
        result: Result<InvokeReceipt, PaymentError>,
    },
    StatusFetched {
        result: Result<StatusResponse, BillingClientError>,
        reply: Option<StatusReply>,
    },
}

/// Handle to a running payment session. Cheap to clone; all clones drive the
/// same session.
#[derive(Clone)]
pub struct PaymentCoordinator {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl PaymentCoordinator {
    /// Spawns the session driver and returns its handle.
    pub fn spawn(
        config: SessionConfig,
        transport: Arc<dyn ChannelTransport>,
        wallet: Arc<dyn WalletProvider>,
    ) -> Result<Self, BillingClientError> {
        let mut billing = BillingClient::try_new(config.base_url.clone())?;
        if let Some(timeout) = config.request_timeout {
            billing = billing.with_timeout(timeout);
        }
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let cancel = CancellationToken::new();
        let channel = RealtimeChannel::new(transport, event_tx, config.reconnect_delay);

        let driver = Driver {
            billing,
            wallet,
            channel,
            internal: internal_tx,
            snapshot: snapshot_tx,
            cancel: cancel.clone(),
            expiry_tick: config.expiry_tick,
            status: ConnectionStatus::Disconnected,
            channel_up: false,
            user_id: None,
            ledger: Ledger::new(),
            current_requirement: None,
            expiry_logged: false,
            in_flight: HashMap::new(),
            pending_settlements: Vec::new(),
            settled_hashes: HashSet::new(),
        };
        let tasks = TaskTracker::new();
        tasks.spawn(driver.run(command_rx, event_rx, internal_rx));
        tasks.close();

        Ok(Self {
            commands: command_tx,
            snapshot: snapshot_rx,
            cancel,
            tasks,
        })
    }

    /// Opens the session for `user_id`: starts the billing channel and seeds
    /// spend totals from the status endpoint. Idempotent.
    pub fn open(&self, user_id: Option<&str>) {
        let _ = self.commands.send(Command::Open {
            user_id: user_id.map(ToOwned::to_owned),
        });
    }

    /// Submits a payment for `requirement` covering `invocation`.
    ///
    /// Returns once the verification endpoint accepted or rejected the
    /// submission; settlement confirmation arrives asynchronously via the
    /// channel. Concurrent calls for the same requirement are collapsed into
    /// a single network submission, and every caller receives that
    /// submission's verdict.
    pub async fn make_payment(
        &self,
        requirement: PaymentRequirement,
        invocation: ToolInvocation,
    ) -> Result<bool, PaymentError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::MakePayment {
                requirement,
                invocation,
                reply,
            })
            .map_err(|_| PaymentError::Closed)?;
        response.await.map_err(|_| PaymentError::Closed)?
    }

    /// Re-fetches `GET /status`. Failures leave prior state unchanged.
    pub async fn refresh_status(&self) -> Result<(), PaymentError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::RefreshStatus { reply })
            .map_err(|_| PaymentError::Closed)?;
        response.await.map_err(|_| PaymentError::Closed)?
    }

    /// Manual override into (or out of) the `payment_required` state.
    pub fn set_payment_required(&self, required: bool) {
        let _ = self.commands.send(Command::SetPaymentRequired(required));
    }

    /// The current state snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that observes every snapshot update.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Disposes the session: closes the channel (terminal), cancels the
    /// expiry tick, and lets any in-flight submission finish naturally with
    /// its result discarded.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tasks.wait().await;
    }
}

struct Driver {
    billing: BillingClient,
    wallet: Arc<dyn WalletProvider>,
    channel: RealtimeChannel,
    internal: mpsc::UnboundedSender<Internal>,
    snapshot: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
    expiry_tick: Duration,

    status: ConnectionStatus,
    channel_up: bool,
    user_id: Option<String>,
    ledger: Ledger,
    current_requirement: Option<PaymentRequirement>,
    expiry_logged: bool,
    in_flight: HashMap<PaymentRequirement, Vec<PaymentReply>>,
    pending_settlements: Vec<UsageRecord>,
    settled_hashes: HashSet<String>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut tick = tokio::time::interval(self.expiry_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command),
                Some(event) = events.recv() => self.handle_channel_event(event),
                Some(message) = internal.recv() => self.handle_internal(message),
                _ = tick.tick() => self.check_expiry(),
            }
            self.publish();
        }
        self.channel.close();
        self.channel.closed().await;
        for (_, waiters) in self.in_flight.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(PaymentError::Closed));
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open { user_id } => self.handle_open(user_id),
            Command::MakePayment {
                requirement,
                invocation,
                reply,
            } => self.start_payment(requirement, invocation, reply),
            Command::RefreshStatus { reply } => self.spawn_status_fetch(Some(reply)),
            Command::SetPaymentRequired(required) => {
                if required {
                    self.transition(ConnectionStatus::PaymentRequired);
                } else if self.transition(ConnectionStatus::Connected) {
                    self.clear_requirement();
                }
            }
        }
    }

    fn handle_open(&mut self, user_id: Option<String>) {
        let Some(user_id) = user_id else {
            // The channel logs this; nothing to authenticate without an id.
            self.channel.open(None);
            return;
        };
        if self.user_id.is_some() {
            debug!("payment session already open");
            self.channel.open(Some(&user_id));
            return;
        }
        self.user_id = Some(user_id.clone());
        self.transition(ConnectionStatus::Connecting);
        self.channel.open(Some(&user_id));
        self.spawn_status_fetch(None);
    }

    fn start_payment(
        &mut self,
        requirement: PaymentRequirement,
        invocation: ToolInvocation,
        reply: PaymentReply,
    ) {
        if requirement.is_expired() {
            let _ = reply.send(Err(PaymentError::RequirementExpired));
            return;
        }
        if let Some(waiters) = self.in_flight.get_mut(&requirement) {
            debug!("submission already in flight for this requirement, joining");
            waiters.push(reply);
            return;
        }
        let Some(user_id) = self.user_id.clone() else {
            let _ = reply.send(Err(PaymentError::NotOpen));
            return;
        };

        self.in_flight.insert(requirement.clone(), vec![reply]);
        self.transition(ConnectionStatus::Connecting);

        let record = UsageRecord::pending(invocation.method.clone(), requirement.amount);
        let wallet = self.wallet.clone();
        let billing = self.billing.clone();
        let internal = self.internal.clone();
        let submitted = requirement.clone();
        // Deliberately not on the task tracker: disposal leaves an in-flight
        // submission to complete naturally and discards its result.
        tokio::spawn(async move {
            let result = submit_payment(wallet, billing, user_id, &submitted, &invocation).await;
            let _ = internal.send(Internal::SubmitResolved {
                requirement: submitted,
                record,
                result,
            });
        });
    }

    fn spawn_status_fetch(&self, reply: Option<StatusReply>) {
        let Some(user_id) = self.user_id.clone() else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(PaymentError::NotOpen));
            }
            return;
        };
        let billing = self.billing.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = billing.status(&user_id).await;
            let _ = internal.send(Internal::StatusFetched { result, reply });
        });
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                self.channel_up = true;
                self.transition(ConnectionStatus::Connected);
                if self.current_requirement.is_some() {
                    // A requirement outstanding before the drop is still owed.
                    self.transition(ConnectionStatus::PaymentRequired);
                }
            }
            ChannelEvent::Disconnected => {
                self.channel_up = false;
                self.transition(ConnectionStatus::Disconnected);
            }
            ChannelEvent::PaymentRequired(requirement) => {
                debug!(amount = %requirement.amount, currency = %requirement.currency, "payment required");
                self.current_requirement = Some(requirement);
                self.expiry_logged = false;
                self.transition(ConnectionStatus::PaymentRequired);
            }
            ChannelEvent::PaymentConfirmed(record) => {
                let record = self.adopt_pending(record);
                self.settle(record);
                // Settlement is authoritative for the ledger, but it only
                // clears the payment gate when one is actually showing.
                if self.status == ConnectionStatus::PaymentRequired {
                    self.transition(ConnectionStatus::Connected);
                    self.clear_requirement();
                }
            }
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::SubmitResolved {
                requirement,
                record,
                result,
            } => self.finish_payment(requirement, record, result),
            Internal::StatusFetched { result, reply } => match result {
                Ok(status) => {
                    if !status.authenticated {
                        debug!("billing backend reports unauthenticated session");
                    }
                    if let Some(usage) = status.usage {
                        self.ledger.seed_total_spent(usage.total_paid);
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                }
                Err(err) => {
                    debug!(error = %err, "status fetch failed, keeping prior totals");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(err.into()));
                    }
                }
            },
        }
    }

    fn finish_payment(
        &mut self,
        requirement: PaymentRequirement,
        record: UsageRecord,
        result: Result<InvokeReceipt, PaymentError>,
    ) {
        let Some(waiters) = self.in_flight.remove(&requirement) else {
            // Expired while in flight: waiters already got their failure. If
            // the backend settled anyway, the channel confirmation will still
            // reach the ledger.
            debug!("discarding late submission result for expired requirement");
            return;
        };
        match result {
            Ok(receipt) => {
                self.transition(ConnectionStatus::Connected);
                if self.current_requirement.as_ref() == Some(&requirement) {
                    self.clear_requirement();
                }
                match receipt.transaction_hash {
                    Some(tx_hash) => {
                        // The response carried settlement info: confirm now
                        // rather than waiting for the channel echo.
                        self.settle(record.confirmed_with(tx_hash));
                    }
                    None => {
                        debug!("submission accepted, awaiting settlement event");
                        self.pending_settlements.push(record);
                    }
                }
                for waiter in waiters {
                    let _ = waiter.send(Ok(true));
                }
            }
            Err(err) => {
                warn!(error = %err, "payment submission failed");
                self.transition(ConnectionStatus::PaymentRequired);
                if self.current_requirement.is_none() {
                    self.current_requirement = Some(requirement);
                    self.expiry_logged = false;
                }
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }

    /// Marries an inbound settlement with a locally pending record (by id
    /// first, then by tool), keeping the local id and creation time.
    fn adopt_pending(&mut self, incoming: UsageRecord) -> UsageRecord {
        let position = self
            .pending_settlements
            .iter()
            .position(|pending| pending.id == incoming.id || pending.tool == incoming.tool);
        match position {
            Some(index) => {
                let pending = self.pending_settlements.remove(index);
                UsageRecord {
                    id: pending.id,
                    timestamp: pending.timestamp,
                    ..incoming
                }
            }
            None => incoming,
        }
    }

    /// Settles one confirmed record into the ledger, deduplicating by
    /// transaction hash so an optimistic confirmation and its channel echo
    /// cannot double-count.
    fn settle(&mut self, record: UsageRecord) {
        if let Some(tx_hash) = &record.tx_hash {
            if !self.settled_hashes.insert(tx_hash.clone()) {
                debug!(tx_hash = %tx_hash, "duplicate settlement ignored");
                return;
            }
        }
        self.ledger.record_confirmed(record);
    }

    fn check_expiry(&mut self) {
        let expired: Vec<PaymentRequirement> = self
            .in_flight
            .keys()
            .filter(|requirement| requirement.is_expired())
            .cloned()
            .collect();
        for requirement in expired {
            warn!("payment requirement expired with submission in flight");
            if let Some(waiters) = self.in_flight.remove(&requirement) {
                for waiter in waiters {
                    let _ = waiter.send(Err(PaymentError::RequirementExpired));
                }
            }
        }
        if let Some(requirement) = &self.current_requirement {
            if requirement.is_expired() && !self.expiry_logged {
                warn!(expires_at = ?requirement.expires_at, "current payment requirement expired");
                self.expiry_logged = true;
            }
        }
    }

    fn clear_requirement(&mut self) {
        self.current_requirement = None;
        self.expiry_logged = false;
    }

    /// The single mutation path for [`ConnectionStatus`]. Transitions outside
    /// the legal table are logic errors: rejected and error-logged, never
    /// silently applied.
    fn transition(&mut self, next: ConnectionStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.may_transition(next) {
            error!(from = %self.status, to = %next, "illegal connection status transition rejected");
            return false;
        }
        #[cfg(feature = "telemetry")]
        tracing::debug!(from = %self.status, to = %next, "connection status transition");
        self.status = next;
        true
    }

    fn publish(&self) {
        let ledger = self.ledger.snapshot();
        self.snapshot.send_replace(SessionSnapshot {
            connection_status: self.status,
            is_connected: self.channel_up,
            session_cost: ledger.session_cost,
            total_spent: ledger.total_spent,
            recent_transactions: ledger.recent_transactions,
            last_payment: ledger.last_payment,
            current_requirement: self.current_requirement.clone(),
        });
    }
}

/// The submission pipeline for one payment: connect the wallet, sign the
/// transfer, post the witness for verification. Runs off the driver task so
/// the event loop never suspends on the network.
async fn submit_payment(
    wallet: Arc<dyn WalletProvider>,
    billing: BillingClient,
    user_id: String,
    requirement: &PaymentRequirement,
    invocation: &ToolInvocation,
) -> Result<InvokeReceipt, PaymentError> {
    let identity = wallet.connect().await?;
    debug!(sender = %identity.address, "wallet ready for payment");
    let intent = TransferIntent::from(requirement);
    let witness = wallet.sign_transfer(&intent).await?;
    let receipt = billing.invoke(&user_id, &witness, invocation).await?;
    Ok(receipt)
}
