//! Realtime billing channel.
//!
//! [`RealtimeChannel`] owns a best-effort persistent connection to the billing
//! backend for a given user identity, decodes inbound JSON events, and
//! recovers from drops with a fixed-delay reconnect loop. The wire itself is
//! behind the [`ChannelTransport`] trait: production code plugs in a real
//! duplex transport, tests script one.
//!
//! Failure policy: transport faults are absorbed here and surface only as
//! [`ChannelEvent::Disconnected`] followed by reconnect attempts; malformed
//! payloads are dropped and logged, never fatal to the channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::timestamp::UnixTimestamp;
use crate::types::{PaymentRequirement, UsageRecord, UsageStatus, generate_id};
use crate::util::money_amount::MoneyAmount;

/// Delay between a drop and the next reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Transport-level failures. Absorbed by the reconnect loop; never surfaced
/// to the coordinator's callers.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to establish billing channel connection: {0}")]
    Connect(String),
}

/// A bidirectional message stream keyed by user identity.
///
/// The production implementation is an external collaborator; the channel
/// only requires that it can be (re)connected and read frame by frame.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self, user_id: &str) -> Result<Box<dyn MessageStream>, TransportError>;
}

/// One established connection. `None` from [`next_message`](Self::next_message)
/// means the peer closed the stream.
#[async_trait]
pub trait MessageStream: Send {
    async fn next_message(&mut self) -> Option<String>;
}

/// Events the channel surfaces to its owner, in strict delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    PaymentRequired(PaymentRequirement),
    PaymentConfirmed(UsageRecord),
}

/// A persistent, self-healing connection to the billing backend.
///
/// `open` is idempotent and `close` is terminal: once closed, the channel
/// never reopens on its own and later `open` calls are no-ops. The reconnect
/// timer is owned here as a cancellable task rather than living inside a
/// callback, so disposal is deterministic.
pub struct RealtimeChannel {
    transport: Arc<dyn ChannelTransport>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    reconnect_delay: Duration,
    cancel: CancellationToken,
    tasks: TaskTracker,
    running: AtomicBool,
}

impl RealtimeChannel {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        events: mpsc::UnboundedSender<ChannelEvent>,
        reconnect_delay: Duration,
    ) -> Self {
        let tasks = TaskTracker::new();
        tasks.close();
        Self {
            transport,
            events,
            reconnect_delay,
            cancel: CancellationToken::new(),
            tasks,
            running: AtomicBool::new(false),
        }
    }

    /// Starts the connection loop for `user_id`.
    ///
    /// No-op when already connecting/open or already closed. With no user
    /// identity there is nothing to authenticate: the call fails silently,
    /// logging only.
    pub fn open(&self, user_id: Option<&str>) {
        if self.cancel.is_cancelled() {
            warn!("billing channel is closed, ignoring open");
            return;
        }
        let Some(user_id) = user_id else {
            warn!("no user identity, billing channel stays closed");
            return;
        };
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("billing channel already open");
            return;
        }
        self.tasks.spawn(run_loop(
            self.transport.clone(),
            user_id.to_owned(),
            self.events.clone(),
            self.reconnect_delay,
            self.cancel.clone(),
        ));
    }

    /// Tears down the transport and cancels any pending reconnect. Terminal.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the connection loop has fully stopped.
    pub async fn closed(&self) {
        self.tasks.wait().await;
    }
}

async fn run_loop(
    transport: Arc<dyn ChannelTransport>,
    user_id: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
    reconnect_delay: Duration,
    cancel: CancellationToken,
) {
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            connected = transport.connect(&user_id) => connected,
        };
        match connected {
            Ok(mut stream) => {
                debug!(user = %user_id, "billing channel connected");
                if events.send(ChannelEvent::Connected).is_err() {
                    return;
                }
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        message = stream.next_message() => match message {
                            Some(text) => {
                                if let Some(event) = decode_event(&text) {
                                    if events.send(event).is_err() {
                                        return;
                                    }
                                }
                            }
                            None => break,
                        }
                    }
                }
                warn!(user = %user_id, "billing channel dropped");
                if events.send(ChannelEvent::Disconnected).is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "billing channel connect failed");
                if events.send(ChannelEvent::Disconnected).is_err() {
                    return;
                }
            }
        }
        debug!(delay = ?reconnect_delay, "scheduling billing channel reconnect");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
}

/// Wire shape of a `payment_confirmed` event.
#[derive(Debug, Deserialize)]
struct PaymentConfirmedWire {
    #[serde(default)]
    id: Option<String>,
    tool: String,
    amount: MoneyAmount,
    transaction_hash: String,
}

impl PaymentConfirmedWire {
    fn into_record(self) -> UsageRecord {
        UsageRecord {
            id: self.id.unwrap_or_else(generate_id),
            tool: self.tool,
            cost: self.amount,
            timestamp: UnixTimestamp::now(),
            tx_hash: Some(self.transaction_hash),
            status: UsageStatus::Confirmed,
        }
    }
}

/// Decodes one inbound frame. Malformed payloads and unrecognized event types
/// yield `None`: dropped with a log line, never an error.
fn decode_event(text: &str) -> Option<ChannelEvent> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "dropping malformed billing channel payload");
            return None;
        }
    };
    let event_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match event_type {
        "payment_required" => {
            let requirement = value
                .get("requirement")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            match serde_json::from_value::<PaymentRequirement>(requirement) {
                Ok(requirement) => Some(ChannelEvent::PaymentRequired(requirement)),
                Err(err) => {
                    warn!(error = %err, "dropping malformed payment_required event");
                    None
                }
            }
        }
        "payment_confirmed" => match serde_json::from_value::<PaymentConfirmedWire>(value) {
            Ok(wire) => Some(ChannelEvent::PaymentConfirmed(wire.into_record())),
            Err(err) => {
                warn!(error = %err, "dropping malformed payment_confirmed event");
                None
            }
        },
        other => {
            // Forward compatibility: newer backends may emit event types we
            // do not know yet.
            debug!(event_type = other, "ignoring unrecognized billing event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;
    use tokio::time::{Duration, timeout};

    /// Transport whose connections are scripted ahead of time: each `connect`
    /// pops the next stream, erroring once the script runs out.
    struct ScriptedTransport {
        streams: Mutex<VecDeque<mpsc::UnboundedReceiver<String>>>,
        connects: AtomicUsize,
    }

    impl ScriptedTransport {
        fn with_streams(count: usize) -> (Arc<Self>, Vec<mpsc::UnboundedSender<String>>) {
            let mut senders = Vec::new();
            let mut streams = VecDeque::new();
            for _ in 0..count {
                let (tx, rx) = mpsc::unbounded_channel();
                senders.push(tx);
                streams.push_back(rx);
            }
            let transport = Arc::new(Self {
                streams: Mutex::new(streams),
                connects: AtomicUsize::new(0),
            });
            (transport, senders)
        }

        fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    struct ScriptedStream(mpsc::UnboundedReceiver<String>);

    #[async_trait]
    impl MessageStream for ScriptedStream {
        async fn next_message(&mut self) -> Option<String> {
            self.0.recv().await
        }
    }

    #[async_trait]
    impl ChannelTransport for ScriptedTransport {
        async fn connect(&self, _user_id: &str) -> Result<Box<dyn MessageStream>, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let next = self.streams.lock().await.pop_front();
            match next {
                Some(rx) => Ok(Box::new(ScriptedStream(rx))),
                None => Err(TransportError::Connect("script exhausted".into())),
            }
        }
    }

    fn channel_with(
        transport: Arc<ScriptedTransport>,
        delay: Duration,
    ) -> (RealtimeChannel, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RealtimeChannel::new(transport, tx, delay), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("channel event stream ended")
    }

    #[tokio::test]
    async fn emits_connected_on_open() {
        let (transport, _senders) = ScriptedTransport::with_streams(1);
        let (channel, mut events) = channel_with(transport, Duration::from_millis(10));
        channel.open(Some("user-1"));
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);
        channel.close();
    }

    #[tokio::test]
    async fn open_without_identity_is_a_logged_noop() {
        let (transport, _senders) = ScriptedTransport::with_streams(1);
        let (channel, mut events) = channel_with(transport.clone(), Duration::from_millis(10));
        channel.open(None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.connect_count(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let (transport, _senders) = ScriptedTransport::with_streams(2);
        let (channel, mut events) = channel_with(transport.clone(), Duration::from_secs(30));
        channel.open(Some("user-1"));
        channel.open(Some("user-1"));
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.connect_count(), 1);
        channel.close();
    }

    #[tokio::test]
    async fn decodes_payment_required_events() {
        let (transport, senders) = ScriptedTransport::with_streams(1);
        let (channel, mut events) = channel_with(transport, Duration::from_millis(10));
        channel.open(Some("user-1"));
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);

        senders[0]
            .send(
                r#"{"type":"payment_required","requirement":{
                    "amount":"0.002","currency":"USDC","network":"base","address":"0xabc"
                }}"#
                .into(),
            )
            .unwrap();

        match next_event(&mut events).await {
            ChannelEvent::PaymentRequired(requirement) => {
                assert_eq!(requirement.amount, MoneyAmount::parse("0.002").unwrap());
                assert_eq!(requirement.address, "0xabc");
            }
            other => panic!("expected payment_required, got {other:?}"),
        }
        channel.close();
    }

    #[tokio::test]
    async fn decodes_payment_confirmed_and_generates_missing_id() {
        let (transport, senders) = ScriptedTransport::with_streams(1);
        let (channel, mut events) = channel_with(transport, Duration::from_millis(10));
        channel.open(Some("user-1"));
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);

        senders[0]
            .send(
                r#"{"type":"payment_confirmed","tool":"getAccounts",
                    "amount":"0.002","transaction_hash":"0xdead"}"#
                    .into(),
            )
            .unwrap();

        match next_event(&mut events).await {
            ChannelEvent::PaymentConfirmed(record) => {
                assert!(!record.id.is_empty());
                assert_eq!(record.tool, "getAccounts");
                assert_eq!(record.tx_hash.as_deref(), Some("0xdead"));
                assert_eq!(record.status, UsageStatus::Confirmed);
            }
            other => panic!("expected payment_confirmed, got {other:?}"),
        }
        channel.close();
    }

    #[tokio::test]
    async fn malformed_and_unknown_payloads_are_dropped_not_fatal() {
        let (transport, senders) = ScriptedTransport::with_streams(1);
        let (channel, mut events) = channel_with(transport, Duration::from_millis(10));
        channel.open(Some("user-1"));
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);

        senders[0].send("{not json".into()).unwrap();
        senders[0].send(r#"{"type":"rate_limit_notice"}"#.into()).unwrap();
        senders[0]
            .send(r#"{"type":"payment_confirmed","tool":42}"#.into())
            .unwrap();
        senders[0]
            .send(
                r#"{"type":"payment_confirmed","tool":"getBalance",
                    "amount":"0.001","transaction_hash":"0xbeef"}"#
                    .into(),
            )
            .unwrap();

        // only the well-formed event comes through, and the channel survives
        match next_event(&mut events).await {
            ChannelEvent::PaymentConfirmed(record) => assert_eq!(record.tool, "getBalance"),
            other => panic!("expected payment_confirmed, got {other:?}"),
        }
        channel.close();
    }

    #[tokio::test]
    async fn reconnects_after_every_drop_until_closed() {
        let (transport, mut senders) = ScriptedTransport::with_streams(3);
        let (channel, mut events) = channel_with(transport.clone(), Duration::from_millis(10));
        channel.open(Some("user-1"));

        for _ in 0..3 {
            assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);
            // force-close the current connection
            drop(senders.remove(0));
            assert_eq!(next_event(&mut events).await, ChannelEvent::Disconnected);
        }

        // script exhausted: connect attempts keep failing and keep retrying
        assert_eq!(next_event(&mut events).await, ChannelEvent::Disconnected);
        assert!(transport.connect_count() >= 4);

        channel.close();
        channel.closed().await;
        let attempts = transport.connect_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.connect_count(), attempts);
    }

    #[tokio::test]
    async fn close_is_terminal_for_open() {
        let (transport, _senders) = ScriptedTransport::with_streams(1);
        let (channel, mut events) = channel_with(transport.clone(), Duration::from_millis(10));
        channel.close();
        channel.open(Some("user-1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.connect_count(), 0);
        assert!(events.try_recv().is_err());
    }
}
