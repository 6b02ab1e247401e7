// =============================================================================
// Connection orchestrator — event dispatch, RPC correlation, synchronization
// =============================================================================
//
// Owns the inbound event queue. A single pump task drains it and fans every
// event out to the registered listeners in registration order, one listener
// at a time, so reducers observe events exactly as they arrived. Listener
// errors are logged and contained; they never stop the pump.
//
// The outbound side correlates trade requests with their responses through
// `requestId -> oneshot` and enforces a transport-level deadline.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::client_api::ClientApiClient;
use crate::error::{Result, SdkError};
use crate::events::{SynchronizationListener, TerminalEvent};
use crate::health_monitor::ConnectionHealthMonitor;
use crate::terminal_state::{TerminalHashes, TerminalState};
use crate::transport::{InboundMessage, RpcResponse, TerminalTransport};
use crate::types::{TradeResponse, TRADE_RETCODE_DONE};

/// Deadline for a correlated trade response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Market-data symbols the connection is subscribed to.
///
/// Shared between the orchestrator (which mutates it) and the health monitor
/// (which reads it every quote-health tick).
#[derive(Default)]
pub struct SubscriptionRegistry {
    symbols: RwLock<Vec<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, symbol: &str) {
        let mut symbols = self.symbols.write();
        if !symbols.iter().any(|s| s == symbol) {
            symbols.push(symbol.to_string());
        }
    }

    pub fn remove(&self, symbol: &str) {
        self.symbols.write().retain(|s| s != symbol);
    }

    pub fn symbols(&self) -> Vec<String> {
        self.symbols.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.read().is_empty()
    }
}

/// Live connection to one trading account's event stream.
pub struct TerminalConnection {
    account_id: String,
    transport: Arc<dyn TerminalTransport>,
    terminal_state: Arc<TerminalState>,
    health_monitor: Arc<ConnectionHealthMonitor>,
    subscriptions: Arc<SubscriptionRegistry>,
    listeners: RwLock<Vec<Arc<dyn SynchronizationListener>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<TradeResponse>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalConnection {
    /// Build the connection, register the replica and health monitor as the
    /// first listeners, and start pumping `inbound`.
    ///
    /// Must run inside a tokio runtime: the pump and the monitor's 1 Hz jobs
    /// are spawned here.
    pub fn new(
        account_id: impl Into<String>,
        transport: Arc<dyn TerminalTransport>,
        inbound: UnboundedReceiver<InboundMessage>,
    ) -> Arc<Self> {
        let account_id = account_id.into();
        let terminal_state = Arc::new(TerminalState::new());
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let health_monitor = Arc::new(ConnectionHealthMonitor::new(
            Arc::clone(&terminal_state),
            Arc::clone(&subscriptions),
            account_id.clone(),
        ));

        let listeners: Vec<Arc<dyn SynchronizationListener>> = vec![
            Arc::clone(&terminal_state) as Arc<dyn SynchronizationListener>,
            Arc::clone(&health_monitor) as Arc<dyn SynchronizationListener>,
        ];

        let connection = Arc::new(Self {
            account_id,
            transport,
            terminal_state,
            health_monitor: Arc::clone(&health_monitor),
            subscriptions,
            listeners: RwLock::new(listeners),
            pending: Mutex::new(HashMap::new()),
            pump: Mutex::new(None),
        });

        health_monitor.start();
        let pump = tokio::spawn(Self::run_pump(Arc::clone(&connection), inbound));
        *connection.pump.lock() = Some(pump);
        connection
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn terminal_state(&self) -> &Arc<TerminalState> {
        &self.terminal_state
    }

    pub fn health_monitor(&self) -> &Arc<ConnectionHealthMonitor> {
        &self.health_monitor
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    /// True once every present replica has finished synchronization.
    pub fn synchronized(&self) -> bool {
        self.terminal_state.synchronized()
    }

    // ── Listener registry ───────────────────────────────────────────────

    /// Append a listener; it will see every event after the built-in ones.
    pub fn add_synchronization_listener(&self, listener: Arc<dyn SynchronizationListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove a previously added listener.
    pub fn remove_synchronization_listener(&self, listener: &Arc<dyn SynchronizationListener>) {
        self.listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    // ── Synchronization ─────────────────────────────────────────────────

    /// Resolve once every present replica reaches full synchronization.
    pub async fn wait_synchronized(&self, timeout: Duration) -> Result<()> {
        let wait = async {
            loop {
                if self.terminal_state.synchronized() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SdkError::timeout("wait_synchronized", timeout))
    }

    /// Ask the server to rebuild the event stream.
    pub async fn reconnect(&self) -> Result<()> {
        self.transport
            .send(serde_json::json!({
                "type": "reconnect",
                "accountId": self.account_id,
            }))
            .await
    }

    /// Subscribe to streaming market data for `symbol`.
    pub async fn subscribe_to_market_data(&self, symbol: &str) -> Result<()> {
        if symbol.is_empty() {
            return Err(SdkError::Validation("symbol must not be empty".into()));
        }
        self.subscriptions.add(symbol);
        self.transport
            .send(serde_json::json!({
                "type": "subscribeToMarketData",
                "accountId": self.account_id,
                "symbol": symbol,
            }))
            .await
    }

    /// Stop streaming market data for `symbol`.
    pub async fn unsubscribe_from_market_data(&self, symbol: &str) -> Result<()> {
        self.subscriptions.remove(symbol);
        self.transport
            .send(serde_json::json!({
                "type": "unsubscribeFromMarketData",
                "accountId": self.account_id,
                "symbol": symbol,
            }))
            .await
    }

    /// Content hashes of the replica, normalized with the registry's
    /// ignored-field lists for `account_type`.
    pub async fn get_hashes(
        &self,
        account_type: &str,
        client_api: &ClientApiClient,
        region: &str,
    ) -> Result<TerminalHashes> {
        let lists = client_api.get_hashing_ignored_field_lists(region).await?;
        self.terminal_state
            .get_hashes(account_type, lists.for_account_type(account_type))
    }

    /// Stop the pump and the health monitor jobs.
    pub async fn close(&self) {
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }
        self.health_monitor.stop().await;
    }

    // ── Trade RPC ───────────────────────────────────────────────────────

    /// Submit a trade descriptor and await the correlated response.
    ///
    /// A response with any retcode other than `TRADE_RETCODE_DONE` surfaces
    /// as a `Trade` error preserving the server's codes.
    pub(crate) async fn trade(&self, descriptor: Map<String, Value>) -> Result<TradeResponse> {
        let request_id = Uuid::new_v4().to_string();
        let mut payload = Map::new();
        payload.insert("type".into(), Value::from("trade"));
        payload.insert("accountId".into(), Value::from(self.account_id.clone()));
        payload.insert("requestId".into(), Value::from(request_id.clone()));
        payload.extend(descriptor);

        let rx = {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(request_id.clone(), tx);
            rx
        };

        if let Err(err) = self.transport.send(Value::Object(payload)).await {
            self.pending.lock().remove(&request_id);
            return Err(err);
        }

        let response = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(SdkError::Internal(
                    "trade response channel dropped".into(),
                ))
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                return Err(SdkError::timeout("trade", REQUEST_TIMEOUT));
            }
        };

        if response.string_code == TRADE_RETCODE_DONE {
            Ok(response)
        } else {
            Err(SdkError::Trade {
                numeric_code: response.numeric_code,
                string_code: response.string_code,
                message: response.message,
            })
        }
    }

    // ── Event pump ──────────────────────────────────────────────────────

    async fn run_pump(connection: Arc<Self>, mut inbound: UnboundedReceiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            match message {
                InboundMessage::Event(event) => connection.dispatch(&event),
                InboundMessage::Response(response) => connection.complete_request(response),
            }
        }
        debug!(account_id = %connection.account_id, "inbound queue closed, pump exiting");
    }

    /// Fan one event out to every listener, in registration order. A failing
    /// listener is logged and skipped; the snapshot it owns stays as-is.
    fn dispatch(&self, event: &TerminalEvent) {
        let listeners: Vec<Arc<dyn SynchronizationListener>> = self.listeners.read().clone();
        for listener in listeners {
            if let Err(err) = listener.on_event(event) {
                error!(
                    account_id = %self.account_id,
                    timestamp = %Utc::now().to_rfc3339(),
                    error = %err,
                    "listener failed to process event"
                );
            }
        }
    }

    fn complete_request(&self, response: RpcResponse) {
        match self.pending.lock().remove(&response.request_id) {
            Some(tx) => {
                let _ = tx.send(response.response);
            }
            None => warn!(
                account_id = %self.account_id,
                request_id = %response.request_id,
                "response without a pending request"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

    use crate::transport::test_support::EchoTransport;
    use crate::types::{AccountInformation, Price};

    fn full_sync_events(ix: &str) -> Vec<TerminalEvent> {
        vec![
            TerminalEvent::Connected {
                instance_index: ix.into(),
                replicas: 1,
            },
            TerminalEvent::AccountInformationUpdated {
                instance_index: ix.into(),
                account_information: AccountInformation {
                    balance: 1000.0,
                    ..AccountInformation::default()
                },
            },
            TerminalEvent::PositionsSynchronized {
                instance_index: ix.into(),
                synchronization_id: "syncId".into(),
            },
            TerminalEvent::PendingOrdersSynchronized {
                instance_index: ix.into(),
                synchronization_id: "syncId".into(),
            },
        ]
    }

    fn connect() -> (
        Arc<TerminalConnection>,
        Arc<EchoTransport>,
        UnboundedSender<InboundMessage>,
    ) {
        let (tx, rx) = unbounded_channel();
        let transport = Arc::new(EchoTransport::new(tx.clone()));
        let connection = TerminalConnection::new(
            "accountId",
            Arc::clone(&transport) as Arc<dyn TerminalTransport>,
            rx,
        );
        (connection, transport, tx)
    }

    #[tokio::test]
    async fn pump_reduces_events_into_the_replica() {
        let (connection, _transport, tx) = connect();
        for event in full_sync_events("0") {
            tx.send(InboundMessage::Event(event)).unwrap();
        }
        connection
            .wait_synchronized(Duration::from_secs(2))
            .await
            .unwrap();

        assert!(connection.terminal_state().connected());
        assert_eq!(
            connection
                .terminal_state()
                .account_information()
                .unwrap()
                .balance,
            1000.0
        );
        connection.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wait_synchronized_times_out_without_sync() {
        let (connection, _transport, tx) = connect();
        tx.send(InboundMessage::Event(TerminalEvent::Connected {
            instance_index: "0".into(),
            replicas: 1,
        }))
        .unwrap();

        let result = connection.wait_synchronized(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SdkError::Timeout { .. })));
        connection.close().await;
    }

    #[tokio::test]
    async fn trade_round_trips_through_the_correlator() {
        let (connection, transport, _tx) = connect();
        let mut descriptor = Map::new();
        descriptor.insert("actionType".into(), Value::from("ORDER_TYPE_BUY"));
        descriptor.insert("symbol".into(), Value::from("GBPUSD"));
        descriptor.insert("volume".into(), Value::from(0.07));

        let response = connection.trade(descriptor).await.unwrap();
        assert_eq!(response.string_code, TRADE_RETCODE_DONE);
        assert_eq!(response.order_id.as_deref(), Some("46870472"));

        let sent = transport.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "trade");
        assert_eq!(sent[0]["accountId"], "accountId");
        assert_eq!(sent[0]["symbol"], "GBPUSD");
        assert!(sent[0]["requestId"].is_string());
        connection.close().await;
    }

    #[tokio::test]
    async fn trade_errors_preserve_the_server_codes() {
        let (connection, transport, _tx) = connect();
        transport.fail_with(10014, "TRADE_RETCODE_INVALID_VOLUME", "Invalid volume");

        let mut descriptor = Map::new();
        descriptor.insert("actionType".into(), Value::from("ORDER_TYPE_BUY"));
        let result = connection.trade(descriptor).await;
        match result {
            Err(SdkError::Trade {
                numeric_code,
                string_code,
                message,
            }) => {
                assert_eq!(numeric_code, 10014);
                assert_eq!(string_code, "TRADE_RETCODE_INVALID_VOLUME");
                assert_eq!(message, "Invalid volume");
            }
            other => panic!("expected trade error, got {other:?}"),
        }
        connection.close().await;
    }

    #[tokio::test]
    async fn failing_listener_does_not_stop_dispatch() {
        struct FailingListener;
        impl SynchronizationListener for FailingListener {
            fn on_event(&self, _event: &TerminalEvent) -> Result<()> {
                Err(SdkError::Internal("listener bug".into()))
            }
        }

        struct CountingListener(AtomicUsize);
        impl SynchronizationListener for CountingListener {
            fn on_event(&self, _event: &TerminalEvent) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let (connection, _transport, tx) = connect();
        connection.add_synchronization_listener(Arc::new(FailingListener));
        let counter = Arc::new(CountingListener(AtomicUsize::new(0)));
        connection.add_synchronization_listener(
            Arc::clone(&counter) as Arc<dyn SynchronizationListener>
        );

        for event in full_sync_events("0") {
            tx.send(InboundMessage::Event(event)).unwrap();
        }
        connection
            .wait_synchronized(Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(counter.0.load(Ordering::SeqCst), 4);
        connection.close().await;
    }

    #[tokio::test]
    async fn subscriptions_are_tracked_and_sent() {
        let (connection, transport, _tx) = connect();
        connection.subscribe_to_market_data("EURUSD").await.unwrap();
        connection.subscribe_to_market_data("EURUSD").await.unwrap();
        assert_eq!(connection.subscriptions().symbols(), vec!["EURUSD"]);

        connection
            .unsubscribe_from_market_data("EURUSD")
            .await
            .unwrap();
        assert!(connection.subscriptions().is_empty());

        let sent = transport.sent.lock().clone();
        assert_eq!(sent[0]["type"], "subscribeToMarketData");
        assert_eq!(sent[2]["type"], "unsubscribeFromMarketData");
        connection.close().await;
    }

    #[tokio::test]
    async fn stream_closed_drops_the_replica_from_reads() {
        let (connection, _transport, tx) = connect();
        for event in full_sync_events("0") {
            tx.send(InboundMessage::Event(event)).unwrap();
        }
        tx.send(InboundMessage::Event(TerminalEvent::SymbolPricesUpdated {
            instance_index: "0".into(),
            prices: vec![Price {
                symbol: "EURUSD".into(),
                bid: 1.1,
                ask: 1.2,
                ..Price::default()
            }],
            equity: None,
            margin: None,
            free_margin: None,
            margin_level: None,
            account_currency_exchange_rate: None,
        }))
        .unwrap();
        connection
            .wait_synchronized(Duration::from_secs(2))
            .await
            .unwrap();
        assert!(connection.terminal_state().price("EURUSD").is_some());

        tx.send(InboundMessage::Event(TerminalEvent::StreamClosed {
            instance_index: "0".into(),
        }))
        .unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(connection.terminal_state().price("EURUSD").is_none());
        connection.close().await;
    }

    #[tokio::test]
    async fn reconnect_sends_the_rebuild_request() {
        let (connection, transport, _tx) = connect();
        connection.reconnect().await.unwrap();
        let sent = transport.sent.lock().clone();
        assert_eq!(sent[0]["type"], "reconnect");
        assert_eq!(sent[0]["accountId"], "accountId");
        connection.close().await;
    }
}
