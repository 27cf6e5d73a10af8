use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use relay_cache::StateCache;
use relay_latency::{LatencyRegistry, LatencyTracker};
use relay_model::{Order, OrderBookSnapshot, Position};

use crate::connection::{ConnState, ConnectionId, ConnectionTable, SendFailure};
use crate::error::{DistributionError, ProtocolError};
use crate::index::SubscriptionIndex;
use crate::protocol::{
    orderbook_channel, orders_channel, positions_channel, ClientRequest, ServerMessage,
    ORDERBOOK_PREFIX,
};

/// How long a closing connection's writer gets to flush.
const WRITER_DRAIN: Duration = Duration::from_secs(2);
/// How long `serve` waits for connection tasks after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct DistributionStats {
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub messages_sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub protocol_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributionStatsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub protocol_errors: u64,
}

impl DistributionStats {
    pub fn snapshot(&self) -> DistributionStatsSnapshot {
        DistributionStatsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

/// Downstream pub/sub server.
///
/// Each accepted socket gets a reader task (this module) and a writer task
/// fed by a bounded queue. Broadcasts never block: a full or closed queue is
/// a failed send for that connection only.
pub struct DistributionServer {
    connections: ConnectionTable,
    index: SubscriptionIndex,
    cache: Arc<StateCache>,
    stats: DistributionStats,
    broadcast_latency: Arc<LatencyTracker>,
}

impl DistributionServer {
    pub fn new(cache: Arc<StateCache>, latency: &LatencyRegistry) -> Self {
        Self {
            connections: ConnectionTable::new(),
            index: SubscriptionIndex::new(),
            cache,
            stats: DistributionStats::default(),
            broadcast_latency: latency.tracker("distribution.broadcast"),
        }
    }

    pub async fn bind(addr: &str) -> Result<TcpListener, DistributionError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| DistributionError::Bind {
                addr: addr.to_string(),
                source,
            })
    }

    /// Accept connections until `shutdown` flips to true (or its sender is
    /// dropped), then close every connection.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), DistributionError> {
        let local = listener.local_addr()?;
        info!(addr = %local, "distribution server listening");

        let mut tasks = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let server = Arc::clone(&self);
                        let shutdown = shutdown.clone();
                        tasks.spawn(server.run_connection(socket, peer, shutdown));
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "connection task failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(connections = tasks.len(), "distribution server shutting down");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "connection tasks did not finish in time, aborting");
            tasks.abort_all();
        }
        info!("distribution server stopped");
        Ok(())
    }

    async fn run_connection(
        self: Arc<Self>,
        socket: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (id, mut outbound) = self.connections.register(Some(peer));

        let ws = match accept_async(socket).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(conn = %id, %peer, error = %e, "websocket handshake failed");
                self.close_connection(id);
                return;
            }
        };
        let (mut sink, mut source) = ws.split();

        let mut writer = tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!(conn = %id, error = %e, "websocket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        if let Err(e) = self.connections.transition(id, ConnState::Open) {
            error!(conn = %id, error = %e, "failed to open connection");
            self.close_connection(id);
            writer.abort();
            return;
        }
        self.stats.connections_opened.fetch_add(1, Ordering::Relaxed);
        info!(conn = %id, %peer, "client connected");
        self.send_to(id, &ServerMessage::welcome());

        loop {
            tokio::select! {
                msg = source.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => self.handle_client_message(id, &text).await,
                    Some(Ok(WsMessage::Binary(_))) => self.reject(id, ProtocolError::Binary),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(conn = %id, error = %e, "websocket read failed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    let _ = self.connections.try_send(id, WsMessage::Close(None));
                    break;
                }
            }
        }

        self.close_connection(id);
        if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            writer.abort();
        }
    }

    /// Open -> Closing, purge subscriptions, then Closed and gone.
    fn close_connection(&self, id: ConnectionId) {
        let was_open = self.connections.state(id) == Some(ConnState::Open);
        let peer = self.connections.peer(id);
        if let Err(e) = self.connections.transition(id, ConnState::Closing) {
            warn!(conn = %id, error = %e, "unexpected state while closing");
        }
        let channels = self.index.remove_connection(id);
        if let Err(e) = self.connections.remove(id) {
            warn!(conn = %id, error = %e, "failed to remove connection");
        }
        if was_open {
            self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
            info!(conn = %id, peer = ?peer, purged = channels.len(), "client disconnected");
        }
    }

    /// Act on one text frame from a client. Every outcome is a reply; nothing
    /// here closes the connection.
    pub async fn handle_client_message(&self, conn: ConnectionId, text: &str) {
        if self.connections.state(conn) != Some(ConnState::Open) {
            debug!(conn = %conn, "message for connection that is not open, ignoring");
            return;
        }

        let request = match ClientRequest::parse(text) {
            Ok(request) => request,
            Err(e) => {
                self.reject(conn, e);
                return;
            }
        };

        match request {
            ClientRequest::Subscribe { channel } => {
                let added = self.index.subscribe(conn, &channel);
                debug!(conn = %conn, channel = %channel, added, "client subscribed");
                self.send_to(
                    conn,
                    &ServerMessage::Subscribed {
                        channel: channel.clone(),
                    },
                );

                if let Some(instrument) = channel
                    .strip_prefix(ORDERBOOK_PREFIX)
                    .filter(|i| !i.is_empty())
                {
                    self.send_initial_orderbook(conn, instrument).await;
                }
            }
            ClientRequest::Unsubscribe { channel } => {
                if self.index.unsubscribe(conn, &channel) {
                    debug!(conn = %conn, channel = %channel, "client unsubscribed");
                    self.send_to(conn, &ServerMessage::Unsubscribed { channel });
                } else {
                    self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    self.send_to(
                        conn,
                        &ServerMessage::error(format!("not subscribed to {}", channel)),
                    );
                }
            }
        }
    }

    /// Snapshot for a new `orderbook.*` subscriber, sent to that connection
    /// only. A failed fetch is reported; the subscription stays.
    async fn send_initial_orderbook(&self, conn: ConnectionId, instrument: &str) {
        match self.cache.orderbook(instrument).await {
            Ok(book) => {
                self.send_to(conn, &ServerMessage::orderbook(&book));
            }
            Err(e) => {
                warn!(conn = %conn, instrument, error = %e, "initial order book fetch failed");
                self.send_to(
                    conn,
                    &ServerMessage::error(format!(
                        "failed to fetch order book for {}: {}",
                        instrument, e
                    )),
                );
            }
        }
    }

    fn reject(&self, conn: ConnectionId, err: ProtocolError) {
        self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
        debug!(conn = %conn, error = %err, "bad client message");
        self.send_to(conn, &ServerMessage::error(err.to_string()));
    }

    fn send_to(&self, conn: ConnectionId, msg: &ServerMessage) -> bool {
        match msg.to_json() {
            Ok(payload) => self.deliver(conn, WsMessage::Text(payload)),
            Err(e) => {
                error!(conn = %conn, error = %e, "failed to encode server message");
                false
            }
        }
    }

    fn deliver(&self, conn: ConnectionId, msg: WsMessage) -> bool {
        match self.connections.try_send(conn, msg) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(failure) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                match failure {
                    SendFailure::Full => warn!(conn = %conn, "outbound queue full, message dropped"),
                    other => debug!(conn = %conn, reason = ?other, "send skipped"),
                }
                false
            }
        }
    }

    /// Send to every open connection. Returns the number of successful sends.
    pub fn broadcast_all(&self, payload: &str) -> usize {
        let _timer = self.broadcast_latency.scoped();
        self.connections
            .open_ids()
            .into_iter()
            .filter(|id| self.deliver(*id, WsMessage::Text(payload.to_string())))
            .count()
    }

    /// Send to the channel's current subscribers. An unknown or empty channel
    /// sends nothing.
    pub fn broadcast_to_channel(&self, channel: &str, payload: &str) -> usize {
        let subscribers = self.index.subscribers(channel);
        if subscribers.is_empty() {
            return 0;
        }
        let _timer = self.broadcast_latency.scoped();
        subscribers
            .into_iter()
            .filter(|id| self.deliver(*id, WsMessage::Text(payload.to_string())))
            .count()
    }

    fn publish(&self, channel: &str, msg: &ServerMessage) -> usize {
        if self.index.subscriber_count(channel) == 0 {
            return 0;
        }
        match msg.to_json() {
            Ok(payload) => self.broadcast_to_channel(channel, &payload),
            Err(e) => {
                error!(channel, error = %e, "failed to encode event");
                0
            }
        }
    }

    pub fn publish_orderbook(&self, book: &OrderBookSnapshot) -> usize {
        self.publish(
            &orderbook_channel(&book.instrument_name),
            &ServerMessage::orderbook(book),
        )
    }

    pub fn publish_order(&self, order: &Order) -> usize {
        self.publish(
            &orders_channel(&order.instrument_name),
            &ServerMessage::Order(order.clone()),
        )
    }

    pub fn publish_position(&self, position: &Position) -> usize {
        self.publish(
            &positions_channel(&position.instrument_name),
            &ServerMessage::Position(position.clone()),
        )
    }

    /// Open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.open_ids().len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.index.subscriber_count(channel)
    }

    pub fn subscriptions_of(&self, conn: ConnectionId) -> Vec<String> {
        self.index.channels_of(conn)
    }

    pub fn stats(&self) -> DistributionStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_gateway::test_helpers::{order_book_json, order_json, MockGateway, MockResponse};
    use relay_gateway::DeribitApi;
    use relay_model::decode;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn server_with(mock: Arc<MockGateway>) -> Arc<DistributionServer> {
        let latency = LatencyRegistry::new();
        let api = DeribitApi::new(mock, Duration::from_secs(1));
        let cache = Arc::new(StateCache::new(api, 10, &latency));
        Arc::new(DistributionServer::new(cache, &latency))
    }

    fn open(server: &DistributionServer) -> (ConnectionId, mpsc::Receiver<WsMessage>) {
        let (id, rx) = server.connections.register(None);
        server.connections.transition(id, ConnState::Open).unwrap();
        (id, rx)
    }

    fn next_json(rx: &mut mpsc::Receiver<WsMessage>) -> Value {
        match rx.try_recv().expect("expected a message") {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_orderbook_subscribe_sends_snapshot_to_subscriber_only() {
        let mock = Arc::new(MockGateway::new());
        mock.respond(
            "public/get_order_book",
            MockResponse::Ok(order_book_json("BTC-PERPETUAL", 42)),
        );
        let server = server_with(mock.clone());
        let (a, mut rx_a) = open(&server);
        let (_b, mut rx_b) = open(&server);

        server
            .handle_client_message(a, r#"{"type":"subscribe","channel":"orderbook.BTC-PERPETUAL"}"#)
            .await;

        assert_eq!(
            next_json(&mut rx_a),
            json!({"type": "subscribed", "channel": "orderbook.BTC-PERPETUAL"})
        );
        let book = next_json(&mut rx_a);
        assert_eq!(book["type"], "orderbook");
        assert_eq!(book["timestamp"], "42");
        assert_eq!(book["bids"][0], json!([50000.0, 10.0]));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(mock.call_count("public/get_order_book"), 1);
        assert_eq!(server.subscriber_count("orderbook.BTC-PERPETUAL"), 1);
    }

    #[tokio::test]
    async fn test_snapshot_fetch_failure_keeps_subscription() {
        let mock = Arc::new(MockGateway::new());
        mock.respond(
            "public/get_order_book",
            MockResponse::TransportError("connection reset".into()),
        );
        let server = server_with(mock);
        let (a, mut rx) = open(&server);

        server
            .handle_client_message(a, r#"{"type":"subscribe","channel":"orderbook.ETH-PERPETUAL"}"#)
            .await;
        assert_eq!(next_json(&mut rx)["type"], "subscribed");
        let err = next_json(&mut rx);
        assert_eq!(err["type"], "error");
        assert!(err["message"].as_str().unwrap().contains("ETH-PERPETUAL"));
        assert_eq!(server.subscriptions_of(a), vec!["orderbook.ETH-PERPETUAL".to_string()]);
    }

    #[tokio::test]
    async fn test_non_orderbook_channel_has_no_snapshot() {
        let mock = Arc::new(MockGateway::new());
        let server = server_with(mock.clone());
        let (a, mut rx) = open(&server);
        server
            .handle_client_message(a, r#"{"type":"subscribe","channel":"orders.BTC-PERPETUAL"}"#)
            .await;
        assert_eq!(next_json(&mut rx)["type"], "subscribed");
        assert!(rx.try_recv().is_err());
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_protocol_errors_reply_and_keep_connection() {
        let server = server_with(Arc::new(MockGateway::new()));
        let (a, mut rx) = open(&server);

        for bad in [
            "not json",
            r#"{"channel":"x"}"#,
            r#"{"type":"publish","channel":"x"}"#,
            r#"{"type":"subscribe"}"#,
        ] {
            server.handle_client_message(a, bad).await;
            assert_eq!(next_json(&mut rx)["type"], "error", "for {}", bad);
        }
        assert_eq!(server.stats().protocol_errors, 4);
        assert_eq!(server.connections.state(a), Some(ConnState::Open));
    }

    #[tokio::test]
    async fn test_unsubscribe_round_trip() {
        let server = server_with(Arc::new(MockGateway::new()));
        let (a, mut rx) = open(&server);

        server
            .handle_client_message(a, r#"{"type":"unsubscribe","channel":"trades.x"}"#)
            .await;
        assert_eq!(
            next_json(&mut rx),
            json!({"type": "error", "message": "not subscribed to trades.x"})
        );

        server
            .handle_client_message(a, r#"{"type":"subscribe","channel":"trades.x"}"#)
            .await;
        server
            .handle_client_message(a, r#"{"type":"unsubscribe","channel":"trades.x"}"#)
            .await;
        assert_eq!(next_json(&mut rx)["type"], "subscribed");
        assert_eq!(next_json(&mut rx), json!({"type": "unsubscribed", "channel": "trades.x"}));
        assert!(server.subscriptions_of(a).is_empty());
        assert_eq!(server.subscriber_count("trades.x"), 0);
    }

    #[tokio::test]
    async fn test_broadcast_to_channel_one_send_per_subscriber() {
        let server = server_with(Arc::new(MockGateway::new()));
        let (a, mut rx_a) = open(&server);
        let (b, mut rx_b) = open(&server);
        let (_c, mut rx_c) = open(&server);
        server.index.subscribe(a, "orderbook.BTC-PERPETUAL");
        server.index.subscribe(b, "orderbook.BTC-PERPETUAL");

        assert_eq!(server.broadcast_to_channel("orderbook.BTC-PERPETUAL", "{\"n\":1}"), 2);
        assert_eq!(rx_a.try_recv().unwrap(), WsMessage::Text("{\"n\":1}".into()));
        assert_eq!(rx_b.try_recv().unwrap(), WsMessage::Text("{\"n\":1}".into()));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_channel_is_noop() {
        let server = server_with(Arc::new(MockGateway::new()));
        let (_a, mut rx) = open(&server);
        assert_eq!(server.broadcast_to_channel("nobody.listens", "x"), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(server.stats().send_failures, 0);
    }

    #[tokio::test]
    async fn test_broadcast_continues_past_failed_connection() {
        let server = server_with(Arc::new(MockGateway::new()));
        let (a, rx_a) = open(&server);
        let (_b, mut rx_b) = open(&server);
        let (_c, mut rx_c) = open(&server);
        drop(rx_a);

        assert_eq!(server.broadcast_all("ping"), 2);
        assert_eq!(server.stats().send_failures, 1);
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
        // the failed connection is not disconnected by a failed send
        assert_eq!(server.connections.state(a), Some(ConnState::Open));
        assert_eq!(server.connection_count(), 3);
    }

    #[tokio::test]
    async fn test_close_purges_all_subscriptions() {
        let server = server_with(Arc::new(MockGateway::new()));
        let (a, _rx_a) = open(&server);
        let (b, _rx_b) = open(&server);
        for ch in ["orderbook.BTC-PERPETUAL", "orders.BTC-PERPETUAL", "positions.BTC-PERPETUAL"] {
            server.index.subscribe(a, ch);
        }
        server.index.subscribe(b, "orders.BTC-PERPETUAL");

        server.close_connection(a);
        assert!(server.subscriptions_of(a).is_empty());
        assert_eq!(server.subscriber_count("orderbook.BTC-PERPETUAL"), 0);
        assert_eq!(server.subscriber_count("orders.BTC-PERPETUAL"), 1);
        assert_eq!(server.connections.state(a), None);
        assert_eq!(server.stats().connections_closed, 1);
    }

    #[tokio::test]
    async fn test_publish_order_and_position() {
        let server = server_with(Arc::new(MockGateway::new()));
        let (a, mut rx) = open(&server);
        server.index.subscribe(a, "orders.BTC-PERPETUAL");

        let order: Order = decode("order", order_json("o-1", "open")).unwrap();
        assert_eq!(server.publish_order(&order), 1);
        let msg = next_json(&mut rx);
        assert_eq!(msg["type"], "order");
        assert_eq!(msg["order_id"], "o-1");

        let position: Position =
            decode("position", relay_gateway::test_helpers::position_json("BTC-PERPETUAL", 1.0)).unwrap();
        assert_eq!(server.publish_position(&position), 0);
    }
}
