use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::client::Credentials;
use crate::dispatcher::{Ingest, InboundDispatcher};
use crate::error::GatewayError;
use crate::gateway::{ConnectionState, Gateway, StreamTransport};
use crate::pending::{PendingReply, PendingRequests};
use crate::protocol::{HeartbeatKind, RpcRequest};

const OUTBOUND_CAPACITY: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub credentials: Option<Credentials>,
    /// Seconds between server heartbeats; `None` leaves heartbeats off.
    pub heartbeat_secs: Option<u64>,
    pub request_timeout: Duration,
}

impl StreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
            heartbeat_secs: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Deribit WebSocket session.
///
/// A writer task owns the sink and drains an outbound queue; a reader task
/// hands every text frame to the dispatcher and answers heartbeat test
/// requests. Requests written through this stream are correlated by id in the
/// dispatcher's pending table.
pub struct DeribitStream {
    outbound: mpsc::Sender<WsMessage>,
    pending: Arc<PendingRequests>,
    next_id: Arc<AtomicU64>,
    state: Arc<watch::Sender<ConnectionState>>,
    request_timeout: Duration,
    authenticated: AtomicBool,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl DeribitStream {
    /// Connect, start the reader and writer tasks, then authenticate and
    /// enable heartbeats when configured.
    pub async fn connect(
        config: StreamConfig,
        dispatcher: Arc<InboundDispatcher>,
    ) -> Result<Arc<Self>, GatewayError> {
        let url = Url::parse(&config.url).map_err(|e| GatewayError::Transport(e.to_string()))?;
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state_tx);

        info!(url = %url, "connecting to Deribit stream");
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(OUTBOUND_CAPACITY);
        let pending = dispatcher.pending();
        let next_id = Arc::new(AtomicU64::new(1));

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!(error = %e, "websocket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            debug!("stream writer exiting");
        });

        let reader = {
            let out_tx = out_tx.clone();
            let next_id = Arc::clone(&next_id);
            let state = Arc::clone(&state);
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(WsMessage::Text(text)) => {
                            if let Ingest::Heartbeat(HeartbeatKind::TestRequest) =
                                dispatcher.ingest(&text).await
                            {
                                let id = next_id.fetch_add(1, Ordering::Relaxed);
                                let params = json!({});
                                let frame = match serde_json::to_string(&RpcRequest::new(id, "public/test", &params)) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        warn!(error = %e, "failed to encode test reply");
                                        continue;
                                    }
                                };
                                if out_tx.send(WsMessage::Text(frame)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(WsMessage::Close(frame)) => {
                            info!(frame = ?frame, "upstream closed connection");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "websocket read failed");
                            break;
                        }
                    }
                }
                state.send_replace(ConnectionState::Disconnected);
                let failed = pending.fail_all();
                warn!(failed_requests = failed, "upstream stream disconnected");
            })
        };

        state.send_replace(ConnectionState::Connected);
        info!("Deribit stream connected");

        let stream = Arc::new(Self {
            outbound: out_tx,
            pending,
            next_id,
            state,
            request_timeout: config.request_timeout,
            authenticated: AtomicBool::new(false),
            tasks: Mutex::new(Some((reader, writer))),
        });

        if let Err(e) = stream.handshake(&config).await {
            stream.close().await;
            return Err(e);
        }

        Ok(stream)
    }

    async fn handshake(&self, config: &StreamConfig) -> Result<(), GatewayError> {
        if let Some(creds) = &config.credentials {
            self.call("public/auth", creds.auth_params())
                .await
                .map_err(|e| GatewayError::Auth(format!("stream authentication failed: {}", e)))?;
            self.authenticated.store(true, Ordering::Release);
            info!("stream session authenticated");
        }

        if let Some(interval) = config.heartbeat_secs {
            self.call("public/set_heartbeat", json!({ "interval": interval }))
                .await?;
            debug!(interval, "heartbeat enabled");
        }
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Connection state notifications.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Send a close frame and stop both tasks.
    pub async fn close(&self) {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some((reader, writer)) = tasks else {
            return;
        };

        let _ = self.outbound.send(WsMessage::Close(None)).await;
        if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
            warn!("stream writer did not finish in time");
        }
        reader.abort();
        self.state.send_replace(ConnectionState::Disconnected);
        self.pending.fail_all();
        info!("Deribit stream closed");
    }
}

#[async_trait]
impl StreamTransport for DeribitStream {
    fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<PendingReply, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&RpcRequest::new(id, method, &params))?;
        let reply = self.pending.register(id, method);

        if self.outbound.send(WsMessage::Text(frame)).await.is_err() {
            self.pending.cancel(id);
            return Err(GatewayError::NotConnected);
        }
        debug!(id, method, "request sent over stream");
        Ok(reply)
    }
}

#[async_trait]
impl Gateway for DeribitStream {
    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        self.send_request(method, params)
            .await?
            .wait(self.request_timeout)
            .await
    }
}
