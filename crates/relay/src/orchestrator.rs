//! Builds the relay from a [`Config`] and tears it down in order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use relay_cache::StateCache;
use relay_distribution::DistributionServer;
use relay_gateway::{
    Channel, ConnectionState, DeribitApi, DeribitClient, DeribitStream, InboundDispatcher,
    Interval, StreamConfig, StreamEvent, UpstreamSubscriptions,
};
use relay_latency::LatencyRegistry;

use crate::config::Config;
use crate::error::RelayError;
use crate::metrics::{RelayStats, StatsSource};

/// Handler for grouped book pushes: replace the snapshot, then fan out.
pub fn book_handler(
    cache: Arc<StateCache>,
    distribution: Arc<DistributionServer>,
) -> impl Fn(StreamEvent) + Send + Sync + 'static {
    move |event: StreamEvent| {
        if let StreamEvent::OrderBook(book) = event {
            cache.apply_orderbook(Arc::clone(&book));
            let sent = distribution.publish_orderbook(&book);
            debug!(
                instrument = %book.instrument_name,
                mid = ?book.mid_price(),
                spread = ?book.spread(),
                sent,
                "order book relayed"
            );
        }
    }
}

/// Handler for `user.orders.*` and `user.changes.*`. Orders and positions are
/// applied to the cache before they are published.
pub fn account_handler(
    cache: Arc<StateCache>,
    distribution: Arc<DistributionServer>,
) -> impl Fn(StreamEvent) + Send + Sync + 'static {
    move |event: StreamEvent| {
        let (orders, positions) = match event {
            StreamEvent::Orders(orders) => (orders, Vec::new()),
            StreamEvent::Changes {
                orders, positions, ..
            } => (orders, positions),
            other => {
                warn!(kind = other.kind(), "unexpected event on account channel");
                return;
            }
        };
        for order in orders {
            let update = cache.apply_order(order.clone());
            debug!(order_id = %order.order_id, state = %order.order_state, update = ?update, "order update");
            distribution.publish_order(&order);
        }
        for position in positions {
            cache.apply_position(position.clone());
            distribution.publish_position(&position);
        }
    }
}

/// Handler for public trades: counted and logged only.
pub fn trades_handler(counter: Arc<AtomicU64>) -> impl Fn(StreamEvent) + Send + Sync + 'static {
    move |event: StreamEvent| {
        if let StreamEvent::Trades(trades) = event {
            counter.fetch_add(trades.len() as u64, Ordering::Relaxed);
            for trade in &trades {
                debug!(
                    instrument = %trade.instrument_name,
                    price = trade.price,
                    amount = trade.amount,
                    direction = %trade.direction,
                    "trade"
                );
            }
        }
    }
}

/// The running relay.
pub struct Orchestrator {
    latency: Arc<LatencyRegistry>,
    dispatcher: Arc<InboundDispatcher>,
    stream: Arc<DeribitStream>,
    subscriptions: UpstreamSubscriptions,
    cache: Arc<StateCache>,
    distribution: Arc<DistributionServer>,
    connected: Arc<AtomicBool>,
    trades_seen: Arc<AtomicU64>,
    distribution_stop: watch::Sender<bool>,
    distribution_task: Mutex<Option<JoinHandle<Result<(), relay_distribution::DistributionError>>>>,
    state_task: JoinHandle<()>,
    metrics_csv: Option<std::path::PathBuf>,
    stopped: AtomicBool,
}

impl Orchestrator {
    pub async fn start(config: &Config) -> Result<Self, RelayError> {
        config.validate()?;
        let timeout = config.request_timeout();
        let latency = Arc::new(LatencyRegistry::new());

        let client = Arc::new(DeribitClient::new(
            config.rest_url(),
            config.credentials(),
            timeout,
        )?);
        if client.has_credentials() {
            let auth = client.authenticate().await?;
            info!(expires_in = auth.expires_in, scope = ?auth.scope, "REST session authenticated");
        }

        let dispatcher = Arc::new(InboundDispatcher::start(config.queue_capacity, &latency)?);

        let stream_config = StreamConfig {
            url: config.ws_url().to_string(),
            credentials: config.credentials(),
            heartbeat_secs: config.heartbeat(),
            request_timeout: timeout,
        };
        let stream = match DeribitStream::connect(stream_config, Arc::clone(&dispatcher)).await {
            Ok(stream) => stream,
            Err(e) => {
                dispatcher.shutdown().await;
                return Err(e.into());
            }
        };

        let api = DeribitApi::new(client, timeout);
        let cache = Arc::new(StateCache::new(api, config.book_depth, &latency));
        let distribution = Arc::new(DistributionServer::new(Arc::clone(&cache), &latency));
        let subscriptions = UpstreamSubscriptions::new(dispatcher.handlers(), stream.clone());
        let trades_seen = Arc::new(AtomicU64::new(0));

        let (connected, state_task) = watch_connection(stream.state());
        let (distribution_stop, stop_rx) = watch::channel(false);

        let relay = Self {
            latency,
            dispatcher,
            stream,
            subscriptions,
            cache,
            distribution,
            connected,
            trades_seen,
            distribution_stop,
            distribution_task: Mutex::new(None),
            state_task,
            metrics_csv: config.metrics_csv.clone(),
            stopped: AtomicBool::new(false),
        };

        if let Err(e) = relay.wire(config).await {
            relay.shutdown().await;
            return Err(e);
        }

        let listener = match DistributionServer::bind(&config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                relay.shutdown().await;
                return Err(e.into());
            }
        };
        let task = tokio::spawn(Arc::clone(&relay.distribution).serve(listener, stop_rx));
        *relay
            .distribution_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        info!(
            network = config.network(),
            instruments = ?config.instrument_list(),
            listen_addr = %config.listen_addr,
            authenticated = relay.stream.is_authenticated(),
            "relay started"
        );
        Ok(relay)
    }

    /// Subscribe upstream channels and prime the cache.
    async fn wire(&self, config: &Config) -> Result<(), RelayError> {
        for instrument in config.instrument_list() {
            self.subscriptions
                .subscribe(
                    Channel::book(instrument.as_str(), config.book_depth, Interval::Ms100),
                    book_handler(Arc::clone(&self.cache), Arc::clone(&self.distribution)),
                )
                .await?;
            self.subscriptions
                .subscribe(
                    Channel::trades(instrument.as_str(), Interval::Ms100),
                    trades_handler(Arc::clone(&self.trades_seen)),
                )
                .await?;
        }

        if !self.stream.is_authenticated() {
            info!("no credentials, private channels disabled");
            return Ok(());
        }

        for channel in [Channel::user_orders(), Channel::user_changes()] {
            self.subscriptions
                .subscribe(
                    channel,
                    account_handler(Arc::clone(&self.cache), Arc::clone(&self.distribution)),
                )
                .await?;
        }

        // a failed prime only means a colder cache
        match self.cache.refresh_positions(&config.currency).await {
            Ok(n) => debug!(positions = n, "positions primed"),
            Err(e) => warn!(error = %e, "failed to prime positions"),
        }
        match self.cache.refresh_open_orders(&config.currency).await {
            Ok(n) => debug!(orders = n, "open orders primed"),
            Err(e) => warn!(error = %e, "failed to prime open orders"),
        }
        Ok(())
    }

    pub fn cache(&self) -> Arc<StateCache> {
        Arc::clone(&self.cache)
    }

    pub fn distribution(&self) -> Arc<DistributionServer> {
        Arc::clone(&self.distribution)
    }

    pub fn latency(&self) -> Arc<LatencyRegistry> {
        Arc::clone(&self.latency)
    }

    /// Stop in dependency order: clients first, then upstream, then the
    /// dispatcher, then the socket. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("relay shutting down");

        self.distribution_stop.send_replace(true);
        let task = self
            .distribution_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "distribution server failed"),
                Err(e) => error!(error = %e, "distribution server task failed"),
            }
        }

        let removed = self.subscriptions.unsubscribe_all().await;
        debug!(channels = removed, "upstream channels unsubscribed");

        self.dispatcher.shutdown().await;
        self.stream.close().await;
        self.state_task.abort();
        self.connected.store(false, Ordering::Release);

        if let Some(path) = &self.metrics_csv {
            match self.latency.export_csv(path) {
                Ok(()) => info!(path = %path.display(), "latency metrics exported"),
                Err(e) => error!(error = %e, "failed to export latency metrics"),
            }
        }
        info!("latency summary\n{}", self.latency.render_table());
        info!("relay stopped");
    }
}

impl StatsSource for Orchestrator {
    fn relay_stats(&self) -> RelayStats {
        RelayStats {
            upstream_connected: self.connected.load(Ordering::Acquire),
            dispatcher: self.dispatcher.stats(),
            queue_depth: self.dispatcher.queue_depth(),
            distribution: self.distribution.stats(),
            connections: self.distribution.connection_count(),
            cache: self.cache.stats(),
            trades_seen: self.trades_seen.load(Ordering::Relaxed),
        }
    }
}

/// Mirror the stream's connection state into a flag for readiness checks.
fn watch_connection(mut state: watch::Receiver<ConnectionState>) -> (Arc<AtomicBool>, JoinHandle<()>) {
    let connected = Arc::new(AtomicBool::new(
        *state.borrow_and_update() == ConnectionState::Connected,
    ));
    let flag = Arc::clone(&connected);
    let task = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            let up = current == ConnectionState::Connected;
            if flag.swap(up, Ordering::AcqRel) != up {
                if up {
                    info!("upstream connected");
                } else {
                    warn!(state = ?current, "upstream connection lost");
                }
            }
        }
    });
    (connected, task)
}
