use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use relay_cache::CacheStats;
use relay_distribution::DistributionStatsSnapshot;
use relay_gateway::DispatcherStatsSnapshot;

/// Point-in-time counters from the running relay.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RelayStats {
    pub upstream_connected: bool,
    pub dispatcher: DispatcherStatsSnapshot,
    pub queue_depth: usize,
    pub distribution: DistributionStatsSnapshot,
    pub connections: usize,
    pub cache: CacheStats,
    pub trades_seen: u64,
}

/// Anything that can report [`RelayStats`]; the orchestrator in production.
pub trait StatsSource: Send + Sync {
    fn relay_stats(&self) -> RelayStats;
}

/// Prometheus view of [`RelayStats`]. Values are copied in at scrape time.
pub struct Metrics {
    pub registry: Registry,
    pub upstream_connected: IntGauge,
    pub dispatch_events: IntCounterVec,
    pub dispatch_queue_depth: IntGauge,
    pub downstream_connections: IntGauge,
    pub downstream_messages: IntCounterVec,
    pub downstream_protocol_errors: IntCounter,
    pub cache_entries: IntGaugeVec,
    pub cache_lookups: IntCounterVec,
    pub trades: IntCounter,
}

/// Counters only move forward; bring one up to an externally kept total.
fn catch_up(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let upstream_connected = IntGauge::new(
            "relay_upstream_connected",
            "1 while the Deribit stream is connected",
        )?;
        let dispatch_events = IntCounterVec::new(
            Opts::new("relay_dispatch_events_total", "Inbound frames by outcome"),
            &["outcome"],
        )?;
        let dispatch_queue_depth = IntGauge::new(
            "relay_dispatch_queue_depth",
            "Events waiting for the dispatch worker",
        )?;
        let downstream_connections = IntGauge::new(
            "relay_downstream_connections",
            "Open client connections",
        )?;
        let downstream_messages = IntCounterVec::new(
            Opts::new("relay_downstream_messages_total", "Messages to clients by result"),
            &["result"],
        )?;
        let downstream_protocol_errors = IntCounter::new(
            "relay_downstream_protocol_errors_total",
            "Client messages answered with an error",
        )?;
        let cache_entries = IntGaugeVec::new(
            Opts::new("relay_cache_entries", "Cached entries by kind"),
            &["kind"],
        )?;
        let cache_lookups = IntCounterVec::new(
            Opts::new("relay_cache_lookups_total", "Cache-aside lookups by result"),
            &["result"],
        )?;
        let trades = IntCounter::new("relay_trades_total", "Public trades seen upstream")?;

        registry.register(Box::new(upstream_connected.clone()))?;
        registry.register(Box::new(dispatch_events.clone()))?;
        registry.register(Box::new(dispatch_queue_depth.clone()))?;
        registry.register(Box::new(downstream_connections.clone()))?;
        registry.register(Box::new(downstream_messages.clone()))?;
        registry.register(Box::new(downstream_protocol_errors.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;
        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(trades.clone()))?;

        Ok(Self {
            registry,
            upstream_connected,
            dispatch_events,
            dispatch_queue_depth,
            downstream_connections,
            downstream_messages,
            downstream_protocol_errors,
            cache_entries,
            cache_lookups,
            trades,
        })
    }

    pub fn update(&self, stats: &RelayStats) {
        self.upstream_connected.set(i64::from(stats.upstream_connected));

        let d = &stats.dispatcher;
        for (outcome, total) in [
            ("queued", d.queued),
            ("dropped", d.dropped),
            ("malformed", d.malformed),
            ("response", d.responses),
            ("heartbeat", d.heartbeats),
            ("rejected", d.rejected),
            ("dispatched", d.dispatched),
            ("decode_failure", d.decode_failures),
            ("handler_panic", d.handler_panics),
        ] {
            catch_up(&self.dispatch_events.with_label_values(&[outcome]), total);
        }
        self.dispatch_queue_depth.set(stats.queue_depth as i64);

        self.downstream_connections.set(stats.connections as i64);
        catch_up(
            &self.downstream_messages.with_label_values(&["sent"]),
            stats.distribution.messages_sent,
        );
        catch_up(
            &self.downstream_messages.with_label_values(&["failed"]),
            stats.distribution.send_failures,
        );
        catch_up(&self.downstream_protocol_errors, stats.distribution.protocol_errors);

        let c = &stats.cache;
        self.cache_entries.with_label_values(&["order"]).set(c.orders as i64);
        self.cache_entries.with_label_values(&["position"]).set(c.positions as i64);
        self.cache_entries.with_label_values(&["orderbook"]).set(c.books as i64);
        catch_up(&self.cache_lookups.with_label_values(&["hit"]), c.hits);
        catch_up(&self.cache_lookups.with_label_values(&["miss"]), c.misses);

        catch_up(&self.trades, stats.trades_seen);
    }

    /// Prometheus text exposition.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
