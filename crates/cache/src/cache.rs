use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use relay_gateway::{DeribitApi, OrderRequest};
use relay_latency::{LatencyRegistry, LatencyTracker};
use relay_model::{
    instrument_currency, Instrument, InstrumentKind, Order, OrderBookSnapshot, Position,
};

use crate::error::CacheError;
use crate::table::{lock, FetchWindow, Table};
use crate::Result;

/// What [`StateCache::apply_order`] did with an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderUpdate {
    Stored,
    /// Terminal state; the entry is gone.
    Removed { was_cached: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub orders: usize,
    pub positions: usize,
    pub books: usize,
    pub hits: u64,
    pub misses: u64,
}

struct Trackers {
    orderbook_fetch: Arc<LatencyTracker>,
    position_fetch: Arc<LatencyTracker>,
    order_fetch: Arc<LatencyTracker>,
    place: Arc<LatencyTracker>,
    cancel: Arc<LatencyTracker>,
    modify: Arc<LatencyTracker>,
}

/// Orders, positions and order books.
///
/// Each kind has its own lock, held only for the map operation itself and
/// never across an upstream call. A miss fetches through [`DeribitApi`] and
/// stores with insert-if-absent. For orders and positions, a push that lands
/// while any fetch or bulk refresh is in flight wins over the fetched value,
/// removals included.
pub struct StateCache {
    api: DeribitApi,
    book_depth: u32,
    orders: Mutex<Table<Order>>,
    positions: Mutex<Table<Position>>,
    books: Mutex<HashMap<String, Arc<OrderBookSnapshot>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    trackers: Trackers,
}

impl StateCache {
    pub fn new(api: DeribitApi, book_depth: u32, latency: &LatencyRegistry) -> Self {
        Self {
            api,
            book_depth,
            orders: Mutex::new(Table::new()),
            positions: Mutex::new(Table::new()),
            books: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            trackers: Trackers {
                orderbook_fetch: latency.tracker("cache.orderbook_fetch"),
                position_fetch: latency.tracker("cache.position_fetch"),
                order_fetch: latency.tracker("cache.order_fetch"),
                place: latency.tracker("order.place"),
                cancel: latency.tracker("order.cancel"),
                modify: latency.tracker("order.modify"),
            },
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    // --- order books ---

    pub async fn orderbook(&self, instrument: &str) -> Result<Arc<OrderBookSnapshot>> {
        if let Some(book) = self.cached_orderbook(instrument) {
            self.hit();
            return Ok(book);
        }
        self.miss();

        let fetched = {
            let _timer = self.trackers.orderbook_fetch.scoped();
            self.api.get_order_book(instrument, self.book_depth).await
        }
        .map_err(|e| {
            warn!(instrument, error = %e, "order book fetch failed");
            e
        })?;

        debug!(instrument, "order book fetched on miss");
        let mut books = lock(&self.books);
        Ok(Arc::clone(
            books
                .entry(instrument.to_string())
                .or_insert_with(|| Arc::new(fetched)),
        ))
    }

    pub fn cached_orderbook(&self, instrument: &str) -> Option<Arc<OrderBookSnapshot>> {
        lock(&self.books).get(instrument).cloned()
    }

    /// Replace the instrument's snapshot.
    pub fn apply_orderbook(&self, book: Arc<OrderBookSnapshot>) {
        lock(&self.books).insert(book.instrument_name.clone(), book);
    }

    // --- positions ---

    pub async fn position(&self, instrument: &str) -> Result<Arc<Position>> {
        if let Some(position) = self.cached_position(instrument) {
            self.hit();
            return Ok(position);
        }
        self.miss();

        let window = FetchWindow::open(&self.positions);
        let fetched = {
            let _timer = self.trackers.position_fetch.scoped();
            self.api.get_position(instrument).await
        }
        .map_err(|e| {
            warn!(instrument, error = %e, "position fetch failed");
            e
        })?;

        Ok(window.store(instrument, fetched))
    }

    pub fn cached_position(&self, instrument: &str) -> Option<Arc<Position>> {
        lock(&self.positions).get(instrument)
    }

    pub fn apply_position(&self, position: Position) {
        lock(&self.positions).push(position.instrument_name.clone(), position);
    }

    /// Every cached position, ordered by instrument.
    pub fn positions(&self) -> Vec<Arc<Position>> {
        let mut all = lock(&self.positions).values();
        all.sort_by(|a, b| a.instrument_name.cmp(&b.instrument_name));
        all
    }

    // --- orders ---

    /// Cache-aside order lookup. A terminal order fetched on miss is returned
    /// but not stored.
    pub async fn order(&self, order_id: &str) -> Result<Arc<Order>> {
        if let Some(order) = self.cached_order(order_id) {
            self.hit();
            return Ok(order);
        }
        self.miss();

        let window = FetchWindow::open(&self.orders);
        let fetched = {
            let _timer = self.trackers.order_fetch.scoped();
            self.api.get_order_state(order_id).await
        }
        .map_err(|e| {
            warn!(order_id, error = %e, "order fetch failed");
            e
        })?;

        if fetched.is_terminal() {
            debug!(order_id, state = %fetched.order_state, "fetched terminal order, not caching");
            return Ok(Arc::new(fetched));
        }

        Ok(window.store(order_id, fetched))
    }

    pub fn cached_order(&self, order_id: &str) -> Option<Arc<Order>> {
        lock(&self.orders).get(order_id)
    }

    /// Replace the order, or drop it if its state is terminal.
    pub fn apply_order(&self, order: Order) -> OrderUpdate {
        let mut orders = lock(&self.orders);
        if order.is_terminal() {
            let was_cached = orders.push_remove(&order.order_id);
            debug!(order_id = %order.order_id, state = %order.order_state, was_cached, "order removed");
            OrderUpdate::Removed { was_cached }
        } else {
            orders.push(order.order_id.clone(), order);
            OrderUpdate::Stored
        }
    }

    /// Every cached order, oldest first.
    pub fn open_orders(&self) -> Vec<Arc<Order>> {
        let mut all = lock(&self.orders).values();
        all.sort_by(|a, b| {
            a.creation_timestamp
                .cmp(&b.creation_timestamp)
                .then_with(|| a.order_id.cmp(&b.order_id))
        });
        all
    }

    // --- order entry ---

    fn validate(request: &OrderRequest) -> Result<()> {
        if request.instrument_name.trim().is_empty() {
            return Err(CacheError::InvalidRequest("instrument name is empty".into()));
        }
        if !(request.amount.is_finite() && request.amount > 0.0) {
            return Err(CacheError::InvalidRequest(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        if request.order_type.requires_price() {
            match request.price {
                Some(p) if p.is_finite() && p > 0.0 => {}
                _ => {
                    return Err(CacheError::InvalidRequest(format!(
                        "{} order needs a positive price",
                        request.order_type
                    )))
                }
            }
        }
        Ok(())
    }

    /// Validate, send to the exchange, and cache the acknowledged order.
    pub async fn place_order(&self, request: &OrderRequest) -> Result<Order> {
        Self::validate(request)?;

        let placement = {
            let _timer = self.trackers.place.scoped();
            self.api.place_order(request).await?
        };

        info!(
            order_id = %placement.order.order_id,
            instrument = %placement.order.instrument_name,
            direction = %placement.order.direction,
            state = %placement.order.order_state,
            fills = placement.trades.len(),
            "order placed"
        );
        self.apply_order(placement.order.clone());
        Ok(placement.order)
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<Order> {
        let order = {
            let _timer = self.trackers.cancel.scoped();
            self.api.cancel(order_id).await?
        };
        info!(order_id, state = %order.order_state, "order cancelled");
        self.apply_order(order.clone());
        Ok(order)
    }

    pub async fn modify_order(&self, order_id: &str, amount: f64, price: Option<f64>) -> Result<Order> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(CacheError::InvalidRequest(format!(
                "amount must be positive, got {}",
                amount
            )));
        }
        if let Some(p) = price {
            if !(p.is_finite() && p > 0.0) {
                return Err(CacheError::InvalidRequest(format!("price must be positive, got {}", p)));
            }
        }

        let placement = {
            let _timer = self.trackers.modify.scoped();
            self.api.edit(order_id, amount, price).await?
        };
        info!(order_id, amount, price = ?price, "order modified");
        self.apply_order(placement.order.clone());
        Ok(placement.order)
    }

    // --- bulk refresh ---

    /// Reload positions for a currency. Positions pushed while the request
    /// was in flight are kept. Returns how many fetched positions were stored.
    pub async fn refresh_positions(&self, currency: &str) -> Result<usize> {
        let window = FetchWindow::open(&self.positions);
        let positions = self.api.get_positions(currency, None).await?;
        let fetched = positions.len();

        let stored = window.replace(
            positions
                .into_iter()
                .map(|p| (p.instrument_name.clone(), p))
                .collect(),
            |_| false,
        );
        info!(currency, fetched, stored, "positions refreshed");
        Ok(stored)
    }

    /// Reload open orders for a currency. Cached orders on instruments of that
    /// currency that the exchange no longer reports are dropped, unless a push
    /// for them arrived while the request was in flight. Returns how many
    /// fetched orders were stored.
    pub async fn refresh_open_orders(&self, currency: &str) -> Result<usize> {
        let window = FetchWindow::open(&self.orders);
        let open = self.api.get_open_orders_by_currency(currency).await?;
        let fetched = open.len();

        let stored = window.replace(
            open.into_iter()
                .filter(|o| !o.is_terminal())
                .map(|o| (o.order_id.clone(), o))
                .collect(),
            |o| instrument_currency(&o.instrument_name).eq_ignore_ascii_case(currency),
        );
        info!(currency, fetched, stored, "open orders refreshed");
        Ok(stored)
    }

    /// Active instruments, straight from the exchange.
    pub async fn instruments(&self, currency: &str, kind: Option<InstrumentKind>) -> Result<Vec<Instrument>> {
        Ok(self.api.get_instruments(currency, kind).await?)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            orders: lock(&self.orders).len(),
            positions: lock(&self.positions).len(),
            books: lock(&self.books).len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
