//! Typed Deribit methods on top of any [`Gateway`].

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use relay_model::{
    decode, Direction, Instrument, InstrumentKind, Order, OrderBookSnapshot, OrderType, Position,
    TimeInForce, Trade,
};

use crate::error::GatewayError;
use crate::gateway::Gateway;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// New order parameters for `private/buy` / `private/sell`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub instrument_name: String,
    pub direction: Direction,
    pub amount: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub label: Option<String>,
    pub post_only: bool,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn limit(instrument: impl Into<String>, direction: Direction, amount: f64, price: f64) -> Self {
        Self {
            instrument_name: instrument.into(),
            direction,
            amount,
            order_type: OrderType::Limit,
            price: Some(price),
            time_in_force: TimeInForce::GoodTilCancelled,
            label: None,
            post_only: false,
            reduce_only: false,
        }
    }

    pub fn market(instrument: impl Into<String>, direction: Direction, amount: f64) -> Self {
        Self {
            instrument_name: instrument.into(),
            direction,
            amount,
            order_type: OrderType::Market,
            price: None,
            time_in_force: TimeInForce::GoodTilCancelled,
            label: None,
            post_only: false,
            reduce_only: false,
        }
    }

    pub fn params(&self) -> Value {
        let mut p = Map::new();
        p.insert("instrument_name".into(), json!(self.instrument_name));
        p.insert("amount".into(), json!(self.amount));
        p.insert("type".into(), json!(self.order_type.to_string()));
        if let Some(price) = self.price {
            p.insert("price".into(), json!(price));
        }
        p.insert("time_in_force".into(), json!(self.time_in_force.to_string()));
        if let Some(label) = &self.label {
            p.insert("label".into(), json!(label));
        }
        if self.post_only {
            p.insert("post_only".into(), json!(true));
        }
        if self.reduce_only {
            p.insert("reduce_only".into(), json!(true));
        }
        Value::Object(p)
    }
}

/// Result of buy/sell/edit: the order plus any immediate fills.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrderPlacement {
    pub order: Order,
    #[serde(default)]
    pub trades: Vec<Trade>,
}

/// Deribit API with an explicit timeout on every call.
#[derive(Clone)]
pub struct DeribitApi {
    gateway: Arc<dyn Gateway>,
    timeout: Duration,
}

impl DeribitApi {
    pub fn new(gateway: Arc<dyn Gateway>, timeout: Duration) -> Self {
        Self { gateway, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        self.gateway
            .call_with_timeout(method, params, self.timeout)
            .await
    }

    pub async fn get_order_book(&self, instrument: &str, depth: u32) -> Result<OrderBookSnapshot, GatewayError> {
        let result = self
            .call(
                "public/get_order_book",
                json!({ "instrument_name": instrument, "depth": depth }),
            )
            .await?;
        Ok(decode("order book", result)?)
    }

    pub async fn get_position(&self, instrument: &str) -> Result<Position, GatewayError> {
        let result = self
            .call("private/get_position", json!({ "instrument_name": instrument }))
            .await?;
        Ok(decode("position", result)?)
    }

    pub async fn get_positions(&self, currency: &str, kind: Option<InstrumentKind>) -> Result<Vec<Position>, GatewayError> {
        let mut params = json!({ "currency": currency });
        if let Some(kind) = kind {
            params["kind"] = json!(kind.to_string());
        }
        let result = self.call("private/get_positions", params).await?;
        Ok(decode("positions", result)?)
    }

    pub async fn get_order_state(&self, order_id: &str) -> Result<Order, GatewayError> {
        let result = self
            .call("private/get_order_state", json!({ "order_id": order_id }))
            .await?;
        Ok(decode("order", result)?)
    }

    pub async fn get_open_orders_by_currency(&self, currency: &str) -> Result<Vec<Order>, GatewayError> {
        let result = self
            .call(
                "private/get_open_orders_by_currency",
                json!({ "currency": currency }),
            )
            .await?;
        Ok(decode("open orders", result)?)
    }

    pub async fn get_instruments(&self, currency: &str, kind: Option<InstrumentKind>) -> Result<Vec<Instrument>, GatewayError> {
        let mut params = json!({ "currency": currency, "expired": false });
        if let Some(kind) = kind {
            params["kind"] = json!(kind.to_string());
        }
        let result = self.call("public/get_instruments", params).await?;
        Ok(decode("instruments", result)?)
    }

    /// `private/buy` or `private/sell` depending on the request's direction.
    pub async fn place_order(&self, request: &OrderRequest) -> Result<OrderPlacement, GatewayError> {
        let result = self.call(request.direction.method(), request.params()).await?;
        Ok(decode("order placement", result)?)
    }

    pub async fn cancel(&self, order_id: &str) -> Result<Order, GatewayError> {
        let result = self
            .call("private/cancel", json!({ "order_id": order_id }))
            .await?;
        Ok(decode("cancelled order", result)?)
    }

    pub async fn edit(&self, order_id: &str, amount: f64, price: Option<f64>) -> Result<OrderPlacement, GatewayError> {
        let mut params = json!({ "order_id": order_id, "amount": amount });
        if let Some(price) = price {
            params["price"] = json!(price);
        }
        let result = self.call("private/edit", params).await?;
        Ok(decode("edited order", result)?)
    }

    pub async fn test(&self) -> Result<Value, GatewayError> {
        self.call("public/test", json!({})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{order_json, MockGateway, MockResponse};

    fn api(mock: &Arc<MockGateway>) -> DeribitApi {
        DeribitApi::new(mock.clone(), Duration::from_millis(200))
    }

    #[test]
    fn test_limit_params() {
        let req = OrderRequest::limit("BTC-PERPETUAL", Direction::Sell, 10.0, 50_000.0);
        let p = req.params();
        assert_eq!(p["type"], "limit");
        assert_eq!(p["price"], 50_000.0);
        assert_eq!(p["time_in_force"], "good_til_cancelled");
        assert!(p.get("post_only").is_none());
    }

    #[test]
    fn test_market_params_omit_price() {
        let req = OrderRequest::market("BTC-PERPETUAL", Direction::Buy, 10.0);
        assert!(req.params().get("price").is_none());
    }

    #[tokio::test]
    async fn test_sell_goes_to_private_sell() {
        let mock = Arc::new(MockGateway::new());
        mock.respond(
            "private/sell",
            MockResponse::Ok(json!({ "order": order_json("o-1", "open"), "trades": [] })),
        );
        let req = OrderRequest::limit("BTC-PERPETUAL", Direction::Sell, 10.0, 50_000.0);
        let placed = api(&mock).place_order(&req).await.unwrap();
        assert_eq!(placed.order.order_id, "o-1");
        assert_eq!(mock.calls()[0].0, "private/sell");
    }

    #[tokio::test]
    async fn test_decode_failure_surfaces() {
        let mock = Arc::new(MockGateway::new());
        mock.respond("public/get_order_book", MockResponse::Ok(json!({"nope": true})));
        let err = api(&mock).get_order_book("BTC-PERPETUAL", 10).await.unwrap_err();
        assert!(matches!(err, GatewayError::Decode(_)));
    }

    #[tokio::test]
    async fn test_every_call_is_bounded() {
        let mock = Arc::new(MockGateway::new());
        mock.respond(
            "private/get_order_state",
            MockResponse::Delayed(Duration::from_secs(5), order_json("o-1", "open")),
        );
        let err = api(&mock).get_order_state("o-1").await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { timeout_ms: 200 }));
    }

    #[tokio::test]
    async fn test_edit_includes_price_when_given() {
        let mock = Arc::new(MockGateway::new());
        mock.respond(
            "private/edit",
            MockResponse::Ok(json!({ "order": order_json("o-1", "open") })),
        );
        api(&mock).edit("o-1", 20.0, Some(51_000.0)).await.unwrap();
        let (_, params) = &mock.calls()[0];
        assert_eq!(params["amount"], 20.0);
        assert_eq!(params["price"], 51_000.0);
    }
}
