// =============================================================================
// Trade facade — typed order/position operations over the trade RPC
// =============================================================================
//
// Each method builds a wire descriptor `{actionType, ...}`, layers in the
// stop-loss/take-profit encoding, shallow-merges the caller's options map
// last, and submits through the connection's RPC correlator.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::connection::TerminalConnection;
use crate::error::{Result, SdkError};
use crate::types::TradeResponse;

/// Units a relative stop level is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopUnits {
    AbsolutePrice,
    RelativePrice,
    RelativePoints,
    RelativePips,
    RelativeCurrency,
    RelativeBalancePercentage,
}

/// A stop-loss or take-profit level: a bare price, or a value with units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopLevel {
    Absolute(f64),
    Relative { value: f64, units: StopUnits },
}

impl From<f64> for StopLevel {
    fn from(price: f64) -> Self {
        Self::Absolute(price)
    }
}

/// Pending order expiration settings.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpirationOptions {
    #[serde(rename = "type")]
    pub expiration_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

/// Extra fields merged into a market order descriptor.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketTradeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magic: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slippage: Option<f64>,
}

/// Extra fields merged into a pending order descriptor.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTradeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magic: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<ExpirationOptions>,
}

impl TerminalConnection {
    // ── Market orders ───────────────────────────────────────────────────

    pub async fn create_market_buy_order(
        &self,
        symbol: &str,
        volume: f64,
        stop_loss: Option<StopLevel>,
        take_profit: Option<StopLevel>,
        options: Option<MarketTradeOptions>,
    ) -> Result<TradeResponse> {
        self.create_market_order("ORDER_TYPE_BUY", symbol, volume, stop_loss, take_profit, options)
            .await
    }

    pub async fn create_market_sell_order(
        &self,
        symbol: &str,
        volume: f64,
        stop_loss: Option<StopLevel>,
        take_profit: Option<StopLevel>,
        options: Option<MarketTradeOptions>,
    ) -> Result<TradeResponse> {
        self.create_market_order("ORDER_TYPE_SELL", symbol, volume, stop_loss, take_profit, options)
            .await
    }

    // ── Pending orders ──────────────────────────────────────────────────

    pub async fn create_limit_buy_order(
        &self,
        symbol: &str,
        volume: f64,
        open_price: f64,
        stop_loss: Option<StopLevel>,
        take_profit: Option<StopLevel>,
        options: Option<PendingTradeOptions>,
    ) -> Result<TradeResponse> {
        self.create_pending_order(
            "ORDER_TYPE_BUY_LIMIT",
            symbol,
            volume,
            open_price,
            None,
            stop_loss,
            take_profit,
            options,
        )
        .await
    }

    pub async fn create_limit_sell_order(
        &self,
        symbol: &str,
        volume: f64,
        open_price: f64,
        stop_loss: Option<StopLevel>,
        take_profit: Option<StopLevel>,
        options: Option<PendingTradeOptions>,
    ) -> Result<TradeResponse> {
        self.create_pending_order(
            "ORDER_TYPE_SELL_LIMIT",
            symbol,
            volume,
            open_price,
            None,
            stop_loss,
            take_profit,
            options,
        )
        .await
    }

    pub async fn create_stop_buy_order(
        &self,
        symbol: &str,
        volume: f64,
        open_price: f64,
        stop_loss: Option<StopLevel>,
        take_profit: Option<StopLevel>,
        options: Option<PendingTradeOptions>,
    ) -> Result<TradeResponse> {
        self.create_pending_order(
            "ORDER_TYPE_BUY_STOP",
            symbol,
            volume,
            open_price,
            None,
            stop_loss,
            take_profit,
            options,
        )
        .await
    }

    pub async fn create_stop_sell_order(
        &self,
        symbol: &str,
        volume: f64,
        open_price: f64,
        stop_loss: Option<StopLevel>,
        take_profit: Option<StopLevel>,
        options: Option<PendingTradeOptions>,
    ) -> Result<TradeResponse> {
        self.create_pending_order(
            "ORDER_TYPE_SELL_STOP",
            symbol,
            volume,
            open_price,
            None,
            stop_loss,
            take_profit,
            options,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_stop_limit_buy_order(
        &self,
        symbol: &str,
        volume: f64,
        open_price: f64,
        stop_limit_price: f64,
        stop_loss: Option<StopLevel>,
        take_profit: Option<StopLevel>,
        options: Option<PendingTradeOptions>,
    ) -> Result<TradeResponse> {
        self.create_pending_order(
            "ORDER_TYPE_BUY_STOP_LIMIT",
            symbol,
            volume,
            open_price,
            Some(stop_limit_price),
            stop_loss,
            take_profit,
            options,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_stop_limit_sell_order(
        &self,
        symbol: &str,
        volume: f64,
        open_price: f64,
        stop_limit_price: f64,
        stop_loss: Option<StopLevel>,
        take_profit: Option<StopLevel>,
        options: Option<PendingTradeOptions>,
    ) -> Result<TradeResponse> {
        self.create_pending_order(
            "ORDER_TYPE_SELL_STOP_LIMIT",
            symbol,
            volume,
            open_price,
            Some(stop_limit_price),
            stop_loss,
            take_profit,
            options,
        )
        .await
    }

    // ── Position operations ─────────────────────────────────────────────

    pub async fn modify_position(
        &self,
        position_id: &str,
        stop_loss: Option<StopLevel>,
        take_profit: Option<StopLevel>,
    ) -> Result<TradeResponse> {
        require_id("position id", position_id)?;
        let mut descriptor = action("POSITION_MODIFY");
        descriptor.insert("positionId".into(), Value::from(position_id));
        insert_stop_options(&mut descriptor, stop_loss, take_profit);
        self.trade(descriptor).await
    }

    pub async fn close_position_partially(
        &self,
        position_id: &str,
        volume: f64,
        options: Option<MarketTradeOptions>,
    ) -> Result<TradeResponse> {
        require_id("position id", position_id)?;
        require_volume(volume)?;
        let mut descriptor = action("POSITION_PARTIAL");
        descriptor.insert("positionId".into(), Value::from(position_id));
        descriptor.insert("volume".into(), Value::from(volume));
        merge_options(&mut descriptor, options.as_ref())?;
        self.trade(descriptor).await
    }

    pub async fn close_position(
        &self,
        position_id: &str,
        options: Option<MarketTradeOptions>,
    ) -> Result<TradeResponse> {
        require_id("position id", position_id)?;
        let mut descriptor = action("POSITION_CLOSE_ID");
        descriptor.insert("positionId".into(), Value::from(position_id));
        merge_options(&mut descriptor, options.as_ref())?;
        self.trade(descriptor).await
    }

    pub async fn close_by(
        &self,
        position_id: &str,
        opposite_position_id: &str,
        options: Option<MarketTradeOptions>,
    ) -> Result<TradeResponse> {
        require_id("position id", position_id)?;
        require_id("opposite position id", opposite_position_id)?;
        let mut descriptor = action("POSITION_CLOSE_BY");
        descriptor.insert("positionId".into(), Value::from(position_id));
        descriptor.insert(
            "closeByPositionId".into(),
            Value::from(opposite_position_id),
        );
        merge_options(&mut descriptor, options.as_ref())?;
        self.trade(descriptor).await
    }

    pub async fn close_positions_by_symbol(
        &self,
        symbol: &str,
        options: Option<MarketTradeOptions>,
    ) -> Result<TradeResponse> {
        require_symbol(symbol)?;
        let mut descriptor = action("POSITIONS_CLOSE_SYMBOL");
        descriptor.insert("symbol".into(), Value::from(symbol));
        merge_options(&mut descriptor, options.as_ref())?;
        self.trade(descriptor).await
    }

    // ── Order operations ────────────────────────────────────────────────

    pub async fn modify_order(
        &self,
        order_id: &str,
        open_price: f64,
        stop_loss: Option<StopLevel>,
        take_profit: Option<StopLevel>,
    ) -> Result<TradeResponse> {
        require_id("order id", order_id)?;
        require_price("open price", open_price)?;
        let mut descriptor = action("ORDER_MODIFY");
        descriptor.insert("orderId".into(), Value::from(order_id));
        descriptor.insert("openPrice".into(), Value::from(open_price));
        insert_stop_options(&mut descriptor, stop_loss, take_profit);
        self.trade(descriptor).await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<TradeResponse> {
        require_id("order id", order_id)?;
        let mut descriptor = action("ORDER_CANCEL");
        descriptor.insert("orderId".into(), Value::from(order_id));
        self.trade(descriptor).await
    }

    // ── Descriptor assembly ─────────────────────────────────────────────

    async fn create_market_order(
        &self,
        action_type: &str,
        symbol: &str,
        volume: f64,
        stop_loss: Option<StopLevel>,
        take_profit: Option<StopLevel>,
        options: Option<MarketTradeOptions>,
    ) -> Result<TradeResponse> {
        require_symbol(symbol)?;
        require_volume(volume)?;
        let mut descriptor = action(action_type);
        descriptor.insert("symbol".into(), Value::from(symbol));
        descriptor.insert("volume".into(), Value::from(volume));
        insert_stop_options(&mut descriptor, stop_loss, take_profit);
        merge_options(&mut descriptor, options.as_ref())?;
        self.trade(descriptor).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_pending_order(
        &self,
        action_type: &str,
        symbol: &str,
        volume: f64,
        open_price: f64,
        stop_limit_price: Option<f64>,
        stop_loss: Option<StopLevel>,
        take_profit: Option<StopLevel>,
        options: Option<PendingTradeOptions>,
    ) -> Result<TradeResponse> {
        require_symbol(symbol)?;
        require_volume(volume)?;
        require_price("open price", open_price)?;
        let mut descriptor = action(action_type);
        descriptor.insert("symbol".into(), Value::from(symbol));
        descriptor.insert("volume".into(), Value::from(volume));
        descriptor.insert("openPrice".into(), Value::from(open_price));
        if let Some(stop_limit_price) = stop_limit_price {
            require_price("stop limit price", stop_limit_price)?;
            descriptor.insert("stopLimitPrice".into(), Value::from(stop_limit_price));
        }
        insert_stop_options(&mut descriptor, stop_loss, take_profit);
        merge_options(&mut descriptor, options.as_ref())?;
        self.trade(descriptor).await
    }
}

fn action(action_type: &str) -> Map<String, Value> {
    let mut descriptor = Map::new();
    descriptor.insert("actionType".into(), Value::from(action_type));
    descriptor
}

/// Encode stop-loss/take-profit: bare numbers emit the price alone, relative
/// levels add the matching `*Units` field.
fn insert_stop_options(
    descriptor: &mut Map<String, Value>,
    stop_loss: Option<StopLevel>,
    take_profit: Option<StopLevel>,
) {
    for (key, units_key, level) in [
        ("stopLoss", "stopLossUnits", stop_loss),
        ("takeProfit", "takeProfitUnits", take_profit),
    ] {
        match level {
            Some(StopLevel::Absolute(price)) => {
                descriptor.insert(key.into(), Value::from(price));
            }
            Some(StopLevel::Relative { value, units }) => {
                descriptor.insert(key.into(), Value::from(value));
                descriptor.insert(
                    units_key.into(),
                    serde_json::to_value(units).expect("stop units serialize to a string"),
                );
            }
            None => {}
        }
    }
}

fn merge_options<T: Serialize>(
    descriptor: &mut Map<String, Value>,
    options: Option<&T>,
) -> Result<()> {
    if let Some(options) = options {
        match serde_json::to_value(options)? {
            Value::Object(map) => descriptor.extend(map),
            Value::Null => {}
            other => {
                return Err(SdkError::Validation(format!(
                    "trade options must be an object, got {other}"
                )))
            }
        }
    }
    Ok(())
}

fn require_symbol(symbol: &str) -> Result<()> {
    if symbol.is_empty() {
        return Err(SdkError::Validation("symbol must not be empty".into()));
    }
    Ok(())
}

fn require_volume(volume: f64) -> Result<()> {
    if !volume.is_finite() || volume <= 0.0 {
        return Err(SdkError::Validation(format!(
            "volume must be a positive number, got {volume}"
        )));
    }
    Ok(())
}

fn require_price(name: &str, price: f64) -> Result<()> {
    if !price.is_finite() || price <= 0.0 {
        return Err(SdkError::Validation(format!(
            "{name} must be a positive number, got {price}"
        )));
    }
    Ok(())
}

fn require_id(name: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(SdkError::Validation(format!("{name} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::mpsc::unbounded_channel;

    use crate::transport::test_support::EchoTransport;
    use crate::transport::TerminalTransport;

    fn connect() -> (Arc<TerminalConnection>, Arc<EchoTransport>) {
        let (tx, rx) = unbounded_channel();
        let transport = Arc::new(EchoTransport::new(tx));
        let connection = TerminalConnection::new(
            "accountId",
            Arc::clone(&transport) as Arc<dyn TerminalTransport>,
            rx,
        );
        (connection, transport)
    }

    fn last_sent(transport: &EchoTransport) -> Value {
        transport.sent.lock().last().cloned().expect("a frame was sent")
    }

    #[tokio::test]
    async fn market_buy_builds_the_expected_descriptor() {
        let (connection, transport) = connect();
        connection
            .create_market_buy_order("GBPUSD", 0.07, Some(0.9.into()), Some(2.0.into()), None)
            .await
            .unwrap();

        let sent = last_sent(&transport);
        assert_eq!(sent["actionType"], "ORDER_TYPE_BUY");
        assert_eq!(sent["symbol"], "GBPUSD");
        assert_eq!(sent["volume"], 0.07);
        assert_eq!(sent["stopLoss"], 0.9);
        assert_eq!(sent["takeProfit"], 2.0);
        assert!(sent.get("stopLossUnits").is_none());
        connection.close().await;
    }

    #[tokio::test]
    async fn relative_stops_emit_the_units_field() {
        let (connection, transport) = connect();
        connection
            .create_market_sell_order(
                "EURUSD",
                0.1,
                Some(StopLevel::Relative {
                    value: 2000.0,
                    units: StopUnits::RelativeCurrency,
                }),
                Some(StopLevel::Relative {
                    value: 0.05,
                    units: StopUnits::RelativePips,
                }),
                None,
            )
            .await
            .unwrap();

        let sent = last_sent(&transport);
        assert_eq!(sent["actionType"], "ORDER_TYPE_SELL");
        assert_eq!(sent["stopLoss"], 2000.0);
        assert_eq!(sent["stopLossUnits"], "RELATIVE_CURRENCY");
        assert_eq!(sent["takeProfit"], 0.05);
        assert_eq!(sent["takeProfitUnits"], "RELATIVE_PIPS");
        connection.close().await;
    }

    #[tokio::test]
    async fn pending_orders_carry_their_prices() {
        let (connection, transport) = connect();
        connection
            .create_limit_buy_order("GBPUSD", 0.07, 1.0, None, None, None)
            .await
            .unwrap();
        assert_eq!(last_sent(&transport)["actionType"], "ORDER_TYPE_BUY_LIMIT");
        assert_eq!(last_sent(&transport)["openPrice"], 1.0);

        connection
            .create_stop_limit_sell_order("GBPUSD", 0.07, 1.5, 1.4, None, None, None)
            .await
            .unwrap();
        let sent = last_sent(&transport);
        assert_eq!(sent["actionType"], "ORDER_TYPE_SELL_STOP_LIMIT");
        assert_eq!(sent["openPrice"], 1.5);
        assert_eq!(sent["stopLimitPrice"], 1.4);
        connection.close().await;
    }

    #[tokio::test]
    async fn options_merge_into_the_descriptor_last() {
        let (connection, transport) = connect();
        connection
            .create_market_buy_order(
                "GBPUSD",
                0.07,
                None,
                None,
                Some(MarketTradeOptions {
                    comment: Some("comment".into()),
                    client_id: Some("TE_GBPUSD_7hyINWqAlE".into()),
                    magic: Some(7),
                    slippage: None,
                }),
            )
            .await
            .unwrap();

        let sent = last_sent(&transport);
        assert_eq!(sent["comment"], "comment");
        assert_eq!(sent["clientId"], "TE_GBPUSD_7hyINWqAlE");
        assert_eq!(sent["magic"], 7);
        assert!(sent.get("slippage").is_none());
        connection.close().await;
    }

    #[tokio::test]
    async fn position_and_order_operations_map_to_action_types() {
        let (connection, transport) = connect();

        connection
            .modify_position("46870472", Some(2.0.into()), None)
            .await
            .unwrap();
        let sent = last_sent(&transport);
        assert_eq!(sent["actionType"], "POSITION_MODIFY");
        assert_eq!(sent["positionId"], "46870472");
        assert_eq!(sent["stopLoss"], 2.0);

        connection
            .close_position_partially("46870472", 0.45, None)
            .await
            .unwrap();
        assert_eq!(last_sent(&transport)["actionType"], "POSITION_PARTIAL");

        connection.close_position("46870472", None).await.unwrap();
        assert_eq!(last_sent(&transport)["actionType"], "POSITION_CLOSE_ID");

        connection
            .close_by("46870472", "46870482", None)
            .await
            .unwrap();
        let sent = last_sent(&transport);
        assert_eq!(sent["actionType"], "POSITION_CLOSE_BY");
        assert_eq!(sent["closeByPositionId"], "46870482");

        connection
            .close_positions_by_symbol("EURUSD", None)
            .await
            .unwrap();
        assert_eq!(last_sent(&transport)["actionType"], "POSITIONS_CLOSE_SYMBOL");

        connection
            .modify_order("46870472", 1.0, None, None)
            .await
            .unwrap();
        let sent = last_sent(&transport);
        assert_eq!(sent["actionType"], "ORDER_MODIFY");
        assert_eq!(sent["orderId"], "46870472");
        assert_eq!(sent["openPrice"], 1.0);

        connection.cancel_order("46870472").await.unwrap();
        assert_eq!(last_sent(&transport)["actionType"], "ORDER_CANCEL");
        connection.close().await;
    }

    #[tokio::test]
    async fn malformed_input_is_rejected_before_the_transport() {
        let (connection, transport) = connect();

        let empty_symbol = connection
            .create_market_buy_order("", 0.07, None, None, None)
            .await;
        assert!(matches!(empty_symbol, Err(SdkError::Validation(_))));

        let zero_volume = connection
            .create_market_buy_order("GBPUSD", 0.0, None, None, None)
            .await;
        assert!(matches!(zero_volume, Err(SdkError::Validation(_))));

        let bad_price = connection
            .create_limit_buy_order("GBPUSD", 0.07, f64::NAN, None, None, None)
            .await;
        assert!(matches!(bad_price, Err(SdkError::Validation(_))));

        assert!(transport.sent.lock().is_empty());
        connection.close().await;
    }
}
