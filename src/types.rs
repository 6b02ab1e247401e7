// =============================================================================
// Shared terminal data model — wire types for the Nimbus trading SDK
// =============================================================================
//
// All types (de)serialize with camelCase field names to match the cloud
// protocol. Optional fields are skipped entirely when absent so that the
// serialized form of a snapshot never contains nulls (the content hashes in
// terminal_state depend on this).
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trading platform the remote terminal runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "mt4")]
    Mt4,
    #[serde(rename = "mt5")]
    Mt5,
}

impl Default for Platform {
    fn default() -> Self {
        Self::Mt5
    }
}

/// Account information snapshot reported by the terminal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInformation {
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub balance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_margin: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<i64>,
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionType {
    #[serde(rename = "POSITION_TYPE_BUY")]
    Buy,
    #[serde(rename = "POSITION_TYPE_SELL")]
    Sell,
}

impl PositionType {
    /// +1 for long positions, -1 for short.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

/// An open position in the terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub position_type: PositionType,
    pub open_price: f64,
    pub volume: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub current_tick_value: f64,
    #[serde(default)]
    pub profit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrealized_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission: Option<f64>,
    #[serde(default)]
    pub magic: i64,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_sequence_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_currency_exchange_rate: Option<f64>,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            id: String::new(),
            symbol: String::new(),
            position_type: PositionType::Buy,
            open_price: 0.0,
            volume: 0.0,
            current_price: 0.0,
            current_tick_value: 0.0,
            profit: 0.0,
            unrealized_profit: None,
            realized_profit: None,
            swap: None,
            commission: None,
            magic: 0,
            time: DateTime::UNIX_EPOCH,
            update_time: None,
            stop_loss: None,
            take_profit: None,
            comment: None,
            original_comment: None,
            client_id: None,
            update_sequence_number: None,
            account_currency_exchange_rate: None,
        }
    }
}

/// Pending order kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "ORDER_TYPE_BUY")]
    Buy,
    #[serde(rename = "ORDER_TYPE_SELL")]
    Sell,
    #[serde(rename = "ORDER_TYPE_BUY_LIMIT")]
    BuyLimit,
    #[serde(rename = "ORDER_TYPE_SELL_LIMIT")]
    SellLimit,
    #[serde(rename = "ORDER_TYPE_BUY_STOP")]
    BuyStop,
    #[serde(rename = "ORDER_TYPE_SELL_STOP")]
    SellStop,
    #[serde(rename = "ORDER_TYPE_BUY_STOP_LIMIT")]
    BuyStopLimit,
    #[serde(rename = "ORDER_TYPE_SELL_STOP_LIMIT")]
    SellStopLimit,
}

impl OrderType {
    /// True for every BUY-family order type.
    pub fn is_buy(&self) -> bool {
        matches!(
            self,
            Self::Buy | Self::BuyLimit | Self::BuyStop | Self::BuyStopLimit
        )
    }
}

/// A pending order in the terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_price: Option<f64>,
    pub volume: f64,
    #[serde(default)]
    pub magic: i64,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_sequence_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_currency_exchange_rate: Option<f64>,
}

impl Default for Order {
    fn default() -> Self {
        Self {
            id: String::new(),
            symbol: String::new(),
            order_type: OrderType::BuyLimit,
            open_price: None,
            current_price: None,
            volume: 0.0,
            magic: 0,
            time: DateTime::UNIX_EPOCH,
            expiration_time: None,
            stop_loss: None,
            take_profit: None,
            comment: None,
            original_comment: None,
            client_id: None,
            update_sequence_number: None,
            account_currency_exchange_rate: None,
        }
    }
}

/// A single broker quote session window, bounds formatted `HH:MM:SS.ffffff`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteSession {
    pub from: String,
    pub to: String,
}

/// Per-weekday quote session windows, keyed `MONDAY` .. `SUNDAY`.
pub type QuoteSessions = HashMap<String, Vec<QuoteSession>>;

/// Symbol specification reported by the terminal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Specification {
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub digits: u32,
    pub tick_size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_sessions: Option<QuoteSessions>,
}

/// Streaming price tick for a symbol.
///
/// `time` is the quote timestamp in UTC; `broker_time` is the same instant
/// rendered in the broker's timezone (`YYYY-MM-DD HH:MM:SS.fff`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Price {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub profit_tick_value: f64,
    #[serde(default)]
    pub loss_tick_value: f64,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub broker_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_currency_exchange_rate: Option<f64>,
}

impl Default for Price {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            bid: 0.0,
            ask: 0.0,
            profit_tick_value: 0.0,
            loss_tick_value: 0.0,
            time: DateTime::UNIX_EPOCH,
            broker_time: String::new(),
            account_currency_exchange_rate: None,
        }
    }
}

/// Result of a trade request, as returned by the trade server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeResponse {
    #[serde(default)]
    pub numeric_code: i64,
    #[serde(default)]
    pub string_code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
}

/// Retcode reported on a fully successful trade.
pub const TRADE_RETCODE_DONE: &str = "TRADE_RETCODE_DONE";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_wire_names_are_camel_case() {
        let p = Position {
            id: "46214692".into(),
            symbol: "GBPUSD".into(),
            position_type: PositionType::Buy,
            open_price: 1.26101,
            volume: 0.07,
            current_price: 1.24883,
            current_tick_value: 1.0,
            profit: -85.25,
            ..Position::default()
        };
        let value = serde_json::to_value(&p).unwrap();
        assert_eq!(value["type"], "POSITION_TYPE_BUY");
        assert_eq!(value["openPrice"], 1.26101);
        assert_eq!(value["currentTickValue"], 1.0);
        // absent optionals are skipped, not serialized as null
        assert!(value.get("unrealizedProfit").is_none());
        assert!(value.get("comment").is_none());
    }

    #[test]
    fn order_type_buy_family() {
        assert!(OrderType::Buy.is_buy());
        assert!(OrderType::BuyStopLimit.is_buy());
        assert!(!OrderType::SellLimit.is_buy());
        assert!(!OrderType::Sell.is_buy());
    }

    #[test]
    fn platform_round_trips_lowercase() {
        assert_eq!(serde_json::to_string(&Platform::Mt4).unwrap(), "\"mt4\"");
        let p: Platform = serde_json::from_str("\"mt5\"").unwrap();
        assert_eq!(p, Platform::Mt5);
    }
}
