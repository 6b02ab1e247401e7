// =============================================================================
// Synchronization event bus
// =============================================================================
//
// `TerminalEvent` is both the internal event bus variant set and the wire
// format of inbound packets: the `type` tag on each JSON frame selects the
// variant. Listeners implement `SynchronizationListener`, overriding only the
// events they care about; the provided `on_event` performs the exhaustive
// dispatch so that adding a variant breaks compilation here rather than
// silently skipping a handler.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{AccountInformation, Order, Position, Price, Specification};

fn default_true() -> bool {
    true
}

/// One inbound synchronization event from the cloud service.
///
/// Every event carries the `instanceIndex` of the replica it applies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TerminalEvent {
    /// Connection to the terminal established for an instance.
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        instance_index: String,
        #[serde(default)]
        replicas: u32,
    },

    /// Connection to the terminal lost for an instance.
    #[serde(rename = "disconnected", rename_all = "camelCase")]
    Disconnected { instance_index: String },

    /// Broker-side connection status changed.
    #[serde(rename = "brokerConnectionStatus", rename_all = "camelCase")]
    BrokerConnectionStatusChanged {
        instance_index: String,
        connected: bool,
    },

    /// A fresh synchronization cycle began.
    #[serde(rename = "synchronizationStarted", rename_all = "camelCase")]
    SynchronizationStarted {
        instance_index: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        synchronization_id: Option<String>,
        #[serde(default = "default_true")]
        specifications_updated: bool,
        #[serde(default = "default_true")]
        positions_updated: bool,
        #[serde(default = "default_true")]
        orders_updated: bool,
    },

    /// Account information arrived.
    #[serde(rename = "accountInformation", rename_all = "camelCase")]
    AccountInformationUpdated {
        instance_index: String,
        account_information: AccountInformation,
    },

    /// Full position list replacement during initial synchronization.
    #[serde(rename = "positions", rename_all = "camelCase")]
    PositionsReplaced {
        instance_index: String,
        positions: Vec<Position>,
    },

    /// Position synchronization finished.
    #[serde(rename = "positionsSynchronized", rename_all = "camelCase")]
    PositionsSynchronized {
        instance_index: String,
        synchronization_id: String,
    },

    /// Single position upsert.
    #[serde(rename = "positionUpdated", rename_all = "camelCase")]
    PositionUpdated {
        instance_index: String,
        position: Position,
    },

    /// Position removal by id.
    #[serde(rename = "positionRemoved", rename_all = "camelCase")]
    PositionRemoved {
        instance_index: String,
        position_id: String,
    },

    /// Full pending order list replacement during initial synchronization.
    #[serde(rename = "orders", rename_all = "camelCase")]
    PendingOrdersReplaced {
        instance_index: String,
        orders: Vec<Order>,
    },

    /// Pending order synchronization finished.
    #[serde(rename = "ordersSynchronized", rename_all = "camelCase")]
    PendingOrdersSynchronized {
        instance_index: String,
        synchronization_id: String,
    },

    /// Single pending order upsert.
    #[serde(rename = "orderUpdated", rename_all = "camelCase")]
    PendingOrderUpdated { instance_index: String, order: Order },

    /// Pending order executed or cancelled.
    #[serde(rename = "orderCompleted", rename_all = "camelCase")]
    PendingOrderCompleted {
        instance_index: String,
        order_id: String,
    },

    /// Symbol specifications upserted and/or removed.
    #[serde(rename = "specifications", rename_all = "camelCase")]
    SymbolSpecificationsUpdated {
        instance_index: String,
        #[serde(default)]
        specifications: Vec<Specification>,
        #[serde(default)]
        removed_symbols: Vec<String>,
    },

    /// Price ticks, optionally with server-side account margin figures.
    #[serde(rename = "prices", rename_all = "camelCase")]
    SymbolPricesUpdated {
        instance_index: String,
        #[serde(default)]
        prices: Vec<Price>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        equity: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        margin: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        free_margin: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        margin_level: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account_currency_exchange_rate: Option<f64>,
    },

    /// The event stream for an instance was closed server-side.
    #[serde(rename = "streamClosed", rename_all = "camelCase")]
    StreamClosed { instance_index: String },
}

impl TerminalEvent {
    /// Instance index the event applies to.
    pub fn instance_index(&self) -> &str {
        match self {
            Self::Connected { instance_index, .. }
            | Self::Disconnected { instance_index }
            | Self::BrokerConnectionStatusChanged { instance_index, .. }
            | Self::SynchronizationStarted { instance_index, .. }
            | Self::AccountInformationUpdated { instance_index, .. }
            | Self::PositionsReplaced { instance_index, .. }
            | Self::PositionsSynchronized { instance_index, .. }
            | Self::PositionUpdated { instance_index, .. }
            | Self::PositionRemoved { instance_index, .. }
            | Self::PendingOrdersReplaced { instance_index, .. }
            | Self::PendingOrdersSynchronized { instance_index, .. }
            | Self::PendingOrderUpdated { instance_index, .. }
            | Self::PendingOrderCompleted { instance_index, .. }
            | Self::SymbolSpecificationsUpdated { instance_index, .. }
            | Self::SymbolPricesUpdated { instance_index, .. }
            | Self::StreamClosed { instance_index } => instance_index,
        }
    }
}

/// Capability-set listener over the synchronization event stream.
///
/// Every method has a no-op default; implementors override the events they
/// consume. The orchestrator invokes `on_event`, which performs the
/// variant-to-method dispatch.
#[allow(unused_variables)]
pub trait SynchronizationListener: Send + Sync {
    fn on_connected(&self, instance_index: &str, replicas: u32) -> Result<()> {
        Ok(())
    }

    fn on_disconnected(&self, instance_index: &str) -> Result<()> {
        Ok(())
    }

    fn on_broker_connection_status_changed(
        &self,
        instance_index: &str,
        connected: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn on_synchronization_started(
        &self,
        instance_index: &str,
        specifications_updated: bool,
        positions_updated: bool,
        orders_updated: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn on_account_information_updated(
        &self,
        instance_index: &str,
        account_information: &AccountInformation,
    ) -> Result<()> {
        Ok(())
    }

    fn on_positions_replaced(&self, instance_index: &str, positions: &[Position]) -> Result<()> {
        Ok(())
    }

    fn on_positions_synchronized(
        &self,
        instance_index: &str,
        synchronization_id: &str,
    ) -> Result<()> {
        Ok(())
    }

    fn on_position_updated(&self, instance_index: &str, position: &Position) -> Result<()> {
        Ok(())
    }

    fn on_position_removed(&self, instance_index: &str, position_id: &str) -> Result<()> {
        Ok(())
    }

    fn on_pending_orders_replaced(&self, instance_index: &str, orders: &[Order]) -> Result<()> {
        Ok(())
    }

    fn on_pending_orders_synchronized(
        &self,
        instance_index: &str,
        synchronization_id: &str,
    ) -> Result<()> {
        Ok(())
    }

    fn on_pending_order_updated(&self, instance_index: &str, order: &Order) -> Result<()> {
        Ok(())
    }

    fn on_pending_order_completed(&self, instance_index: &str, order_id: &str) -> Result<()> {
        Ok(())
    }

    fn on_symbol_specifications_updated(
        &self,
        instance_index: &str,
        specifications: &[Specification],
        removed_symbols: &[String],
    ) -> Result<()> {
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_symbol_prices_updated(
        &self,
        instance_index: &str,
        prices: &[Price],
        equity: Option<f64>,
        margin: Option<f64>,
        free_margin: Option<f64>,
        margin_level: Option<f64>,
        account_currency_exchange_rate: Option<f64>,
    ) -> Result<()> {
        Ok(())
    }

    fn on_stream_closed(&self, instance_index: &str) -> Result<()> {
        Ok(())
    }

    /// Dispatch a bus event to the matching handler method.
    fn on_event(&self, event: &TerminalEvent) -> Result<()> {
        match event {
            TerminalEvent::Connected {
                instance_index,
                replicas,
            } => self.on_connected(instance_index, *replicas),
            TerminalEvent::Disconnected { instance_index } => {
                self.on_disconnected(instance_index)
            }
            TerminalEvent::BrokerConnectionStatusChanged {
                instance_index,
                connected,
            } => self.on_broker_connection_status_changed(instance_index, *connected),
            TerminalEvent::SynchronizationStarted {
                instance_index,
                specifications_updated,
                positions_updated,
                orders_updated,
                ..
            } => self.on_synchronization_started(
                instance_index,
                *specifications_updated,
                *positions_updated,
                *orders_updated,
            ),
            TerminalEvent::AccountInformationUpdated {
                instance_index,
                account_information,
            } => self.on_account_information_updated(instance_index, account_information),
            TerminalEvent::PositionsReplaced {
                instance_index,
                positions,
            } => self.on_positions_replaced(instance_index, positions),
            TerminalEvent::PositionsSynchronized {
                instance_index,
                synchronization_id,
            } => self.on_positions_synchronized(instance_index, synchronization_id),
            TerminalEvent::PositionUpdated {
                instance_index,
                position,
            } => self.on_position_updated(instance_index, position),
            TerminalEvent::PositionRemoved {
                instance_index,
                position_id,
            } => self.on_position_removed(instance_index, position_id),
            TerminalEvent::PendingOrdersReplaced {
                instance_index,
                orders,
            } => self.on_pending_orders_replaced(instance_index, orders),
            TerminalEvent::PendingOrdersSynchronized {
                instance_index,
                synchronization_id,
            } => self.on_pending_orders_synchronized(instance_index, synchronization_id),
            TerminalEvent::PendingOrderUpdated {
                instance_index,
                order,
            } => self.on_pending_order_updated(instance_index, order),
            TerminalEvent::PendingOrderCompleted {
                instance_index,
                order_id,
            } => self.on_pending_order_completed(instance_index, order_id),
            TerminalEvent::SymbolSpecificationsUpdated {
                instance_index,
                specifications,
                removed_symbols,
            } => self.on_symbol_specifications_updated(
                instance_index,
                specifications,
                removed_symbols,
            ),
            TerminalEvent::SymbolPricesUpdated {
                instance_index,
                prices,
                equity,
                margin,
                free_margin,
                margin_level,
                account_currency_exchange_rate,
            } => self.on_symbol_prices_updated(
                instance_index,
                prices,
                *equity,
                *margin,
                *free_margin,
                *margin_level,
                *account_currency_exchange_rate,
            ),
            TerminalEvent::StreamClosed { instance_index } => {
                self.on_stream_closed(instance_index)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_decode_from_tagged_frames() {
        let event: TerminalEvent = serde_json::from_str(
            r#"{"type": "connected", "instanceIndex": "0", "replicas": 2}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            TerminalEvent::Connected { ref instance_index, replicas: 2 } if instance_index == "0"
        ));
    }

    #[test]
    fn synchronization_started_flags_default_to_true() {
        let event: TerminalEvent = serde_json::from_str(
            r#"{"type": "synchronizationStarted", "instanceIndex": "1", "positionsUpdated": false}"#,
        )
        .unwrap();
        match event {
            TerminalEvent::SynchronizationStarted {
                specifications_updated,
                positions_updated,
                orders_updated,
                ..
            } => {
                assert!(specifications_updated);
                assert!(!positions_updated);
                assert!(orders_updated);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn prices_event_carries_optional_margin_figures() {
        let event: TerminalEvent = serde_json::from_str(
            r#"{
                "type": "prices",
                "instanceIndex": "0",
                "prices": [],
                "equity": 1250.5
            }"#,
        )
        .unwrap();
        match event {
            TerminalEvent::SymbolPricesUpdated { equity, margin, .. } => {
                assert_eq!(equity, Some(1250.5));
                assert_eq!(margin, None);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(event.instance_index(), "0");
    }
}
