// =============================================================================
// Nimbus Cloud Trading SDK — client-side core
// =============================================================================
//
// Mirrors the state of a remote trading terminal into a local in-process
// replica and exposes a trade/RPC surface against it. The remote service
// pushes synchronization events over a bidirectional channel; the SDK reduces
// them into per-instance snapshots, arbitrates reads across replicas, keeps
// content hashes for incremental resync, and monitors connection health.
//
// The replica is volatile: it is rebuilt from scratch on every
// synchronization and never persisted.
// =============================================================================

pub mod client_api;
pub mod connection;
pub mod error;
pub mod events;
pub mod health_monitor;
pub mod reservoir;
pub mod terminal_state;
pub mod trade;
pub mod transport;
pub mod types;

pub use client_api::{ClientApiClient, HashingIgnoredFieldLists, IgnoredFieldLists, UrlResolver};
pub use connection::{SubscriptionRegistry, TerminalConnection};
pub use error::{Result, SdkError};
pub use events::{SynchronizationListener, TerminalEvent};
pub use health_monitor::{ConnectionHealthMonitor, ConnectionHealthStatus};
pub use terminal_state::{TerminalHashes, TerminalState};
pub use trade::{ExpirationOptions, MarketTradeOptions, PendingTradeOptions, StopLevel, StopUnits};
pub use transport::{TerminalTransport, WsTransport};
pub use types::{
    AccountInformation, Order, OrderType, Platform, Position, PositionType, Price, Specification,
    TradeResponse,
};
