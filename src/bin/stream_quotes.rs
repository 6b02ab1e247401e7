// =============================================================================
// Quote streaming example — connect, synchronize, subscribe, stream
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use nimbus_sdk::events::SynchronizationListener;
use nimbus_sdk::transport::WsTransport;
use nimbus_sdk::types::Price;
use nimbus_sdk::TerminalConnection;

/// Prints every price update for the watched symbol.
struct QuoteListener {
    symbol: String,
}

impl SynchronizationListener for QuoteListener {
    fn on_symbol_prices_updated(
        &self,
        _instance_index: &str,
        prices: &[Price],
        _equity: Option<f64>,
        _margin: Option<f64>,
        _free_margin: Option<f64>,
        _margin_level: Option<f64>,
        _account_currency_exchange_rate: Option<f64>,
    ) -> nimbus_sdk::Result<()> {
        for price in prices.iter().filter(|p| p.symbol == self.symbol) {
            info!(
                symbol = %price.symbol,
                bid = price.bid,
                ask = price.ask,
                time = %price.time,
                "price updated"
            );
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let token = std::env::var("TOKEN").expect("TOKEN must be set");
    let account_id = std::env::var("ACCOUNT_ID").expect("ACCOUNT_ID must be set");
    let symbol = std::env::var("SYMBOL").unwrap_or_else(|_| "EURUSD".into());
    let url = std::env::var("NIMBUS_WS_URL")
        .unwrap_or_else(|_| "wss://trade-client-api-v1.vint-hill.nimbus.trade/ws".into());

    let (transport, inbound) = WsTransport::connect(&url, &token).await?;
    let connection = TerminalConnection::new(account_id, transport.clone(), inbound);

    connection.add_synchronization_listener(Arc::new(QuoteListener {
        symbol: symbol.clone(),
    }));

    info!("waiting for the local replica to synchronize to the terminal state");
    connection
        .wait_synchronized(Duration::from_secs(1200))
        .await?;

    connection.subscribe_to_market_data(&symbol).await?;
    info!(symbol = %symbol, "streaming quotes now, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    connection.close().await;
    transport.close().await;
    Ok(())
}
