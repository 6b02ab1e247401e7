// =============================================================================
// Connection health monitor — quote freshness and weekly uptime
// =============================================================================
//
// Two cooperative 1 Hz jobs share the monitor:
//   1. Quote health: derives "server now" from the broker-time offset of the
//      latest quote and checks whether any subscribed symbol sits inside a
//      quote session without fresh prices.
//   2. Uptime: pushes 100/0 into a week-long reservoir once per second.
//
// Both jobs are cancellable tasks scoped to the monitor; `stop` aborts them
// and awaits their exit. A failing tick is logged, never propagated.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, NaiveDateTime, Utc, Weekday};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::error;

use crate::connection::SubscriptionRegistry;
use crate::error::Result;
use crate::events::SynchronizationListener;
use crate::reservoir::Reservoir;
use crate::terminal_state::TerminalState;
use crate::types::Price;

/// Longest tolerated gap between quotes while inside a quote session.
const MIN_QUOTE_INTERVAL: Duration = Duration::from_secs(60);

/// Uptime reservoir: one slot per hour of the week, over a 7-day window.
const UPTIME_CAPACITY: usize = 24 * 7;
const UPTIME_WINDOW_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Composite connection health snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealthStatus {
    pub connected: bool,
    pub connected_to_broker: bool,
    pub quote_streaming_healthy: bool,
    pub synchronized: bool,
    pub healthy: bool,
    pub message: String,
}

/// Tracks connection health for one account.
pub struct ConnectionHealthMonitor {
    terminal_state: Arc<TerminalState>,
    subscriptions: Arc<SubscriptionRegistry>,
    account_id: String,
    quotes_healthy: AtomicBool,
    offset_secs: RwLock<f64>,
    price_updated_at: RwLock<Option<Instant>>,
    uptime_reservoir: Mutex<Reservoir>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionHealthMonitor {
    pub fn new(
        terminal_state: Arc<TerminalState>,
        subscriptions: Arc<SubscriptionRegistry>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            terminal_state,
            subscriptions,
            account_id: account_id.into(),
            quotes_healthy: AtomicBool::new(false),
            offset_secs: RwLock::new(0.0),
            price_updated_at: RwLock::new(None),
            uptime_reservoir: Mutex::new(Reservoir::with_window(
                UPTIME_CAPACITY,
                UPTIME_WINDOW_MS,
            )),
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Launch the two 1 Hz jobs. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut jobs = self.jobs.lock();
        if !jobs.is_empty() {
            return;
        }

        let monitor = Arc::clone(self);
        jobs.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                monitor.update_quote_health();
            }
        }));

        let monitor = Arc::clone(self);
        jobs.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                monitor.measure_uptime();
            }
        }));
    }

    /// Cancel both jobs and await their exit.
    pub async fn stop(&self) {
        let jobs: Vec<JoinHandle<()>> = self.jobs.lock().drain(..).collect();
        for job in jobs {
            job.abort();
            let _ = job.await;
        }
    }

    /// Current composite health status.
    pub fn health_status(&self) -> ConnectionHealthStatus {
        let connected = self.terminal_state.connected();
        let connected_to_broker = self.terminal_state.connected_to_broker();
        let synchronized = self.terminal_state.synchronized();
        let quote_streaming_healthy = self.quotes_healthy.load(Ordering::SeqCst);
        let healthy = connected && connected_to_broker && quote_streaming_healthy && synchronized;

        let message = if healthy {
            "Connection to broker is stable. No health issues detected.".to_string()
        } else {
            let mut reasons = Vec::new();
            if !connected {
                reasons.push("connection to API server is not established or lost");
            }
            if !connected_to_broker {
                reasons.push("connection to broker is not established or lost");
            }
            if !synchronized {
                reasons.push("local terminal state is not synchronized to broker");
            }
            if !quote_streaming_healthy {
                reasons.push("quotes are not streamed from the broker properly");
            }
            format!(
                "Connection is not healthy because {}.",
                reasons.join(" and ")
            )
        };

        ConnectionHealthStatus {
            connected,
            connected_to_broker,
            quote_streaming_healthy,
            synchronized,
            healthy,
            message,
        }
    }

    /// Uptime percentage measured over the last week.
    pub fn uptime(&self) -> f64 {
        self.uptime_reservoir.lock().get_statistics().average
    }

    fn update_quote_health(&self) {
        self.update_quote_health_at(Utc::now());
    }

    fn update_quote_health_at(&self, now: DateTime<Utc>) {
        let offset = *self.offset_secs.read();
        let server_now = now - chrono::Duration::milliseconds((offset * 1000.0) as i64);
        let day = weekday_name(server_now.date_naive().weekday());
        let server_time = server_now.format("%H:%M:%S%.6f").to_string();

        let mut in_session = false;
        for symbol in self.subscriptions.symbols() {
            let Some(specification) = self.terminal_state.specification(&symbol) else {
                continue;
            };
            let Some(sessions) = specification.quote_sessions else {
                continue;
            };
            for session in sessions.get(day).map(Vec::as_slice).unwrap_or(&[]) {
                if session.from.as_str() <= server_time.as_str()
                    && server_time.as_str() <= session.to.as_str()
                {
                    in_session = true;
                }
            }
        }

        let fresh = self
            .price_updated_at
            .read()
            .map(|at| at.elapsed() < MIN_QUOTE_INTERVAL)
            .unwrap_or(false);
        let healthy = self.subscriptions.is_empty() || !in_session || fresh;
        self.quotes_healthy.store(healthy, Ordering::SeqCst);
    }

    fn measure_uptime(&self) {
        let healthy = self.terminal_state.connected()
            && self.terminal_state.connected_to_broker()
            && self.terminal_state.synchronized()
            && self.quotes_healthy.load(Ordering::SeqCst);
        self.uptime_reservoir
            .lock()
            .push(if healthy { 100.0 } else { 0.0 });
    }
}

impl SynchronizationListener for ConnectionHealthMonitor {
    fn on_symbol_prices_updated(
        &self,
        _instance_index: &str,
        prices: &[Price],
        _equity: Option<f64>,
        _margin: Option<f64>,
        _free_margin: Option<f64>,
        _margin_level: Option<f64>,
        _account_currency_exchange_rate: Option<f64>,
    ) -> Result<()> {
        for price in prices {
            match parse_broker_time(&price.broker_time) {
                Ok(broker_secs) => {
                    *self.price_updated_at.write() = Some(Instant::now());
                    *self.offset_secs.write() =
                        Utc::now().timestamp_millis() as f64 / 1000.0 - broker_secs;
                }
                Err(err) => error!(
                    account_id = %self.account_id,
                    timestamp = %Utc::now().to_rfc3339(),
                    broker_time = %price.broker_time,
                    error = %err,
                    "failed to update quote streaming health status on price update"
                ),
            }
        }
        Ok(())
    }
}

/// Broker time in epoch seconds, parsed from `YYYY-MM-DD HH:MM:SS[.fff]`.
fn parse_broker_time(broker_time: &str) -> std::result::Result<f64, chrono::ParseError> {
    let parsed = NaiveDateTime::parse_from_str(broker_time, "%Y-%m-%d %H:%M:%S%.f")?;
    Ok(parsed.and_utc().timestamp_millis() as f64 / 1000.0)
}

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "MONDAY",
        Weekday::Tue => "TUESDAY",
        Weekday::Wed => "WEDNESDAY",
        Weekday::Thu => "THURSDAY",
        Weekday::Fri => "FRIDAY",
        Weekday::Sat => "SATURDAY",
        Weekday::Sun => "SUNDAY",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::types::{QuoteSession, Specification};

    fn monitor_fixture() -> (Arc<TerminalState>, Arc<SubscriptionRegistry>, ConnectionHealthMonitor)
    {
        let terminal_state = Arc::new(TerminalState::new());
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let monitor = ConnectionHealthMonitor::new(
            Arc::clone(&terminal_state),
            Arc::clone(&subscriptions),
            "accountId",
        );
        (terminal_state, subscriptions, monitor)
    }

    fn eurusd_with_weekday_session(day: &str) -> Specification {
        let mut sessions = crate::types::QuoteSessions::new();
        sessions.insert(
            day.to_string(),
            vec![QuoteSession {
                from: "08:00:00.000000".into(),
                to: "17:00:00.000000".into(),
            }],
        );
        Specification {
            symbol: "EURUSD".into(),
            digits: 5,
            tick_size: 0.00001,
            quote_sessions: Some(sessions),
            ..Specification::default()
        }
    }

    // 2020-01-06 was a Monday
    fn monday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 6, 12, 0, 0).unwrap()
    }

    #[test]
    fn quotes_are_healthy_with_no_subscriptions() {
        let (_state, _subs, monitor) = monitor_fixture();
        monitor.update_quote_health_at(monday_noon());
        assert!(monitor.quotes_healthy.load(Ordering::SeqCst));
    }

    #[test]
    fn stale_quotes_inside_a_session_are_unhealthy() {
        let (state, subs, monitor) = monitor_fixture();
        state
            .on_symbol_specifications_updated("0", &[eurusd_with_weekday_session("MONDAY")], &[])
            .unwrap();
        subs.add("EURUSD");

        monitor.update_quote_health_at(monday_noon());
        assert!(!monitor.quotes_healthy.load(Ordering::SeqCst));

        // a fresh price restores health
        *monitor.price_updated_at.write() = Some(Instant::now());
        monitor.update_quote_health_at(monday_noon());
        assert!(monitor.quotes_healthy.load(Ordering::SeqCst));
    }

    #[test]
    fn outside_the_session_window_quotes_are_healthy() {
        let (state, subs, monitor) = monitor_fixture();
        state
            .on_symbol_specifications_updated("0", &[eurusd_with_weekday_session("TUESDAY")], &[])
            .unwrap();
        subs.add("EURUSD");

        monitor.update_quote_health_at(monday_noon());
        assert!(monitor.quotes_healthy.load(Ordering::SeqCst));
    }

    #[test]
    fn broker_time_offset_shifts_the_server_clock() {
        let (state, subs, monitor) = monitor_fixture();
        state
            .on_symbol_specifications_updated("0", &[eurusd_with_weekday_session("MONDAY")], &[])
            .unwrap();
        subs.add("EURUSD");

        // 20:00 local is outside the window, but a +4h broker offset puts
        // "server now" at 16:00, inside the session
        *monitor.offset_secs.write() = 4.0 * 3600.0;
        let evening = Utc.with_ymd_and_hms(2020, 1, 6, 20, 0, 0).unwrap();
        monitor.update_quote_health_at(evening);
        assert!(!monitor.quotes_healthy.load(Ordering::SeqCst));
    }

    #[test]
    fn health_message_enumerates_every_failing_reason() {
        let (_state, _subs, monitor) = monitor_fixture();
        let status = monitor.health_status();
        assert!(!status.healthy);
        assert_eq!(
            status.message,
            "Connection is not healthy because connection to API server is not established or \
             lost and connection to broker is not established or lost and local terminal state \
             is not synchronized to broker and quotes are not streamed from the broker properly."
        );
    }

    #[test]
    fn healthy_connection_reports_a_stable_message() {
        let (state, _subs, monitor) = monitor_fixture();
        state.on_connected("0", 1).unwrap();
        state.on_broker_connection_status_changed("0", true).unwrap();
        state
            .on_account_information_updated("0", &Default::default())
            .unwrap();
        state.on_positions_synchronized("0", "sync").unwrap();
        state.on_pending_orders_synchronized("0", "sync").unwrap();
        monitor.update_quote_health_at(monday_noon());

        let status = monitor.health_status();
        assert!(status.healthy);
        assert_eq!(
            status.message,
            "Connection to broker is stable. No health issues detected."
        );
    }

    #[test]
    fn uptime_averages_the_pushed_samples() {
        let (state, _subs, monitor) = monitor_fixture();
        monitor.update_quote_health_at(monday_noon());

        // unhealthy: not connected
        monitor.measure_uptime();
        assert!((monitor.uptime() - 0.0).abs() < 1e-9);

        state.on_connected("0", 1).unwrap();
        state.on_broker_connection_status_changed("0", true).unwrap();
        state
            .on_account_information_updated("0", &Default::default())
            .unwrap();
        state.on_positions_synchronized("0", "sync").unwrap();
        state.on_pending_orders_synchronized("0", "sync").unwrap();
        monitor.measure_uptime();
        assert!((monitor.uptime() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn price_updates_refresh_the_offset() {
        let (_state, _subs, monitor) = monitor_fixture();
        let price = Price {
            symbol: "EURUSD".into(),
            broker_time: "2020-01-06 12:00:00.000".into(),
            ..Price::default()
        };
        monitor
            .on_symbol_prices_updated("0", &[price], None, None, None, None, None)
            .unwrap();
        assert!(monitor.price_updated_at.read().is_some());
        // offset is now (distance to 2020) rather than the initial zero
        assert!(monitor.offset_secs.read().abs() > 1.0);
    }

    #[test]
    fn malformed_broker_time_is_swallowed() {
        let (_state, _subs, monitor) = monitor_fixture();
        let price = Price {
            symbol: "EURUSD".into(),
            broker_time: "not a timestamp".into(),
            ..Price::default()
        };
        assert!(monitor
            .on_symbol_prices_updated("0", &[price], None, None, None, None, None)
            .is_ok());
        assert!(monitor.price_updated_at.read().is_none());
    }
}
