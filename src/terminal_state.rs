// =============================================================================
// Terminal state replica — local copy of the remote terminal, per instance
// =============================================================================
//
// The replica keeps one snapshot per instance index and reduces the inbound
// synchronization events into it. Reads never name an instance: they resolve
// through best-replica selection over (initializationCounter, tiebreak) and
// return owned copies, so callers can hold results across await points.
//
// Thread safety: the snapshot map sits behind a parking_lot RwLock; all
// mutations arrive through the orchestrator's single dispatch task.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::debug;

use crate::client_api::IgnoredFieldLists;
use crate::error::{Result, SdkError};
use crate::events::SynchronizationListener;
use crate::types::{
    AccountInformation, Order, Platform, Position, PositionType, Price, Specification,
};

/// Seconds a removal/completion tombstone stays alive.
const TOMBSTONE_TTL_SECS: i64 = 5 * 60;

/// Fields always excluded from position hashing.
const POSITION_STRIP: &[&str] = &[
    "profit",
    "unrealizedProfit",
    "realizedProfit",
    "currentPrice",
    "currentTickValue",
    "updateSequenceNumber",
    "accountCurrencyExchangeRate",
    "comment",
    "originalComment",
    "clientId",
];

/// Fields always excluded from order hashing.
const ORDER_STRIP: &[&str] = &[
    "currentPrice",
    "updateSequenceNumber",
    "accountCurrencyExchangeRate",
    "comment",
    "originalComment",
    "clientId",
];

/// One replica snapshot.
#[derive(Debug, Clone, Default)]
pub struct InstanceState {
    pub instance_index: String,
    pub connected: bool,
    pub connected_to_broker: bool,
    pub account_information: Option<AccountInformation>,
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
    pub specifications_by_symbol: HashMap<String, Specification>,
    pub prices_by_symbol: HashMap<String, Price>,
    pub completed_orders: HashMap<String, i64>,
    pub removed_positions: HashMap<String, i64>,
    pub orders_initialized: bool,
    pub positions_initialized: bool,
    pub last_update_time: f64,
    pub initialization_counter: u32,
    pub specification_count: usize,
}

impl InstanceState {
    fn new(instance_index: &str) -> Self {
        Self {
            instance_index: instance_index.to_string(),
            ..Self::default()
        }
    }
}

/// Hex MD5 digests over the normalized snapshot, for incremental resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalHashes {
    pub specifications_md5: String,
    pub positions_md5: String,
    pub orders_md5: String,
}

#[derive(Debug, Clone, Copy)]
enum BestMode {
    Specification,
    Price,
}

/// Local replica of the remote terminal state.
pub struct TerminalState {
    states: RwLock<HashMap<String, InstanceState>>,
    price_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
}

impl Default for TerminalState {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalState {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            price_waiters: Mutex::new(HashMap::new()),
        }
    }

    // ── Readers over the best replica ───────────────────────────────────

    /// True if any instance has connected to the terminal.
    pub fn connected(&self) -> bool {
        self.states.read().values().any(|s| s.connected)
    }

    /// True if any instance reports the terminal connected to the broker.
    pub fn connected_to_broker(&self) -> bool {
        self.states.read().values().any(|s| s.connected_to_broker)
    }

    /// True once every present instance has completed synchronization.
    pub fn synchronized(&self) -> bool {
        let states = self.states.read();
        !states.is_empty() && states.values().all(|s| s.initialization_counter == 3)
    }

    pub fn account_information(&self) -> Option<AccountInformation> {
        self.with_best(None, |state| state.account_information.clone())
    }

    /// Open positions, in arrival order.
    pub fn positions(&self) -> Vec<Position> {
        self.with_best(None, |state| state.positions.clone())
    }

    /// Pending orders, in arrival order.
    pub fn orders(&self) -> Vec<Order> {
        self.with_best(None, |state| state.orders.clone())
    }

    /// Known symbol specifications, sorted by symbol.
    pub fn specifications(&self) -> Vec<Specification> {
        self.with_best(None, |state| {
            let mut specs: Vec<Specification> =
                state.specifications_by_symbol.values().cloned().collect();
            specs.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            specs
        })
    }

    /// Specification for `symbol`, from the best replica that has it.
    pub fn specification(&self, symbol: &str) -> Option<Specification> {
        self.with_best(Some((symbol, BestMode::Specification)), |state| {
            state.specifications_by_symbol.get(symbol).cloned()
        })
    }

    /// Latest price for `symbol`, from the best replica that has it.
    pub fn price(&self, symbol: &str) -> Option<Price> {
        self.with_best(Some((symbol, BestMode::Price)), |state| {
            state.prices_by_symbol.get(symbol).cloned()
        })
    }

    /// Waits until a price for `symbol` is known, up to `timeout`.
    pub async fn wait_for_price(&self, symbol: &str, timeout: Duration) -> Result<Price> {
        if let Some(price) = self.price(symbol) {
            return Ok(price);
        }
        let rx = {
            let mut waiters = self.price_waiters.lock();
            let (tx, rx) = oneshot::channel();
            waiters.entry(symbol.to_string()).or_default().push(tx);
            rx
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(_) => self.price(symbol).ok_or_else(|| {
                SdkError::Internal(format!("price waiter for {symbol} fired without a price"))
            }),
            Err(_) => Err(SdkError::timeout("wait_for_price", timeout)),
        }
    }

    // ── Content hashing ─────────────────────────────────────────────────

    /// MD5 digests over the canonicalized specifications, positions and
    /// orders of the best replica. `ignored_fields` comes from the hashing
    /// registry for the same account type.
    pub fn get_hashes(
        &self,
        account_type: &str,
        ignored_fields: &IgnoredFieldLists,
    ) -> Result<TerminalHashes> {
        let g1 = account_type == "cloud-g1";

        let mut specifications = self.specifications();
        specifications.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        let mut spec_values = Vec::with_capacity(specifications.len());
        for spec in &specifications {
            let mut obj = to_object(spec)?;
            for field in &ignored_fields.specification {
                obj.remove(field);
            }
            if g1 {
                obj.remove("description");
                promote_integers(&mut obj, &["digits"]);
            }
            spec_values.push(Value::Object(obj));
        }

        let mut positions = self.positions();
        positions.sort_by(|a, b| a.id.cmp(&b.id));
        let mut position_values = Vec::with_capacity(positions.len());
        for position in &positions {
            let mut obj = to_object(position)?;
            for field in POSITION_STRIP.iter().copied() {
                obj.remove(field);
            }
            for field in &ignored_fields.position {
                obj.remove(field);
            }
            if g1 {
                obj.remove("time");
                obj.remove("updateTime");
                promote_integers(&mut obj, &["magic"]);
            }
            position_values.push(Value::Object(obj));
        }

        let mut orders = self.orders();
        orders.sort_by(|a, b| a.id.cmp(&b.id));
        let mut order_values = Vec::with_capacity(orders.len());
        for order in &orders {
            let mut obj = to_object(order)?;
            for field in ORDER_STRIP.iter().copied() {
                obj.remove(field);
            }
            for field in &ignored_fields.order {
                obj.remove(field);
            }
            if g1 {
                obj.remove("time");
                promote_integers(&mut obj, &["magic"]);
            }
            order_values.push(Value::Object(obj));
        }

        Ok(TerminalHashes {
            specifications_md5: md5_hex(&spec_values)?,
            positions_md5: md5_hex(&position_values)?,
            orders_md5: md5_hex(&order_values)?,
        })
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn with_best<R>(
        &self,
        filter: Option<(&str, BestMode)>,
        f: impl FnOnce(&InstanceState) -> R,
    ) -> R {
        let states = self.states.read();
        match Self::select_best(&states, filter) {
            Some(state) => f(state),
            None => f(&InstanceState::default()),
        }
    }

    /// Best-replica selection: highest initialization counter, tie-broken by
    /// lastUpdateTime at counter 3 and by specification count at counter 0.
    /// Candidates failing the symbol filter are skipped without updating the
    /// running maxima. Instances are visited in sorted key order.
    fn select_best<'a>(
        states: &'a HashMap<String, InstanceState>,
        filter: Option<(&str, BestMode)>,
    ) -> Option<&'a InstanceState> {
        let mut keys: Vec<&String> = states.keys().collect();
        keys.sort();

        let mut best: Option<&InstanceState> = None;
        let mut max_update_time = -1.0f64;
        let mut max_counter = -1i64;
        let mut max_spec_count = -1i64;
        for key in keys {
            let state = &states[key];
            let counter = i64::from(state.initialization_counter);
            let better = max_counter < counter
                || (max_counter == counter
                    && max_counter == 3
                    && max_update_time < state.last_update_time)
                || (max_counter == counter
                    && max_counter == 0
                    && max_spec_count < state.specification_count as i64);
            if !better {
                continue;
            }
            let qualifies = match filter {
                None => true,
                Some((symbol, BestMode::Specification)) => {
                    state.specifications_by_symbol.contains_key(symbol)
                }
                Some((symbol, BestMode::Price)) => state.prices_by_symbol.contains_key(symbol),
            };
            if qualifies {
                max_update_time = state.last_update_time;
                max_counter = counter;
                max_spec_count = state.specification_count as i64;
                best = Some(state);
            }
        }
        best
    }

    fn with_state<R>(&self, instance_index: &str, f: impl FnOnce(&mut InstanceState) -> R) -> R {
        let mut states = self.states.write();
        let state = states
            .entry(instance_index.to_string())
            .or_insert_with(|| InstanceState::new(instance_index));
        f(state)
    }

    fn remove_position_at(&self, instance_index: &str, position_id: &str, now_secs: i64) {
        self.with_state(instance_index, |state| {
            if state.positions.iter().any(|p| p.id == position_id) {
                state.positions.retain(|p| p.id != position_id);
            } else {
                state
                    .removed_positions
                    .retain(|_, at| *at + TOMBSTONE_TTL_SECS >= now_secs);
                state
                    .removed_positions
                    .insert(position_id.to_string(), now_secs);
            }
        });
    }

    fn complete_order_at(&self, instance_index: &str, order_id: &str, now_secs: i64) {
        self.with_state(instance_index, |state| {
            if state.orders.iter().any(|o| o.id == order_id) {
                state.orders.retain(|o| o.id != order_id);
            } else {
                state
                    .completed_orders
                    .retain(|_, at| *at + TOMBSTONE_TTL_SECS >= now_secs);
                state.completed_orders.insert(order_id.to_string(), now_secs);
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_prices(
        &self,
        instance_index: &str,
        prices: &[Price],
        equity: Option<f64>,
        margin: Option<f64>,
        free_margin: Option<f64>,
        margin_level: Option<f64>,
    ) {
        let mut woken: Vec<oneshot::Sender<()>> = Vec::new();
        {
            let mut states = self.states.write();
            states
                .entry(instance_index.to_string())
                .or_insert_with(|| InstanceState::new(instance_index));

            // Specifications resolve through best-replica selection across
            // the whole map, so collect them before mutating this instance.
            let needed: HashSet<String> = states[instance_index]
                .positions
                .iter()
                .map(|p| p.symbol.clone())
                .collect();
            let specs: HashMap<String, Specification> = needed
                .iter()
                .filter_map(|symbol| {
                    Self::select_best(&states, Some((symbol.as_str(), BestMode::Specification)))
                        .and_then(|s| s.specifications_by_symbol.get(symbol).cloned())
                })
                .map(|spec| (spec.symbol.clone(), spec))
                .collect();

            let state = states
                .get_mut(instance_index)
                .expect("instance created above");

            state.last_update_time = prices
                .iter()
                .map(|p| p.time.timestamp_millis() as f64 / 1000.0)
                .fold(0.0, f64::max);

            let mut prices_initialized = false;
            for price in prices {
                state
                    .prices_by_symbol
                    .insert(price.symbol.clone(), price.clone());
                prices_initialized = true;

                for i in 0..state.positions.len() {
                    if state.positions[i].symbol == price.symbol {
                        if let Some(spec) = specs.get(&price.symbol) {
                            update_position_profits(&mut state.positions[i], price, spec);
                        }
                    } else {
                        let symbol = state.positions[i].symbol.clone();
                        match state.prices_by_symbol.get(&symbol).cloned() {
                            Some(known) => {
                                if state.positions[i].unrealized_profit.is_none() {
                                    if let Some(spec) = specs.get(&symbol) {
                                        update_position_profits(
                                            &mut state.positions[i],
                                            &known,
                                            spec,
                                        );
                                    }
                                }
                            }
                            None => prices_initialized = false,
                        }
                    }
                }

                for order in state.orders.iter_mut().filter(|o| o.symbol == price.symbol) {
                    order.current_price = Some(if order.order_type.is_buy() {
                        price.ask
                    } else {
                        price.bid
                    });
                }

                let mut waiters = self.price_waiters.lock();
                if let Some(list) = waiters.remove(&price.symbol) {
                    woken.extend(list);
                }
            }

            if let Some(ai) = state.account_information.as_mut() {
                if state.positions_initialized && prices_initialized {
                    let computed = ai.balance
                        + state
                            .positions
                            .iter()
                            .map(|p| match ai.platform {
                                Platform::Mt5 => {
                                    round_cents(p.unrealized_profit.unwrap_or(0.0))
                                        + round_cents(p.swap.unwrap_or(0.0))
                                }
                                Platform::Mt4 => {
                                    round_cents(p.swap.unwrap_or(0.0))
                                        + round_cents(p.commission.unwrap_or(0.0))
                                        + round_cents(p.unrealized_profit.unwrap_or(0.0))
                                }
                            })
                            .sum::<f64>();
                    ai.equity = Some(round_cents(equity.unwrap_or(computed)));
                } else {
                    ai.equity = equity.filter(|v| *v != 0.0).or(ai.equity);
                }
                ai.margin = margin.filter(|v| *v != 0.0).or(ai.margin);
                ai.free_margin = free_margin.filter(|v| *v != 0.0).or(ai.free_margin);
                // TODO: gate this on margin_level instead of free_margin once
                // the server contract for partial margin updates is clarified
                if free_margin.filter(|v| *v != 0.0).is_some() {
                    ai.margin_level = margin_level;
                }
            }
        }

        // Waiters resolve after the price is stored, so an awaiter observes
        // at least the price that woke it.
        for tx in woken {
            let _ = tx.send(());
        }
    }

    #[cfg(test)]
    fn instance(&self, instance_index: &str) -> Option<InstanceState> {
        self.states.read().get(instance_index).cloned()
    }
}

impl SynchronizationListener for TerminalState {
    fn on_connected(&self, instance_index: &str, _replicas: u32) -> Result<()> {
        self.with_state(instance_index, |state| state.connected = true);
        Ok(())
    }

    fn on_disconnected(&self, instance_index: &str) -> Result<()> {
        self.with_state(instance_index, |state| {
            state.connected = false;
            state.connected_to_broker = false;
        });
        Ok(())
    }

    fn on_broker_connection_status_changed(
        &self,
        instance_index: &str,
        connected: bool,
    ) -> Result<()> {
        self.with_state(instance_index, |state| {
            state.connected_to_broker = connected;
        });
        Ok(())
    }

    fn on_synchronization_started(
        &self,
        instance_index: &str,
        specifications_updated: bool,
        positions_updated: bool,
        orders_updated: bool,
    ) -> Result<()> {
        debug!(
            instance_index,
            specifications_updated, positions_updated, orders_updated, "synchronization started"
        );
        self.with_state(instance_index, |state| {
            state.account_information = None;
            state.prices_by_symbol.clear();
            state.initialization_counter = 0;
            if positions_updated {
                state.positions.clear();
                state.removed_positions.clear();
                state.positions_initialized = false;
            }
            if orders_updated {
                state.orders.clear();
                state.completed_orders.clear();
                state.orders_initialized = false;
            }
            if specifications_updated {
                state.specifications_by_symbol.clear();
            }
        });
        Ok(())
    }

    fn on_account_information_updated(
        &self,
        instance_index: &str,
        account_information: &AccountInformation,
    ) -> Result<()> {
        self.with_state(instance_index, |state| {
            state.account_information = Some(account_information.clone());
            state.initialization_counter = state.initialization_counter.max(1);
        });
        Ok(())
    }

    fn on_positions_replaced(&self, instance_index: &str, positions: &[Position]) -> Result<()> {
        self.with_state(instance_index, |state| {
            state.positions = positions.to_vec();
        });
        Ok(())
    }

    fn on_positions_synchronized(
        &self,
        instance_index: &str,
        _synchronization_id: &str,
    ) -> Result<()> {
        self.with_state(instance_index, |state| {
            state.removed_positions.clear();
            state.positions_initialized = true;
            state.initialization_counter = state.initialization_counter.max(2);
        });
        Ok(())
    }

    fn on_position_updated(&self, instance_index: &str, position: &Position) -> Result<()> {
        self.with_state(instance_index, |state| {
            if let Some(existing) = state.positions.iter_mut().find(|p| p.id == position.id) {
                *existing = position.clone();
            } else if !state.removed_positions.contains_key(&position.id) {
                state.positions.push(position.clone());
            }
        });
        Ok(())
    }

    fn on_position_removed(&self, instance_index: &str, position_id: &str) -> Result<()> {
        self.remove_position_at(instance_index, position_id, Utc::now().timestamp());
        Ok(())
    }

    fn on_pending_orders_replaced(&self, instance_index: &str, orders: &[Order]) -> Result<()> {
        self.with_state(instance_index, |state| {
            state.orders = orders.to_vec();
        });
        Ok(())
    }

    fn on_pending_orders_synchronized(
        &self,
        instance_index: &str,
        _synchronization_id: &str,
    ) -> Result<()> {
        self.with_state(instance_index, |state| {
            state.completed_orders.clear();
            state.orders_initialized = true;
            state.initialization_counter = state.initialization_counter.max(3);
        });
        Ok(())
    }

    fn on_pending_order_updated(&self, instance_index: &str, order: &Order) -> Result<()> {
        self.with_state(instance_index, |state| {
            if let Some(existing) = state.orders.iter_mut().find(|o| o.id == order.id) {
                *existing = order.clone();
            } else if !state.completed_orders.contains_key(&order.id) {
                state.orders.push(order.clone());
            }
        });
        Ok(())
    }

    fn on_pending_order_completed(&self, instance_index: &str, order_id: &str) -> Result<()> {
        self.complete_order_at(instance_index, order_id, Utc::now().timestamp());
        Ok(())
    }

    fn on_symbol_specifications_updated(
        &self,
        instance_index: &str,
        specifications: &[Specification],
        removed_symbols: &[String],
    ) -> Result<()> {
        self.with_state(instance_index, |state| {
            for spec in specifications {
                state
                    .specifications_by_symbol
                    .insert(spec.symbol.clone(), spec.clone());
            }
            for symbol in removed_symbols {
                state.specifications_by_symbol.remove(symbol);
            }
            state.specification_count = state.specifications_by_symbol.len();
        });
        Ok(())
    }

    fn on_symbol_prices_updated(
        &self,
        instance_index: &str,
        prices: &[Price],
        equity: Option<f64>,
        margin: Option<f64>,
        free_margin: Option<f64>,
        margin_level: Option<f64>,
        _account_currency_exchange_rate: Option<f64>,
    ) -> Result<()> {
        self.apply_prices(
            instance_index,
            prices,
            equity,
            margin,
            free_margin,
            margin_level,
        );
        Ok(())
    }

    fn on_stream_closed(&self, instance_index: &str) -> Result<()> {
        debug!(instance_index, "stream closed, dropping replica");
        self.states.write().remove(instance_index);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// P&L recomputation
// ---------------------------------------------------------------------------

/// Re-derive a position's running P&L from a fresh quote.
///
/// The first recompute captures `realizedProfit` as the difference between
/// the server-reported profit and the unrealized profit implied by the
/// stored entry quote; later recomputes only move the unrealized part.
fn update_position_profits(position: &mut Position, price: &Price, specification: &Specification) {
    let multiplier = 10f64.powi(specification.digits as i32);
    let round_digits = |v: f64| (v * multiplier).round() / multiplier;

    position.profit = round_digits(position.profit);
    if position.unrealized_profit.is_none() || position.realized_profit.is_none() {
        let unrealized = position.position_type.sign()
            * (position.current_price - position.open_price)
            * position.current_tick_value
            * position.volume
            / specification.tick_size;
        let unrealized = round_digits(unrealized);
        position.unrealized_profit = Some(unrealized);
        position.realized_profit = Some(position.profit - unrealized);
    }

    let new_price = match position.position_type {
        PositionType::Buy => price.bid,
        PositionType::Sell => price.ask,
    };
    let is_profitable = position.position_type.sign() * (new_price - position.open_price);
    let tick_value = if is_profitable > 0.0 {
        price.profit_tick_value
    } else {
        price.loss_tick_value
    };
    let unrealized = round_digits(
        position.position_type.sign()
            * (new_price - position.open_price)
            * tick_value
            * position.volume
            / specification.tick_size,
    );
    position.unrealized_profit = Some(unrealized);
    position.profit = round_digits(unrealized + position.realized_profit.unwrap_or(0.0));
    position.current_price = new_price;
    position.current_tick_value = tick_value;
}

fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Hashing helpers
// ---------------------------------------------------------------------------

fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(SdkError::Internal(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// Promote top-level non-boolean integer values to floats, except `keep`
/// keys. Serialized floats render as `X.0`, matching the g1 encoding.
fn promote_integers(obj: &mut Map<String, Value>, keep: &[&str]) {
    for (key, value) in obj.iter_mut() {
        if keep.contains(&key.as_str()) {
            continue;
        }
        if let Value::Number(n) = value {
            if n.is_i64() || n.is_u64() {
                if let Some(i) = n.as_i64() {
                    *value = Value::from(i as f64);
                }
            }
        }
    }
}

fn md5_hex(values: &[Value]) -> Result<String> {
    let json = serde_json::to_string(values)?;
    Ok(hex::encode(md5::compute(json.as_bytes()).0))
}
