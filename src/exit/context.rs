// =============================================================================
// ExitContext — per-position monitoring state
// =============================================================================
//
// One context per monitored position, owned by the registry and mutated only
// while that position's slot lock is held.  Life-cycle:
//
//   Monitoring -> (PartialExit)* -> Monitoring (reduced qty)
//   Monitoring -> Closed (full exit / quantity reaches zero / manual stop)
//
// `remaining_quantity` is monotonically non-increasing and never negative;
// a reduction that would overshoot is clamped to zero and flagged via
// `invariant_breach` instead of propagating an error.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::types::{ExitReason, Side};

/// Quantities at or below this are treated as zero.
pub const QTY_EPSILON: f64 = 1e-9;

/// Mutable state for a single monitored position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitContext {
    /// Unique key, immutable for the context's lifetime.
    pub position_id: String,
    /// Symbol used to route price updates to this context.
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    /// ATR snapshot taken at monitoring start.  `None` means the value was
    /// not yet available when monitoring began; the first feed reading
    /// backfills it once, after which it is frozen.
    pub entry_atr: Option<f64>,
    /// Most recent ATR from the volatility feed (held across gaps).
    pub last_atr: Option<f64>,
    pub original_quantity: f64,
    /// `0 <= remaining <= original`, reduced by partial exits and external
    /// fills.
    pub remaining_quantity: f64,
    /// Maximum favorable excursion tracker: highest price seen for longs,
    /// lowest for shorts.
    pub best_price: f64,
    /// Ratchet reference: the last emitted trailing stop, possibly floored at
    /// the entry price by the breakeven rule.  `None` before the first
    /// adjustment.
    pub last_trailing_stop_price: Option<f64>,
    /// Event time of the last emitted trailing adjustment.
    pub last_trailing_update_ms: Option<i64>,
    /// Client order id of the live trailing stop; replacing it implies the
    /// execution collaborator cancels the predecessor.
    pub active_trailing_order_id: Option<String>,
    pub breakeven_activated: bool,
    pub partial_exit_1_done: bool,
    pub partial_exit_2_done: bool,
    /// Append-only set of triggered reason tags (audit trail).
    pub exit_reasons: Vec<ExitReason>,
    /// Event time the position entered monitoring, epoch milliseconds.
    pub entry_time_ms: i64,
    /// Realized PnL reported through position events.
    pub realized_pnl: f64,
    /// Set when a quantity clamp fired; never cleared.
    pub invariant_breach: bool,
}

impl ExitContext {
    /// Create a context for a freshly registered position.  Inputs are
    /// validated by the registry before this is called.
    pub fn new(
        position_id: &str,
        symbol: &str,
        side: Side,
        entry_price: f64,
        quantity: f64,
        entry_atr: Option<f64>,
        entry_time_ms: i64,
    ) -> Self {
        info!(
            id = %position_id,
            symbol,
            side = %side,
            entry_price,
            quantity,
            entry_atr = ?entry_atr,
            "monitoring started"
        );

        Self {
            position_id: position_id.to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            entry_atr,
            last_atr: entry_atr,
            original_quantity: quantity,
            remaining_quantity: quantity,
            best_price: entry_price,
            last_trailing_stop_price: None,
            last_trailing_update_ms: None,
            active_trailing_order_id: None,
            breakeven_activated: false,
            partial_exit_1_done: false,
            partial_exit_2_done: false,
            exit_reasons: Vec::new(),
            entry_time_ms,
            realized_pnl: 0.0,
            invariant_breach: false,
        }
    }

    /// Signed distance from entry in the position's favor: positive when the
    /// trade is winning, negative when it is losing.
    pub fn favorable_excursion(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.side.sign()
    }

    /// Favorable excursion of the best price seen so far.
    pub fn best_excursion(&self) -> f64 {
        self.favorable_excursion(self.best_price)
    }

    /// Ratchet `best_price`: only ever moves in the position's favor.
    pub fn track_best_price(&mut self, price: f64) {
        if self.favorable_excursion(price) > self.best_excursion() {
            self.best_price = price;
        }
    }

    /// Fold in a fresh ATR reading.  Non-positive values are ignored; the
    /// first accepted reading backfills a missing `entry_atr` and freezes it.
    pub fn update_atr(&mut self, atr: f64) {
        if !atr.is_finite() || atr <= 0.0 {
            return;
        }
        if self.entry_atr.is_none() {
            self.entry_atr = Some(atr);
            info!(id = %self.position_id, atr, "entry ATR backfilled from feed");
        }
        self.last_atr = Some(atr);
    }

    /// Append a reason tag unless it is already recorded.
    pub fn record_reason(&mut self, reason: ExitReason) {
        if !self.exit_reasons.contains(&reason) {
            self.exit_reasons.push(reason);
        }
    }

    /// Reduce the remaining quantity by `delta`, clamping at zero.
    ///
    /// Returns `true` when the reduction overshot and was clamped, in which
    /// case `invariant_breach` is set.
    pub fn reduce_remaining(&mut self, delta: f64) -> bool {
        let next = self.remaining_quantity - delta;

        if next < -QTY_EPSILON {
            error!(
                id = %self.position_id,
                remaining = self.remaining_quantity,
                delta,
                "quantity reduction exceeds remaining — clamping to zero"
            );
            self.remaining_quantity = 0.0;
            self.invariant_breach = true;
            return true;
        }

        self.remaining_quantity = if next <= QTY_EPSILON { 0.0 } else { next };
        false
    }

    /// Whether the position has no quantity left to manage.
    pub fn is_flat(&self) -> bool {
        self.remaining_quantity <= QTY_EPSILON
    }

    /// Reference the next trailing candidate must improve on: the last stop,
    /// or the theoretical entry stop before any adjustment was emitted.
    pub fn trail_reference(&self, trail_distance: f64) -> f64 {
        self.last_trailing_stop_price
            .unwrap_or(self.entry_price - self.side.sign() * trail_distance)
    }

    /// Milliseconds this position has been monitored as of `now_ms`.
    /// Out-of-order event times never produce a negative duration.
    pub fn holding_time_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.entry_time_ms).max(0)
    }

    /// Immutable diagnostic copy for dashboards and logs.
    pub fn view(&self) -> ContextView {
        ContextView {
            position_id: self.position_id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            entry_price: self.entry_price,
            entry_atr: self.entry_atr,
            last_atr: self.last_atr,
            original_quantity: self.original_quantity,
            remaining_quantity: self.remaining_quantity,
            best_price: self.best_price,
            last_trailing_stop_price: self.last_trailing_stop_price,
            active_trailing_order_id: self.active_trailing_order_id.clone(),
            breakeven_activated: self.breakeven_activated,
            partial_exit_1_done: self.partial_exit_1_done,
            partial_exit_2_done: self.partial_exit_2_done,
            exit_reasons: self.exit_reasons.clone(),
            entry_time_ms: self.entry_time_ms,
            realized_pnl: self.realized_pnl,
            invariant_breach: self.invariant_breach,
        }
    }
}

/// Serialisable snapshot of one context, detached from live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextView {
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub entry_atr: Option<f64>,
    pub last_atr: Option<f64>,
    pub original_quantity: f64,
    pub remaining_quantity: f64,
    pub best_price: f64,
    pub last_trailing_stop_price: Option<f64>,
    pub active_trailing_order_id: Option<String>,
    pub breakeven_activated: bool,
    pub partial_exit_1_done: bool,
    pub partial_exit_2_done: bool,
    pub exit_reasons: Vec<ExitReason>,
    pub entry_time_ms: i64,
    pub realized_pnl: f64,
    pub invariant_breach: bool,
}
