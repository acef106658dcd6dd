// =============================================================================
// Position Monitor Registry — owns every tracked position and routes updates
// =============================================================================
//
// Life-cycle per position:
//   start_monitoring  ->  price dispatches (evaluation passes)  ->  one of:
//     - full exit decision      (market order emitted, slot retired)
//     - external fill to flat   (reconciled via dispatch_position_update)
//     - manual stop             (stop_monitoring_by_id)
//
// Locking discipline:
//   - `index` (RwLock) maps position ids to slots plus a by-symbol view.  It
//     is held only long enough to splice the maps, never across evaluation.
//   - Each slot carries its own Mutex so symbols evaluate independently; a
//     slow position cannot stall the rest of a dispatch.
//   - Every acquisition is timed (`try_*_for`).  Entry-point lookups surface
//     a timeout as `EngineError::LockTimeout`; inside a dispatch pass slot
//     waits are counted and skipped, and once a slot is retired its index
//     removal is deferred on timeout and drained by a later dispatch.
//   - `retired` flips under the slot lock before the slot leaves the index,
//     so a stop racing an exit decision settles on exactly one terminal
//     outcome.
//   - The index lock is never acquired while a slot lock is held.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExitParams;
use crate::emitter::{ExitOrderEmitter, ExitOrderRequest, OrderKind};
use crate::errors::EngineError;
use crate::exit::context::{ContextView, ExitContext};
use crate::exit::evaluator;
use crate::feeds::{FibonacciFeed, VolatilityFeed};
use crate::types::{ExitDecision, ExitReason, MarketSnapshot, Side};

// ---------------------------------------------------------------------------
// Outcomes and counters
// ---------------------------------------------------------------------------

/// Result of a `start_monitoring` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new slot was created for the position.
    Created,
    /// The id was already tracked; the existing state is left untouched.
    AlreadyMonitored,
}

/// Result of a `stop_monitoring_by_id` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Removed,
    /// Unknown id, or the position already reached a terminal outcome.
    NotFound,
}

/// Result of reconciling an externally reported fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionUpdateOutcome {
    /// Fill absorbed; the position stays monitored with this much left.
    Reconciled { remaining: f64 },
    /// The fill took the position flat; monitoring ended.
    Closed,
    NotFound,
}

/// Per-dispatch counters returned to the caller of `dispatch_price_update`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DispatchStats {
    /// Slots registered for the snapshot's symbol.
    pub matched: usize,
    /// Slots that actually ran an evaluation pass.
    pub evaluated: usize,
    /// Effects produced across all evaluated slots.
    pub decisions: usize,
    /// Slot locks that could not be taken within the wait budget.
    pub lock_timeouts: usize,
    /// Slots skipped because price or entry ATR was unusable.
    pub data_gaps: usize,
}

/// Cumulative registry counters, exposed for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active_positions: usize,
    pub evaluations: u64,
    pub decisions: u64,
    pub lock_timeouts: u64,
    pub data_gaps: u64,
    pub invariant_clamps: u64,
}

// ---------------------------------------------------------------------------
// Internal storage
// ---------------------------------------------------------------------------

struct PositionSlot {
    ctx: Mutex<ExitContext>,
    /// Set under the slot lock when a terminal outcome is chosen; checked
    /// before and after every acquisition so a detached slot is never acted
    /// on twice.
    retired: AtomicBool,
}

#[derive(Default)]
struct Index {
    slots: HashMap<String, Arc<PositionSlot>>,
    /// Secondary view so a price dispatch touches only its symbol's slots.
    by_symbol: HashMap<String, HashSet<String>>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Thread-safe registry of every position under exit monitoring.
pub struct PositionMonitorRegistry {
    index: RwLock<Index>,
    emitter: Arc<dyn ExitOrderEmitter>,
    volatility: Arc<dyn VolatilityFeed>,
    fib: Arc<dyn FibonacciFeed>,
    params: ExitParams,
    lock_wait: Duration,
    active_positions: AtomicUsize,
    evaluations_total: AtomicU64,
    decisions_total: AtomicU64,
    lock_timeouts_total: AtomicU64,
    data_gaps_total: AtomicU64,
    invariant_clamps_total: AtomicU64,
}

impl PositionMonitorRegistry {
    pub fn new(
        params: ExitParams,
        lock_wait_ms: u64,
        emitter: Arc<dyn ExitOrderEmitter>,
        volatility: Arc<dyn VolatilityFeed>,
        fib: Arc<dyn FibonacciFeed>,
    ) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            emitter,
            volatility,
            fib,
            params,
            lock_wait: Duration::from_millis(lock_wait_ms),
            active_positions: AtomicUsize::new(0),
            evaluations_total: AtomicU64::new(0),
            decisions_total: AtomicU64::new(0),
            lock_timeouts_total: AtomicU64::new(0),
            data_gaps_total: AtomicU64::new(0),
            invariant_clamps_total: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Start / stop
    // -------------------------------------------------------------------------

    /// Register a position for exit monitoring.
    ///
    /// `entry_atr = 0.0` means "unknown yet": the slot is created but every
    /// evaluation is suppressed until the volatility feed backfills it.
    /// Starting an id that is already tracked is a no-op reporting
    /// `AlreadyMonitored`.
    pub fn start_monitoring(
        &self,
        position_id: &str,
        symbol: &str,
        side: Side,
        entry_price: f64,
        quantity: f64,
        entry_atr: f64,
        entry_time_ms: i64,
    ) -> Result<StartOutcome, EngineError> {
        let position_id = position_id.trim();
        if position_id.is_empty() {
            return Err(EngineError::validation("position id must not be empty"));
        }
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(EngineError::validation("symbol must not be empty"));
        }
        if !entry_price.is_finite() || entry_price <= 0.0 {
            return Err(EngineError::validation(format!(
                "entry price must be finite and positive, got {entry_price}"
            )));
        }
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(EngineError::validation(format!(
                "quantity must be finite and positive, got {quantity}"
            )));
        }
        if !entry_atr.is_finite() || entry_atr < 0.0 {
            return Err(EngineError::validation(format!(
                "entry ATR must be finite and non-negative, got {entry_atr}"
            )));
        }
        let entry_atr = if entry_atr > 0.0 { Some(entry_atr) } else { None };

        let mut index = self
            .index
            .try_write_for(self.lock_wait)
            .ok_or(EngineError::LockTimeout {
                resource: "registry index",
            })?;

        if index.slots.contains_key(position_id) {
            warn!(id = %position_id, symbol = %symbol, "start ignored — position already monitored");
            return Ok(StartOutcome::AlreadyMonitored);
        }

        let ctx = ExitContext::new(
            position_id,
            &symbol,
            side,
            entry_price,
            quantity,
            entry_atr,
            entry_time_ms,
        );
        let slot = Arc::new(PositionSlot {
            ctx: Mutex::new(ctx),
            retired: AtomicBool::new(false),
        });

        index.slots.insert(position_id.to_string(), slot);
        index
            .by_symbol
            .entry(symbol)
            .or_default()
            .insert(position_id.to_string());
        self.active_positions.fetch_add(1, Ordering::SeqCst);

        Ok(StartOutcome::Created)
    }

    /// Stop monitoring a position without emitting any order.
    ///
    /// Reports `NotFound` for unknown ids and for positions that already
    /// reached a terminal outcome — a stop racing an exit decision never
    /// produces a second terminal event.
    pub fn stop_monitoring_by_id(&self, position_id: &str) -> Result<StopOutcome, EngineError> {
        let slot = {
            let index =
                self.index
                    .try_read_for(self.lock_wait)
                    .ok_or(EngineError::LockTimeout {
                        resource: "registry index",
                    })?;
            match index.slots.get(position_id) {
                Some(slot) => Arc::clone(slot),
                None => return Ok(StopOutcome::NotFound),
            }
        };

        let symbol;
        let already_retired;
        {
            let mut ctx =
                slot.ctx
                    .try_lock_for(self.lock_wait)
                    .ok_or(EngineError::LockTimeout {
                        resource: "position slot",
                    })?;
            symbol = ctx.symbol.clone();
            already_retired = slot.retired.swap(true, Ordering::SeqCst);
            if !already_retired {
                ctx.record_reason(ExitReason::ManualStop);
                info!(
                    id = %position_id,
                    symbol = %symbol,
                    remaining = format!("{:.4}", ctx.remaining_quantity),
                    "monitoring stopped by request"
                );
            }
        }

        // The winner of the race detaches; doing it here as well is harmless
        // because detach is idempotent.
        self.detach_retired(position_id, &symbol);

        if already_retired {
            return Ok(StopOutcome::NotFound);
        }
        Ok(StopOutcome::Removed)
    }

    /// Remove a slot from both maps.  Returns whether this call removed it.
    fn detach(&self, position_id: &str, symbol: &str) -> Result<bool, EngineError> {
        let mut index = self
            .index
            .try_write_for(self.lock_wait)
            .ok_or(EngineError::LockTimeout {
                resource: "registry index",
            })?;
        if index.slots.remove(position_id).is_none() {
            return Ok(false);
        }
        if let Some(ids) = index.by_symbol.get_mut(symbol) {
            ids.remove(position_id);
            if ids.is_empty() {
                index.by_symbol.remove(symbol);
            }
        }
        self.active_positions.fetch_sub(1, Ordering::SeqCst);
        Ok(true)
    }

    /// Detach a slot that is already retired.  An index-lock timeout here is
    /// counted and the removal deferred; a retired slot emits nothing in the
    /// meantime, and the next dispatch for its symbol drains it.
    fn detach_retired(&self, position_id: &str, symbol: &str) {
        if self.detach(position_id, symbol).is_err() {
            self.lock_timeouts_total.fetch_add(1, Ordering::Relaxed);
            warn!(
                id = %position_id,
                symbol = %symbol,
                "index lock wait expired while detaching retired slot — removal deferred"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Price dispatch
    // -------------------------------------------------------------------------

    /// Run an evaluation pass for every position on the snapshot's symbol and
    /// apply whatever effects come out.  A snapshot for an untracked symbol
    /// is a counted no-op.  Only the initial index lookup can fail; lock
    /// waits further in are counted and skipped so one position never blocks
    /// the rest of the pass.
    pub fn dispatch_price_update(
        &self,
        snapshot: &MarketSnapshot,
    ) -> Result<DispatchStats, EngineError> {
        let mut stats = DispatchStats::default();

        let matched: Vec<(String, Arc<PositionSlot>)> = {
            let index =
                self.index
                    .try_read_for(self.lock_wait)
                    .ok_or(EngineError::LockTimeout {
                        resource: "registry index",
                    })?;
            match index.by_symbol.get(&snapshot.symbol) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| {
                        index
                            .slots
                            .get(id)
                            .map(|slot| (id.clone(), Arc::clone(slot)))
                    })
                    .collect(),
                None => Vec::new(),
            }
        };

        if matched.is_empty() {
            debug!(symbol = %snapshot.symbol, "price update for untracked symbol");
            return Ok(stats);
        }
        stats.matched = matched.len();

        // Resolve indicator inputs once per dispatch, not per slot.
        let feed_atr = self.volatility.atr(&snapshot.symbol);
        let fib_levels = self.fib.level_set(&snapshot.symbol);

        for (position_id, slot) in matched {
            if slot.retired.load(Ordering::SeqCst) {
                // Retired but still indexed: the owning detach timed out or
                // is still in flight.  Draining here is idempotent.
                self.detach_retired(&position_id, &snapshot.symbol);
                continue;
            }

            let Some(mut ctx) = slot.ctx.try_lock_for(self.lock_wait) else {
                stats.lock_timeouts += 1;
                self.lock_timeouts_total.fetch_add(1, Ordering::Relaxed);
                warn!(
                    id = %position_id,
                    symbol = %snapshot.symbol,
                    "slot lock wait expired during price dispatch"
                );
                continue;
            };
            // Re-check now that we hold the lock; a stop or an earlier exit
            // may have retired the slot while we waited.
            if slot.retired.load(Ordering::SeqCst) {
                continue;
            }

            if let Some(atr) = feed_atr {
                ctx.update_atr(atr);
            }

            if !snapshot.has_usable_price(ctx.side) || ctx.entry_atr.is_none() {
                stats.data_gaps += 1;
                self.data_gaps_total.fetch_add(1, Ordering::Relaxed);
                debug!(
                    id = %position_id,
                    symbol = %snapshot.symbol,
                    "data gap — evaluation suppressed"
                );
                continue;
            }

            stats.evaluated += 1;
            self.evaluations_total.fetch_add(1, Ordering::Relaxed);

            let decisions =
                evaluator::evaluate(&mut ctx, snapshot, &self.params, fib_levels.as_ref());

            if decisions.is_empty() {
                debug!(
                    id = %position_id,
                    outcome = %ExitDecision::NoAction,
                    "evaluation pass complete"
                );
                continue;
            }

            let mut terminal = false;
            for decision in decisions {
                stats.decisions += 1;
                self.decisions_total.fetch_add(1, Ordering::Relaxed);
                match decision {
                    ExitDecision::NoAction => {}
                    ExitDecision::AdjustTrailingStop { stop_price } => {
                        self.apply_trailing(&mut ctx, snapshot, stop_price);
                    }
                    ExitDecision::PartialExit { quantity, reason } => {
                        self.apply_partial(&mut ctx, snapshot, quantity, reason);
                    }
                    ExitDecision::FullExit { reason } => {
                        self.apply_full(&mut ctx, snapshot, reason);
                        slot.retired.store(true, Ordering::SeqCst);
                        terminal = true;
                    }
                }
                if terminal {
                    break;
                }
            }
            drop(ctx);

            if terminal {
                self.detach_retired(&position_id, &snapshot.symbol);
            }
        }

        Ok(stats)
    }

    /// Place or replace the resting trailing stop for the remaining quantity.
    fn apply_trailing(&self, ctx: &mut ExitContext, snapshot: &MarketSnapshot, stop_price: f64) {
        let request_id = Uuid::new_v4().to_string();
        if let Some(previous) = ctx.active_trailing_order_id.replace(request_id.clone()) {
            debug!(
                id = %ctx.position_id,
                previous = %previous,
                replacement = %request_id,
                "trailing stop order replaced"
            );
        }

        info!(
            id = %ctx.position_id,
            symbol = %ctx.symbol,
            stop_price = format!("{:.4}", stop_price),
            quantity = format!("{:.4}", ctx.remaining_quantity),
            "trailing stop adjusted"
        );

        self.emitter.submit(ExitOrderRequest {
            request_id,
            position_id: ctx.position_id.clone(),
            symbol: ctx.symbol.clone(),
            side: ctx.side,
            quantity: ctx.remaining_quantity,
            kind: OrderKind::Stop,
            price_or_trigger: Some(stop_price),
            reason: ExitReason::TrailingAdjust,
            created_at_ms: snapshot.timestamp_ms,
        });
    }

    /// Emit a marketable limit for a partial exit and reduce the remainder.
    fn apply_partial(
        &self,
        ctx: &mut ExitContext,
        snapshot: &MarketSnapshot,
        quantity: f64,
        reason: ExitReason,
    ) {
        if ctx.reduce_remaining(quantity) {
            self.invariant_clamps_total.fetch_add(1, Ordering::Relaxed);
        }
        let price = snapshot.decision_price(ctx.side);

        info!(
            id = %ctx.position_id,
            symbol = %ctx.symbol,
            quantity = format!("{:.4}", quantity),
            price = format!("{:.4}", price),
            remaining = format!("{:.4}", ctx.remaining_quantity),
            reason = %reason,
            "partial exit order submitted"
        );

        self.emitter.submit(ExitOrderRequest {
            request_id: Uuid::new_v4().to_string(),
            position_id: ctx.position_id.clone(),
            symbol: ctx.symbol.clone(),
            side: ctx.side,
            quantity,
            kind: OrderKind::Limit,
            price_or_trigger: Some(price),
            reason,
            created_at_ms: snapshot.timestamp_ms,
        });
    }

    /// Emit a market order for everything left.  The caller retires the slot.
    fn apply_full(&self, ctx: &mut ExitContext, snapshot: &MarketSnapshot, reason: ExitReason) {
        let quantity = ctx.remaining_quantity;
        if ctx.reduce_remaining(quantity) {
            self.invariant_clamps_total.fetch_add(1, Ordering::Relaxed);
        }

        info!(
            id = %ctx.position_id,
            symbol = %ctx.symbol,
            quantity = format!("{:.4}", quantity),
            price = format!("{:.4}", snapshot.decision_price(ctx.side)),
            reason = %reason,
            "full exit order submitted — monitoring ends"
        );

        self.emitter.submit(ExitOrderRequest {
            request_id: Uuid::new_v4().to_string(),
            position_id: ctx.position_id.clone(),
            symbol: ctx.symbol.clone(),
            side: ctx.side,
            quantity,
            kind: OrderKind::Market,
            price_or_trigger: None,
            reason,
            created_at_ms: snapshot.timestamp_ms,
        });
    }

    // -------------------------------------------------------------------------
    // External fill reconciliation
    // -------------------------------------------------------------------------

    /// Absorb a fill reported by the downstream collaborator (a resting
    /// trailing stop firing, a manual close, any external reduction).
    /// Quantities the registry itself already deducted when it emitted an
    /// order must not be echoed back here.
    pub fn dispatch_position_update(
        &self,
        position_id: &str,
        realized_pnl_delta: f64,
        filled_quantity_delta: f64,
    ) -> Result<PositionUpdateOutcome, EngineError> {
        if !filled_quantity_delta.is_finite() || filled_quantity_delta < 0.0 {
            return Err(EngineError::validation(format!(
                "filled quantity delta must be finite and non-negative, got {filled_quantity_delta}"
            )));
        }
        if !realized_pnl_delta.is_finite() {
            return Err(EngineError::validation(
                "realized pnl delta must be finite",
            ));
        }

        let slot = {
            let index =
                self.index
                    .try_read_for(self.lock_wait)
                    .ok_or(EngineError::LockTimeout {
                        resource: "registry index",
                    })?;
            match index.slots.get(position_id) {
                Some(slot) => Arc::clone(slot),
                None => return Ok(PositionUpdateOutcome::NotFound),
            }
        };

        let symbol;
        {
            let mut ctx =
                slot.ctx
                    .try_lock_for(self.lock_wait)
                    .ok_or(EngineError::LockTimeout {
                        resource: "position slot",
                    })?;
            if slot.retired.load(Ordering::SeqCst) {
                // Same drain as the dispatch path: a retired slot still in
                // the index is a deferred detach.
                let symbol = ctx.symbol.clone();
                drop(ctx);
                self.detach_retired(position_id, &symbol);
                return Ok(PositionUpdateOutcome::NotFound);
            }

            ctx.realized_pnl += realized_pnl_delta;
            if filled_quantity_delta > 0.0 && ctx.reduce_remaining(filled_quantity_delta) {
                self.invariant_clamps_total.fetch_add(1, Ordering::Relaxed);
            }

            if !ctx.is_flat() {
                debug!(
                    id = %position_id,
                    filled = format!("{:.4}", filled_quantity_delta),
                    remaining = format!("{:.4}", ctx.remaining_quantity),
                    "external fill reconciled"
                );
                return Ok(PositionUpdateOutcome::Reconciled {
                    remaining: ctx.remaining_quantity,
                });
            }

            ctx.record_reason(ExitReason::ExternalFill);
            slot.retired.store(true, Ordering::SeqCst);
            symbol = ctx.symbol.clone();
            info!(
                id = %position_id,
                symbol = %symbol,
                realized_pnl = format!("{:.4}", ctx.realized_pnl),
                "position flat after external fill — monitoring ends"
            );
        }

        self.detach_retired(position_id, &symbol);
        Ok(PositionUpdateOutcome::Closed)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Point-in-time copies of every live position's state.
    pub fn snapshot(&self) -> Result<Vec<ContextView>, EngineError> {
        let slots: Vec<Arc<PositionSlot>> = {
            let index =
                self.index
                    .try_read_for(self.lock_wait)
                    .ok_or(EngineError::LockTimeout {
                        resource: "registry index",
                    })?;
            index.slots.values().map(Arc::clone).collect()
        };

        let mut views = Vec::with_capacity(slots.len());
        for slot in slots {
            if slot.retired.load(Ordering::SeqCst) {
                continue;
            }
            let Some(ctx) = slot.ctx.try_lock_for(self.lock_wait) else {
                self.lock_timeouts_total.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            views.push(ctx.view());
        }
        Ok(views)
    }

    /// Cumulative counters since construction.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_positions: self.active_positions.load(Ordering::SeqCst),
            evaluations: self.evaluations_total.load(Ordering::Relaxed),
            decisions: self.decisions_total.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts_total.load(Ordering::Relaxed),
            data_gaps: self.data_gaps_total.load(Ordering::Relaxed),
            invariant_clamps: self.invariant_clamps_total.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for PositionMonitorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionMonitorRegistry")
            .field(
                "active_positions",
                &self.active_positions.load(Ordering::SeqCst),
            )
            .field(
                "evaluations",
                &self.evaluations_total.load(Ordering::Relaxed),
            )
            .field("decisions", &self.decisions_total.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::RecordingEmitter;
    use crate::feeds::IndicatorStore;
    use std::sync::mpsc;
    use std::thread;

    fn params() -> ExitParams {
        ExitParams {
            trail_debounce_ms: 0,
            min_trail_pct: 0.0,
            ..ExitParams::default()
        }
    }

    fn snap(symbol: &str, price: f64, ts: i64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.to_string(),
            bid: price,
            ask: price,
            last: price,
            timestamp_ms: ts,
        }
    }

    fn test_registry(
        params: ExitParams,
    ) -> (
        Arc<PositionMonitorRegistry>,
        Arc<RecordingEmitter>,
        Arc<IndicatorStore>,
    ) {
        let emitter = Arc::new(RecordingEmitter::new());
        let store = Arc::new(IndicatorStore::default());
        let registry = Arc::new(PositionMonitorRegistry::new(
            params,
            250,
            emitter.clone(),
            store.clone(),
            store.clone(),
        ));
        (registry, emitter, store)
    }

    #[test]
    fn start_then_duplicate_preserves_original() {
        let (registry, _, _) = test_registry(params());
        assert_eq!(
            registry
                .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
                .unwrap(),
            StartOutcome::Created
        );
        assert_eq!(
            registry
                .start_monitoring("p1", "BTCUSDT", Side::Short, 50.0, 1.0, 9.0, 0)
                .unwrap(),
            StartOutcome::AlreadyMonitored
        );

        let views = registry.snapshot().unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].entry_price, 100.0);
        assert_eq!(views[0].side, Side::Long);
        assert_eq!(registry.stats().active_positions, 1);
    }

    #[test]
    fn start_rejects_invalid_inputs() {
        let (registry, _, _) = test_registry(params());
        assert!(registry
            .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 0.0, 2.0, 0)
            .is_err());
        assert!(registry
            .start_monitoring("p2", "BTCUSDT", Side::Long, -1.0, 10.0, 2.0, 0)
            .is_err());
        assert!(registry
            .start_monitoring("p3", "BTCUSDT", Side::Long, 100.0, 10.0, -2.0, 0)
            .is_err());
        assert!(registry
            .start_monitoring("p4", "BTCUSDT", Side::Long, 100.0, f64::NAN, 2.0, 0)
            .is_err());
        assert!(registry
            .start_monitoring("", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
            .is_err());
        assert!(registry
            .start_monitoring("p5", "  ", Side::Long, 100.0, 10.0, 2.0, 0)
            .is_err());
        assert_eq!(registry.stats().active_positions, 0);
    }

    #[test]
    fn stop_unknown_position_reports_not_found() {
        let (registry, _, _) = test_registry(params());
        assert_eq!(
            registry.stop_monitoring_by_id("ghost").unwrap(),
            StopOutcome::NotFound
        );
    }

    #[test]
    fn stop_removes_and_second_stop_reports_not_found() {
        let (registry, emitter, _) = test_registry(params());
        registry
            .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
            .unwrap();

        assert_eq!(
            registry.stop_monitoring_by_id("p1").unwrap(),
            StopOutcome::Removed
        );
        assert_eq!(
            registry.stop_monitoring_by_id("p1").unwrap(),
            StopOutcome::NotFound
        );
        assert_eq!(registry.stats().active_positions, 0);
        assert!(registry.snapshot().unwrap().is_empty());
        // A stop never emits orders.
        assert_eq!(emitter.len(), 0);
    }

    #[test]
    fn dispatch_for_untracked_symbol_is_a_noop() {
        let (registry, emitter, _) = test_registry(params());
        registry
            .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
            .unwrap();

        let stats = registry
            .dispatch_price_update(&snap("ETHUSDT", 100.0, 1_000))
            .unwrap();
        assert_eq!(stats.matched, 0);
        assert_eq!(stats.evaluated, 0);
        assert_eq!(emitter.len(), 0);
    }

    #[test]
    fn quiet_tick_counts_evaluation_without_effects() {
        let (registry, emitter, _) = test_registry(params());
        registry
            .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
            .unwrap();

        let stats = registry
            .dispatch_price_update(&snap("BTCUSDT", 100.1, 1_000))
            .unwrap();
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.evaluated, 1);
        assert_eq!(stats.decisions, 0);
        assert_eq!(emitter.len(), 0);
    }

    #[test]
    fn stop_loss_emits_market_order_once_and_removes() {
        let (registry, emitter, _) = test_registry(params());
        registry
            .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
            .unwrap();

        let stats = registry
            .dispatch_price_update(&snap("BTCUSDT", 97.0, 1_000))
            .unwrap();
        assert_eq!(stats.decisions, 1);

        let requests = emitter.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, OrderKind::Market);
        assert_eq!(requests[0].quantity, 10.0);
        assert_eq!(requests[0].reason, ExitReason::StopLoss);
        assert_eq!(requests[0].price_or_trigger, None);
        assert_eq!(requests[0].side, Side::Long);

        assert_eq!(registry.stats().active_positions, 0);
        assert!(registry.snapshot().unwrap().is_empty());

        // Another tick for the same symbol matches nothing.
        let stats = registry
            .dispatch_price_update(&snap("BTCUSDT", 97.0, 2_000))
            .unwrap();
        assert_eq!(stats.matched, 0);
        assert_eq!(emitter.len(), 1);
    }

    #[test]
    fn partial_flow_reduces_remaining_and_uses_limit_orders() {
        let (registry, emitter, _) = test_registry(params());
        registry
            .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
            .unwrap();

        // Target 1: trailing adjustment plus a half-size limit.
        registry
            .dispatch_price_update(&snap("BTCUSDT", 105.0, 1_000))
            .unwrap();
        {
            let requests = emitter.requests();
            assert_eq!(requests.len(), 2);
            assert_eq!(requests[0].kind, OrderKind::Stop);
            assert_eq!(requests[0].price_or_trigger, Some(103.0));
            assert_eq!(requests[1].kind, OrderKind::Limit);
            assert_eq!(requests[1].quantity, 5.0);
            assert_eq!(requests[1].price_or_trigger, Some(105.0));
            assert_eq!(requests[1].reason, ExitReason::PartialTp1);
        }
        let views = registry.snapshot().unwrap();
        assert_eq!(views[0].remaining_quantity, 5.0);

        // Target 2 on a later tick.
        registry
            .dispatch_price_update(&snap("BTCUSDT", 108.0, 2_000))
            .unwrap();
        let requests = emitter.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[2].kind, OrderKind::Stop);
        assert_eq!(requests[3].kind, OrderKind::Limit);
        assert_eq!(requests[3].quantity, 3.0);
        assert_eq!(requests[3].reason, ExitReason::PartialTp2);

        let views = registry.snapshot().unwrap();
        assert_eq!(views[0].remaining_quantity, 2.0);
        assert!(views[0].partial_exit_1_done);
        assert!(views[0].partial_exit_2_done);
        assert_eq!(registry.stats().active_positions, 1);
    }

    #[test]
    fn external_fill_reconciles_before_partial_target() {
        let (registry, emitter, _) = test_registry(params());
        registry
            .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
            .unwrap();

        assert_eq!(
            registry.dispatch_position_update("p1", 12.5, 4.0).unwrap(),
            PositionUpdateOutcome::Reconciled { remaining: 6.0 }
        );

        // TP1 still wants half the original size and 6.0 remains.
        registry
            .dispatch_price_update(&snap("BTCUSDT", 105.0, 1_000))
            .unwrap();
        let partial = emitter
            .requests()
            .into_iter()
            .find(|r| r.kind == OrderKind::Limit)
            .unwrap();
        assert_eq!(partial.quantity, 5.0);

        let views = registry.snapshot().unwrap();
        assert_eq!(views[0].remaining_quantity, 1.0);
        assert_eq!(views[0].realized_pnl, 12.5);
    }

    #[test]
    fn external_fill_to_flat_closes_monitoring() {
        let (registry, _, _) = test_registry(params());
        registry
            .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
            .unwrap();

        assert_eq!(
            registry.dispatch_position_update("p1", 40.0, 10.0).unwrap(),
            PositionUpdateOutcome::Closed
        );
        assert_eq!(registry.stats().active_positions, 0);
        assert_eq!(
            registry.dispatch_position_update("p1", 0.0, 1.0).unwrap(),
            PositionUpdateOutcome::NotFound
        );
    }

    #[test]
    fn overfill_clamps_to_flat_and_counts_the_breach() {
        let (registry, _, _) = test_registry(params());
        registry
            .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
            .unwrap();

        assert_eq!(
            registry.dispatch_position_update("p1", 0.0, 12.0).unwrap(),
            PositionUpdateOutcome::Closed
        );
        assert_eq!(registry.stats().invariant_clamps, 1);
        assert_eq!(registry.stats().active_positions, 0);
    }

    #[test]
    fn negative_fill_delta_is_rejected() {
        let (registry, _, _) = test_registry(params());
        assert!(registry.dispatch_position_update("p1", 0.0, -1.0).is_err());
        assert!(registry
            .dispatch_position_update("p1", f64::NAN, 1.0)
            .is_err());
    }

    #[test]
    fn trailing_replacement_tracks_latest_order_id() {
        let (registry, emitter, _) = test_registry(params());
        registry
            .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
            .unwrap();

        registry
            .dispatch_price_update(&snap("BTCUSDT", 105.0, 1_000))
            .unwrap();
        registry
            .dispatch_price_update(&snap("BTCUSDT", 106.0, 2_000))
            .unwrap();

        let stops: Vec<ExitOrderRequest> = emitter
            .requests()
            .into_iter()
            .filter(|r| r.kind == OrderKind::Stop)
            .collect();
        assert_eq!(stops.len(), 2);
        assert_ne!(stops[0].request_id, stops[1].request_id);
        assert_eq!(stops[1].price_or_trigger, Some(104.0));

        let views = registry.snapshot().unwrap();
        assert_eq!(
            views[0].active_trailing_order_id.as_deref(),
            Some(stops[1].request_id.as_str())
        );
    }

    #[test]
    fn entry_atr_is_backfilled_from_the_volatility_feed() {
        let (registry, emitter, store) = test_registry(params());
        registry
            .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 10.0, 0.0, 0)
            .unwrap();

        // No ATR anywhere yet: the pass is suppressed, not acted on.
        let stats = registry
            .dispatch_price_update(&snap("BTCUSDT", 97.0, 1_000))
            .unwrap();
        assert_eq!(stats.data_gaps, 1);
        assert_eq!(stats.evaluated, 0);
        assert_eq!(emitter.len(), 0);

        // Feed comes alive; the same price now trips the stop.
        store.set_atr("BTCUSDT", 2.0);
        let stats = registry
            .dispatch_price_update(&snap("BTCUSDT", 97.0, 2_000))
            .unwrap();
        assert_eq!(stats.evaluated, 1);
        let requests = emitter.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, OrderKind::Market);
        assert_eq!(registry.stats().data_gaps, 1);
    }

    #[test]
    fn snapshot_lists_each_live_position() {
        let (registry, _, _) = test_registry(params());
        registry
            .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
            .unwrap();
        registry
            .start_monitoring("p2", "ETHUSDT", Side::Short, 2_000.0, 1.0, 15.0, 0)
            .unwrap();

        let views = registry.snapshot().unwrap();
        assert_eq!(views.len(), 2);
        assert!(views.iter().any(|v| v.position_id == "p1"));
        assert!(views.iter().any(|v| v.position_id == "p2"));
    }

    #[test]
    fn concurrent_stop_and_dispatch_yield_one_terminal_outcome() {
        for _ in 0..50 {
            let (registry, emitter, _) = test_registry(params());
            registry
                .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
                .unwrap();

            let dispatcher = {
                let registry = registry.clone();
                thread::spawn(move || {
                    registry
                        .dispatch_price_update(&snap("BTCUSDT", 97.0, 1_000))
                        .unwrap();
                })
            };
            let stopper = {
                let registry = registry.clone();
                thread::spawn(move || {
                    matches!(
                        registry.stop_monitoring_by_id("p1").unwrap(),
                        StopOutcome::Removed
                    )
                })
            };

            dispatcher.join().unwrap();
            let removed = stopper.join().unwrap() as usize;

            let market_exits = emitter
                .requests()
                .iter()
                .filter(|r| r.kind == OrderKind::Market)
                .count();
            assert_eq!(
                market_exits + removed,
                1,
                "exactly one terminal outcome per position"
            );
            assert_eq!(registry.stats().active_positions, 0);
        }
    }

    /// Emitter that parks the submitting thread between the order going out
    /// and the slot being detached, so a test can seize the index write lock
    /// inside that window.
    struct GatedEmitter {
        requests: Mutex<Vec<ExitOrderRequest>>,
        submitted: Mutex<mpsc::Sender<()>>,
        proceed: Mutex<mpsc::Receiver<()>>,
    }

    impl ExitOrderEmitter for GatedEmitter {
        fn submit(&self, request: ExitOrderRequest) {
            self.requests.lock().push(request);
            let _ = self.submitted.lock().send(());
            let _ = self.proceed.lock().recv();
        }
    }

    #[test]
    fn detach_timeout_defers_removal_without_failing_the_pass() {
        let (submitted_tx, submitted_rx) = mpsc::channel();
        let (proceed_tx, proceed_rx) = mpsc::channel();
        let emitter = Arc::new(GatedEmitter {
            requests: Mutex::new(Vec::new()),
            submitted: Mutex::new(submitted_tx),
            proceed: Mutex::new(proceed_rx),
        });
        let store = Arc::new(IndicatorStore::default());
        let registry = Arc::new(PositionMonitorRegistry::new(
            params(),
            50,
            emitter.clone(),
            store.clone(),
            store,
        ));
        registry
            .start_monitoring("p1", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
            .unwrap();
        registry
            .start_monitoring("p2", "BTCUSDT", Side::Long, 100.0, 10.0, 2.0, 0)
            .unwrap();

        // 97.0 trips the stop for both positions in one pass.
        let dispatcher = {
            let registry = registry.clone();
            thread::spawn(move || registry.dispatch_price_update(&snap("BTCUSDT", 97.0, 1_000)))
        };

        // First market order is out and the dispatcher is parked inside
        // submit.  Seize the index write lock so neither terminal detach can
        // land within the wait budget, then let both submits finish.
        submitted_rx.recv().unwrap();
        let index_guard = registry.index.write();
        proceed_tx.send(()).unwrap();
        submitted_rx.recv().unwrap();
        proceed_tx.send(()).unwrap();

        let stats = dispatcher
            .join()
            .unwrap()
            .expect("a deferred detach must not fail the dispatch");
        drop(index_guard);

        // Both positions were evaluated and exited despite the blocked
        // detaches; only the index removals are pending.
        assert_eq!(stats.matched, 2);
        assert_eq!(stats.evaluated, 2);
        assert_eq!(stats.decisions, 2);
        {
            let requests = emitter.requests.lock();
            assert_eq!(requests.len(), 2);
            assert!(requests.iter().all(|r| r.kind == OrderKind::Market));
        }
        assert_eq!(registry.stats().active_positions, 2);
        assert!(registry.snapshot().unwrap().is_empty());
        assert!(registry.stats().lock_timeouts >= 2);

        // A position update aimed at a leaked slot drains it on the way out.
        assert_eq!(
            registry.dispatch_position_update("p1", 0.0, 1.0).unwrap(),
            PositionUpdateOutcome::NotFound
        );
        assert_eq!(registry.stats().active_positions, 1);

        // The next tick drains the remaining slot instead of re-evaluating
        // it, and afterwards the symbol matches nothing.
        let stats = registry
            .dispatch_price_update(&snap("BTCUSDT", 97.0, 2_000))
            .unwrap();
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.evaluated, 0);
        assert_eq!(emitter.requests.lock().len(), 2);
        assert_eq!(registry.stats().active_positions, 0);

        let stats = registry
            .dispatch_price_update(&snap("BTCUSDT", 97.0, 3_000))
            .unwrap();
        assert_eq!(stats.matched, 0);
    }
}
