// =============================================================================
// Trailing-stop ratchet and debounce
// =============================================================================
//
// The trailing candidate follows the best price at a fixed ATR distance and
// only tightens, never widens.  An adjustment is emitted only when BOTH
// debounce gates hold: the candidate improves on the previous reference by
// more than the minimum step, and enough wall-clock time has passed since the
// last emitted adjustment.  A candidate that fails either gate is discarded;
// the reference moves only on emission.
// =============================================================================

use tracing::{debug, info};

use crate::config::ExitParams;
use crate::exit::context::ExitContext;
use crate::types::ExitReason;

/// Effective trailing distance for this position: entry-ATR scaled, floored
/// at a percentage of the entry price.  `None` while the entry ATR is still
/// unknown.
pub fn trail_distance(ctx: &ExitContext, params: &ExitParams) -> Option<f64> {
    let atr = ctx.entry_atr?;
    let raw = atr * params.trail_distance_multiple;
    let floor = ctx.entry_price * params.min_trail_pct / 100.0;
    Some(raw.max(floor))
}

/// Arm the breakeven rule: flag the context and raise the ratchet reference
/// to the entry price.  Emits no order; the next trailing adjustment must
/// improve on the entry-level floor.
pub fn arm_breakeven(ctx: &mut ExitContext) {
    ctx.breakeven_activated = true;
    ctx.record_reason(ExitReason::BreakevenArmed);

    let entry = ctx.entry_price;
    let tightens = match ctx.last_trailing_stop_price {
        // Only tighten, never widen.
        Some(current) => (entry - current) * ctx.side.sign() > 0.0,
        None => true,
    };

    if tightens {
        ctx.last_trailing_stop_price = Some(entry);
        info!(
            id = %ctx.position_id,
            floor = entry,
            "breakeven armed — trailing floor raised to entry"
        );
    } else {
        info!(
            id = %ctx.position_id,
            "breakeven armed — existing stop already beyond entry"
        );
    }
}

/// Evaluate the trailing ratchet against the current best price.
///
/// On success the context's reference and debounce clock are advanced and the
/// new stop price is returned for emission.
pub fn evaluate_trail(ctx: &mut ExitContext, now_ms: i64, params: &ExitParams) -> Option<f64> {
    let distance = trail_distance(ctx, params)?;
    let candidate = ctx.best_price - ctx.side.sign() * distance;
    let reference = ctx.trail_reference(distance);

    let improvement = (candidate - reference) * ctx.side.sign();
    let min_step = ctx.entry_atr? * params.min_trail_step_atr;
    if improvement <= min_step {
        return None;
    }

    if let Some(last_ms) = ctx.last_trailing_update_ms {
        let elapsed = now_ms.saturating_sub(last_ms);
        if elapsed < params.trail_debounce_ms as i64 {
            debug!(
                id = %ctx.position_id,
                elapsed_ms = elapsed,
                debounce_ms = params.trail_debounce_ms,
                "trailing adjustment debounced"
            );
            return None;
        }
    }

    ctx.last_trailing_stop_price = Some(candidate);
    ctx.last_trailing_update_ms = Some(now_ms);
    ctx.record_reason(ExitReason::TrailingAdjust);

    debug!(
        id = %ctx.position_id,
        stop_price = format!("{:.4}", candidate),
        best_price = format!("{:.4}", ctx.best_price),
        improvement = format!("{:.4}", improvement),
        "trailing stop ratcheted"
    );

    Some(candidate)
}
