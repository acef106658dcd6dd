// =============================================================================
// Exit policy checks — pure predicates over context + price
// =============================================================================
//
// Each check answers one question and mutates nothing; the evaluator owns
// rule ordering and all state changes.  Every threshold is expressed in
// entry-ATR units, so a check returns false while the entry ATR is unknown
// (the data-gap policy: never exit on incomplete data).
// =============================================================================

use crate::config::ExitParams;
use crate::exit::context::ExitContext;
use crate::feeds::{FibLevel, FibLevelSet};

/// Hard stop: adverse excursion at or beyond `entry_atr * stop_atr_multiple`.
pub fn stop_loss_hit(ctx: &ExitContext, price: f64, params: &ExitParams) -> bool {
    let Some(atr) = ctx.entry_atr else {
        return false;
    };
    let adverse = -ctx.favorable_excursion(price);
    adverse >= atr * params.stop_atr_multiple
}

/// Whether the breakeven rule should arm on this tick.
pub fn breakeven_trigger(ctx: &ExitContext, price: f64, params: &ExitParams) -> bool {
    if ctx.breakeven_activated {
        return false;
    }
    let Some(atr) = ctx.entry_atr else {
        return false;
    };
    ctx.favorable_excursion(price) >= atr * params.breakeven_trigger_multiple
}

/// Whether the favorable excursion has crossed a partial target.
pub fn partial_target_hit(ctx: &ExitContext, price: f64, trigger_multiple: f64) -> bool {
    let Some(atr) = ctx.entry_atr else {
        return false;
    };
    ctx.favorable_excursion(price) >= atr * trigger_multiple
}

/// Reversal give-back: armed once the best price reached the arming
/// excursion, triggered when the current price has surrendered the
/// configured fraction of that maximum favorable excursion.
pub fn reversal_triggered(ctx: &ExitContext, price: f64, params: &ExitParams) -> bool {
    let Some(atr) = ctx.entry_atr else {
        return false;
    };
    let best = ctx.best_excursion();
    if best < atr * params.reversal_arm_multiple {
        return false;
    }
    let current = ctx.favorable_excursion(price);
    current <= best * (1.0 - params.reversal_giveback_fraction)
}

/// Volatility expansion: the current ATR has blown out relative to the ATR
/// captured at entry.
pub fn volatility_expanded(ctx: &ExitContext, params: &ExitParams) -> bool {
    match (ctx.entry_atr, ctx.last_atr) {
        (Some(entry), Some(last)) => last >= entry * params.vol_expansion_multiple,
        _ => false,
    }
}

/// Fibonacci retracement touch, honored only after the position has earned
/// the arming excursion.  Returns the touched level for logging.
pub fn fib_retracement_touch<'a>(
    ctx: &ExitContext,
    price: f64,
    levels: Option<&'a FibLevelSet>,
    params: &ExitParams,
) -> Option<&'a FibLevel> {
    let atr = ctx.entry_atr?;
    if ctx.best_excursion() < atr * params.fib_arm_multiple {
        return None;
    }
    levels?.touched(price)
}

/// Maximum holding time reached.  Limits past the representable millisecond
/// range saturate instead of wrapping negative.
pub fn max_hold_elapsed(ctx: &ExitContext, now_ms: i64, params: &ExitParams) -> bool {
    let limit_ms = i64::try_from(params.max_hold_secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000);
    ctx.holding_time_ms(now_ms) >= limit_ms
}
