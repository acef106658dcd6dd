// =============================================================================
// Exit evaluator — one rule-ordered pass over a single position
// =============================================================================
//
// Called with exclusive access to one context and an immutable market
// snapshot.  Rule priority, highest first:
//
//   1. Stop-loss                  — full exit, short-circuits the pass.
//   2. Breakeven arm              — state change only, no order.
//   3. Trailing ratchet           — emits an adjustment when both debounce
//                                   gates hold.
//   4. Partial targets (1 then 2) — at most one partial per pass; a clamped
//                                   partial that consumes the remainder is
//                                   promoted to a full exit.
//   5. Technical / time           — reversal give-back, volatility expansion,
//                                   Fibonacci touch, max holding time; first
//                                   satisfied wins, appended after 3/4.
//
// The pass yields an ordered effect list (at most: trailing adjustment,
// partial exit, full exit).  The evaluator never touches quantities or mints
// order ids; applying decisions is the registry's job.
// =============================================================================

use tracing::{debug, info};

use crate::config::ExitParams;
use crate::exit::context::{ExitContext, QTY_EPSILON};
use crate::exit::{policy, trailing};
use crate::feeds::FibLevelSet;
use crate::types::{ExitDecision, ExitReason, MarketSnapshot};

/// Evaluate every exit rule for one position against one snapshot.
///
/// Returns an empty list when nothing triggered or when the snapshot / entry
/// ATR is unusable (the data-gap policy suppresses the pass rather than act
/// on incomplete data).
pub fn evaluate(
    ctx: &mut ExitContext,
    snapshot: &MarketSnapshot,
    params: &ExitParams,
    fib_levels: Option<&FibLevelSet>,
) -> Vec<ExitDecision> {
    let mut decisions = Vec::new();

    if !snapshot.has_usable_price(ctx.side) || ctx.entry_atr.is_none() {
        return decisions;
    }

    let price = snapshot.decision_price(ctx.side);
    let now_ms = snapshot.timestamp_ms;

    ctx.track_best_price(price);

    // ── 1. Stop-loss ─────────────────────────────────────────────
    if policy::stop_loss_hit(ctx, price, params) {
        ctx.record_reason(ExitReason::StopLoss);
        info!(
            id = %ctx.position_id,
            symbol = %ctx.symbol,
            side = %ctx.side,
            entry_price = ctx.entry_price,
            price,
            "stop-loss hit — full exit"
        );
        decisions.push(ExitDecision::FullExit {
            reason: ExitReason::StopLoss,
        });
        return decisions;
    }

    // ── 2. Breakeven arm ─────────────────────────────────────────
    if policy::breakeven_trigger(ctx, price, params) {
        trailing::arm_breakeven(ctx);
    }

    // ── 3. Trailing ratchet ──────────────────────────────────────
    if let Some(stop_price) = trailing::evaluate_trail(ctx, now_ms, params) {
        decisions.push(ExitDecision::AdjustTrailingStop { stop_price });
    }

    // ── 4. Partial targets (one per pass) ────────────────────────
    // A gapped tick that crosses both targets fires target 1 now and
    // target 2 on the next tick.
    let mut full_exit_emitted = false;
    if !ctx.partial_exit_1_done
        && policy::partial_target_hit(ctx, price, params.tp1_trigger_multiple)
    {
        full_exit_emitted = push_partial(
            ctx,
            &mut decisions,
            params.tp1_fraction,
            ExitReason::PartialTp1,
        );
        ctx.partial_exit_1_done = true;
    } else if !ctx.partial_exit_2_done
        && policy::partial_target_hit(ctx, price, params.tp2_trigger_multiple)
    {
        full_exit_emitted = push_partial(
            ctx,
            &mut decisions,
            params.tp2_fraction,
            ExitReason::PartialTp2,
        );
        ctx.partial_exit_2_done = true;
    }

    // ── 5. Technical / time exits ────────────────────────────────
    if !full_exit_emitted {
        let technical = if policy::reversal_triggered(ctx, price, params) {
            Some(ExitReason::Reversal)
        } else if policy::volatility_expanded(ctx, params) {
            Some(ExitReason::VolatilityExpansion)
        } else if let Some(level) = policy::fib_retracement_touch(ctx, price, fib_levels, params)
        {
            debug!(
                id = %ctx.position_id,
                ratio = level.ratio,
                level_price = level.price,
                "fib retracement level touched"
            );
            Some(ExitReason::FibRetracement)
        } else if policy::max_hold_elapsed(ctx, now_ms, params) {
            Some(ExitReason::MaxHoldTime)
        } else {
            None
        };

        if let Some(reason) = technical {
            ctx.record_reason(reason);
            info!(
                id = %ctx.position_id,
                symbol = %ctx.symbol,
                price,
                reason = %reason,
                "technical exit triggered — full exit"
            );
            decisions.push(ExitDecision::FullExit { reason });
        }
    }

    if !decisions.is_empty() {
        debug!(
            id = %ctx.position_id,
            count = decisions.len(),
            "evaluation pass produced effects"
        );
    }

    decisions
}

/// Push a partial-exit effect, clamping the quantity to what is left.
/// Returns `true` when the clamp consumed the whole remainder and the effect
/// was promoted to a full exit.
fn push_partial(
    ctx: &mut ExitContext,
    decisions: &mut Vec<ExitDecision>,
    fraction: f64,
    reason: ExitReason,
) -> bool {
    let desired = fraction * ctx.original_quantity;
    let quantity = desired.min(ctx.remaining_quantity);
    if quantity <= QTY_EPSILON {
        return false;
    }

    ctx.record_reason(reason);

    if quantity >= ctx.remaining_quantity - QTY_EPSILON {
        info!(
            id = %ctx.position_id,
            desired,
            remaining = ctx.remaining_quantity,
            reason = %reason,
            "partial target consumes remainder — promoted to full exit"
        );
        decisions.push(ExitDecision::FullExit { reason });
        true
    } else {
        info!(
            id = %ctx.position_id,
            quantity,
            remaining = ctx.remaining_quantity,
            reason = %reason,
            "partial target hit"
        );
        decisions.push(ExitDecision::PartialExit { quantity, reason });
        false
    }
}
