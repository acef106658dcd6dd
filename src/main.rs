// =============================================================================
// Sentinel Exit Engine — Main Entry Point
// =============================================================================
//
// Wires the position monitor registry to simulated per-symbol market feeds
// and a channel-backed order collaborator, then drives everything from
// random-walk tick loops. Every position it opens is a demo position; the
// engine itself never talks to a venue.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod emitter;
mod errors;
mod exit;
mod feeds;
mod registry;
mod types;

use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::emitter::{ChannelEmitter, OrderKind};
use crate::feeds::{FibLevel, FibLevelSet, IndicatorStore};
use crate::registry::PositionMonitorRegistry;
use crate::types::{MarketSnapshot, Side};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Sentinel Exit Engine — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = match EngineConfig::load("exit_config.json") {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, "Failed to load config — writing defaults");
            let cfg = EngineConfig::default();
            if let Err(e) = cfg.save("exit_config.json") {
                error!(error = %e, "Failed to write default config");
            }
            cfg
        }
    };

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("SENTINEL_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec!["BTCUSDT".into(), "ETHUSDT".into(), "SOLUSDT".into()];
    }
    config.validate()?;

    info!(symbols = ?config.symbols, "Monitored symbols");
    info!(
        lock_wait_ms = config.lock_wait_ms,
        max_hold_secs = config.exit.max_hold_secs,
        "Exit engine configured"
    );

    // ── 2. Shared components ─────────────────────────────────────────────
    let indicators = Arc::new(IndicatorStore::default());
    let (order_emitter, mut order_rx) = ChannelEmitter::new();
    let registry = Arc::new(PositionMonitorRegistry::new(
        config.exit.clone(),
        config.lock_wait_ms,
        Arc::new(order_emitter),
        indicators.clone(),
        indicators.clone(),
    ));

    // ── 3. Order collaborator (simulated venue) ──────────────────────────
    // Market and limit requests are logged as immediate fills; the registry
    // already deducted those quantities, so nothing is echoed back.  Stop
    // requests rest at the venue and only return through
    // dispatch_position_update when they trigger.
    tokio::spawn(async move {
        while let Some(request) = order_rx.recv().await {
            match request.kind {
                OrderKind::Market | OrderKind::Limit => {
                    info!(
                        request_id = %request.request_id,
                        position_id = %request.position_id,
                        symbol = %request.symbol,
                        kind = %request.kind,
                        quantity = format!("{:.4}", request.quantity),
                        price = ?request.price_or_trigger,
                        reason = %request.reason,
                        "simulated fill"
                    );
                }
                OrderKind::Stop => {
                    info!(
                        request_id = %request.request_id,
                        position_id = %request.position_id,
                        symbol = %request.symbol,
                        trigger = ?request.price_or_trigger,
                        "trailing stop order resting at venue"
                    );
                }
            }
        }
        warn!("order channel closed — collaborator loop ending");
    });

    // ── 4. Per-symbol demo feeds ─────────────────────────────────────────
    for symbol in &config.symbols {
        let sym = symbol.clone();
        let reg = registry.clone();
        let store = indicators.clone();
        let demo = config.demo.clone();

        tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            let mut price = demo.base_price * (0.5 + rng.gen::<f64>());
            let mut ewma_range = price * demo.step_pct / 100.0;
            let mut session_high = price;
            let mut session_low = price;
            let mut next_side = Side::Long;
            let mut tick: u64 = 0;

            let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(
                demo.tick_interval_ms,
            ));
            loop {
                interval.tick().await;
                tick += 1;

                // Random walk with an occasional burst tick.
                let z: f64 = rng.gen::<f64>() * 2.0 - 1.0;
                let burst = if rng.gen::<f64>() < 0.02 { 4.0 } else { 1.0 };
                let delta = price * (demo.step_pct / 100.0) * z * burst;
                price = (price + delta).max(0.01);
                session_high = session_high.max(price);
                session_low = session_low.min(price);

                // Rolling ATR proxy: EWMA of absolute tick moves.
                ewma_range = 0.95 * ewma_range + 0.05 * delta.abs();
                store.set_atr(&sym, ewma_range);

                // Refresh retracement levels from the session range now and then.
                if tick % 50 == 0 && session_high > session_low {
                    let range = session_high - session_low;
                    store.set_fib_levels(
                        &sym,
                        FibLevelSet {
                            levels: vec![
                                FibLevel {
                                    ratio: 0.382,
                                    price: session_high - range * 0.382,
                                },
                                FibLevel {
                                    ratio: 0.5,
                                    price: session_high - range * 0.5,
                                },
                                FibLevel {
                                    ratio: 0.618,
                                    price: session_high - range * 0.618,
                                },
                            ],
                            touch_tolerance: price * 0.0005,
                        },
                    );
                }

                let half_spread = price * demo.spread_pct / 200.0;
                let snapshot = MarketSnapshot {
                    symbol: sym.clone(),
                    bid: price - half_spread,
                    ask: price + half_spread,
                    last: price,
                    timestamp_ms: Utc::now().timestamp_millis(),
                };

                match reg.dispatch_price_update(&snapshot) {
                    Ok(stats) if stats.decisions > 0 => {
                        debug!(symbol = %sym, decisions = stats.decisions, "tick produced exit effects");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(symbol = %sym, error = %e, "price dispatch failed"),
                }

                // Open a fresh demo position when none is live for this symbol.
                if tick % 40 == 0 {
                    let live = match reg.snapshot() {
                        Ok(views) => views.iter().any(|v| v.symbol == sym),
                        Err(e) => {
                            warn!(symbol = %sym, error = %e, "registry snapshot failed");
                            continue;
                        }
                    };
                    if !live {
                        let side = next_side;
                        next_side = match side {
                            Side::Long => Side::Short,
                            Side::Short => Side::Long,
                        };
                        let id = Uuid::new_v4().to_string();
                        match reg.start_monitoring(
                            &id,
                            &sym,
                            side,
                            price,
                            demo.quantity,
                            ewma_range,
                            Utc::now().timestamp_millis(),
                        ) {
                            Ok(outcome) => info!(
                                id = %id,
                                symbol = %sym,
                                side = %side,
                                price = format!("{:.4}", price),
                                outcome = ?outcome,
                                "demo position opened"
                            ),
                            Err(e) => {
                                warn!(symbol = %sym, error = %e, "failed to open demo position")
                            }
                        }
                    }
                }
            }
        });
    }

    info!(count = config.symbols.len(), "Demo feeds launched");

    // ── 5. External fill injector ────────────────────────────────────────
    // Simulates fills the engine did not originate, e.g. a resting trailing
    // stop triggering at the venue.
    let trim_registry = registry.clone();
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;

            let views = match trim_registry.snapshot() {
                Ok(views) => views,
                Err(e) => {
                    warn!(error = %e, "registry snapshot failed");
                    continue;
                }
            };
            let Some(view) = views.into_iter().next() else {
                continue;
            };

            let fraction = 0.1 + rng.gen::<f64>() * 0.2;
            let fill = view.remaining_quantity * fraction;
            match trim_registry.dispatch_position_update(&view.position_id, 0.0, fill) {
                Ok(outcome) => info!(
                    id = %view.position_id,
                    fill = format!("{:.4}", fill),
                    outcome = ?outcome,
                    "external fill injected"
                ),
                Err(e) => warn!(id = %view.position_id, error = %e, "external fill rejected"),
            }
        }
    });

    // ── 6. Diagnostics heartbeat ─────────────────────────────────────────
    let diag_registry = registry.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(15));
        loop {
            interval.tick().await;

            let stats = diag_registry.stats();
            info!(
                active = stats.active_positions,
                evaluations = stats.evaluations,
                decisions = stats.decisions,
                lock_timeouts = stats.lock_timeouts,
                data_gaps = stats.data_gaps,
                invariant_clamps = stats.invariant_clamps,
                "registry heartbeat"
            );

            match diag_registry.snapshot() {
                Ok(views) => {
                    for view in views {
                        info!(
                            id = %view.position_id,
                            symbol = %view.symbol,
                            side = %view.side,
                            entry = format!("{:.4}", view.entry_price),
                            best = format!("{:.4}", view.best_price),
                            remaining = format!("{:.4}", view.remaining_quantity),
                            trail = ?view.last_trailing_stop_price,
                            "live position"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "registry snapshot failed"),
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    info!("Sentinel Exit Engine shut down complete.");
    Ok(())
}
