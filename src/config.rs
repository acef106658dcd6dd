// =============================================================================
// Engine Configuration — exit-rule tuning with atomic save
// =============================================================================
//
// Every tunable of the exit engine lives here.  Persistence uses an atomic
// tmp + rename pattern to prevent corruption on crash, and all fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file.
//
// Rule thresholds are expressed in entry-ATR units (a multiple of the ATR
// captured when monitoring started), so a position's targets do not drift as
// volatility changes after entry.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::EngineError;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_lock_wait_ms() -> u64 {
    250
}

fn default_stop_atr_multiple() -> f64 {
    1.5
}

fn default_breakeven_trigger_multiple() -> f64 {
    1.0
}

fn default_trail_distance_multiple() -> f64 {
    1.0
}

fn default_min_trail_step_atr() -> f64 {
    0.25
}

fn default_trail_debounce_ms() -> u64 {
    500
}

fn default_min_trail_pct() -> f64 {
    0.05
}

fn default_tp1_trigger_multiple() -> f64 {
    2.5
}

fn default_tp1_fraction() -> f64 {
    0.5
}

fn default_tp2_trigger_multiple() -> f64 {
    4.0
}

fn default_tp2_fraction() -> f64 {
    0.3
}

fn default_reversal_arm_multiple() -> f64 {
    1.5
}

fn default_reversal_giveback_fraction() -> f64 {
    0.6
}

fn default_vol_expansion_multiple() -> f64 {
    3.0
}

fn default_fib_arm_multiple() -> f64 {
    1.0
}

fn default_max_hold_secs() -> u64 {
    3600
}

fn default_tick_interval_ms() -> u64 {
    250
}

fn default_base_price() -> f64 {
    100.0
}

fn default_step_pct() -> f64 {
    0.08
}

fn default_spread_pct() -> f64 {
    0.02
}

fn default_demo_quantity() -> f64 {
    10.0
}

// =============================================================================
// ExitParams
// =============================================================================

/// Tunable parameters for the exit rule chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitParams {
    /// ATR multiple for the hard stop-loss distance.
    #[serde(default = "default_stop_atr_multiple")]
    pub stop_atr_multiple: f64,

    /// Favorable excursion (in ATR multiples) at which the breakeven rule
    /// arms and raises the trailing floor to the entry price.
    #[serde(default = "default_breakeven_trigger_multiple")]
    pub breakeven_trigger_multiple: f64,

    /// ATR multiple for the trailing-stop distance from the best price.
    #[serde(default = "default_trail_distance_multiple")]
    pub trail_distance_multiple: f64,

    /// Minimum improvement (in ATR multiples) a trailing candidate must show
    /// over the previous stop before a new adjustment is emitted.
    #[serde(default = "default_min_trail_step_atr")]
    pub min_trail_step_atr: f64,

    /// Minimum wall-clock interval between two trailing adjustments.
    #[serde(default = "default_trail_debounce_ms")]
    pub trail_debounce_ms: u64,

    /// Floor on the trailing distance as a percentage of entry price, so a
    /// near-zero ATR can never produce an absurdly tight trail.
    #[serde(default = "default_min_trail_pct")]
    pub min_trail_pct: f64,

    /// Favorable excursion (ATR multiples) that triggers partial target 1.
    #[serde(default = "default_tp1_trigger_multiple")]
    pub tp1_trigger_multiple: f64,

    /// Fraction of the original quantity closed at partial target 1.
    #[serde(default = "default_tp1_fraction")]
    pub tp1_fraction: f64,

    /// Favorable excursion (ATR multiples) that triggers partial target 2.
    #[serde(default = "default_tp2_trigger_multiple")]
    pub tp2_trigger_multiple: f64,

    /// Fraction of the original quantity closed at partial target 2.
    #[serde(default = "default_tp2_fraction")]
    pub tp2_fraction: f64,

    /// Best-price excursion (ATR multiples) required before the reversal
    /// give-back rule arms.
    #[serde(default = "default_reversal_arm_multiple")]
    pub reversal_arm_multiple: f64,

    /// Fraction of the maximum favorable excursion that, once given back,
    /// triggers a reversal exit.
    #[serde(default = "default_reversal_giveback_fraction")]
    pub reversal_giveback_fraction: f64,

    /// Current-ATR / entry-ATR ratio at which the volatility-expansion rule
    /// exits the position.
    #[serde(default = "default_vol_expansion_multiple")]
    pub vol_expansion_multiple: f64,

    /// Best-price excursion (ATR multiples) required before a Fibonacci
    /// retracement touch is honored.
    #[serde(default = "default_fib_arm_multiple")]
    pub fib_arm_multiple: f64,

    /// Maximum holding time before the position is force-closed.
    #[serde(default = "default_max_hold_secs")]
    pub max_hold_secs: u64,
}

impl Default for ExitParams {
    fn default() -> Self {
        Self {
            stop_atr_multiple: default_stop_atr_multiple(),
            breakeven_trigger_multiple: default_breakeven_trigger_multiple(),
            trail_distance_multiple: default_trail_distance_multiple(),
            min_trail_step_atr: default_min_trail_step_atr(),
            trail_debounce_ms: default_trail_debounce_ms(),
            min_trail_pct: default_min_trail_pct(),
            tp1_trigger_multiple: default_tp1_trigger_multiple(),
            tp1_fraction: default_tp1_fraction(),
            tp2_trigger_multiple: default_tp2_trigger_multiple(),
            tp2_fraction: default_tp2_fraction(),
            reversal_arm_multiple: default_reversal_arm_multiple(),
            reversal_giveback_fraction: default_reversal_giveback_fraction(),
            vol_expansion_multiple: default_vol_expansion_multiple(),
            fib_arm_multiple: default_fib_arm_multiple(),
            max_hold_secs: default_max_hold_secs(),
        }
    }
}

impl ExitParams {
    /// Reject parameter combinations the rule chain cannot operate on.
    pub fn validate(&self) -> Result<(), EngineError> {
        let positive = [
            ("stop_atr_multiple", self.stop_atr_multiple),
            ("breakeven_trigger_multiple", self.breakeven_trigger_multiple),
            ("trail_distance_multiple", self.trail_distance_multiple),
            ("min_trail_step_atr", self.min_trail_step_atr),
            ("tp1_trigger_multiple", self.tp1_trigger_multiple),
            ("tp2_trigger_multiple", self.tp2_trigger_multiple),
            ("reversal_arm_multiple", self.reversal_arm_multiple),
            ("vol_expansion_multiple", self.vol_expansion_multiple),
            ("fib_arm_multiple", self.fib_arm_multiple),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(EngineError::validation(format!(
                    "{name} must be a positive number, got {value}"
                )));
            }
        }

        let fractions = [
            ("tp1_fraction", self.tp1_fraction),
            ("tp2_fraction", self.tp2_fraction),
        ];
        for (name, value) in fractions {
            if !value.is_finite() || value <= 0.0 || value > 1.0 {
                return Err(EngineError::validation(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }

        if !self.reversal_giveback_fraction.is_finite()
            || self.reversal_giveback_fraction <= 0.0
            || self.reversal_giveback_fraction >= 1.0
        {
            return Err(EngineError::validation(format!(
                "reversal_giveback_fraction must be in (0, 1), got {}",
                self.reversal_giveback_fraction
            )));
        }

        if !self.min_trail_pct.is_finite() || self.min_trail_pct < 0.0 {
            return Err(EngineError::validation(format!(
                "min_trail_pct must be >= 0, got {}",
                self.min_trail_pct
            )));
        }

        if self.max_hold_secs == 0 {
            return Err(EngineError::validation(
                "max_hold_secs must be greater than zero",
            ));
        }

        Ok(())
    }
}

// =============================================================================
// DemoFeedParams
// =============================================================================

/// Knobs for the built-in random-walk demo feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoFeedParams {
    /// Interval between synthetic ticks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Starting price of the random walk.
    #[serde(default = "default_base_price")]
    pub base_price: f64,

    /// Per-tick step size as a percentage of the current price.
    #[serde(default = "default_step_pct")]
    pub step_pct: f64,

    /// Synthetic bid/ask spread as a percentage of the mid price.
    #[serde(default = "default_spread_pct")]
    pub spread_pct: f64,

    /// Quantity used for demo positions.
    #[serde(default = "default_demo_quantity")]
    pub quantity: f64,
}

impl Default for DemoFeedParams {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            base_price: default_base_price(),
            step_pct: default_step_pct(),
            spread_pct: default_spread_pct(),
            quantity: default_demo_quantity(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Sentinel exit engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Symbols the demo feed produces ticks for.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Bounded wait applied to every registry lock acquisition.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    /// Exit rule parameters.
    #[serde(default)]
    pub exit: ExitParams,

    /// Demo feed parameters.
    #[serde(default)]
    pub demo: DemoFeedParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            lock_wait_ms: default_lock_wait_ms(),
            exit: ExitParams::default(),
            demo: DemoFeedParams::default(),
        }
    }
}

impl EngineConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.lock_wait_ms == 0 {
            return Err(EngineError::validation(
                "lock_wait_ms must be greater than zero",
            ));
        }
        // A zero period would panic inside tokio::time::interval.
        if self.demo.tick_interval_ms == 0 {
            return Err(EngineError::validation(
                "demo.tick_interval_ms must be greater than zero",
            ));
        }
        if !self.demo.base_price.is_finite() || self.demo.base_price <= 0.0 {
            return Err(EngineError::validation(format!(
                "demo.base_price must be positive, got {}",
                self.demo.base_price
            )));
        }
        if !self.demo.quantity.is_finite() || self.demo.quantity <= 0.0 {
            return Err(EngineError::validation(format!(
                "demo.quantity must be positive, got {}",
                self.demo.quantity
            )));
        }
        self.exit.validate()
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            lock_wait_ms = config.lock_wait_ms,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        // Atomic write: write to a temporary sibling file, then rename.
        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
