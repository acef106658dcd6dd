// =============================================================================
// Collaborator feeds — volatility and Fibonacci levels
// =============================================================================
//
// The engine never computes indicators itself.  External collaborators keep
// per-symbol ATR values and Fibonacci retracement levels current, and the
// registry reads them through these traits at dispatch time.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Source of the current ATR for a symbol, in price units.
pub trait VolatilityFeed: Send + Sync {
    /// `None` while the collaborator has not produced a value yet.
    fn atr(&self, symbol: &str) -> Option<f64>;
}

/// Source of the active Fibonacci retracement levels for a symbol.
pub trait FibonacciFeed: Send + Sync {
    fn level_set(&self, symbol: &str) -> Option<FibLevelSet>;
}

// ---------------------------------------------------------------------------
// Fibonacci levels
// ---------------------------------------------------------------------------

/// One retracement level: the ratio it was derived from and its price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FibLevel {
    pub ratio: f64,
    pub price: f64,
}

/// The set of levels currently in play for a symbol, with the proximity
/// tolerance the collaborator considers a "touch".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FibLevelSet {
    pub levels: Vec<FibLevel>,
    /// Absolute price distance within which a level counts as touched.
    pub touch_tolerance: f64,
}

impl FibLevelSet {
    /// The first level within `touch_tolerance` of `price`, if any.
    pub fn touched(&self, price: f64) -> Option<&FibLevel> {
        self.levels
            .iter()
            .find(|level| (price - level.price).abs() <= self.touch_tolerance)
    }
}

// ---------------------------------------------------------------------------
// IndicatorStore
// ---------------------------------------------------------------------------

/// Shared in-memory implementation of both feeds.
///
/// Indicator collaborators write into it; the registry reads from it through
/// the trait objects.
pub struct IndicatorStore {
    atr: RwLock<HashMap<String, f64>>,
    fib: RwLock<HashMap<String, FibLevelSet>>,
}

impl IndicatorStore {
    pub fn new() -> Self {
        Self {
            atr: RwLock::new(HashMap::new()),
            fib: RwLock::new(HashMap::new()),
        }
    }

    /// Record a fresh ATR value. Non-positive values are ignored so a
    /// half-initialized collaborator can never poison the stored reading.
    pub fn set_atr(&self, symbol: &str, value: f64) {
        if !value.is_finite() || value <= 0.0 {
            debug!(symbol, value, "ignoring non-positive ATR update");
            return;
        }
        self.atr.write().insert(symbol.to_string(), value);
    }

    /// Replace the active level set for a symbol.
    pub fn set_fib_levels(&self, symbol: &str, levels: FibLevelSet) {
        self.fib.write().insert(symbol.to_string(), levels);
    }
}

impl Default for IndicatorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VolatilityFeed for IndicatorStore {
    fn atr(&self, symbol: &str) -> Option<f64> {
        self.atr.read().get(symbol).copied()
    }
}

impl FibonacciFeed for IndicatorStore {
    fn level_set(&self, symbol: &str) -> Option<FibLevelSet> {
        self.fib.read().get(symbol).cloned()
    }
}
