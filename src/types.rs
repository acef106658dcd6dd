// =============================================================================
// Shared types used across the Sentinel exit engine
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Direction of a tracked position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Signed direction multiplier: `+1.0` for longs, `-1.0` for shorts.
    ///
    /// All excursion arithmetic is expressed as
    /// `(price - entry_price) * side.sign()` so that "favorable" is always
    /// positive regardless of direction.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Self::Long),
            "SHORT" | "SELL" => Ok(Self::Short),
            other => Err(EngineError::Validation {
                reason: format!("unknown side '{other}'"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MarketSnapshot
// ---------------------------------------------------------------------------

/// Immutable snapshot of the market for one symbol at one instant.
///
/// Produced by the market-data collaborator and shared read-only across every
/// position evaluated for that symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    /// Event time in epoch milliseconds (exchange time, not arrival time).
    pub timestamp_ms: i64,
}

impl MarketSnapshot {
    /// The price an exit would realistically execute at: the bid for closing a
    /// long, the ask for closing a short. Falls back to `last` when the quote
    /// side is missing or non-positive.
    pub fn decision_price(&self, side: Side) -> f64 {
        let quote = match side {
            Side::Long => self.bid,
            Side::Short => self.ask,
        };
        if quote.is_finite() && quote > 0.0 {
            quote
        } else {
            self.last
        }
    }

    /// Whether this snapshot carries a price the engine can act on.
    pub fn has_usable_price(&self, side: Side) -> bool {
        let price = self.decision_price(side);
        price.is_finite() && price > 0.0
    }
}

// ---------------------------------------------------------------------------
// ExitReason
// ---------------------------------------------------------------------------

/// Why an exit effect (or audit-worthy state change) was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    PartialTp1,
    PartialTp2,
    Reversal,
    VolatilityExpansion,
    FibRetracement,
    MaxHoldTime,
    ManualStop,
    ExternalFill,
    BreakevenArmed,
    TrailingAdjust,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "SL"),
            Self::PartialTp1 => write!(f, "TP1"),
            Self::PartialTp2 => write!(f, "TP2"),
            Self::Reversal => write!(f, "REVERSAL"),
            Self::VolatilityExpansion => write!(f, "VOL_EXPAND"),
            Self::FibRetracement => write!(f, "FIB_TOUCH"),
            Self::MaxHoldTime => write!(f, "TIME"),
            Self::ManualStop => write!(f, "MANUAL"),
            Self::ExternalFill => write!(f, "EXT_FILL"),
            Self::BreakevenArmed => write!(f, "BE_ARM"),
            Self::TrailingAdjust => write!(f, "TRAIL_ADJ"),
        }
    }
}

// ---------------------------------------------------------------------------
// ExitDecision
// ---------------------------------------------------------------------------

/// One effect produced by an evaluation pass.
///
/// A single pass yields an ordered list of at most three effects: an optional
/// trailing-stop adjustment, an optional partial exit, and an optional
/// full exit. A stop-loss hit short-circuits the pass and is the only effect
/// emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExitDecision {
    NoAction,
    AdjustTrailingStop { stop_price: f64 },
    PartialExit { quantity: f64, reason: ExitReason },
    FullExit { reason: ExitReason },
}

impl std::fmt::Display for ExitDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAction => write!(f, "NO_ACTION"),
            Self::AdjustTrailingStop { stop_price } => {
                write!(f, "TRAIL_ADJ@{stop_price:.4}")
            }
            Self::PartialExit { quantity, reason } => {
                write!(f, "PARTIAL {quantity:.4} ({reason})")
            }
            Self::FullExit { reason } => write!(f, "FULL ({reason})"),
        }
    }
}
