// =============================================================================
// Exit-order boundary — intents handed to the execution collaborator
// =============================================================================
//
// The engine decides; it never routes orders.  Every applied decision becomes
// an `ExitOrderRequest` pushed through an `ExitOrderEmitter`.  Submission
// happens inside the per-position critical section, so implementations must
// enqueue without blocking.
//
// The engine does not track acknowledgment: broker-side fills flow back in
// through `dispatch_position_update` as external quantity deltas.
// =============================================================================

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::{ExitReason, Side};

/// How the execution collaborator should work the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    /// Immediate close at market (full exits).
    Market,
    /// Resting stop order (trailing-stop placements and replacements).
    Stop,
    /// Marketable limit at the decision price (partial exits, bounded
    /// slippage).
    Limit,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Stop => write!(f, "STOP"),
            Self::Limit => write!(f, "LIMIT"),
        }
    }
}

/// One exit intent. `side` is the position side; the collaborator derives the
/// closing order side from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitOrderRequest {
    /// Client order id minted by the registry (UUID v4).
    pub request_id: String,
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub kind: OrderKind,
    /// Limit price or stop trigger; `None` for market orders.
    pub price_or_trigger: Option<f64>,
    pub reason: ExitReason,
    pub created_at_ms: i64,
}

/// Sink for exit intents.
///
/// `submit` is called while the emitting position's lock is held and must
/// return promptly; queue the request and do the slow work elsewhere.
pub trait ExitOrderEmitter: Send + Sync {
    fn submit(&self, request: ExitOrderRequest);
}

// ---------------------------------------------------------------------------
// ChannelEmitter
// ---------------------------------------------------------------------------

/// Emitter backed by an unbounded tokio channel; the execution collaborator
/// consumes the receiving end.
pub struct ChannelEmitter {
    tx: mpsc::UnboundedSender<ExitOrderRequest>,
}

impl ChannelEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExitOrderRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ExitOrderEmitter for ChannelEmitter {
    fn submit(&self, request: ExitOrderRequest) {
        if let Err(e) = self.tx.send(request) {
            warn!(error = %e, "exit order dropped — execution consumer is gone");
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingEmitter (test support)
// ---------------------------------------------------------------------------

/// Captures every submitted request for assertions.
#[cfg(test)]
pub(crate) struct RecordingEmitter {
    requests: parking_lot::Mutex<Vec<ExitOrderRequest>>,
}

#[cfg(test)]
impl RecordingEmitter {
    pub(crate) fn new() -> Self {
        Self {
            requests: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<ExitOrderRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.lock().len()
    }
}

#[cfg(test)]
impl ExitOrderEmitter for RecordingEmitter {
    fn submit(&self, request: ExitOrderRequest) {
        self.requests.lock().push(request);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn request(reason: ExitReason, kind: OrderKind) -> ExitOrderRequest {
        ExitOrderRequest {
            request_id: "req-1".to_string(),
            position_id: "pos-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            quantity: 5.0,
            kind,
            price_or_trigger: Some(101.0),
            reason,
            created_at_ms: 1_000,
        }
    }

    #[test]
    fn channel_emitter_delivers_in_order() {
        let (emitter, mut rx) = ChannelEmitter::new();

        emitter.submit(request(ExitReason::TrailingAdjust, OrderKind::Stop));
        emitter.submit(request(ExitReason::PartialTp1, OrderKind::Limit));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.reason, ExitReason::TrailingAdjust);
        assert_eq!(first.kind, OrderKind::Stop);
        assert_eq!(second.reason, ExitReason::PartialTp1);
        assert!(rx.try_recv().is_err(), "channel should be drained");
    }

    #[test]
    fn submit_survives_dropped_consumer() {
        let (emitter, rx) = ChannelEmitter::new();
        drop(rx);
        // Must not panic; the request is logged and dropped.
        emitter.submit(request(ExitReason::StopLoss, OrderKind::Market));
    }

    #[test]
    fn recording_emitter_captures_requests() {
        let emitter = RecordingEmitter::new();
        emitter.submit(request(ExitReason::StopLoss, OrderKind::Market));
        emitter.submit(request(ExitReason::PartialTp2, OrderKind::Limit));

        assert_eq!(emitter.len(), 2);
        let captured = emitter.requests();
        assert_eq!(captured[0].reason, ExitReason::StopLoss);
        assert_eq!(captured[1].reason, ExitReason::PartialTp2);
    }

    #[test]
    fn order_kind_display_is_stable() {
        assert_eq!(OrderKind::Market.to_string(), "MARKET");
        assert_eq!(OrderKind::Stop.to_string(), "STOP");
        assert_eq!(OrderKind::Limit.to_string(), "LIMIT");
    }
}
