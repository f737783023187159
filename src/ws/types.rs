//! Handler surface the link reports to.

use crate::core::{DeliveryFailure, LinkEvent, WireFrame};

/// Receiver of everything the link surfaces to its owner.
///
/// All methods run on the link actor, one at a time; keep them short or hand the work off.
pub trait LinkHandler: Send + 'static {
    /// Application frame with no registered route.
    fn on_message(&mut self, _frame: WireFrame) {}

    /// Terminal delivery outcome for a tracked envelope. Fired at most once per envelope.
    fn on_delivery_failure(&mut self, _failure: DeliveryFailure) {}

    fn on_event(&mut self, _event: LinkEvent) {}
}

/// Handler that discards everything.
impl LinkHandler for () {}
