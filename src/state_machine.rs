//! Trade lifecycle state machine
//!
//! Pure transition logic over `(current_status, event)`. The ledger consults
//! `ensure_legal` inside its transactions before any status write; the
//! orchestrator uses `apply` to compute the next status for a domain event.

use crate::types::{CancelReason, TradeStatus};
use std::fmt;

/// Domain events that drive a trade through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeEvent {
    /// Discovery created the trade; begin scanning for a signal
    StartSearch,
    /// A qualifying signal was persisted
    QualifyingSignal,
    /// Window ended without a qualifying signal
    WindowExpiredWithoutSignal,
    /// confirm_ts >= end_ts: the confirmation can never complete in-window
    ConfirmTooLate,
    /// Signal quality fell below the strict threshold before confirmation
    QualityBelowStrict,
    /// Wall clock reached confirm_ts
    ConfirmReached,
    /// CAP evaluation passed
    CapPass,
    /// CAP evaluation failed
    CapFail,
    /// CAP evaluation reported LATE
    CapLate,
    /// User confirmed the trade (day mode)
    UserOk,
    /// User skipped the trade (day mode)
    UserSkip,
    /// No user response within the allowed window
    ResponseTimeout,
    /// Policy auto-confirmed the trade (night mode)
    AutoOk,
    /// Night trading disabled or night cap reached
    NightDisabled,
    /// Window expired while the trade was in flight
    WindowExpired,
    /// Bot paused before the search started
    Paused,
    /// Order was placed on the book
    OrderPlaced,
    /// Order filled and the window resolved
    FilledAndResolved,
    /// Order was rejected by the venue
    OrderRejected,
}

/// Outcome of applying an event: the next status and, when the trade is
/// being cancelled, the reason to record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: TradeStatus,
    pub cancel_reason: Option<CancelReason>,
}

impl Transition {
    fn to(next: TradeStatus) -> Self {
        Self {
            next,
            cancel_reason: None,
        }
    }

    fn cancelled(reason: CancelReason) -> Self {
        Self {
            next: TradeStatus::Cancelled,
            cancel_reason: Some(reason),
        }
    }
}

/// An attempted transition that the table does not admit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TradeStatus,
    pub to: Option<TradeStatus>,
    pub event: Option<TradeEvent>,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.to, self.event) {
            (Some(to), _) => write!(f, "invalid transition {} -> {}", self.from, to),
            (None, Some(event)) => {
                write!(f, "event {:?} not applicable in status {}", event, self.from)
            }
            (None, None) => write!(f, "invalid transition from {}", self.from),
        }
    }
}

impl std::error::Error for InvalidTransition {}

/// Statuses reachable from `from` in one legal step.
pub fn legal_targets(from: TradeStatus) -> &'static [TradeStatus] {
    use TradeStatus::*;
    match from {
        New => &[SearchingSignal, Cancelled],
        SearchingSignal => &[Signalled, Cancelled],
        Signalled => &[WaitingConfirm, Cancelled],
        WaitingConfirm => &[WaitingCap, Cancelled],
        WaitingCap => &[Ready, Cancelled],
        Ready => &[OrderPlaced, Cancelled],
        OrderPlaced => &[Settled, Error],
        Settled | Cancelled | Error => &[],
    }
}

/// Check that `from -> to` is a legal edge. Terminal states reject
/// everything.
pub fn ensure_legal(from: TradeStatus, to: TradeStatus) -> Result<(), InvalidTransition> {
    if legal_targets(from).contains(&to) {
        Ok(())
    } else {
        Err(InvalidTransition {
            from,
            to: Some(to),
            event: None,
        })
    }
}

/// Apply a domain event to a status, yielding the transition it mandates.
///
/// Pure: no side effects, no clock. Events that are not meaningful in the
/// given status are rejected rather than ignored, so a caller can surface
/// the violation.
pub fn apply(status: TradeStatus, event: TradeEvent) -> Result<Transition, InvalidTransition> {
    use TradeEvent::*;
    use TradeStatus::*;

    let transition = match (status, event) {
        (New, StartSearch) => Transition::to(SearchingSignal),
        (New, WindowExpired) => Transition::cancelled(CancelReason::Expired),
        (New, WindowExpiredWithoutSignal) => Transition::cancelled(CancelReason::NoSignal),
        (New, Paused) => Transition::cancelled(CancelReason::Paused),

        (SearchingSignal, QualifyingSignal) => Transition::to(Signalled),
        (SearchingSignal, WindowExpiredWithoutSignal) => {
            Transition::cancelled(CancelReason::NoSignal)
        }

        (Signalled, ConfirmTooLate) => Transition::cancelled(CancelReason::Late),
        (Signalled, QualityBelowStrict) => Transition::cancelled(CancelReason::LowQuality),
        (Signalled, ConfirmReached) => Transition::to(WaitingConfirm),
        (Signalled, WindowExpired) => Transition::cancelled(CancelReason::Expired),

        (WaitingConfirm, ConfirmReached) => Transition::to(WaitingCap),
        (WaitingConfirm, WindowExpired) => Transition::cancelled(CancelReason::Expired),
        (WaitingConfirm, ConfirmTooLate) => Transition::cancelled(CancelReason::Late),

        (WaitingCap, CapPass) => Transition::to(Ready),
        (WaitingCap, CapFail) => Transition::cancelled(CancelReason::CapFail),
        (WaitingCap, CapLate) => Transition::cancelled(CancelReason::Late),
        (WaitingCap, WindowExpired) => Transition::cancelled(CancelReason::CapFail),

        (Ready, UserOk) | (Ready, AutoOk) => Transition::to(TradeStatus::OrderPlaced),
        (Ready, UserSkip) => Transition::cancelled(CancelReason::Skip),
        (Ready, ResponseTimeout) => Transition::cancelled(CancelReason::Expired),
        (Ready, NightDisabled) => Transition::cancelled(CancelReason::NightDisabled),
        (Ready, WindowExpired) => Transition::cancelled(CancelReason::Expired),

        (TradeStatus::OrderPlaced, FilledAndResolved) => Transition::to(Settled),
        (TradeStatus::OrderPlaced, OrderRejected) => Transition {
            next: Error,
            cancel_reason: None,
        },

        _ => {
            return Err(InvalidTransition {
                from: status,
                to: None,
                event: Some(event),
            })
        }
    };

    // Every event-derived transition must also be a legal edge.
    ensure_legal(status, transition.next)?;
    Ok(transition)
}
