//! Debounced verification state machine.
//!
//! Turns the per-frame stream of face observations into stable access
//! decisions. An outcome must persist unchanged for the stability window
//! before it is finalized; a finalized decision then holds the terminal in
//! a result lock during which observations are ignored.
//!
//! The state lives in an explicitly owned [`VerificationSession`] value and
//! [`step`] is a pure function of `(session, observation, now)`, so the
//! whole machine is testable with synthetic timestamps.

use crate::types::{Decision, FaceObservation, FailureEvidence, Outcome};
use std::time::{Duration, Instant};

/// Default time an outcome must stay unchanged before it is finalized.
pub const DEFAULT_STABLE_WINDOW: Duration = Duration::from_secs(1);
/// Default time a finalized result stays on the display.
pub const DEFAULT_RESULT_HOLD: Duration = Duration::from_secs(5);
/// Longest result lock honoured; longer holds are capped to this.
pub const MAX_RESULT_HOLD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Debounce and hold durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub stable_window: Duration,
    pub result_hold: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            stable_window: DEFAULT_STABLE_WINDOW,
            result_hold: DEFAULT_RESULT_HOLD,
        }
    }
}

/// Coarse phase of a session, without the per-phase data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Verifying,
    ResultLock,
}

/// Live controller state.
///
/// `stable_since` only exists while verifying and `lock_until` only while
/// locked; the enum makes any other combination unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerificationSession {
    #[default]
    Idle,
    Verifying {
        target: Outcome,
        stable_since: Instant,
    },
    ResultLock {
        lock_until: Instant,
    },
}

impl VerificationSession {
    pub fn phase(&self) -> Phase {
        match self {
            VerificationSession::Idle => Phase::Idle,
            VerificationSession::Verifying { .. } => Phase::Verifying,
            VerificationSession::ResultLock { .. } => Phase::ResultLock,
        }
    }

    pub fn target_outcome(&self) -> Option<Outcome> {
        match self {
            VerificationSession::Verifying { target, .. } => Some(*target),
            _ => None,
        }
    }

    pub fn stable_since(&self) -> Option<Instant> {
        match self {
            VerificationSession::Verifying { stable_since, .. } => Some(*stable_since),
            _ => None,
        }
    }

    pub fn lock_until(&self) -> Option<Instant> {
        match self {
            VerificationSession::ResultLock { lock_until } => Some(*lock_until),
            _ => None,
        }
    }

    /// True while a result lock is active and has not yet expired at `now`.
    ///
    /// The tick driver uses this to skip frame acquisition entirely.
    pub fn is_locked_at(&self, now: Instant) -> bool {
        matches!(self, VerificationSession::ResultLock { lock_until } if now < *lock_until)
    }
}

/// Advance the state machine by one tick.
///
/// Returns the next session and the decision to dispatch, if any. A
/// result lock that has not expired produces no decision: the display
/// already shows the final message and no effect may repeat.
pub fn step(
    session: VerificationSession,
    observation: Option<FaceObservation>,
    now: Instant,
    timing: &Timing,
) -> (VerificationSession, Option<Decision>) {
    match session {
        VerificationSession::ResultLock { lock_until } => {
            if now >= lock_until {
                (VerificationSession::Idle, Some(Decision::ShowIdle))
            } else {
                (session, None)
            }
        }
        VerificationSession::Idle => match observation {
            None => (VerificationSession::Idle, Some(Decision::ShowIdle)),
            Some(obs) => (
                VerificationSession::Verifying {
                    target: obs.outcome,
                    stable_since: now,
                },
                Some(Decision::ShowVerifying),
            ),
        },
        VerificationSession::Verifying {
            target,
            stable_since,
        } => {
            let Some(obs) = observation else {
                // Losing the face cancels the verification outright.
                return (VerificationSession::Idle, Some(Decision::ShowIdle));
            };

            if obs.outcome != target {
                return (
                    VerificationSession::Verifying {
                        target: obs.outcome,
                        stable_since: now,
                    },
                    Some(Decision::ShowVerifying),
                );
            }

            if now.saturating_duration_since(stable_since) < timing.stable_window {
                return (session, Some(Decision::ShowVerifying));
            }

            let decision = match target {
                Outcome::Ok => Decision::ShowSuccess,
                Outcome::Fail => Decision::ShowFailure(FailureEvidence {
                    bbox: obs.bbox,
                    confidence: obs.confidence,
                    frame: obs.frame,
                }),
            };
            let next = VerificationSession::ResultLock {
                lock_until: lock_deadline(now, timing.result_hold),
            };
            (next, Some(decision))
        }
    }
}

fn lock_deadline(now: Instant, hold: Duration) -> Instant {
    now.checked_add(hold.min(MAX_RESULT_HOLD)).unwrap_or(now)
}

/// Owns the single session and threads it through [`step`].
pub struct VerificationController {
    session: VerificationSession,
    timing: Timing,
}

impl VerificationController {
    pub fn new(timing: Timing) -> Self {
        Self {
            session: VerificationSession::Idle,
            timing,
        }
    }

    pub fn session(&self) -> VerificationSession {
        self.session
    }

    pub fn step(&mut self, observation: Option<FaceObservation>, now: Instant) -> Option<Decision> {
        let previous = self.session.phase();
        let (next, decision) = step(self.session, observation, now, &self.timing);
        if next.phase() != previous {
            tracing::debug!(from = ?previous, to = ?next.phase(), "verification phase changed");
        }
        self.session = next;
        decision
    }
}
