//! Turns controller decisions into display, evidence and alert effects.

use crate::evidence::{EvidenceError, EvidenceStore};
use crate::notifier::{self, Notifier};
use chrono::{DateTime, Local};
use facegate_core::Decision;
use facegate_hw::display::{fit_line, CharDisplay, DisplayError};
use thiserror::Error;

/// Two fixed display lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Screen {
    pub line1: &'static str,
    pub line2: &'static str,
}

impl Screen {
    pub const IDLE: Screen = Screen::new("PLEASE FACE", "THE CAMERA");
    pub const VERIFYING: Screen = Screen::new("VERIFYING...", "");
    pub const GRANTED: Screen = Screen::new("ACCESS GRANTED", "WELCOME!");
    pub const DENIED: Screen = Screen::new("ACCESS DENIED", "TRY AGAIN");
    pub const MODEL_MISSING: Screen = Screen::new("MODEL MISSING", "RUN TRAINING");
    pub const DETECTOR_MISSING: Screen = Screen::new("DETECTOR MISSING", "CHECK INSTALL");
    pub const CAMERA_ERROR: Screen = Screen::new("CAMERA ERROR", "CHECK DEVICE");

    const fn new(line1: &'static str, line2: &'static str) -> Self {
        Self { line1, line2 }
    }

    pub fn for_decision(decision: &Decision) -> Screen {
        match decision {
            Decision::ShowIdle => Screen::IDLE,
            Decision::ShowVerifying => Screen::VERIFYING,
            Decision::ShowSuccess => Screen::GRANTED,
            Decision::ShowFailure(_) => Screen::DENIED,
        }
    }
}

/// Display wrapper that drops writes identical to the last one.
pub struct CachedDisplay<D> {
    inner: D,
    last: Option<(String, String)>,
}

impl<D: CharDisplay> CachedDisplay<D> {
    pub fn new(inner: D) -> Self {
        Self { inner, last: None }
    }

    /// Render `screen` unless it is already showing. Returns whether a write happened.
    pub fn show(&mut self, screen: Screen) -> Result<bool, DisplayError> {
        let lines = (fit_line(screen.line1), fit_line(screen.line2));
        if self.last.as_ref() == Some(&lines) {
            return Ok(false);
        }
        self.inner.render(&lines.0, &lines.1)?;
        self.last = Some(lines);
        Ok(true)
    }

    pub fn clear(&mut self) -> Result<(), DisplayError> {
        self.last = None;
        self.inner.clear()
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("display error: {0}")]
    Display(#[from] DisplayError),
    #[error("evidence error: {0}")]
    Evidence(#[from] EvidenceError),
}

/// Applies each decision exactly once.
pub struct EffectDispatcher<D, N> {
    display: CachedDisplay<D>,
    evidence: EvidenceStore,
    notifier: N,
}

impl<D: CharDisplay, N: Notifier> EffectDispatcher<D, N> {
    pub fn new(display: CachedDisplay<D>, evidence: EvidenceStore, notifier: N) -> Self {
        Self {
            display,
            evidence,
            notifier,
        }
    }

    pub fn apply(&mut self, decision: Decision) -> Result<(), DispatchError> {
        self.apply_at(decision, Local::now())
    }

    /// Render the decision's screen; on failure also write evidence and send an alert.
    ///
    /// Evidence errors propagate. Alert errors are logged and dropped.
    pub fn apply_at(&mut self, decision: Decision, at: DateTime<Local>) -> Result<(), DispatchError> {
        let screen = Screen::for_decision(&decision);
        if self.display.show(screen)? {
            tracing::info!(decision = decision.name(), "display updated");
        }

        if let Decision::ShowFailure(evidence) = decision {
            self.evidence.save(&evidence, at)?;
            if let Err(e) = self.notifier.notify(&notifier::failure_message(at)) {
                tracing::warn!(error = %e, "failure alert not delivered");
            }
        }
        Ok(())
    }

    pub fn display_mut(&mut self) -> &mut CachedDisplay<D> {
        &mut self.display
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use crate::notifier::NotifyError;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records every render and clear in a shared log.
    #[derive(Clone, Default)]
    pub struct RecordingDisplay {
        pub log: Rc<RefCell<Vec<String>>>,
    }

    impl CharDisplay for RecordingDisplay {
        fn render(&mut self, line1: &str, line2: &str) -> Result<(), DisplayError> {
            self.log
                .borrow_mut()
                .push(format!("{}|{}", line1.trim_end(), line2.trim_end()));
            Ok(())
        }

        fn clear(&mut self) -> Result<(), DisplayError> {
            self.log.borrow_mut().push("<clear>".to_string());
            Ok(())
        }
    }

    /// Counts alerts; optionally fails every one of them.
    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        pub sent: Rc<RefCell<Vec<String>>>,
        pub fail: bool,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, text: &str) -> Result<(), NotifyError> {
            self.sent.borrow_mut().push(text.to_string());
            if self.fail {
                Err(NotifyError::Status {
                    status: 401,
                    body: "unauthorized".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }
}
