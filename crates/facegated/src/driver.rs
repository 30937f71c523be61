//! Fixed-period tick loop tying camera, classifier, controller and effects together.

use crate::dispatcher::{DispatchError, EffectDispatcher};
use crate::notifier::Notifier;
use facegate_core::{
    ClassificationAdapter, FaceLocalizer, IdentityClassifier, ObserveError, VerificationController,
};
use facegate_hw::{CameraError, CharDisplay, FrameSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("classification error: {0}")]
    Observe(#[from] ObserveError),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Owns every runtime resource of the terminal.
///
/// Dropping the driver clears the display, then releases the frame source.
/// This runs on normal return, on error and during panic unwinding.
pub struct TickDriver<S, L, C, D, N>
where
    S: FrameSource,
    L: FaceLocalizer,
    C: IdentityClassifier,
    D: CharDisplay,
    N: Notifier,
{
    dispatcher: EffectDispatcher<D, N>,
    controller: VerificationController,
    adapter: ClassificationAdapter<L, C>,
    source: S,
    interval: Duration,
}

impl<S, L, C, D, N> TickDriver<S, L, C, D, N>
where
    S: FrameSource,
    L: FaceLocalizer,
    C: IdentityClassifier,
    D: CharDisplay,
    N: Notifier,
{
    pub fn new(
        source: S,
        adapter: ClassificationAdapter<L, C>,
        controller: VerificationController,
        dispatcher: EffectDispatcher<D, N>,
        interval: Duration,
    ) -> Self {
        Self {
            dispatcher,
            controller,
            adapter,
            source,
            interval,
        }
    }

    /// Tick until `shutdown` is raised or a tick fails.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), DriverError> {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "tick loop started");
        while !shutdown.load(Ordering::SeqCst) {
            self.tick_at(Instant::now())?;
            std::thread::sleep(self.interval);
        }
        tracing::info!("tick loop stopped");
        Ok(())
    }

    /// One iteration at time `now`.
    ///
    /// No frame is pulled while an unexpired result lock is active.
    pub fn tick_at(&mut self, now: Instant) -> Result<(), DriverError> {
        let observation = if self.controller.session().is_locked_at(now) {
            None
        } else {
            let frame = self.source.capture()?;
            tracing::trace!(
                sequence = frame.sequence,
                age_us = frame.timestamp.elapsed().as_micros() as u64,
                "frame captured"
            );
            let image = frame.into_image().map_err(CameraError::from)?;
            self.adapter.observe(image)?
        };

        if let Some(decision) = self.controller.step(observation, now) {
            self.dispatcher.apply(decision)?;
        }
        Ok(())
    }
}

impl<S, L, C, D, N> Drop for TickDriver<S, L, C, D, N>
where
    S: FrameSource,
    L: FaceLocalizer,
    C: IdentityClassifier,
    D: CharDisplay,
    N: Notifier,
{
    fn drop(&mut self) {
        if let Err(e) = self.dispatcher.display_mut().clear() {
            tracing::warn!(error = %e, "failed to clear display on shutdown");
        }
    }
}
