//! Enrollment session: turns capture triggers into face samples and, once
//! enough are collected, into one stored identity.
//!
//! ```text
//! AwaitingFace -> Capturing(1) -> Capturing(2) -> Finalizing -> Done
//!       \______________\_______________\______________/
//!                          Cancel -> Cancelled
//! ```

use crate::sample::{FaceSample, SampleError};
use crate::store::{EnrollmentStore, StoreError};
use crate::types::{BoundingBox, EnrolledIdentity};
use image::RgbImage;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Accepted captures needed before an identity is built.
pub const SAMPLES_PER_ENROLLMENT: usize = 3;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("enrollment not ready to finalize (state: {0:?})")]
    NotReady(EnrollState),
    #[error("sample error: {0}")]
    Sample(#[from] SampleError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Session-level user input, polled once per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Capture,
    Cancel,
}

#[derive(Debug, Clone)]
pub struct EnrollConfig {
    /// Minimum time between two accepted captures.
    pub capture_interval: Duration,
}

impl Default for EnrollConfig {
    fn default() -> Self {
        Self {
            capture_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollState {
    AwaitingFace,
    Capturing { count: usize },
    Finalizing,
    Done,
    Cancelled,
}

/// What a single frame did to the session.
#[derive(Debug)]
pub enum EnrollStep {
    /// No trigger, or nothing left to do.
    Idle,
    Captured { count: usize },
    /// Capture trigger arrived inside the debounce interval.
    Debounced,
    /// Capture trigger with zero or several faces in view.
    Ambiguous { faces: usize },
    /// The sole face box could not be cropped.
    InvalidSample(SampleError),
    Cancelled,
}

pub struct EnrollmentSession {
    id: String,
    name: String,
    config: EnrollConfig,
    state: EnrollState,
    samples: Vec<FaceSample>,
    last_capture_at: Option<Instant>,
    /// Face count of the previous rejected trigger, while rejections repeat.
    last_rejection: Option<usize>,
}

impl EnrollmentSession {
    pub fn new(id: impl Into<String>, name: impl Into<String>, config: EnrollConfig) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            config,
            state: EnrollState::AwaitingFace,
            samples: Vec::with_capacity(SAMPLES_PER_ENROLLMENT),
            last_capture_at: None,
            last_rejection: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> EnrollState {
        self.state
    }

    pub fn captured(&self) -> usize {
        self.samples.len()
    }

    /// Capture progress in [0, 1].
    pub fn progress(&self) -> f32 {
        self.samples.len() as f32 / SAMPLES_PER_ENROLLMENT as f32
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, EnrollState::Done | EnrollState::Cancelled)
    }

    /// Advance the session by one frame.
    ///
    /// `faces` are the detector boxes for `frame`; `now` is the frame time.
    pub fn on_frame(
        &mut self,
        frame: &RgbImage,
        faces: &[BoundingBox],
        trigger: Option<Trigger>,
        now: Instant,
    ) -> EnrollStep {
        match (self.state, trigger) {
            (EnrollState::Done | EnrollState::Cancelled, _) => EnrollStep::Idle,
            (_, Some(Trigger::Cancel)) => {
                tracing::info!(
                    id = %self.id,
                    discarded = self.samples.len(),
                    "enrollment cancelled"
                );
                self.samples.clear();
                self.state = EnrollState::Cancelled;
                EnrollStep::Cancelled
            }
            (EnrollState::Finalizing, _) | (_, None) => EnrollStep::Idle,
            (_, Some(Trigger::Capture)) => self.capture(frame, faces, now),
        }
    }

    fn capture(&mut self, frame: &RgbImage, faces: &[BoundingBox], now: Instant) -> EnrollStep {
        if let Some(last) = self.last_capture_at {
            if now.saturating_duration_since(last) < self.config.capture_interval {
                tracing::debug!("capture trigger debounced");
                return EnrollStep::Debounced;
            }
        }

        let [face] = faces else {
            let count = faces.len();
            // Only warn when the rejection reason changes.
            if self.last_rejection.replace(count) == Some(count) {
                tracing::debug!(faces = count, "capture rejected again");
            } else {
                tracing::warn!(faces = count, "capture rejected: no face or multiple faces");
            }
            return EnrollStep::Ambiguous { faces: count };
        };

        let sample = match FaceSample::from_region(frame, face) {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!(error = %e, "capture rejected: unusable face region");
                return EnrollStep::InvalidSample(e);
            }
        };

        self.samples.push(sample);
        self.last_capture_at = Some(now);
        self.last_rejection = None;

        let count = self.samples.len();
        self.state = if count >= SAMPLES_PER_ENROLLMENT {
            EnrollState::Finalizing
        } else {
            EnrollState::Capturing { count }
        };
        tracing::info!(count, required = SAMPLES_PER_ENROLLMENT, "photo captured");

        EnrollStep::Captured { count }
    }

    /// Average the captures, persist the identity and finish the session.
    ///
    /// The record is fully built before the write. On failure the captures
    /// are kept and the session stays in `Finalizing`.
    pub fn finalize(&mut self, store: &EnrollmentStore) -> Result<EnrolledIdentity, EnrollError> {
        if self.state != EnrollState::Finalizing {
            return Err(EnrollError::NotReady(self.state));
        }

        let identity =
            EnrolledIdentity::from_samples(self.id.clone(), self.name.clone(), self.samples.clone())?;
        store.save(&identity)?;

        self.samples.clear();
        self.state = EnrollState::Done;
        tracing::info!(id = %self.id, name = %self.name, "enrollment complete");

        Ok(identity)
    }
}
