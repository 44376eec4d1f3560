//! Per-frame session loops.
//!
//! One thread, one blocking frame read per iteration:
//! acquire -> detect -> advance the state machine -> render -> poll triggers.

use crate::controls::Controls;
use crate::render::{Overlay, Renderer, Tone};
use anyhow::{Context, Result};
use facegate_core::enroll::SAMPLES_PER_ENROLLMENT;
use facegate_core::{
    BoundingBox, EnrolledIdentity, EnrollState, EnrollStep, EnrollmentSession, EnrollmentStore,
    FaceDetector, Trigger, VerificationSession, Verdict, VerifyPhase,
};
use facegate_hw::{Frame, FrameSource};

const ENROLL_INSTRUCTIONS: &str = "Position your face in the frame and press capture";

/// Failed frames in a row after which a session gives up.
pub const MAX_CONSECUTIVE_FAILURES: usize = 10;

/// The external collaborators a session loop talks to.
pub struct SessionIo<'a> {
    pub source: &'a mut dyn FrameSource,
    pub detector: &'a mut dyn FaceDetector,
    pub controls: &'a mut dyn Controls,
    pub renderer: &'a mut dyn Renderer,
}

impl SessionIo<'_> {
    /// Drop the first `count` frames while the camera's exposure settles.
    pub fn discard_warmup(&mut self, count: usize) {
        if count > 0 {
            tracing::info!(count, "discarding warmup frames");
        }
        for _ in 0..count {
            match self.source.next_frame() {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => tracing::warn!(error = %e, "warmup frame failed"),
            }
        }
    }

    /// Read and detect the next frame. `None` once the source is exhausted.
    ///
    /// A failed read or detection skips to the following frame; only
    /// [`MAX_CONSECUTIVE_FAILURES`] failures in a row end the session.
    fn next(&mut self) -> Result<Option<(Frame, Vec<BoundingBox>)>> {
        let mut failures = 0;
        loop {
            match self.read_frame() {
                Ok(next) => return Ok(next),
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(e.context(format!("{failures} consecutive frames failed")));
                    }
                    tracing::warn!(error = %format!("{e:#}"), failures, "skipping failed frame");
                }
            }
        }
    }

    fn read_frame(&mut self) -> Result<Option<(Frame, Vec<BoundingBox>)>> {
        let Some(frame) = self.source.next_frame().context("frame acquisition failed")? else {
            return Ok(None);
        };
        let faces = self
            .detector
            .detect(&frame.image)
            .context("face detection failed")?;
        tracing::trace!(sequence = frame.sequence, faces = faces.len(), "frame");
        Ok(Some((frame, faces)))
    }
}

#[derive(Debug)]
pub enum EnrollOutcome {
    Registered(EnrolledIdentity),
    Cancelled,
    /// The frame source ended before enough photos were taken.
    SourceExhausted { captured: usize },
}

/// Drive an enrollment session until it is persisted, cancelled or starved.
pub fn run_enrollment(
    io: &mut SessionIo<'_>,
    store: &EnrollmentStore,
    session: &mut EnrollmentSession,
) -> Result<EnrollOutcome> {
    loop {
        let Some((frame, faces)) = io.next()? else {
            return Ok(EnrollOutcome::SourceExhausted {
                captured: session.captured(),
            });
        };

        let trigger = io.controls.poll();
        let step = session.on_frame(&frame.image, &faces, trigger, frame.timestamp);
        io.renderer.render(&frame, &enrollment_overlay(session, &step, &faces));

        if matches!(step, EnrollStep::Cancelled) {
            return Ok(EnrollOutcome::Cancelled);
        }
        if session.state() == EnrollState::Finalizing {
            let identity = session
                .finalize(store)
                .context("failed to persist enrollment")?;
            return Ok(EnrollOutcome::Registered(identity));
        }
    }
}

fn enrollment_overlay(session: &EnrollmentSession, step: &EnrollStep, faces: &[BoundingBox]) -> Overlay {
    let (text, tone) = match step {
        EnrollStep::Captured { count } => (
            format!("Photo {count}/{SAMPLES_PER_ENROLLMENT} captured"),
            Tone::Progress,
        ),
        EnrollStep::Ambiguous { .. } => ("No face or multiple faces detected".to_string(), Tone::Denied),
        EnrollStep::InvalidSample(_) => ("Face region unusable, try again".to_string(), Tone::Denied),
        EnrollStep::Cancelled => ("Enrollment cancelled".to_string(), Tone::Neutral),
        EnrollStep::Idle | EnrollStep::Debounced => (ENROLL_INSTRUCTIONS.to_string(), Tone::Neutral),
    };
    Overlay {
        text,
        tone,
        level: session.progress(),
        detail: Some(format!("Photos: {}", session.captured())),
        boxes: faces.to_vec(),
    }
}

#[derive(Debug, Default)]
pub struct VerifySummary {
    pub frames: usize,
    pub scores: usize,
    /// Verdict on screen when the session ended.
    pub last_verdict: Option<Verdict>,
}

/// Drive a verification session until cancelled or the source ends.
pub fn run_verification(io: &mut SessionIo<'_>, session: &mut VerificationSession) -> Result<VerifySummary> {
    let mut summary = VerifySummary::default();

    while let Some((frame, faces)) = io.next()? {
        summary.frames += 1;

        match session.on_frame(&frame.image, &faces, frame.timestamp) {
            Ok(VerifyPhase::Scoring) => summary.scores += 1,
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "skipping unusable face region"),
        }

        io.renderer.render(&frame, &verification_overlay(session.verdict()));

        if io.controls.poll() == Some(Trigger::Cancel) {
            tracing::info!("verification ended by user");
            break;
        }
    }

    summary.last_verdict = session.verdict().cloned();
    Ok(summary)
}

fn verification_overlay(verdict: Option<&Verdict>) -> Overlay {
    let Some(verdict) = verdict else {
        return Overlay::blank();
    };
    Overlay {
        text: verdict.banner(),
        tone: if verdict.matched {
            Tone::Accepted
        } else {
            Tone::Denied
        },
        level: verdict.confidence,
        detail: Some(format!(
            "Confidence Level: {}%",
            (verdict.confidence * 100.0).round() as u32
        )),
        boxes: vec![verdict.bound_box],
    }
}
