//! Frame sources: the live camera stream and still-image replay.

use crate::camera::CameraError;
use crate::frame::{self, Frame};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

const REPLAY_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "ppm"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("replay {}: {reason}", path.display())]
    Replay { path: PathBuf, reason: String },
}

impl SourceError {
    fn replay(path: &Path, err: impl std::fmt::Display) -> Self {
        SourceError::Replay {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }
}

/// Produces frames for the session loop, one blocking read per iteration.
pub trait FrameSource {
    /// Wait for the next frame. `Ok(None)` marks the end of the stream.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;
}

/// Replays a directory of still images in file-name order.
///
/// Frames are mirrored like camera frames and stamped at a fixed period
/// from the moment the source was opened.
pub struct ReplaySource {
    pending: VecDeque<PathBuf>,
    started: Instant,
    frame_period: Duration,
    sequence: u32,
}

impl ReplaySource {
    pub fn open(dir: &Path, frame_period: Duration) -> Result<Self, SourceError> {
        let entries = std::fs::read_dir(dir).map_err(|e| SourceError::replay(dir, e))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| REPLAY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        paths.sort();

        tracing::info!(dir = %dir.display(), frames = paths.len(), "replay source opened");

        Ok(Self {
            pending: paths.into(),
            started: Instant::now(),
            frame_period,
            sequence: 0,
        })
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };

        let mut image = image::open(&path)
            .map_err(|e| SourceError::replay(&path, e))?
            .to_rgb8();
        frame::mirror(&mut image);

        let timestamp = self.started + self.frame_period * self.sequence;
        let sequence = self.sequence;
        self.sequence += 1;

        tracing::debug!(path = %path.display(), sequence, "replayed frame");
        Ok(Some(Frame {
            image,
            timestamp,
            sequence,
        }))
    }
}
