//! Verdict presentation. The session loops only ever hand an [`Overlay`] to a
//! [`Renderer`]; nothing flows back into matching.

use facegate_core::BoundingBox;
use facegate_hw::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Neutral,
    Progress,
    Accepted,
    Denied,
}

/// Everything drawn on top of a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub text: String,
    pub tone: Tone,
    /// Confidence (verification) or capture progress (enrollment), in [0, 1].
    pub level: f32,
    /// Secondary line, e.g. "Photos: 2" or "Confidence Level: 97%".
    pub detail: Option<String>,
    pub boxes: Vec<BoundingBox>,
}

impl Overlay {
    pub fn blank() -> Self {
        Self {
            text: String::new(),
            tone: Tone::Neutral,
            level: 0.0,
            detail: None,
            boxes: Vec::new(),
        }
    }
}

pub trait Renderer {
    fn render(&mut self, frame: &Frame, overlay: &Overlay);
}

/// Prints the banner to the terminal whenever its text, tone or detail line
/// changes, so a re-score with a new confidence prints again.
#[derive(Default)]
pub struct ConsoleRenderer {
    last: Option<(String, Tone, Option<String>)>,
}

impl ConsoleRenderer {
    fn changed(&mut self, overlay: &Overlay) -> bool {
        let current = (overlay.text.clone(), overlay.tone, overlay.detail.clone());
        if self.last.as_ref() == Some(&current) {
            return false;
        }
        self.last = Some(current);
        true
    }
}

impl Renderer for ConsoleRenderer {
    fn render(&mut self, frame: &Frame, overlay: &Overlay) {
        if !self.changed(overlay) {
            return;
        }

        tracing::debug!(
            sequence = frame.sequence,
            tone = ?overlay.tone,
            level = overlay.level,
            boxes = overlay.boxes.len(),
            "overlay changed"
        );
        if overlay.text.is_empty() {
            return;
        }
        match &overlay.detail {
            Some(detail) => println!("{}  [{detail}]", overlay.text),
            None => println!("{}", overlay.text),
        }
    }
}
