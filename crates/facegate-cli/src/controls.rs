//! Session triggers, polled once per frame without blocking.

use facegate_core::Trigger;
use std::io::BufRead;
use std::sync::mpsc::{self, Receiver};

pub trait Controls {
    /// Return the trigger raised since the last poll, if any.
    fn poll(&mut self) -> Option<Trigger>;
}

/// Reads triggers from stdin lines: Enter (or `c`) captures, `q` or `esc` quits.
///
/// A reader thread feeds a channel so `poll` never waits on the terminal.
pub struct StdinControls {
    rx: Receiver<Trigger>,
}

impl StdinControls {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("facegate-stdin".into())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    let Ok(line) = line else { break };
                    if let Some(trigger) = parse_trigger(&line) {
                        if tx.send(trigger).is_err() {
                            break;
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "stdin reader unavailable; session can only end with Ctrl-C");
        }
        Self { rx }
    }
}

impl Controls for StdinControls {
    fn poll(&mut self) -> Option<Trigger> {
        self.rx.try_recv().ok()
    }
}

/// Fires a capture trigger on every frame unless the inner controls
/// produced something. The enrollment debounce spaces the captures out.
pub struct AutoCapture<C> {
    inner: C,
}

impl<C: Controls> AutoCapture<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C: Controls> Controls for AutoCapture<C> {
    fn poll(&mut self) -> Option<Trigger> {
        self.inner.poll().or(Some(Trigger::Capture))
    }
}

pub fn parse_trigger(line: &str) -> Option<Trigger> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" | "c" | "capture" => Some(Trigger::Capture),
        "q" | "quit" | "esc" | "\u{1b}" => Some(Trigger::Cancel),
        _ => None,
    }
}
