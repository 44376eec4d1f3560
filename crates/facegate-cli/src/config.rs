use anyhow::{Context, Result};
use facegate_core::{EnrollConfig, VerifyConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// CLI configuration: defaults, then an optional TOML file, then `FACEGATE_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the SCRFD ONNX model.
    pub model_dir: PathBuf,
    /// Path to the SQLite enrollment database.
    pub db_path: PathBuf,
    /// Cosine similarity a face must exceed to match.
    pub match_threshold: f32,
    /// Minimum time between verification scoring passes.
    pub score_interval_ms: u64,
    /// How long a verdict survives with no face in view.
    pub verdict_expiry_ms: u64,
    /// Minimum time between accepted enrollment captures.
    pub capture_interval_ms: u64,
    /// Minimum SCRFD detection score.
    pub detector_confidence: f32,
    /// Frames discarded at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Timestamp spacing of replayed frames.
    pub replay_frame_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: PathBuf::from("/usr/share/facegate/models"),
            db_path: data_dir.join("faces.db"),
            match_threshold: facegate_core::types::DEFAULT_MATCH_THRESHOLD,
            score_interval_ms: 300,
            verdict_expiry_ms: 2000,
            capture_interval_ms: 1000,
            detector_confidence: facegate_core::detector::DEFAULT_CONFIDENCE_THRESHOLD,
            warmup_frames: 4,
            replay_frame_ms: 33,
        }
    }
}

impl Config {
    /// Load configuration, reading `path` as TOML when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_toml(&text)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(base.with_env_overrides())
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn with_env_overrides(self) -> Self {
        Self {
            camera_device: env_or("FACEGATE_CAMERA_DEVICE", self.camera_device),
            model_dir: env_or("FACEGATE_MODEL_DIR", self.model_dir),
            db_path: env_or("FACEGATE_DB_PATH", self.db_path),
            match_threshold: env_or("FACEGATE_MATCH_THRESHOLD", self.match_threshold),
            score_interval_ms: env_or("FACEGATE_SCORE_INTERVAL_MS", self.score_interval_ms),
            verdict_expiry_ms: env_or("FACEGATE_VERDICT_EXPIRY_MS", self.verdict_expiry_ms),
            capture_interval_ms: env_or("FACEGATE_CAPTURE_INTERVAL_MS", self.capture_interval_ms),
            detector_confidence: env_or("FACEGATE_DETECTOR_CONFIDENCE", self.detector_confidence),
            warmup_frames: env_or("FACEGATE_WARMUP_FRAMES", self.warmup_frames),
            replay_frame_ms: env_or("FACEGATE_REPLAY_FRAME_MS", self.replay_frame_ms),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    pub fn enroll_config(&self) -> EnrollConfig {
        EnrollConfig {
            capture_interval: Duration::from_millis(self.capture_interval_ms),
        }
    }

    pub fn verify_config(&self) -> VerifyConfig {
        VerifyConfig {
            threshold: self.match_threshold,
            score_interval: Duration::from_millis(self.score_interval_ms),
            verdict_expiry: Duration::from_millis(self.verdict_expiry_ms),
        }
    }

    pub fn replay_frame_period(&self) -> Duration {
        Duration::from_millis(self.replay_frame_ms)
    }
}

/// Parse `key` from the environment, keeping `default` when unset or invalid.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_design_constants() {
        let config = Config::default();
        let verify = config.verify_config();
        assert_eq!(verify.threshold, 0.85);
        assert_eq!(verify.score_interval, Duration::from_millis(300));
        assert_eq!(verify.verdict_expiry, Duration::from_secs(2));
        assert_eq!(config.enroll_config().capture_interval, Duration::from_secs(1));
        assert!(config.db_path.ends_with("facegate/faces.db"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            camera_device = "/dev/video4"
            match_threshold = 0.9
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.match_threshold, 0.9);
        assert_eq!(config.score_interval_ms, 300);
        assert_eq!(config.warmup_frames, 4);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(Config::from_toml("match_threshold = \"high\"").is_err());
    }

    #[test]
    fn test_model_path() {
        let config = Config::from_toml("model_dir = \"/opt/models\"").unwrap();
        assert_eq!(config.scrfd_model_path(), PathBuf::from("/opt/models/det_10g.onnx"));
    }

    #[test]
    fn test_env_or_unset_keeps_default() {
        assert_eq!(env_or("FACEGATE_TEST_UNSET_KEY_7F3A", 42u64), 42);
    }
}
