//! Verification session: throttled per-frame scoring against the enrolled
//! gallery, with a verdict that stays on screen until superseded or expired.

use crate::sample::{FaceSample, SampleError};
use crate::store::{EnrollmentStore, StoreError};
use crate::types::{BoundingBox, CosineMatcher, EnrolledIdentity, Matcher, DEFAULT_MATCH_THRESHOLD};
use image::RgbImage;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Confidence must be strictly above this to match.
    pub threshold: f32,
    /// Minimum time between two scoring passes.
    pub score_interval: Duration,
    /// How long a verdict survives frames with no face after its score.
    pub verdict_expiry: Duration,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            score_interval: Duration::from_millis(300),
            verdict_expiry: Duration::from_secs(2),
        }
    }
}

/// Who a positive verdict refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedIdentity {
    pub id: String,
    pub name: String,
}

/// The decision currently on screen.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub matched: bool,
    /// Set only when `matched`.
    pub identity: Option<MatchedIdentity>,
    /// Best similarity, in [0, 1].
    pub confidence: f32,
    /// Region the verdict is drawn around; follows the sole detected face.
    pub bound_box: BoundingBox,
    pub created_at: Instant,
}

impl Verdict {
    pub fn banner(&self) -> String {
        match &self.identity {
            Some(identity) if self.matched => {
                format!("Welcome, {} (ID: {})", identity.name, identity.id)
            }
            _ => "Access Denied - Identity Not Verified".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPhase {
    /// Nothing scored yet.
    Idle,
    /// A fresh verdict was produced this frame.
    Scoring,
    /// An earlier verdict is still shown.
    Displaying,
    /// The last verdict was cleared after the subject left.
    Expired,
}

pub struct VerificationSession<M: Matcher = CosineMatcher> {
    gallery: Vec<EnrolledIdentity>,
    matcher: M,
    config: VerifyConfig,
    phase: VerifyPhase,
    verdict: Option<Verdict>,
    last_scored_at: Option<Instant>,
}

impl VerificationSession<CosineMatcher> {
    pub fn new(gallery: Vec<EnrolledIdentity>, config: VerifyConfig) -> Self {
        Self::with_matcher(gallery, CosineMatcher, config)
    }

    /// Load the whole store once and start a session over it.
    ///
    /// An empty store is valid: every face then scores as "no match".
    pub fn open(store: &EnrollmentStore, config: VerifyConfig) -> Result<Self, StoreError> {
        let report = store.load_all()?;
        if report.skipped > 0 {
            tracing::warn!(skipped = report.skipped, "some enrolled identities could not be loaded");
        }
        if report.identities.is_empty() {
            tracing::warn!("no enrolled identities; every face will be denied");
        }
        Ok(Self::new(report.identities, config))
    }
}

impl<M: Matcher> VerificationSession<M> {
    pub fn with_matcher(gallery: Vec<EnrolledIdentity>, matcher: M, config: VerifyConfig) -> Self {
        tracing::info!(
            identities = gallery.len(),
            threshold = config.threshold,
            "verification session ready"
        );
        Self {
            gallery,
            matcher,
            config,
            phase: VerifyPhase::Idle,
            verdict: None,
            last_scored_at: None,
        }
    }

    pub fn gallery(&self) -> &[EnrolledIdentity] {
        &self.gallery
    }

    pub fn phase(&self) -> VerifyPhase {
        self.phase
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        self.verdict.as_ref()
    }

    /// Advance the session by one frame.
    ///
    /// Only a frame with exactly one face is scored, and no more often than
    /// `score_interval`. A frame with no face clears the verdict once
    /// `verdict_expiry` has passed since the last score. On error the
    /// session is left untouched.
    pub fn on_frame(
        &mut self,
        frame: &RgbImage,
        faces: &[BoundingBox],
        now: Instant,
    ) -> Result<VerifyPhase, SampleError> {
        match faces {
            [face] if self.score_due(now) => {
                let sample = FaceSample::from_region(frame, face)?;
                self.score(&sample, *face, now);
                self.phase = VerifyPhase::Scoring;
            }
            [face] => {
                if let Some(verdict) = self.verdict.as_mut() {
                    verdict.bound_box = *face;
                    self.phase = VerifyPhase::Displaying;
                }
            }
            [] if self.expired(now) => {
                self.verdict = None;
                self.phase = VerifyPhase::Expired;
                tracing::info!("verdict expired");
            }
            _ => {
                if self.verdict.is_some() {
                    self.phase = VerifyPhase::Displaying;
                }
            }
        }
        Ok(self.phase)
    }

    fn score_due(&self, now: Instant) -> bool {
        self.last_scored_at
            .map_or(true, |last| now.saturating_duration_since(last) >= self.config.score_interval)
    }

    fn expired(&self, now: Instant) -> bool {
        self.verdict.is_some()
            && self
                .last_scored_at
                .is_some_and(|last| now.saturating_duration_since(last) > self.config.verdict_expiry)
    }

    fn score(&mut self, sample: &FaceSample, face: BoundingBox, now: Instant) {
        let query = sample.to_vector();
        let best = self.matcher.best_match(&query, &self.gallery);
        let matched = best.is_match(self.config.threshold);
        let identity = best.identity.filter(|_| matched).map(|i| MatchedIdentity {
            id: i.id().to_string(),
            name: i.name().to_string(),
        });

        let changed = self
            .verdict
            .as_ref()
            .map_or(true, |prev| prev.matched != matched || prev.identity != identity);
        if changed {
            tracing::info!(
                matched,
                id = identity.as_ref().map(|i| i.id.as_str()),
                confidence = best.confidence,
                "verdict changed"
            );
        } else {
            tracing::debug!(matched, confidence = best.confidence, "face rescored");
        }

        self.verdict = Some(Verdict {
            matched,
            identity,
            confidence: best.confidence,
            bound_box: face,
            created_at: now,
        });
        self.last_scored_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SAMPLE_LEN;
    use image::Rgb;

    const FACE: BoundingBox = BoundingBox {
        x: 0,
        y: 0,
        width: 128,
        height: 128,
    };

    fn solid_frame(rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(128, 128, Rgb(rgb))
    }

    fn identity(id: &str, name: &str, rgb: [u8; 3]) -> EnrolledIdentity {
        let bytes: Vec<u8> = rgb.iter().copied().cycle().take(SAMPLE_LEN).collect();
        let sample = FaceSample::from_raw(bytes).unwrap();
        EnrolledIdentity::from_samples(id, name, vec![sample; 3]).unwrap()
    }

    fn session() -> VerificationSession {
        VerificationSession::new(
            vec![
                identity("1001", "Ayu", [0, 200, 0]),
                identity("1002", "Budi", [0, 0, 200]),
            ],
            VerifyConfig::default(),
        )
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_identical_face_matches() {
        let mut s = session();
        let phase = s.on_frame(&solid_frame([0, 200, 0]), &[FACE], Instant::now()).unwrap();
        assert_eq!(phase, VerifyPhase::Scoring);

        let verdict = s.verdict().unwrap();
        assert!(verdict.matched);
        assert!((verdict.confidence - 1.0).abs() < 1e-6);
        assert_eq!(verdict.identity.as_ref().map(|i| i.id.as_str()), Some("1001"));
        assert_eq!(verdict.banner(), "Welcome, Ayu (ID: 1001)");
    }

    #[test]
    fn test_orthogonal_face_denied() {
        let mut s = session();
        s.on_frame(&solid_frame([200, 0, 0]), &[FACE], Instant::now()).unwrap();

        let verdict = s.verdict().unwrap();
        assert!(!verdict.matched);
        assert!(verdict.confidence.abs() < 1e-6);
        assert!(verdict.identity.is_none());
        assert_eq!(verdict.banner(), "Access Denied - Identity Not Verified");
    }

    #[test]
    fn test_empty_gallery_denies() {
        let mut s = VerificationSession::new(Vec::new(), VerifyConfig::default());
        s.on_frame(&solid_frame([10, 10, 10]), &[FACE], Instant::now()).unwrap();
        let verdict = s.verdict().unwrap();
        assert!(!verdict.matched);
        assert_eq!(verdict.confidence, 0.0);
    }

    #[test]
    fn test_open_from_store() {
        let store = EnrollmentStore::open_in_memory().unwrap();
        store.save(&identity("9", "Citra", [50, 60, 70])).unwrap();

        let mut s = VerificationSession::open(&store, VerifyConfig::default()).unwrap();
        assert_eq!(s.gallery().len(), 1);
        s.on_frame(&solid_frame([50, 60, 70]), &[FACE], Instant::now()).unwrap();
        assert!(s.verdict().unwrap().matched);
    }

    #[test]
    fn test_open_fails_when_store_cannot_be_read() {
        let path = std::env::temp_dir().join(format!("facegate-verify-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let store = EnrollmentStore::open(&path).unwrap();
        store.save(&identity("9", "Citra", [50, 60, 70])).unwrap();

        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE identities")
            .unwrap();

        let result = VerificationSession::open(&store, VerifyConfig::default());
        assert!(matches!(result, Err(StoreError::Unavailable { .. })));

        drop(store);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_rescoring_is_throttled() {
        let mut s = session();
        let t0 = Instant::now();
        s.on_frame(&solid_frame([0, 200, 0]), &[FACE], t0).unwrap();

        // A different face inside the interval keeps the old verdict.
        let phase = s.on_frame(&solid_frame([0, 0, 200]), &[FACE], t0 + ms(100)).unwrap();
        assert_eq!(phase, VerifyPhase::Displaying);
        assert_eq!(s.verdict().unwrap().identity.as_ref().unwrap().id, "1001");

        let phase = s.on_frame(&solid_frame([0, 0, 200]), &[FACE], t0 + ms(300)).unwrap();
        assert_eq!(phase, VerifyPhase::Scoring);
        assert_eq!(s.verdict().unwrap().identity.as_ref().unwrap().id, "1002");
        assert_eq!(s.verdict().unwrap().created_at, t0 + ms(300));
    }

    #[test]
    fn test_box_follows_face_between_scores() {
        let mut s = session();
        let t0 = Instant::now();
        let frame = RgbImage::from_pixel(320, 240, Rgb([0, 200, 0]));
        s.on_frame(&frame, &[FACE], t0).unwrap();

        let moved = BoundingBox::new(20, 10, 128, 128);
        s.on_frame(&frame, &[moved], t0 + ms(50)).unwrap();
        assert_eq!(s.verdict().unwrap().bound_box, moved);
    }

    #[test]
    fn test_multiple_faces_keep_last_verdict() {
        let mut s = session();
        let t0 = Instant::now();
        s.on_frame(&solid_frame([0, 200, 0]), &[FACE], t0).unwrap();

        let other = BoundingBox::new(10, 10, 50, 50);
        let phase = s
            .on_frame(&solid_frame([0, 0, 200]), &[FACE, other], t0 + ms(3000))
            .unwrap();
        assert_eq!(phase, VerifyPhase::Displaying);
        assert!(s.verdict().unwrap().matched);
        assert_eq!(s.verdict().unwrap().created_at, t0);
    }

    #[test]
    fn test_verdict_survives_short_absence() {
        let mut s = session();
        let t0 = Instant::now();
        s.on_frame(&solid_frame([0, 200, 0]), &[FACE], t0).unwrap();

        for step in [100, 800, 1500, 1999] {
            let phase = s.on_frame(&solid_frame([0, 0, 0]), &[], t0 + ms(step)).unwrap();
            assert_eq!(phase, VerifyPhase::Displaying);
        }
        assert!(s.verdict().unwrap().matched);
    }

    #[test]
    fn test_verdict_expires_after_long_absence() {
        let mut s = session();
        let t0 = Instant::now();
        s.on_frame(&solid_frame([0, 200, 0]), &[FACE], t0).unwrap();

        s.on_frame(&solid_frame([0, 0, 0]), &[], t0 + ms(1000)).unwrap();
        let phase = s.on_frame(&solid_frame([0, 0, 0]), &[], t0 + ms(2100)).unwrap();
        assert_eq!(phase, VerifyPhase::Expired);
        assert!(s.verdict().is_none());

        // Stays cleared, and the next face is scored straight away.
        assert_eq!(s.on_frame(&solid_frame([0, 0, 0]), &[], t0 + ms(2200)).unwrap(), VerifyPhase::Expired);
        let phase = s.on_frame(&solid_frame([0, 0, 200]), &[FACE], t0 + ms(2300)).unwrap();
        assert_eq!(phase, VerifyPhase::Scoring);
        assert_eq!(s.verdict().unwrap().identity.as_ref().unwrap().id, "1002");
    }

    #[test]
    fn test_invalid_region_leaves_state_untouched() {
        let mut s = session();
        let t0 = Instant::now();
        s.on_frame(&solid_frame([0, 200, 0]), &[FACE], t0).unwrap();

        let outside = BoundingBox::new(500, 500, 40, 40);
        let err = s.on_frame(&solid_frame([0, 0, 200]), &[outside], t0 + ms(400));
        assert!(matches!(err, Err(SampleError::EmptyRegion { .. })));
        assert_eq!(s.verdict().unwrap().created_at, t0);
        assert_eq!(s.verdict().unwrap().bound_box, FACE);
    }

    #[test]
    fn test_idle_until_first_face() {
        let mut s = session();
        let phase = s.on_frame(&solid_frame([0, 0, 0]), &[], Instant::now()).unwrap();
        assert_eq!(phase, VerifyPhase::Idle);
        assert!(s.verdict().is_none());
    }

    #[test]
    fn test_custom_threshold() {
        let config = VerifyConfig {
            threshold: 0.5,
            ..VerifyConfig::default()
        };
        let mut s = VerificationSession::new(vec![identity("1", "Dewi", [200, 100, 0])], config);
        // cos((200,100,0), (100,200,0)) = 0.8
        s.on_frame(&solid_frame([100, 200, 0]), &[FACE], Instant::now()).unwrap();
        assert!(s.verdict().unwrap().matched);
    }
}
