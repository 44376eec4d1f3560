//! facegate-core: identity matching pipeline.
//!
//! Raw-pixel face vectors, a SQLite enrollment store, cosine matching, and
//! the per-frame enrollment and verification state machines. Face detection
//! (SCRFD via ONNX Runtime) sits behind the [`FaceDetector`] trait.

pub mod detector;
pub mod enroll;
pub mod sample;
pub mod store;
pub mod types;
pub mod verify;

pub use detector::{FaceDetector, ScrfdDetector};
pub use enroll::{EnrollConfig, EnrollState, EnrollStep, EnrollmentSession, Trigger};
pub use sample::{FaceSample, SampleError};
pub use store::{EnrollmentStore, StoreError};
pub use types::{BestMatch, BoundingBox, CosineMatcher, EnrolledIdentity, FaceVector, Matcher};
pub use verify::{VerificationSession, Verdict, VerifyConfig, VerifyPhase};
