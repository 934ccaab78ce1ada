pub mod error;
pub mod types;
pub mod verifier;

pub use error::{IntegrityError, IntegrityResult};
pub use types::{SegmentSource, VerificationSummary};
pub use verifier::IntegrityVerifier;
