pub mod record;
pub mod session;

pub use record::{LocalizationEntry, PatientRecord};
pub use session::{
    CaptureSession, FailureReason, SessionChange, SessionEvent, SessionStateKind,
    VerifiedLocalization,
};
