use thiserror::Error;

pub type DrmResult<T> = Result<T, DrmError>;

/// Content-protection errors.
///
/// `is_fatal()` distinguishes errors that must terminate playback from
/// those the driver (or the next encrypted event) can recover from.
#[derive(Debug, Error, Clone)]
pub enum DrmError {
    #[error("none of the candidate key systems is supported by this environment")]
    IncompatibleKeySystems,

    #[error("key-system configuration changed mid-playback: {0}")]
    InvalidKeySystem(String),

    #[error("persistent licenses require a license storage")]
    StorageRequired,

    #[error("license request failed: {reason}")]
    LicenseRequest { reason: String, fatal: bool },

    #[error("server certificate rejected: {0}")]
    ServerCertificate(String),

    #[error("key session error: {0}")]
    Session(String),

    #[error("CDM failure: {0}")]
    Cdm(String),

    #[error("protection driver already disposed")]
    Disposed,
}

impl DrmError {
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::IncompatibleKeySystems
            | Self::InvalidKeySystem(_)
            | Self::StorageRequired
            | Self::ServerCertificate(_)
            | Self::Disposed => true,
            Self::LicenseRequest { fatal, .. } => *fatal,
            Self::Session(_) | Self::Cdm(_) => false,
        }
    }
}
