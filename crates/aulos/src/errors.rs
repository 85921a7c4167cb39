use aulos_drm::DrmError;
use aulos_events::{ErrorCode, ErrorKind, ErrorReport};
use thiserror::Error;

pub type PlayerResult<T> = Result<T, PlayerError>;

/// Engine error catalog.
///
/// Every error carries a stable [`ErrorCode`] and a `fatal` flag. Fatal
/// errors terminate the orchestrator with a final `Fatal` event; non-fatal
/// ones surface as `Warning` and playback continues.
#[derive(Debug, Error, Clone)]
pub enum PlayerError {
    #[error("media error [{code}]: {reason}")]
    Media {
        code: ErrorCode,
        reason: String,
        fatal: bool,
    },

    #[error("network error [{code}]: {reason}")]
    Network {
        code: ErrorCode,
        reason: String,
        fatal: bool,
    },

    #[error("encrypted media error [{code}]: {source}")]
    EncryptedMedia {
        code: ErrorCode,
        #[source]
        source: DrmError,
        fatal: bool,
    },

    #[error("unknown error [{code}]: {reason}")]
    Other {
        code: ErrorCode,
        reason: String,
        fatal: bool,
    },
}

impl PlayerError {
    pub fn media(code: ErrorCode, reason: impl Into<String>, fatal: bool) -> Self {
        Self::Media {
            code,
            reason: reason.into(),
            fatal,
        }
    }

    pub fn network(code: ErrorCode, reason: impl Into<String>, fatal: bool) -> Self {
        Self::Network {
            code,
            reason: reason.into(),
            fatal,
        }
    }

    /// Wrap a protection error, deriving code and fatality from it.
    #[must_use]
    pub fn encrypted(source: DrmError) -> Self {
        let code = match &source {
            DrmError::IncompatibleKeySystems => ErrorCode::IncompatibleKeySystems,
            DrmError::InvalidKeySystem(_) | DrmError::StorageRequired => {
                ErrorCode::InvalidKeySystem
            }
            DrmError::LicenseRequest { .. } => ErrorCode::LicenseRequestError,
            DrmError::ServerCertificate(_) => ErrorCode::ServerCertificateError,
            DrmError::Session(_) | DrmError::Cdm(_) | DrmError::Disposed => ErrorCode::SessionError,
        };
        let fatal = source.is_fatal();
        Self::EncryptedMedia {
            code,
            source,
            fatal,
        }
    }

    pub fn other(reason: impl Into<String>, fatal: bool) -> Self {
        Self::Other {
            code: ErrorCode::Unknown,
            reason: reason.into(),
            fatal,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Media { .. } => ErrorKind::Media,
            Self::Network { .. } => ErrorKind::Network,
            Self::EncryptedMedia { .. } => ErrorKind::EncryptedMedia,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Media { code, .. }
            | Self::Network { code, .. }
            | Self::EncryptedMedia { code, .. }
            | Self::Other { code, .. } => *code,
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Media { fatal, .. }
            | Self::Network { fatal, .. }
            | Self::EncryptedMedia { fatal, .. }
            | Self::Other { fatal, .. } => *fatal,
        }
    }

    /// Snapshot for event emission.
    #[must_use]
    pub fn report(&self) -> ErrorReport {
        ErrorReport::new(self.kind(), self.code(), self.to_string(), self.is_fatal())
    }
}
