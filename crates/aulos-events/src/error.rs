use std::fmt;

/// Broad family an error belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Presentation element / source extension failure.
    Media,
    /// Transport failure (manifest or segment).
    Network,
    /// Content-protection failure.
    EncryptedMedia,
    /// Anything the engine could not classify.
    Other,
}

/// Stable machine-readable error codes surfaced to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    MediaStartingTimeNotFound,
    MediaSourceOpenError,
    BufferAppendError,
    BufferFull,
    ManifestFetchError,
    ManifestParseError,
    SegmentFetchError,
    SegmentParseError,
    InvalidKeySystem,
    IncompatibleKeySystems,
    LicenseRequestError,
    ServerCertificateError,
    SessionError,
    MediaElementError,
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Cloneable snapshot of an engine error, carried by warning and fatal
/// events. The full error (with source chain) lives on the engine side;
/// subscribers only need the classification and a rendered message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: String,
    pub fatal: bool,
}

impl ErrorReport {
    #[must_use]
    pub fn new(kind: ErrorKind, code: ErrorCode, message: impl Into<String>, fatal: bool) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            fatal,
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{} ({}): {}",
            self.kind,
            self.code,
            if self.fatal { "fatal" } else { "warning" },
            self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_display_includes_severity() {
        let report = ErrorReport::new(
            ErrorKind::Network,
            ErrorCode::SegmentFetchError,
            "HTTP 503",
            false,
        );
        let rendered = report.to_string();
        assert!(rendered.contains("warning"));
        assert!(rendered.contains("SegmentFetchError"));
    }
}
