use thiserror::Error;
use url::Url;

pub type NetResult<T> = Result<T, NetError>;

/// Centralized transport error type.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    #[error("Timeout")]
    Timeout,

    #[error("HTTP {status} for URL: {url}")]
    Status { status: u16, url: Url },

    #[error("Transport failed: {0}")]
    Transport(String),

    #[error("Request failed after {attempts} attempts: {source}")]
    RetryExhausted { attempts: u32, source: Box<Self> },

    #[error("Cancelled")]
    Cancelled,
}

impl NetError {
    /// Whether a retry may succeed.
    ///
    /// Server-side failures (5xx), throttling (429) and timeouts (408,
    /// transport-level) are transient; client errors are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            Self::Transport(reason) => {
                reason.contains("timeout")
                    || reason.contains("connection")
                    || reason.contains("network")
                    || reason.contains("body")
            }
            Self::RetryExhausted { .. } | Self::Cancelled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn test_url(raw: &str) -> Url {
        Url::parse(raw).expect("valid test URL")
    }

    #[rstest]
    #[case::timeout(NetError::Timeout, true)]
    #[case::http_500(NetError::Status { status: 500, url: test_url("http://example.com") }, true)]
    #[case::http_503(NetError::Status { status: 503, url: test_url("http://example.com") }, true)]
    #[case::http_429(NetError::Status { status: 429, url: test_url("http://example.com") }, true)]
    #[case::http_408(NetError::Status { status: 408, url: test_url("http://example.com") }, true)]
    #[case::http_404(NetError::Status { status: 404, url: test_url("http://example.com") }, false)]
    #[case::http_403(NetError::Status { status: 403, url: test_url("http://example.com") }, false)]
    #[case::cancelled(NetError::Cancelled, false)]
    #[case::exhausted(
        NetError::RetryExhausted { attempts: 3, source: Box::new(NetError::Timeout) },
        false
    )]
    fn retryability(#[case] error: NetError, #[case] expected: bool) {
        assert_eq!(error.is_retryable(), expected);
    }

    #[rstest]
    #[case("connection reset by peer", true)]
    #[case("network unreachable", true)]
    #[case("timeout while reading body", true)]
    #[case("invalid certificate", false)]
    fn transport_string_classification(#[case] reason: &str, #[case] expected: bool) {
        assert_eq!(
            NetError::Transport(reason.to_string()).is_retryable(),
            expected
        );
    }

    #[test]
    fn exhausted_display_carries_source() {
        let error = NetError::RetryExhausted {
            attempts: 3,
            source: Box::new(NetError::Timeout),
        };
        assert!(error.to_string().contains("after 3 attempts"));
        assert!(error.to_string().contains("Timeout"));
    }
}
