//! Error taxonomy returned by [`Manager::call`](crate::Manager::call).

/// Result type using [`AnaError`].
pub type Result<T> = std::result::Result<T, AnaError>;

/// Every non-successful outcome of a managed call.
///
/// `Expired` and `StillRunning` are decisions taken over the tracked state;
/// `Operation` and `Panic` come from the work function itself; `Backend`
/// means the storage contract broke and nothing about the record can be
/// assumed.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AnaError {
    /// The request, or the attempt tracked for it, is past its expiration.
    #[error("Operation {target} expired for key {key}.")]
    Expired { target: String, key: String },

    /// Another attempt holds the claim and has not timed out.
    #[error("Operation {target} still running for key {key}.")]
    StillRunning { target: String, key: String },

    /// The work function panicked.
    #[error("Got panic \"{0}\"")]
    Panic(String),

    /// The work function returned an error.
    #[error("{0}")]
    Operation(anyhow::Error),

    /// The backend refused to commit a successful result.
    #[error("Operation {target} for key {key} was not committed: {cause}")]
    Vetoed {
        target: String,
        key: String,
        cause: String,
    },

    /// Claim, lock, commit or rollback failed.
    #[error("backend error: {0}")]
    Backend(anyhow::Error),
}

impl AnaError {
    pub(crate) fn expired(target: &str, key: &str) -> Self {
        Self::Expired {
            target: target.to_string(),
            key: key.to_string(),
        }
    }

    pub(crate) fn still_running(target: &str, key: &str) -> Self {
        Self::StillRunning {
            target: target.to_string(),
            key: key.to_string(),
        }
    }

    /// Whether the same request may succeed if issued again later.
    ///
    /// Only a concurrent holder clears up by itself; an expired request needs a
    /// new `reference_time`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StillRunning { .. })
    }

    /// Stable error code for logs and wire responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Expired { .. } => "OPERATION_EXPIRED",
            Self::StillRunning { .. } => "OPERATION_STILL_RUNNING",
            Self::Panic(_) => "OPERATION_PANICKED",
            Self::Operation(_) => "OPERATION_FAILED",
            Self::Vetoed { .. } => "OPERATION_VETOED",
            Self::Backend(_) => "BACKEND_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_wire_messages() {
        assert_eq!(
            AnaError::expired("target", "key").to_string(),
            "Operation target expired for key key."
        );
        assert_eq!(
            AnaError::still_running("target", "key").to_string(),
            "Operation target still running for key key."
        );
        assert_eq!(
            AnaError::Panic("Boom!".to_string()).to_string(),
            "Got panic \"Boom!\""
        );
        assert_eq!(
            AnaError::Operation(anyhow::anyhow!("Boom!")).to_string(),
            "Boom!"
        );
    }

    #[test]
    fn test_only_still_running_is_retryable() {
        assert!(AnaError::still_running("t", "k").is_retryable());
        assert!(!AnaError::expired("t", "k").is_retryable());
        assert!(!AnaError::Panic("x".into()).is_retryable());
        assert!(!AnaError::Backend(anyhow::anyhow!("db down")).is_retryable());
    }

    #[test]
    fn test_error_codes() {
        let cases = vec![
            (AnaError::expired("t", "k"), "OPERATION_EXPIRED"),
            (AnaError::still_running("t", "k"), "OPERATION_STILL_RUNNING"),
            (AnaError::Panic("x".into()), "OPERATION_PANICKED"),
            (AnaError::Operation(anyhow::anyhow!("x")), "OPERATION_FAILED"),
            (
                AnaError::Vetoed {
                    target: "t".into(),
                    key: "k".into(),
                    cause: "Operation expired".into(),
                },
                "OPERATION_VETOED",
            ),
            (AnaError::Backend(anyhow::anyhow!("x")), "BACKEND_ERROR"),
        ];

        for (error, expected) in cases {
            assert_eq!(error.error_code(), expected, "code for {:?}", error);
        }
    }
}
