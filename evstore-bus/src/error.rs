//! Error types for the message bus.

/// Error type for bus operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The bus could not be reached or refused the operation.
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    /// Connection setup failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Error reported by the Iggy SDK.
    #[error("iggy error: {0}")]
    Iggy(String),

    /// A message could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The named topic is not known to this bus.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
}

impl From<iggy::prelude::IggyError> for Error {
    fn from(e: iggy::prelude::IggyError) -> Self {
        Error::Iggy(e.to_string())
    }
}

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_displays_reason() {
        let err = Error::Unavailable("broker down".to_string());
        assert_eq!(err.to_string(), "bus unavailable: broker down");
    }

    #[test]
    fn serialization_converts_from_serde() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
