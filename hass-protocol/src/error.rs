//! Error types for the hass-protocol crate.

/// Errors raised while encoding or decoding hub frames.
///
/// Every decoding failure is a protocol violation from the hub's side: the
/// frame was not valid JSON, carried an unknown `type`, or was missing a
/// field the contract requires.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON
    #[error("Malformed frame: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// The frame had no `type` discriminator
    #[error("Frame is missing the `type` discriminator")]
    MissingType,

    /// The frame carried a `type` the bridge does not understand
    #[error("Unrecognized frame type: {0}")]
    UnrecognizedType(String),

    /// A required field was absent or had the wrong shape
    #[error("Invalid `{frame_type}` frame: {reason}")]
    InvalidFrame {
        /// The frame's `type` discriminator
        frame_type: String,
        /// What was wrong with it
        reason: String,
    },

    /// An outgoing request could not be encoded
    #[error("Failed to encode request: {0}")]
    Encode(String),
}

/// Convenience type alias for Results using ProtocolError.
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let error = ProtocolError::UnrecognizedType("bogus".to_string());
        assert_eq!(error.to_string(), "Unrecognized frame type: bogus");

        let error = ProtocolError::InvalidFrame {
            frame_type: "result".to_string(),
            reason: "missing id".to_string(),
        };
        assert_eq!(error.to_string(), "Invalid `result` frame: missing id");

        assert_eq!(
            ProtocolError::MissingType.to_string(),
            "Frame is missing the `type` discriminator"
        );
    }

    #[test]
    fn test_conversion_from_serde_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: ProtocolError = json_error.into();
        assert!(matches!(error, ProtocolError::MalformedJson(_)));
        assert!(error.to_string().starts_with("Malformed frame"));
    }
}
