//! Error types for the CRM chat assistant

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for assistant operations
pub type Result<T> = std::result::Result<T, AssistantError>;

#[derive(Error, Debug)]
pub enum AssistantError {

    // =============================
    // Data Access
    // =============================

    #[error("Record source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Malformed record at row {row}: {reason}")]
    MalformedRecord { row: usize, reason: String },

    // =============================
    // Startup
    // =============================

    #[error("Missing credential: {0} is not set")]
    CredentialMissing(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // Query Handling
    // =============================

    #[error("LLM upstream error: {0}")]
    UpstreamError(String),

    #[error("No records matched the query")]
    NoRelevantData,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Session {0} belongs to a different user")]
    SessionConflict(Uuid),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv_async::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AssistantError {
    /// Text that is safe to show in the chat transcript.
    pub fn user_message(&self) -> String {
        match self {
            AssistantError::UpstreamError(_) | AssistantError::HttpError(_) => {
                "I'm sorry, I couldn't reach the assistant service just now. \
                 Please try again in a moment."
                    .to_string()
            }
            AssistantError::InvalidInput(reason) => format!("Please try again: {}", reason),
            AssistantError::NoRelevantData => {
                "I couldn't find any proposals or follow-ups matching that question.".to_string()
            }
            AssistantError::SessionNotFound(_) => {
                "Your chat session has expired. Please start a new one.".to_string()
            }
            AssistantError::SessionConflict(_) => {
                "That chat belongs to someone else. Please start a new one.".to_string()
            }
            _ => "Something went wrong while answering. Please try again.".to_string(),
        }
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, AssistantError::UpstreamError(_) | AssistantError::HttpError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_message_is_an_apology() {
        let err = AssistantError::UpstreamError("timed out after 30s".to_string());
        let message = err.user_message();
        assert!(message.contains("sorry"));
        assert!(!message.contains("30s"));
        assert!(err.is_upstream());
    }

    #[test]
    fn test_malformed_record_display() {
        let err = AssistantError::MalformedRecord {
            row: 4,
            reason: "missing client".to_string(),
        };
        assert_eq!(err.to_string(), "Malformed record at row 4: missing client");
    }
}
