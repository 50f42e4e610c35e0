use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QmpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message is not a JSON object: {0}")]
    NotAnObject(String),

    #[error("Event without a string name: {0}")]
    BadEvent(String),

    #[error("Expected QMP greeting, got: {0}")]
    MissingGreeting(String),

    #[error("Unexpected QMP greeting while waiting for {0}")]
    UnexpectedGreeting(String),

    #[error("Command '{command}' failed: {detail}")]
    CommandFailed { command: String, detail: String },

    #[error("Reply to '{command}' has no '{field}' field")]
    MissingField {
        command: String,
        field: &'static str,
    },

    #[error("Unrecognised migration status '{0}'")]
    UnknownStatus(String),

    #[error("Timed out after {after:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        after: Duration,
    },

    #[error("No reply to '{command}' after absorbing {count} events")]
    EventFlood { command: String, count: usize },
}

impl QmpError {
    /// True when the peer said something it should not have, as opposed to
    /// the transport failing or a wait running out.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            QmpError::Json(_)
                | QmpError::NotAnObject(_)
                | QmpError::BadEvent(_)
                | QmpError::MissingGreeting(_)
                | QmpError::UnexpectedGreeting(_)
                | QmpError::CommandFailed { .. }
                | QmpError::MissingField { .. }
                | QmpError::UnknownStatus(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QmpError>;
