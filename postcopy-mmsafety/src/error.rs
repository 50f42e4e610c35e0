use crate::instance::{LaunchError, Role};
use crate::phase::Phase;
use crate::qmp::QmpError;
use crate::serial::SerialError;
use crate::uffd::Support;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// How far a bounded wait went before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitBound {
    Elapsed(Duration),
    Events(usize),
}

impl fmt::Display for WaitBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitBound::Elapsed(after) => write!(f, "{:?}", after),
            WaitBound::Events(count) => write!(f, "{} events", count),
        }
    }
}

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Environment unsupported: {0}")]
    EnvironmentUnsupported(Support),

    #[error("Protocol violation during {phase}: {detail}")]
    ProtocolViolation { phase: Phase, detail: String },

    #[error("Timed out during {phase} waiting for {waiting_for} (gave up after {bound})")]
    Timeout {
        phase: Phase,
        waiting_for: String,
        bound: WaitBound,
    },

    #[error("Control channel to {role} failed during {phase}: {source}")]
    Qmp {
        phase: Phase,
        role: Role,
        #[source]
        source: QmpError,
    },

    #[error("Failed to launch {role} instance: {source}")]
    Launch {
        role: Role,
        #[source]
        source: LaunchError,
    },

    #[error("IO error during {phase}: {source}")]
    Io {
        phase: Phase,
        #[source]
        source: std::io::Error,
    },

    #[error("Run cancelled")]
    Cancelled,
}

impl HarnessError {
    pub fn phase(&self) -> Option<Phase> {
        match self {
            HarnessError::ProtocolViolation { phase, .. }
            | HarnessError::Timeout { phase, .. }
            | HarnessError::Qmp { phase, .. }
            | HarnessError::Io { phase, .. } => Some(*phase),
            HarnessError::Launch { .. } => Some(Phase::Init),
            HarnessError::EnvironmentUnsupported(_) | HarnessError::Cancelled => None,
        }
    }

    pub fn protocol(phase: Phase, detail: impl Into<String>) -> Self {
        HarnessError::ProtocolViolation {
            phase,
            detail: detail.into(),
        }
    }

    /// Sort a control channel error into the harness taxonomy.
    pub fn from_qmp(phase: Phase, role: Role, err: QmpError) -> Self {
        match err {
            QmpError::Timeout { waiting_for, after } => HarnessError::Timeout {
                phase,
                waiting_for,
                bound: WaitBound::Elapsed(after),
            },
            QmpError::EventFlood { command, count } => HarnessError::Timeout {
                phase,
                waiting_for: format!("reply to '{command}' from {role}"),
                bound: WaitBound::Events(count),
            },
            err if err.is_protocol_violation() => HarnessError::ProtocolViolation {
                phase,
                detail: format!("{role}: {err}"),
            },
            source => HarnessError::Qmp {
                phase,
                role,
                source,
            },
        }
    }

    pub fn from_serial(phase: Phase, err: SerialError) -> Self {
        match err {
            SerialError::UnexpectedByte { .. } => HarnessError::ProtocolViolation {
                phase,
                detail: err.to_string(),
            },
            SerialError::Timeout { ref path, after } => HarnessError::Timeout {
                phase,
                waiting_for: format!("boot sentinel on {}", path.display()),
                bound: WaitBound::Elapsed(after),
            },
            SerialError::Io { source, .. } => HarnessError::Io { phase, source },
        }
    }
}
