//! Phases of a postcopy migration run.
//!
//! Transitions are strictly linear:
//! Init → Configuring → AwaitingBoot → Migrating → AwaitingStop →
//! AwaitingResume → AwaitingCompletion → Cleanup → Done.
//! A fatal error leaves the sequence wherever it happened; Cleanup is only
//! reached by a run that completed.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Starting both instances.
    Init,
    /// Enabling postcopy and throttling the source.
    Configuring,
    /// Waiting for the source guest to print its boot sentinel.
    AwaitingBoot,
    /// Issuing `migrate` and `migrate-start-postcopy`.
    Migrating,
    AwaitingStop,
    AwaitingResume,
    /// Polling `query-migrate` until `completed`.
    AwaitingCompletion,
    Cleanup,
    Done,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::Init,
        Phase::Configuring,
        Phase::AwaitingBoot,
        Phase::Migrating,
        Phase::AwaitingStop,
        Phase::AwaitingResume,
        Phase::AwaitingCompletion,
        Phase::Cleanup,
        Phase::Done,
    ];

    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Init => Some(Phase::Configuring),
            Phase::Configuring => Some(Phase::AwaitingBoot),
            Phase::AwaitingBoot => Some(Phase::Migrating),
            Phase::Migrating => Some(Phase::AwaitingStop),
            Phase::AwaitingStop => Some(Phase::AwaitingResume),
            Phase::AwaitingResume => Some(Phase::AwaitingCompletion),
            Phase::AwaitingCompletion => Some(Phase::Cleanup),
            Phase::Cleanup => Some(Phase::Done),
            Phase::Done => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Configuring => "configuring",
            Phase::AwaitingBoot => "awaiting-boot",
            Phase::Migrating => "migrating",
            Phase::AwaitingStop => "awaiting-stop",
            Phase::AwaitingResume => "awaiting-resume",
            Phase::AwaitingCompletion => "awaiting-completion",
            Phase::Cleanup => "cleanup",
            Phase::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
