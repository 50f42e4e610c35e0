pub mod client;
pub mod commands;
pub mod error;
pub mod events;
pub mod protocol;

pub use client::{QmpClient, Transport};
pub use error::{QmpError, Result};
pub use events::{EventFilter, ObservedEvent, RunContext};
pub use protocol::{ControlMessage, Event, MigrationStatus, Reply, Request};
