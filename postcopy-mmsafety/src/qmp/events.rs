//! Separating command replies from asynchronous events.
//!
//! QMP multiplexes events and replies on one connection with no correlation
//! ids, so anything that issues a command has to be ready to step over events
//! that arrive first. Those events are not thrown away: they are recorded in
//! the [`RunContext`] of the current run, and a `STOP` seen on the source
//! connection sets the run's stop flag.

use super::client::{QmpClient, Transport};
use super::error::{QmpError, Result};
use super::protocol::{ControlMessage, EVENT_STOP, Event, Reply, Request};
use crate::instance::Role;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ObservedEvent {
    pub role: Role,
    pub event: Event,
}

/// Per-run mutable state shared between phases.
///
/// Created fresh for every run. The stop flag only ever goes false → true.
#[derive(Debug, Default)]
pub struct RunContext {
    stop_seen: bool,
    events: Vec<ObservedEvent>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_seen(&self) -> bool {
        self.stop_seen
    }

    pub fn events(&self) -> &[ObservedEvent] {
        &self.events
    }

    pub fn record(&mut self, role: Role, event: Event) {
        if role == Role::Source && event.name == EVENT_STOP && !self.stop_seen {
            debug!("STOP observed on source connection");
            self.stop_seen = true;
        }
        self.events.push(ObservedEvent { role, event });
    }

    /// Index of the first recorded event named `name` from `role`.
    pub fn position_of(&self, role: Role, name: &str) -> Option<usize> {
        self.events
            .iter()
            .position(|observed| observed.role == role && observed.event.name == name)
    }

    pub fn take_events(&mut self) -> Vec<ObservedEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Reads replies and events for one peer, with bounded waits.
#[derive(Debug, Clone, Copy)]
pub struct EventFilter {
    role: Role,
    max_events: usize,
    reply_timeout: Duration,
}

impl EventFilter {
    pub const DEFAULT_MAX_EVENTS: usize = 10_000;
    pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_events: Self::DEFAULT_MAX_EVENTS,
            reply_timeout: Self::DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events.max(1);
        self
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Return the next reply on the connection, absorbing any events read
    /// before it.
    ///
    /// `awaiting` names the command whose reply is expected and only feeds
    /// diagnostics.
    pub async fn fetch_reply<S: Transport>(
        &self,
        client: &mut QmpClient<S>,
        ctx: &mut RunContext,
        awaiting: &str,
    ) -> Result<Reply> {
        let deadline = Instant::now() + self.reply_timeout;
        let mut absorbed = 0usize;

        loop {
            let message = match timeout_at(deadline, client.receive()).await {
                Ok(message) => message?,
                Err(_) => {
                    return Err(QmpError::Timeout {
                        waiting_for: format!("reply to '{awaiting}' from {}", self.role),
                        after: self.reply_timeout,
                    });
                }
            };

            match message {
                ControlMessage::Reply(reply) => return Ok(reply),
                ControlMessage::Event(event) => {
                    debug!(
                        "Absorbed {} event from {} while awaiting '{}'",
                        event.name, self.role, awaiting
                    );
                    ctx.record(self.role, event);
                    absorbed += 1;
                    if absorbed >= self.max_events {
                        return Err(QmpError::EventFlood {
                            command: awaiting.to_string(),
                            count: absorbed,
                        });
                    }
                }
                ControlMessage::Greeting(_) => {
                    return Err(QmpError::UnexpectedGreeting(format!("'{awaiting}'")));
                }
            }
        }
    }

    /// Send `request` and return the contents of its `return` key.
    ///
    /// A reply without `return` (including QMP `error` replies) is a
    /// [`QmpError::CommandFailed`].
    pub async fn command<S: Transport>(
        &self,
        client: &mut QmpClient<S>,
        ctx: &mut RunContext,
        request: &Request,
    ) -> Result<Value> {
        client.send(request).await?;
        let reply = self.fetch_reply(client, ctx, &request.execute).await?;
        reply.into_return(&request.execute)
    }

    /// Block until an event named `name` arrives.
    ///
    /// Other events are recorded like in [`fetch_reply`](Self::fetch_reply).
    /// Replies cannot be matched to anything here and are dropped.
    pub async fn wait_for_event<S: Transport>(
        &self,
        client: &mut QmpClient<S>,
        ctx: &mut RunContext,
        name: &str,
        timeout: Duration,
    ) -> Result<Event> {
        let deadline = Instant::now() + timeout;

        loop {
            let message = match timeout_at(deadline, client.receive()).await {
                Ok(message) => message?,
                Err(_) => {
                    return Err(QmpError::Timeout {
                        waiting_for: format!("{name} event from {}", self.role),
                        after: timeout,
                    });
                }
            };

            match message {
                ControlMessage::Event(event) if event.name == name => {
                    debug!("{} event received from {}", name, self.role);
                    ctx.record(self.role, event.clone());
                    return Ok(event);
                }
                ControlMessage::Event(event) => {
                    debug!(
                        "Recorded {} event from {} while waiting for {}",
                        event.name, self.role, name
                    );
                    ctx.record(self.role, event);
                }
                ControlMessage::Reply(reply) => {
                    warn!(
                        "Dropping unsolicited reply from {} while waiting for {}: {:?}",
                        self.role, name, reply
                    );
                }
                ControlMessage::Greeting(_) => {
                    return Err(QmpError::UnexpectedGreeting(format!("{name} event")));
                }
            }
        }
    }
}
