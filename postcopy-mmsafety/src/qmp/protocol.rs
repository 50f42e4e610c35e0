//! QMP wire messages.
//!
//! Every message is a single JSON object on its own line. Requests carry an
//! `execute` key; the server answers with either `return` or `error`, and may
//! interleave asynchronous `event` objects anywhere in the stream. There are
//! no request ids: replies pair with requests purely by order.

use super::error::{QmpError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const EVENT_STOP: &str = "STOP";
pub const EVENT_RESUME: &str = "RESUME";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Request {
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

/// Asynchronous notification, e.g. `{"event": "STOP", "data": {}, ...}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Value::Null,
            timestamp: None,
        }
    }
}

/// A command reply. The raw object is kept so that a reply lacking `return`
/// can still report what the server did send.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply(Map<String, Value>);

impl Reply {
    pub fn new(object: Map<String, Value>) -> Self {
        Self(object)
    }

    pub fn has_return(&self) -> bool {
        self.0.contains_key("return")
    }

    pub fn return_value(&self) -> Option<&Value> {
        self.0.get("return")
    }

    /// `class: desc` from an `{"error": {...}}` reply.
    pub fn error_description(&self) -> Option<String> {
        let error = self.0.get("error")?;
        let desc = error.get("desc").and_then(Value::as_str).unwrap_or("");
        match error.get("class").and_then(Value::as_str) {
            Some(class) => Some(format!("{class}: {desc}")),
            None => Some(desc.to_string()),
        }
    }

    pub fn into_return(mut self, command: &str) -> Result<Value> {
        if let Some(value) = self.0.remove("return") {
            return Ok(value);
        }
        let detail = match self.error_description() {
            Some(desc) => desc,
            None => format!("reply has no 'return' key: {}", Value::Object(self.0)),
        };
        Err(QmpError::CommandFailed {
            command: command.to_string(),
            detail,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// `{"QMP": {...}}`, sent once when the connection opens.
    Greeting(Value),
    Event(Event),
    Reply(Reply),
}

impl ControlMessage {
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)?;
        let Value::Object(object) = value else {
            return Err(QmpError::NotAnObject(line.to_string()));
        };

        if object.contains_key("event") {
            let event = serde_json::from_value(Value::Object(object))
                .map_err(|_| QmpError::BadEvent(line.to_string()))?;
            return Ok(ControlMessage::Event(event));
        }

        if let Some(greeting) = object.get("QMP") {
            return Ok(ControlMessage::Greeting(greeting.clone()));
        }

        Ok(ControlMessage::Reply(Reply(object)))
    }

    pub fn is_event(&self) -> bool {
        matches!(self, ControlMessage::Event(_))
    }
}

/// Value of `status` in a `query-migrate` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStatus {
    None,
    Setup,
    Cancelling,
    Cancelled,
    Active,
    PostcopyActive,
    PostcopyPaused,
    PostcopyRecoverSetup,
    PostcopyRecover,
    Completed,
    Failed,
    Colo,
    PreSwitchover,
    Device,
    WaitUnplug,
}

impl MigrationStatus {
    pub fn parse(status: &str) -> Result<Self> {
        serde_json::from_value(Value::String(status.to_string()))
            .map_err(|_| QmpError::UnknownStatus(status.to_string()))
    }

    /// Extract the status from the `return` object of `query-migrate`.
    pub fn from_query_reply(value: &Value) -> Result<Self> {
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| QmpError::MissingField {
                command: "query-migrate".to_string(),
                field: "status",
            })?;
        Self::parse(status)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::None => "none",
            MigrationStatus::Setup => "setup",
            MigrationStatus::Cancelling => "cancelling",
            MigrationStatus::Cancelled => "cancelled",
            MigrationStatus::Active => "active",
            MigrationStatus::PostcopyActive => "postcopy-active",
            MigrationStatus::PostcopyPaused => "postcopy-paused",
            MigrationStatus::PostcopyRecoverSetup => "postcopy-recover-setup",
            MigrationStatus::PostcopyRecover => "postcopy-recover",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Colo => "colo",
            MigrationStatus::PreSwitchover => "pre-switchover",
            MigrationStatus::Device => "device",
            MigrationStatus::WaitUnplug => "wait-unplug",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
