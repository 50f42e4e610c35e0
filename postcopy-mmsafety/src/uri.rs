//! Migration endpoint URIs of the form `tcp:host:port`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UriError {
    #[error("'{0}' is not of the form transport:host:port")]
    Malformed(String),

    #[error("Unsupported migration transport '{0}' (only tcp is supported)")]
    UnsupportedTransport(String),

    #[error("Invalid port in '{0}'")]
    InvalidPort(String),

    #[error("Empty host in '{0}'")]
    EmptyHost(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationUri {
    host: String,
    port: u16,
}

impl MigrationUri {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `host:port`, suitable for `TcpListener::bind` / `TcpStream::connect`.
    pub fn socket_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for MigrationUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (transport, rest) = s
            .split_once(':')
            .ok_or_else(|| UriError::Malformed(s.to_string()))?;
        if transport != "tcp" {
            return Err(UriError::UnsupportedTransport(transport.to_string()));
        }

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| UriError::Malformed(s.to_string()))?;
        if host.is_empty() {
            return Err(UriError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| UriError::InvalidPort(s.to_string()))?;

        Ok(Self::tcp(host, port))
    }
}

impl TryFrom<String> for MigrationUri {
    type Error = UriError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MigrationUri> for String {
    fn from(uri: MigrationUri) -> Self {
        uri.to_string()
    }
}

impl fmt::Display for MigrationUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp:{}:{}", self.host, self.port)
    }
}
