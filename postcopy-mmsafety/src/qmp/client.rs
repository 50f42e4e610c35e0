//! Line-oriented QMP client for a single emulator connection.

use super::commands;
use super::error::{QmpError, Result};
use super::protocol::{ControlMessage, Request};
use serde_json::Value;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tracing::{debug, trace};

/// Any byte stream a QMP connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub struct QmpClient<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    line: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> QmpClient<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            line: String::new(),
        }
    }

    /// Consume the greeting and leave capabilities-negotiation mode.
    ///
    /// Returns the greeting body (version and advertised capabilities).
    pub async fn negotiate(&mut self) -> Result<Value> {
        let greeting = match self.receive().await? {
            ControlMessage::Greeting(greeting) => greeting,
            other => return Err(QmpError::MissingGreeting(format!("{other:?}"))),
        };

        if let Some(version) = greeting.pointer("/version/qemu") {
            debug!("QMP greeting, emulator version {}", version);
        }

        let request = commands::qmp_capabilities();
        match self.execute(&request).await? {
            ControlMessage::Reply(reply) => {
                reply.into_return(&request.execute)?;
            }
            ControlMessage::Greeting(_) => {
                return Err(QmpError::UnexpectedGreeting(request.execute));
            }
            ControlMessage::Event(event) => {
                // Events are not delivered before negotiation completes.
                return Err(QmpError::CommandFailed {
                    command: request.execute,
                    detail: format!("event '{}' arrived during negotiation", event.name),
                });
            }
        }

        Ok(greeting)
    }

    pub async fn send(&mut self, request: &Request) -> Result<()> {
        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        trace!("-> {}", String::from_utf8_lossy(&payload).trim_end());
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read the next message, whatever it is.
    ///
    /// Not cancel safe: a partially read line is lost if the future is
    /// dropped. Callers only time out reads that are fatal anyway.
    pub async fn receive(&mut self) -> Result<ControlMessage> {
        loop {
            self.line.clear();
            let n = self.reader.read_line(&mut self.line).await?;
            if n == 0 {
                return Err(QmpError::ConnectionClosed);
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            trace!("<- {}", line);
            return ControlMessage::parse(line);
        }
    }

    /// Send a request and read exactly one message back, unfiltered.
    pub async fn execute(&mut self, request: &Request) -> Result<ControlMessage> {
        self.send(request).await?;
        self.receive().await
    }

    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
