//! Scripted stand-in for a pair of emulator instances.
//!
//! Each launched instance is an in-memory QMP peer on a duplex stream. The
//! source peer answers `query-migrate` from a fixed list of statuses and
//! writes its serial log according to [`Boot`]; the destination peer emits
//! `RESUME` once the source has been switched to postcopy.

use async_trait::async_trait;
use postcopy_mmsafety::instance::{Instance, InstanceLauncher, InstanceSpec, LaunchError, Role};
use postcopy_mmsafety::qmp::{QmpClient, Transport};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;

/// What the source guest writes to its serial port.
#[derive(Debug, Clone, Copy)]
pub enum Boot {
    /// 'A' followed by a stream of 'B's.
    Sentinel,
    /// A first byte that is not the sentinel.
    Garbage(u8),
}

#[derive(Debug, Clone)]
pub struct Script {
    pub boot: Boot,
    /// Statuses returned by successive `query-migrate` calls; the last one
    /// repeats.
    pub statuses: Vec<&'static str>,
    /// Emit STOP before the reply to `migrate-start-postcopy` instead of
    /// after it.
    pub stop_before_postcopy_reply: bool,
    /// Reply with a QMP error to this command on this peer.
    pub fail_command: Option<(Role, &'static str)>,
    /// On `migrate`, connect to the given URI and send a few bytes.
    pub connect_on_migrate: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            boot: Boot::Sentinel,
            statuses: vec!["active", "postcopy-active", "postcopy-active", "completed"],
            stop_before_postcopy_reply: false,
            fail_command: None,
            connect_on_migrate: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggedCommand {
    pub role: Role,
    pub execute: String,
    pub arguments: Value,
}

#[derive(Clone)]
pub struct FakeLauncher {
    script: Arc<Script>,
    log: Arc<Mutex<Vec<LoggedCommand>>>,
    launches: Arc<AtomicUsize>,
    postcopy: Arc<Notify>,
}

impl FakeLauncher {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            log: Arc::new(Mutex::new(Vec::new())),
            launches: Arc::new(AtomicUsize::new(0)),
            postcopy: Arc::new(Notify::new()),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn commands(&self, role: Role) -> Vec<LoggedCommand> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.role == role)
            .cloned()
            .collect()
    }

    pub fn executed(&self, role: Role) -> Vec<String> {
        self.commands(role).into_iter().map(|c| c.execute).collect()
    }

    pub fn count(&self, role: Role, execute: &str) -> usize {
        self.executed(role).iter().filter(|e| *e == execute).count()
    }
}

#[async_trait]
impl InstanceLauncher for FakeLauncher {
    async fn launch(&self, spec: &InstanceSpec) -> Result<Instance, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let peer = Peer {
            role: spec.role,
            script: Arc::clone(&self.script),
            log: Arc::clone(&self.log),
            postcopy: Arc::clone(&self.postcopy),
            queries: 0,
        };
        tokio::spawn(peer.serve(server_end));

        match spec.role {
            Role::Source => {
                tokio::spawn(write_serial(spec.serial_path.clone(), self.script.boot));
            }
            Role::Destination => {
                std::fs::File::create(&spec.serial_path).map_err(|source| {
                    LaunchError::Spawn {
                        binary: spec.binary.clone(),
                        source,
                    }
                })?;
            }
        }

        let stream: Box<dyn Transport> = Box::new(client_end);
        let mut qmp = QmpClient::new(stream);
        qmp.negotiate().await?;
        Ok(Instance::new(spec.role, qmp, spec.serial_path.clone()))
    }
}

async fn write_serial(path: PathBuf, boot: Boot) {
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut file = tokio::fs::File::create(&path).await.unwrap();
    let first = match boot {
        Boot::Sentinel => b'A',
        Boot::Garbage(byte) => byte,
    };
    file.write_all(&[first]).await.unwrap();
    file.flush().await.unwrap();
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if file.write_all(b"BBBB").await.is_err() {
            return;
        }
    }
}

struct Peer {
    role: Role,
    script: Arc<Script>,
    log: Arc<Mutex<Vec<LoggedCommand>>>,
    postcopy: Arc<Notify>,
    queries: usize,
}

impl Peer {
    async fn serve(mut self, stream: DuplexStream) {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();

        send(
            &mut write,
            json!({
                "QMP": {
                    "version": { "qemu": { "major": 9, "minor": 2, "micro": 0 }, "package": "" },
                    "capabilities": ["oob"]
                }
            }),
        )
        .await;

        let postcopy = Arc::clone(&self.postcopy);
        let mut resumed = false;
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    if !self.handle(&line, &mut write).await {
                        break;
                    }
                }
                _ = postcopy.notified(), if self.role == Role::Destination && !resumed => {
                    resumed = true;
                    send(&mut write, json!({ "event": "RESUME", "data": {} })).await;
                }
            }
        }
    }

    /// Answer one request. Returns false once the peer should hang up.
    async fn handle(&mut self, line: &str, write: &mut WriteHalf<DuplexStream>) -> bool {
        let request: Value = serde_json::from_str(line).unwrap();
        let execute = request["execute"].as_str().unwrap().to_string();
        let arguments = request.get("arguments").cloned().unwrap_or(Value::Null);
        self.log.lock().unwrap().push(LoggedCommand {
            role: self.role,
            execute: execute.clone(),
            arguments: arguments.clone(),
        });

        if self.script.fail_command == Some((self.role, execute.as_str())) {
            send(
                write,
                json!({ "error": { "class": "GenericError", "desc": "scripted failure" } }),
            )
            .await;
            return true;
        }

        match execute.as_str() {
            "qmp_capabilities"
            | "migrate-set-capabilities"
            | "migrate-set-parameters"
            | "migrate_set_speed"
            | "migrate_set_downtime" => ok(write).await,
            "migrate" => {
                if self.script.connect_on_migrate {
                    // Hand over some "RAM" and wait for the far end to
                    // acknowledge it before replying.
                    let uri = arguments["uri"].as_str().unwrap();
                    let address = uri.strip_prefix("tcp:").unwrap();
                    let mut stream = TcpStream::connect(address).await.unwrap();
                    stream.write_all(b"RAM").await.unwrap();
                    let mut ack = [0u8; 1];
                    stream.read_exact(&mut ack).await.unwrap();
                }
                send(
                    write,
                    json!({ "event": "MIGRATION", "data": { "status": "setup" } }),
                )
                .await;
                ok(write).await;
            }
            "migrate-start-postcopy" => {
                let stop = json!({
                    "event": "STOP",
                    "data": {},
                    "timestamp": { "seconds": 1700000000, "microseconds": 0 }
                });
                if self.script.stop_before_postcopy_reply {
                    send(write, stop).await;
                    ok(write).await;
                } else {
                    ok(write).await;
                    send(write, stop).await;
                }
                self.postcopy.notify_one();
            }
            "query-migrate" => {
                let statuses = &self.script.statuses;
                let status = statuses[self.queries.min(statuses.len() - 1)];
                self.queries += 1;
                send(write, json!({ "return": { "status": status } })).await;
            }
            "quit" => {
                ok(write).await;
                return false;
            }
            other => {
                send(
                    write,
                    json!({
                        "error": {
                            "class": "CommandNotFound",
                            "desc": format!("The command {other} has not been found")
                        }
                    }),
                )
                .await;
            }
        }
        true
    }
}

async fn ok(write: &mut WriteHalf<DuplexStream>) {
    send(write, json!({ "return": {} })).await;
}

async fn send(write: &mut WriteHalf<DuplexStream>, message: Value) {
    let mut line = serde_json::to_vec(&message).unwrap();
    line.push(b'\n');
    // The orchestrator may already have hung up.
    let _ = write.write_all(&line).await;
}
