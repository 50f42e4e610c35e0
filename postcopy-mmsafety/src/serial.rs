//! Watching the guest serial log for the boot sentinel.
//!
//! The emulator appends guest serial output to a file while we read it, so
//! hitting end of file only means "not yet". The guest prints a single `A`
//! once it is up, followed by an endless run of `B`s; anything other than
//! `A` as the first byte means the side channel is broken.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::{Instant, sleep};
use tracing::debug;

pub const BOOT_SENTINEL: u8 = b'A';

#[derive(Error, Debug)]
pub enum SerialError {
    #[error("Unexpected byte 0x{byte:02x} on {}", .path.display())]
    UnexpectedByte { byte: u8, path: PathBuf },

    #[error("Timed out after {after:?} waiting for sentinel on {}", .path.display())]
    Timeout { path: PathBuf, after: Duration },

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct SerialWatcher {
    poll_interval: Duration,
    timeout: Duration,
}

impl SerialWatcher {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

    pub fn new(timeout: Duration) -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            timeout,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Wait until the first byte of `path` is `sentinel`.
    ///
    /// A file that does not exist yet is treated the same as an empty one.
    pub async fn wait_for_sentinel(&self, path: &Path, sentinel: u8) -> Result<(), SerialError> {
        let deadline = Instant::now() + self.timeout;
        let mut file = self.open(path, deadline).await?;
        let mut byte = [0u8; 1];
        let mut polls = 0u64;

        loop {
            let n = file.read(&mut byte).await.map_err(|source| SerialError::Io {
                path: path.to_path_buf(),
                source,
            })?;

            if n == 1 {
                if byte[0] == sentinel {
                    debug!(
                        "Sentinel {:?} seen on {} after {} polls",
                        sentinel as char,
                        path.display(),
                        polls
                    );
                    return Ok(());
                }
                return Err(SerialError::UnexpectedByte {
                    byte: byte[0],
                    path: path.to_path_buf(),
                });
            }

            if Instant::now() >= deadline {
                return Err(self.timed_out(path));
            }
            polls += 1;
            sleep(self.poll_interval).await;
            file.seek(SeekFrom::Start(0))
                .await
                .map_err(|source| SerialError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
    }

    async fn open(&self, path: &Path, deadline: Instant) -> Result<File, SerialError> {
        loop {
            match File::open(path).await {
                Ok(file) => return Ok(file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if Instant::now() >= deadline {
                        return Err(self.timed_out(path));
                    }
                    sleep(self.poll_interval).await;
                }
                Err(source) => {
                    return Err(SerialError::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
        }
    }

    fn timed_out(&self, path: &Path) -> SerialError {
        SerialError::Timeout {
            path: path.to_path_buf(),
            after: self.timeout,
        }
    }
}

/// Delete a serial log. A file that is already gone counts as deleted.
pub fn remove_serial_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
