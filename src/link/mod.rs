//! Device link: ownership of the single TCP connection to the chamber.
//!
//! The wire protocol is strictly request/response with no pipelining, so the
//! link exposes exactly one operation, [`DeviceLink::send_command`], which
//! writes one line and blocks for the one corresponding response line. The
//! proxy actor holds the link exclusively; there is never a second in-flight
//! write on the connection.
//!
//! On a connection fault the link attempts a bounded reconnect so future
//! commands can proceed, but it never retries the failed command itself:
//! the device's per-command side effects are wear counters, and a blind
//! replay could double-count them. The caller decides what happens next.

pub mod mock;

use crate::error::{GuardError, GuardResult};
use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

/// Policy for bounded reconnect attempts after a connection fault.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of connect attempts.
    pub max_attempts: u32,
    /// Base delay between attempts; grows linearly with the attempt number.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

/// Serialized line-oriented access to the instrument.
///
/// Implementations own the underlying transport. `&mut self` on every method
/// makes concurrent round trips unrepresentable.
#[async_trait]
pub trait DeviceLink: Send {
    /// Writes one command line and waits for its single response line.
    ///
    /// Never retries the command. `LinkTimeout` means the command may or may
    /// not have executed; the caller is responsible for resynchronizing.
    async fn send_command(&mut self, line: &str) -> GuardResult<String>;

    /// Establishes the connection if it is not already up.
    async fn ensure_connected(&mut self) -> GuardResult<()>;

    /// Whether a connection is currently established.
    fn is_connected(&self) -> bool;
}

/// TCP implementation of [`DeviceLink`].
pub struct TcpDeviceLink {
    addr: String,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
    connect_timeout: Duration,
    round_trip_timeout: Duration,
    retry: RetryPolicy,
}

impl TcpDeviceLink {
    /// Creates a link to `addr` (host:port). No connection is made until the
    /// first command or an explicit `ensure_connected`.
    pub fn new(
        addr: String,
        connect_timeout: Duration,
        round_trip_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            addr,
            reader: None,
            writer: None,
            connect_timeout,
            round_trip_timeout,
            retry,
        }
    }

    fn drop_stream(&mut self) {
        self.reader = None;
        self.writer = None;
    }

    async fn connect_once(&mut self) -> GuardResult<()> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                GuardError::LinkUnavailable(format!(
                    "connect to {} timed out after {:?}",
                    self.addr, self.connect_timeout
                ))
            })?
            .map_err(|e| {
                GuardError::LinkUnavailable(format!("connect to {} failed: {}", self.addr, e))
            })?;

        let (read_half, write_half) = stream.into_split();
        self.reader = Some(BufReader::new(read_half));
        self.writer = Some(write_half);
        debug!("Connected to device at {}", self.addr);
        Ok(())
    }

    /// Bounded reconnect with linear backoff.
    async fn reconnect(&mut self) -> GuardResult<()> {
        self.drop_stream();
        let mut last_err = None;
        for attempt in 0..self.retry.max_attempts {
            match self.connect_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(
                        "Reconnect attempt {}/{} to {} failed: {}",
                        attempt + 1,
                        self.retry.max_attempts,
                        self.addr,
                        e
                    );
                    last_err = Some(e);
                    if attempt + 1 < self.retry.max_attempts {
                        sleep(self.retry.backoff_delay * (attempt + 1)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            GuardError::LinkUnavailable(format!("no connect attempts made for {}", self.addr))
        }))
    }
}

#[async_trait]
impl DeviceLink for TcpDeviceLink {
    async fn send_command(&mut self, line: &str) -> GuardResult<String> {
        if self.writer.is_none() {
            self.reconnect().await?;
        }

        let result = {
            let writer = self.writer.as_mut().ok_or_else(|| {
                GuardError::LinkUnavailable("no connection after reconnect".to_string())
            })?;
            let reader = self.reader.as_mut().ok_or_else(|| {
                GuardError::LinkUnavailable("no connection after reconnect".to_string())
            })?;

            let payload = format!("{}\n", line);
            timeout(self.round_trip_timeout, async move {
                writer.write_all(payload.as_bytes()).await?;
                writer.flush().await?;
                let mut response = String::new();
                let n = reader.read_line(&mut response).await?;
                Ok::<_, std::io::Error>((response, n))
            })
            .await
        };

        match result {
            Err(_elapsed) => {
                // Deadline exceeded with the command possibly executed; the
                // connection state is unknowable, so discard it.
                self.drop_stream();
                Err(GuardError::LinkTimeout(self.round_trip_timeout))
            }
            Ok(Err(io_err)) => {
                warn!("Connection fault during round trip: {}", io_err);
                if let Err(e) = self.reconnect().await {
                    warn!("Reconnect after fault failed: {}", e);
                }
                Err(GuardError::LinkUnavailable(format!(
                    "connection fault mid-command: {}",
                    io_err
                )))
            }
            Ok(Ok((_, 0))) => {
                warn!("Device closed the connection mid-command");
                if let Err(e) = self.reconnect().await {
                    warn!("Reconnect after close failed: {}", e);
                }
                Err(GuardError::LinkUnavailable(
                    "connection closed by device".to_string(),
                ))
            }
            Ok(Ok((response, _))) => {
                debug!("Device response: {}", response.trim());
                Ok(response.trim().to_string())
            }
        }
    }

    async fn ensure_connected(&mut self) -> GuardResult<()> {
        if self.writer.is_none() {
            self.reconnect().await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.writer.is_some()
    }
}
