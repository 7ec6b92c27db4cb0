//! Transport seam and bounded reconnection policy.
//!
//! The [`Connector`] trait decouples sessions from how a byte stream to the
//! relay is obtained, so tests can hand out in-memory duplex pipes while the
//! binaries dial TCP.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::{AppError, Result};

/// Upper bound on a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Opens a fresh byte stream to the relay.
pub trait Connector: Send + Sync {
    /// Stream type produced by this connector.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new stream.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Channel`] if the relay cannot be reached.
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Self::Stream>> + Send + '_>>;
}

/// Dials the relay over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    /// Connector for the relay at `addr`.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Self::Stream>> + Send + '_>> {
        Box::pin(async move {
            let stream = TcpStream::connect(self.addr)
                .await
                .map_err(|e| AppError::Channel(format!("connect {} failed: {e}", self.addr)))?;
            stream
                .set_nodelay(true)
                .map_err(|e| AppError::Channel(format!("set_nodelay failed: {e}")))?;
            Ok(stream)
        })
    }
}

/// Bounded exponential backoff for re-establishing a dropped channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up; `0` disables reconnection.
    pub max_attempts: u32,
    /// Delay before the first attempt; doubles for each further attempt.
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    /// Policy described by the session configuration.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            max_attempts: config.reconnect_max_attempts,
            base_delay: Duration::from_millis(config.reconnect_backoff_ms),
        }
    }

    /// Delay before 1-based `attempt`, capped at 30 seconds.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .checked_mul(1_u32 << shift)
            .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
    }
}

/// Run `connect_once` until it succeeds or `policy` is exhausted.
///
/// `on_attempt` is called with the 1-based attempt number before each
/// delay so the caller can surface a "reconnecting" status.
///
/// # Errors
///
/// Returns the last attempt's error once every attempt has failed, or
/// [`AppError::Channel`] if `cancel` fires first.
pub async fn reconnect<T, F, Fut>(
    policy: ReconnectPolicy,
    cancel: &CancellationToken,
    mut on_attempt: impl FnMut(u32),
    mut connect_once: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = AppError::Channel("reconnection disabled".into());

    for attempt in 1..=policy.max_attempts {
        on_attempt(attempt);
        let delay = policy.delay_for(attempt);

        tokio::select! {
            () = cancel.cancelled() => {
                return Err(AppError::Channel("reconnection cancelled".into()));
            }
            () = tokio::time::sleep(delay) => {}
        }

        match connect_once().await {
            Ok(value) => {
                info!(attempt, "channel re-established");
                return Ok(value);
            }
            Err(err) => {
                warn!(attempt, max_attempts = policy.max_attempts, %err, "reconnect attempt failed");
                last_err = err;
            }
        }
    }

    Err(last_err)
}
