//! Channel writer task.
//!
//! Receives outbound messages from a tokio [`mpsc`] channel, serialises each
//! one to a single JSON line, and writes it through a [`FramedWrite`].

use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::codec::WireCodec;
use crate::protocol::messages::{encode_line, WireMessage};
use crate::{AppError, Result};

/// Framed outbound half of a session channel.
pub type LineWriter<W> = FramedWrite<W, WireCodec>;

/// Wrap `stream` in a [`LineWriter`].
pub fn line_writer<W: AsyncWrite>(stream: W) -> LineWriter<W> {
    FramedWrite::new(stream, WireCodec::new())
}

/// Writer task: serialises messages from `msg_rx` onto `framed`.
///
/// The task exits when:
/// - `cancel` fires: nothing queued is written after that point, which is
///   what lets a removed student guarantee no event escapes after closure;
/// - `msg_rx` is closed: everything already queued is written first, then
///   the sink is flushed and closed so the peer sees EOF.
///
/// # Errors
///
/// Returns [`AppError::Channel`] if a write fails.
pub async fn run_writer<W, T>(
    label: String,
    mut framed: LineWriter<W>,
    mut msg_rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
    T: WireMessage,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(channel = %label, "writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(msg) = msg else {
                    debug!(channel = %label, "writer: message channel closed, stopping");
                    break;
                };

                let kind = msg.kind();
                let line = match encode_line(&msg) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(channel = %label, kind, error = %e, "writer: dropping unserialisable message");
                        continue;
                    }
                };

                framed.send(line).await.map_err(|e| {
                    warn!(channel = %label, kind, error = %e, "writer: write failed");
                    AppError::Channel(format!("write failed: {e}"))
                })?;
            }
        }
    }

    if let Err(e) = framed.close().await {
        debug!(channel = %label, error = %e, "writer: close failed");
    }

    Ok(())
}

/// Write a single message directly, outside the writer task.
///
/// Used during handshakes, before the writer task takes over the sink.
///
/// # Errors
///
/// Returns [`AppError::Channel`] if the write fails.
pub async fn send_one<W, T>(framed: &mut LineWriter<W>, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
    T: WireMessage,
{
    let line = encode_line(msg)?;
    framed
        .send(line)
        .await
        .map_err(|e| AppError::Channel(format!("write failed: {e}")))
}
