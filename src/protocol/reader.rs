//! Channel reader task.
//!
//! Reads newline-delimited JSON messages from one side of a session
//! channel, parses each line into the message family `T`, and forwards the
//! results through a tokio [`mpsc`] channel.
//!
//! The reader is driven by a [`FramedRead`] backed by [`WireCodec`], which
//! enforces the per-line limit before any JSON parsing happens. Handshake
//! code reads from the same `FramedRead` first and then hands it over, so
//! no buffered bytes are lost between the two phases.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::codec::WireCodec;
use crate::protocol::messages::{decode_line, WireMessage};

/// Framed inbound half of a session channel.
pub type LineReader<R> = FramedRead<R, WireCodec>;

/// Item produced by [`run_reader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<T> {
    /// A decoded message.
    Message(T),
    /// The stream ended or failed; no further items follow.
    Closed {
        /// Human-readable reason (`stream closed`, `stream error: …`).
        reason: String,
    },
}

/// Wrap `stream` in a [`LineReader`].
pub fn line_reader<R: AsyncRead>(stream: R) -> LineReader<R> {
    FramedRead::new(stream, WireCodec::new())
}

/// Channel reader task: reads NDJSON lines and emits [`Inbound`] items.
///
/// On clean EOF or an I/O error, sends [`Inbound::Closed`] before
/// returning. Malformed lines, oversized lines, and unknown message types
/// are logged and skipped; they never terminate the reader.
///
/// # Cancellation
///
/// When `cancel` fires the reader exits without emitting `Closed`.
pub async fn run_reader<R, T>(
    label: String,
    mut framed: LineReader<R>,
    event_tx: mpsc::Sender<Inbound<T>>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
    T: WireMessage,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(channel = %label, "reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(channel = %label, "reader: EOF detected");
                        send_closed(&event_tx, &label, "stream closed").await;
                        break;
                    }

                    // The codec skips oversized lines itself, so any error
                    // here has already ended the stream.
                    Some(Err(e)) => {
                        warn!(channel = %label, error = %e, "reader: stream error, stopping");
                        send_closed(&event_tx, &label, &format!("stream error: {e}")).await;
                        break;
                    }

                    Some(Ok(line)) => match decode_line::<T>(&line) {
                        Ok(Some(msg)) => {
                            if event_tx.send(Inbound::Message(msg)).await.is_err() {
                                debug!(channel = %label, "reader: event_tx closed, stopping");
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(channel = %label, error = %e, "reader: dropping malformed message");
                        }
                    },
                }
            }
        }
    }
}

async fn send_closed<T>(event_tx: &mpsc::Sender<Inbound<T>>, label: &str, reason: &str) {
    let closed = Inbound::Closed {
        reason: reason.to_owned(),
    };
    if event_tx.send(closed).await.is_err() {
        debug!(channel = %label, "reader: event_tx closed before Closed could be delivered");
    }
}
