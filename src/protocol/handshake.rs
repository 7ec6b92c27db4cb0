//! Channel opening handshakes.
//!
//! Every relay connection starts with one exchange before the reader and
//! writer tasks take over:
//!
//! 1. **Student**: sends `join{student_id}`, waits for `joined` (or
//!    `rejected`).
//! 2. **Observer**: sends `admin_join`, waits for `initial_roster`.
//! 3. **Relay**: waits for the first [`ClientHello`] line to learn the
//!    connection's role.
//!
//! Each exchange is bounded by a timeout. A channel that does not finish in
//! time is treated as failed: the caller releases what it holds and never
//! registers the peer.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::models::student::{StudentId, StudentState};
use crate::protocol::messages::{
    decode_line, ClientHello, ObserverMessage, RelayEvent, StudentCommand, StudentMessage,
    WireMessage,
};
use crate::protocol::reader::LineReader;
use crate::protocol::writer::{send_one, LineWriter};
use crate::{AppError, Result};

/// Join the relay as `student_id` and wait for the acknowledgement.
///
/// # Errors
///
/// - `AppError::Handshake("… timeout …")`: no answer within `timeout`.
/// - `AppError::Handshake("rejected: …")`: the relay refused the identity.
/// - `AppError::Channel`: the stream failed or closed during the exchange.
pub async fn student_join<R, W>(
    reader: &mut LineReader<R>,
    writer: &mut LineWriter<W>,
    student_id: &StudentId,
    timeout: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let join = StudentMessage::Join {
        student_id: student_id.clone(),
    };
    send_one(writer, &join).await?;
    debug!(%student_id, "handshake: join sent");

    tokio::time::timeout(timeout, wait_for_ack(reader, student_id))
        .await
        .map_err(|_| {
            AppError::Handshake(format!(
                "join timeout: no acknowledgement within {timeout:?} for {student_id}"
            ))
        })??;

    info!(%student_id, "handshake: joined");
    Ok(())
}

/// Subscribe to the relay as an observer and wait for the initial roster.
///
/// # Errors
///
/// - `AppError::Handshake("… timeout …")`: no roster within `timeout`.
/// - `AppError::Channel`: the stream failed or closed during the exchange.
pub async fn observer_join<R, W>(
    reader: &mut LineReader<R>,
    writer: &mut LineWriter<W>,
    timeout: Duration,
) -> Result<Vec<StudentState>>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    send_one(writer, &ObserverMessage::AdminJoin).await?;
    debug!("handshake: admin_join sent");

    let students = tokio::time::timeout(timeout, wait_for_roster(reader))
        .await
        .map_err(|_| {
            AppError::Handshake(format!("admin_join timeout: no roster within {timeout:?}"))
        })??;

    info!(students = students.len(), "handshake: observer subscribed");
    Ok(students)
}

/// Relay side: wait for the connection's first [`ClientHello`].
///
/// # Errors
///
/// - `AppError::Handshake("… timeout …")`: nothing usable within `timeout`.
/// - `AppError::Protocol`: a malformed line arrived before the hello.
/// - `AppError::Channel`: the stream failed or closed first.
pub async fn await_hello<R>(reader: &mut LineReader<R>, timeout: Duration) -> Result<ClientHello>
where
    R: AsyncRead + Unpin + Send,
{
    tokio::time::timeout(timeout, next_message::<_, ClientHello>(reader))
        .await
        .map_err(|_| AppError::Handshake(format!("no hello within {timeout:?}")))?
}

async fn wait_for_ack<R>(reader: &mut LineReader<R>, student_id: &StudentId) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        match next_message::<_, StudentCommand>(reader).await? {
            StudentCommand::Joined { student_id: acked } if acked == *student_id => return Ok(()),
            StudentCommand::Joined { student_id: other } => {
                debug!(%other, "handshake: ignoring ack for another identity");
            }
            StudentCommand::Rejected { reason } => {
                return Err(AppError::Handshake(format!("rejected: {reason}")));
            }
            StudentCommand::Removal { reason } => {
                return Err(AppError::Handshake(format!(
                    "removed before join completed: {reason}"
                )));
            }
        }
    }
}

async fn wait_for_roster<R>(reader: &mut LineReader<R>) -> Result<Vec<StudentState>>
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        match next_message::<_, RelayEvent>(reader).await? {
            RelayEvent::InitialRoster { students } => return Ok(students),
            other => debug!(kind = other.kind(), "handshake: skipping event before roster"),
        }
    }
}

/// Read until one recognized message of family `T` arrives.
///
/// Blank lines and unknown types are skipped; malformed lines are errors.
async fn next_message<R, T>(reader: &mut LineReader<R>) -> Result<T>
where
    R: AsyncRead + Unpin + Send,
    T: WireMessage,
{
    loop {
        let Some(line) = reader.next().await else {
            return Err(AppError::Channel("peer closed during handshake".into()));
        };
        if let Some(msg) = decode_line::<T>(&line?)? {
            return Ok(msg);
        }
    }
}
