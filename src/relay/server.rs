//! NDJSON channel listener.
//!
//! Every accepted connection announces its role with a [`ClientHello`]:
//! students get a per-identity channel, observers get the roster followed by
//! the live event broadcast.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::student::StudentId;
use crate::protocol::handshake;
use crate::protocol::messages::{
    ClientHello, ObserverMessage, RelayEvent, StudentCommand, StudentMessage,
};
use crate::protocol::reader::{line_reader, run_reader, Inbound, LineReader};
use crate::protocol::writer::{line_writer, run_writer, send_one, LineWriter};
use crate::relay::hub::RelayHub;
use crate::Result;

const COMMAND_BUFFER: usize = 16;
const INBOUND_BUFFER: usize = 64;

/// Spawn the accept loop on an already bound listener.
pub fn spawn_relay(
    hub: Arc<RelayHub>,
    listener: TcpListener,
    handshake_timeout: Duration,
    ct: CancellationToken,
) -> JoinHandle<()> {
    let addr = listener
        .local_addr()
        .map_or_else(|_| "unknown".to_owned(), |a| a.to_string());

    tokio::spawn(
        async move {
            info!("relay listening");
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("relay shutting down");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if let Err(err) = stream.set_nodelay(true) {
                                debug!(%peer, %err, "set_nodelay failed");
                            }
                            let hub = Arc::clone(&hub);
                            let ct = ct.child_token();
                            tokio::spawn(
                                serve_connection(stream, hub, handshake_timeout, ct)
                                    .instrument(info_span!("connection", %peer)),
                            );
                        }
                        Err(err) => warn!(%err, "accept failed"),
                    },
                }
            }
        }
        .instrument(info_span!("relay", %addr)),
    )
}

/// Serve one connection until it closes.
///
/// Generic over the stream so tests can drive it through an in-memory pipe.
pub async fn serve_connection<S>(
    stream: S,
    hub: Arc<RelayHub>,
    handshake_timeout: Duration,
    ct: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = line_reader(read_half);
    let writer = line_writer(write_half);

    let hello = match handshake::await_hello(&mut reader, handshake_timeout).await {
        Ok(hello) => hello,
        Err(err) => {
            warn!(%err, "connection dropped before hello");
            return;
        }
    };

    match hello {
        ClientHello::Join { student_id } => {
            serve_student(student_id, reader, writer, hub, ct)
                .instrument(info_span!("student"))
                .await;
        }
        ClientHello::AdminJoin => {
            if let Err(err) = serve_observer(reader, writer, hub, ct)
                .instrument(info_span!("observer"))
                .await
            {
                debug!(%err, "observer connection ended");
            }
        }
    }
}

async fn serve_student<R, W>(
    student_id: StudentId,
    reader: LineReader<R>,
    mut writer: LineWriter<W>,
    hub: Arc<RelayHub>,
    ct: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let close = ct.child_token();

    let conn_id = match hub.register(&student_id, cmd_tx, close.clone()).await {
        Ok(conn_id) => conn_id,
        Err(err) => {
            warn!(%student_id, %err, "join rejected");
            let rejected = StudentCommand::Rejected {
                reason: err.to_string(),
            };
            if let Err(err) = send_one(&mut writer, &rejected).await {
                debug!(%err, "could not deliver rejection");
            }
            return;
        }
    };

    let ack = StudentCommand::Joined {
        student_id: student_id.clone(),
    };
    if let Err(err) = send_one(&mut writer, &ack).await {
        warn!(%student_id, %err, "join ack failed");
        hub.depart(&student_id, conn_id).await;
        return;
    }

    let label = student_id.to_string();
    let (in_tx, mut in_rx) = mpsc::channel(INBOUND_BUFFER);
    let writer_task = tokio::spawn(run_writer(label.clone(), writer, cmd_rx, close.clone()));
    let reader_task = tokio::spawn(run_reader::<_, StudentMessage>(
        label,
        reader,
        in_tx,
        close.clone(),
    ));

    loop {
        tokio::select! {
            biased;

            () = close.cancelled() => {
                debug!(%student_id, "student channel closed by relay");
                break;
            }

            inbound = in_rx.recv() => match inbound {
                Some(Inbound::Message(StudentMessage::Frame { snapshot })) => {
                    hub.record_frame(&student_id, conn_id, snapshot).await;
                }
                Some(Inbound::Message(StudentMessage::AudioSegment { audio, snapshot })) => {
                    hub.record_audio(&student_id, conn_id, audio, snapshot).await;
                }
                Some(Inbound::Message(StudentMessage::Leave { .. })) => {
                    info!(%student_id, "student left");
                    break;
                }
                Some(Inbound::Message(StudentMessage::Join { .. })) => {
                    debug!(%student_id, "repeated join ignored");
                }
                Some(Inbound::Closed { reason }) => {
                    info!(%student_id, reason, "student channel closed");
                    break;
                }
                None => break,
            },
        }
    }

    hub.depart(&student_id, conn_id).await;
    close.cancel();
    if let Ok(Err(err)) = writer_task.await {
        debug!(%err, "student writer ended with error");
    }
    if reader_task.await.is_err() {
        debug!("student reader ended abnormally");
    }
}

async fn serve_observer<R, W>(
    reader: LineReader<R>,
    mut writer: LineWriter<W>,
    hub: Arc<RelayHub>,
    ct: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (students, mut events) = hub.observe().await;
    info!(students = students.len(), "observer subscribed");
    send_one(&mut writer, &RelayEvent::InitialRoster { students }).await?;

    let (in_tx, mut in_rx) = mpsc::channel(INBOUND_BUFFER);
    let reader_cancel = ct.child_token();
    let reader_task = tokio::spawn(run_reader::<_, ObserverMessage>(
        "observer".to_owned(),
        reader,
        in_tx,
        reader_cancel.clone(),
    ));

    let outcome = loop {
        tokio::select! {
            biased;

            () = ct.cancelled() => break Ok(()),

            inbound = in_rx.recv() => match inbound {
                Some(Inbound::Message(msg)) => {
                    if let Some(reply) = handle_observer_message(&hub, msg, &mut events).await {
                        if let Err(err) = send_one(&mut writer, &reply).await {
                            break Err(err);
                        }
                    }
                }
                Some(Inbound::Closed { reason }) => {
                    info!(reason, "observer disconnected");
                    break Ok(());
                }
                None => break Ok(()),
            },

            event = events.recv() => match event {
                Ok(event) => {
                    if let Err(err) = send_one(&mut writer, &event).await {
                        break Err(err);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "observer lagged, resending roster");
                    let (students, fresh) = hub.observe().await;
                    events = fresh;
                    if let Err(err) = send_one(&mut writer, &RelayEvent::InitialRoster { students }).await {
                        break Err(err);
                    }
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    reader_cancel.cancel();
    if reader_task.await.is_err() {
        debug!("observer reader ended abnormally");
    }
    outcome
}

/// Apply one observer request; returns a direct reply if one is owed.
async fn handle_observer_message(
    hub: &RelayHub,
    msg: ObserverMessage,
    events: &mut tokio::sync::broadcast::Receiver<RelayEvent>,
) -> Option<RelayEvent> {
    match msg {
        ObserverMessage::AdminJoin => {
            let (students, fresh) = hub.observe().await;
            *events = fresh;
            Some(RelayEvent::InitialRoster { students })
        }
        ObserverMessage::RemoveStudent { student_id, reason } => {
            if hub.remove_student(&student_id, &reason).await {
                None
            } else {
                Some(RelayEvent::ProtocolError {
                    message: format!("cannot remove {student_id}: not connected"),
                })
            }
        }
        ObserverMessage::DismissAlert { student_id } => {
            hub.dismiss_alert(&student_id).await;
            None
        }
    }
}
