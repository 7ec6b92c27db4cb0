//! Student-side session lifecycle.
//!
//! [`StudentSession::start`] is the `start-capture` entry point. One
//! background task owns the whole session: it joins the relay, acquires the
//! capture devices, runs the [`CaptureScheduler`], and reacts to relay
//! commands. However the session ends, the devices are released before the
//! stop hook runs, and the hook runs exactly once.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::capture::{CaptureDevices, CaptureScheduler, DeviceGuard};
use crate::config::{CaptureConfig, GlobalConfig};
use crate::models::student::StudentId;
use crate::protocol::handshake;
use crate::protocol::messages::{StudentCommand, StudentMessage};
use crate::protocol::reader::{line_reader, run_reader, Inbound, LineReader};
use crate::protocol::transport::{reconnect, Connector, ReconnectPolicy};
use crate::protocol::writer::{line_writer, run_writer, LineWriter};
use crate::{AppError, Result};

/// Outbound queue depth between the scheduler and the writer task.
const OUTBOUND_BUFFER: usize = 64;
/// Inbound queue depth between the reader task and the session loop.
const INBOUND_BUFFER: usize = 16;
/// How long a graceful leave waits for queued messages to flush.
const LEAVE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Observable state of a student session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    /// Dialing the relay and waiting for `joined`.
    Connecting,
    /// Joined and capturing.
    Active,
    /// Channel lost; trying to get it back.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Terminal: the operator removed this student.
    Removed {
        /// Reason sent by the operator.
        reason: String,
    },
    /// Terminal: devices failed or the join was refused.
    Failed {
        /// What went wrong.
        error: String,
    },
    /// Terminal: the student left on its own.
    Left,
    /// Terminal: the channel could not be re-established.
    Disconnected {
        /// Last channel error.
        error: String,
    },
}

impl SessionPhase {
    /// Whether the session has ended.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Removed { .. } | Self::Failed { .. } | Self::Left | Self::Disconnected { .. }
        )
    }
}

/// Why a session ended; handed to the stop hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Operator-initiated removal.
    Removed {
        /// Reason sent by the operator.
        reason: String,
    },
    /// Self-initiated leave (or the session handle was dropped).
    Left,
    /// Camera or microphone failure.
    DeviceFailure {
        /// Device error.
        error: String,
    },
    /// The relay refused the join or did not answer in time.
    HandshakeFailed {
        /// Handshake error.
        error: String,
    },
    /// Reconnection window exhausted.
    Disconnected {
        /// Last channel error.
        error: String,
    },
}

impl SessionEnd {
    fn phase(&self) -> SessionPhase {
        match self {
            Self::Removed { reason } => SessionPhase::Removed {
                reason: reason.clone(),
            },
            Self::Left => SessionPhase::Left,
            Self::DeviceFailure { error } | Self::HandshakeFailed { error } => {
                SessionPhase::Failed {
                    error: error.clone(),
                }
            }
            Self::Disconnected { error } => SessionPhase::Disconnected {
                error: error.clone(),
            },
        }
    }
}

/// Cleanup callback invoked once when the session ends.
pub type StopHook = Box<dyn FnOnce(SessionEnd) + Send + 'static>;

/// Fires the stop hook at most once; a task that dies without reporting
/// still reports `Disconnected` from `Drop`.
struct StopHookOnce(Option<StopHook>);

impl StopHookOnce {
    fn fire(&mut self, end: SessionEnd) {
        if let Some(hook) = self.0.take() {
            hook(end);
        }
    }
}

impl Drop for StopHookOnce {
    fn drop(&mut self) {
        self.fire(SessionEnd::Disconnected {
            error: "session task aborted".into(),
        });
    }
}

/// Handle to a running student session.
///
/// Dropping the handle tears the session down abruptly.
pub struct StudentSession {
    student_id: StudentId,
    phase_rx: watch::Receiver<SessionPhase>,
    leave: CancellationToken,
    shutdown: CancellationToken,
    task: Option<JoinHandle<SessionEnd>>,
}

impl Drop for StudentSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl StudentSession {
    /// Start capturing as `student_id` against the relay behind `connector`.
    ///
    /// Returns immediately; progress is visible through [`phase`](Self::phase)
    /// and [`subscribe`](Self::subscribe).
    pub fn start<C>(
        student_id: StudentId,
        connector: C,
        devices: Arc<dyn CaptureDevices>,
        config: &GlobalConfig,
        stop_hook: StopHook,
    ) -> Self
    where
        C: Connector + 'static,
    {
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Connecting);
        let shutdown = CancellationToken::new();
        let leave = shutdown.child_token();

        let ctx = SessionContext {
            student_id: student_id.clone(),
            connector,
            devices,
            capture: config.capture.clone(),
            handshake_timeout: config.session.handshake_timeout(),
            policy: ReconnectPolicy::from_config(&config.session),
            phase_tx,
            leave: leave.clone(),
            shutdown: shutdown.clone(),
        };

        let span = info_span!("student_session", student_id = %student_id);
        let task = tokio::spawn(
            async move {
                let mut hook = StopHookOnce(Some(stop_hook));
                let end = ctx.run().await;
                ctx.phase_tx.send_replace(end.phase());
                hook.fire(end.clone());
                end
            }
            .instrument(span),
        );

        Self {
            student_id,
            phase_rx,
            leave,
            shutdown,
            task: Some(task),
        }
    }

    /// Identity this session joined as.
    #[must_use]
    pub fn student_id(&self) -> &StudentId {
        &self.student_id
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase_rx.borrow().clone()
    }

    /// Watch phase transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.phase_rx.clone()
    }

    /// Leave the exam: stop capture, send `leave`, close the channel.
    pub fn leave(&self) {
        self.leave.cancel();
    }

    /// Wait for the session to end and return why it ended.
    pub async fn wait(mut self) -> SessionEnd {
        let Some(task) = self.task.take() else {
            return SessionEnd::Left;
        };
        task.await.unwrap_or_else(|e| SessionEnd::Disconnected {
            error: format!("session task failed: {e}"),
        })
    }
}

/// How one connected stretch of the session ended.
enum ConnectionOutcome {
    Removed(String),
    Left,
    DeviceFailure(AppError),
    ChannelLost(String),
}

type Channel<S> = (LineReader<ReadHalf<S>>, LineWriter<WriteHalf<S>>);

struct SessionContext<C: Connector> {
    student_id: StudentId,
    connector: C,
    devices: Arc<dyn CaptureDevices>,
    capture: CaptureConfig,
    handshake_timeout: Duration,
    policy: ReconnectPolicy,
    phase_tx: watch::Sender<SessionPhase>,
    leave: CancellationToken,
    shutdown: CancellationToken,
}

impl<C: Connector> SessionContext<C> {
    async fn run(&self) -> SessionEnd {
        let mut channel = match self.establish().await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(%err, "join failed");
                return SessionEnd::HandshakeFailed {
                    error: err.to_string(),
                };
            }
        };

        loop {
            let (reader, writer) = channel;
            match self.run_connection(reader, writer).await {
                ConnectionOutcome::Removed(reason) => return SessionEnd::Removed { reason },
                ConnectionOutcome::Left => return SessionEnd::Left,
                ConnectionOutcome::DeviceFailure(err) => {
                    return SessionEnd::DeviceFailure {
                        error: err.to_string(),
                    };
                }
                ConnectionOutcome::ChannelLost(reason) => {
                    warn!(reason, "channel lost");
                }
            }

            let reconnected = reconnect(
                self.policy,
                &self.leave,
                |attempt| {
                    self.phase_tx
                        .send_replace(SessionPhase::Reconnecting { attempt });
                },
                || self.establish(),
            )
            .await;

            channel = match reconnected {
                Ok(channel) => channel,
                Err(_) if self.leave.is_cancelled() => return SessionEnd::Left,
                Err(err) => {
                    return SessionEnd::Disconnected {
                        error: err.to_string(),
                    };
                }
            };
        }
    }

    /// Dial the relay and complete the `join` handshake.
    async fn establish(&self) -> Result<Channel<C::Stream>> {
        let stream = self.connector.connect().await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = line_reader(read_half);
        let mut writer = line_writer(write_half);
        handshake::student_join(
            &mut reader,
            &mut writer,
            &self.student_id,
            self.handshake_timeout,
        )
        .await?;
        Ok((reader, writer))
    }

    async fn run_connection<R, W>(
        &self,
        reader: LineReader<R>,
        writer: LineWriter<W>,
    ) -> ConnectionOutcome
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let guard = match DeviceGuard::acquire(self.student_id.clone(), self.devices.as_ref()) {
            Ok(guard) => guard,
            Err(err) => {
                warn!(%err, "could not acquire capture devices");
                return ConnectionOutcome::DeviceFailure(err);
            }
        };

        let conn_cancel = self.shutdown.child_token();
        let label = self.student_id.to_string();
        let (out_tx, out_rx) = mpsc::channel::<StudentMessage>(OUTBOUND_BUFFER);
        let (in_tx, mut in_rx) = mpsc::channel::<Inbound<StudentCommand>>(INBOUND_BUFFER);

        let mut writer_task = tokio::spawn(run_writer(
            label.clone(),
            writer,
            out_rx,
            conn_cancel.clone(),
        ));
        let reader_task = tokio::spawn(run_reader(label, reader, in_tx, conn_cancel.clone()));
        let mut capture = CaptureScheduler::new(
            self.student_id.clone(),
            &self.capture,
            out_tx.clone(),
            conn_cancel.child_token(),
        )
        .spawn(guard);

        self.phase_tx.send_replace(SessionPhase::Active);
        info!("session active");

        let outcome = loop {
            tokio::select! {
                biased;

                () = self.leave.cancelled() => break ConnectionOutcome::Left,

                inbound = in_rx.recv() => match inbound {
                    Some(Inbound::Message(StudentCommand::Removal { reason })) => {
                        // Stop every sender before anything else is awaited.
                        conn_cancel.cancel();
                        info!(reason, "removal received");
                        break ConnectionOutcome::Removed(reason);
                    }
                    Some(Inbound::Message(StudentCommand::Rejected { reason })) => {
                        conn_cancel.cancel();
                        break ConnectionOutcome::ChannelLost(format!("rejected mid-session: {reason}"));
                    }
                    Some(Inbound::Message(StudentCommand::Joined { .. })) => {
                        debug!("duplicate joined acknowledgement ignored");
                    }
                    Some(Inbound::Closed { reason }) => break ConnectionOutcome::ChannelLost(reason),
                    None => break ConnectionOutcome::ChannelLost("reader stopped".into()),
                },

                result = capture.finished() => match result {
                    Ok(()) => break ConnectionOutcome::ChannelLost("outbound channel closed".into()),
                    Err(err) => break ConnectionOutcome::DeviceFailure(err),
                },

                result = &mut writer_task => {
                    let reason = match result {
                        Ok(Ok(())) => "writer stopped".to_owned(),
                        Ok(Err(err)) => err.to_string(),
                        Err(err) => format!("writer task failed: {err}"),
                    };
                    break ConnectionOutcome::ChannelLost(reason);
                }
            }
        };

        let graceful = matches!(outcome, ConnectionOutcome::Left) && !self.shutdown.is_cancelled();
        if graceful {
            let stats = capture.stop().await;
            debug!(?stats, "capture stopped before leave");
            if out_tx
                .send(StudentMessage::Leave {
                    student_id: self.student_id.clone(),
                })
                .await
                .is_err()
            {
                debug!("writer gone before leave could be queued");
            }
            drop(out_tx);
            if tokio::time::timeout(LEAVE_FLUSH_TIMEOUT, &mut writer_task)
                .await
                .is_err()
            {
                warn!("leave flush timed out");
            }
            conn_cancel.cancel();
        } else {
            conn_cancel.cancel();
            drop(out_tx);
            let stats = capture.stop().await;
            debug!(?stats, "capture stopped");
        }

        if !writer_task.is_finished() {
            writer_task.abort();
        }
        if reader_task.await.is_err() {
            debug!("reader task ended abnormally");
        }
        outcome
    }
}
