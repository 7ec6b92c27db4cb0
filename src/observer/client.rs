//! Observer process wiring: relay subscription plus the engine loop.
//!
//! [`ObserverClient::connect`] completes the `admin_join` handshake, then
//! spawns one task that exclusively owns the [`ObserverEngine`]. Relay
//! events and operator commands both flow into that task, so the store and
//! ledger have a single writer. Change notifications go out on a
//! [`broadcast`] channel.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::models::student::{StudentId, StudentState};
use crate::observer::engine::{ObserverEngine, ObserverNotice};
use crate::protocol::handshake;
use crate::protocol::messages::{ObserverMessage, RelayEvent};
use crate::protocol::reader::{line_reader, run_reader, Inbound};
use crate::protocol::transport::{reconnect, Connector, ReconnectPolicy};
use crate::protocol::writer::{line_writer, run_writer};
use crate::{AppError, Result};

const NOTICE_BUFFER: usize = 256;
const COMMAND_BUFFER: usize = 32;
const CHANNEL_BUFFER: usize = 256;

/// Relay link status as seen by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// Subscribed and receiving events.
    Connected,
    /// Subscription lost; trying again.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// The client stopped.
    Closed {
        /// Why, if it was not a requested shutdown.
        error: Option<String>,
    },
}

enum Command {
    ConfirmRemove {
        student_id: StudentId,
        reply: oneshot::Sender<Result<bool>>,
    },
    Remove {
        student_id: StudentId,
        reason: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Dismiss {
        student_id: StudentId,
        reply: oneshot::Sender<Result<()>>,
    },
    Focus {
        student_id: StudentId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<ObserverEngine>,
    },
}

/// Handle to a running observer.
///
/// Dropping the handle stops the engine loop and closes the subscription.
pub struct ObserverClient {
    cmd_tx: mpsc::Sender<Command>,
    notice_tx: broadcast::Sender<ObserverNotice>,
    link_rx: watch::Receiver<LinkStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Drop for ObserverClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ObserverClient {
    /// Subscribe to the relay behind `connector` and start the engine loop.
    ///
    /// The initial roster is already folded into the engine when this
    /// returns.
    ///
    /// # Errors
    ///
    /// - [`AppError::Config`]: the observer configuration is invalid.
    /// - [`AppError::Channel`] / [`AppError::Handshake`]: the first
    ///   subscription failed.
    pub async fn connect<C>(connector: C, config: &GlobalConfig) -> Result<Self>
    where
        C: Connector + 'static,
    {
        let mut engine = ObserverEngine::new(&config.observer)?;
        let cancel = CancellationToken::new();
        let timeout = config.session.handshake_timeout();

        let (roster, link) = Link::open(&connector, timeout, &cancel).await?;
        engine.apply(RelayEvent::InitialRoster { students: roster });

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (notice_tx, _) = broadcast::channel(NOTICE_BUFFER);
        let (link_tx, link_rx) = watch::channel(LinkStatus::Connected);

        let event_loop = EngineLoop {
            engine,
            connector,
            timeout,
            policy: ReconnectPolicy::from_config(&config.session),
            notice_tx: notice_tx.clone(),
            link_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(
            event_loop
                .run(link, cmd_rx)
                .instrument(info_span!("observer")),
        );

        Ok(Self {
            cmd_tx,
            notice_tx,
            link_rx,
            cancel,
            task: Some(task),
        })
    }

    /// Receive change notifications from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ObserverNotice> {
        self.notice_tx.subscribe()
    }

    /// Watch the relay link status.
    #[must_use]
    pub fn link_status(&self) -> watch::Receiver<LinkStatus> {
        self.link_rx.clone()
    }

    /// Confirm removal of a student under review.
    ///
    /// Returns `false` when a removal for the student is already in flight.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] if the student has no open review;
    /// [`AppError::Channel`] if the client has stopped.
    pub async fn confirm_remove(&self, student_id: StudentId) -> Result<bool> {
        self.request(|reply| Command::ConfirmRemove { student_id, reply })
            .await?
    }

    /// Remove a connected student regardless of review state.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] if the student is not connected;
    /// [`AppError::Channel`] if the client has stopped.
    pub async fn remove(&self, student_id: StudentId, reason: impl Into<String>) -> Result<bool> {
        let reason = reason.into();
        self.request(|reply| Command::Remove {
            student_id,
            reason,
            reply,
        })
        .await?
    }

    /// Dismiss a critical status as a false alarm.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] if the student has no open review;
    /// [`AppError::Channel`] if the client has stopped.
    pub async fn dismiss(&self, student_id: StudentId) -> Result<()> {
        self.request(|reply| Command::Dismiss { student_id, reply })
            .await?
    }

    /// Point the detail panel at a student.
    ///
    /// # Errors
    ///
    /// [`AppError::Channel`] if the client has stopped.
    pub async fn focus(&self, student_id: StudentId) -> Result<bool> {
        self.request(|reply| Command::Focus { student_id, reply })
            .await
    }

    /// Copy of the engine state as of now.
    ///
    /// # Errors
    ///
    /// [`AppError::Channel`] if the client has stopped.
    pub async fn snapshot(&self) -> Result<ObserverEngine> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Stop the engine loop and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if task.await.is_err() {
                debug!("observer task ended abnormally");
            }
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| AppError::Channel("observer stopped".into()))?;
        rx.await
            .map_err(|_| AppError::Channel("observer stopped before replying".into()))
    }
}

/// One live relay subscription.
struct Link {
    in_rx: mpsc::Receiver<Inbound<RelayEvent>>,
    out_tx: mpsc::Sender<ObserverMessage>,
    cancel: CancellationToken,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Link {
    async fn open<C: Connector>(
        connector: &C,
        timeout: Duration,
        parent: &CancellationToken,
    ) -> Result<(Vec<StudentState>, Self)> {
        let stream = connector.connect().await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = line_reader(read_half);
        let mut writer = line_writer(write_half);
        let roster = handshake::observer_join(&mut reader, &mut writer, timeout).await?;

        let cancel = parent.child_token();
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_BUFFER);
        tokio::spawn(run_reader("observer".to_owned(), reader, in_tx, cancel.clone()));
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = run_writer("observer".to_owned(), writer, out_rx, writer_cancel).await {
                warn!(%err, "observer writer stopped");
            }
        });

        Ok((
            roster,
            Self {
                in_rx,
                out_tx,
                cancel,
            },
        ))
    }
}

struct EngineLoop<C> {
    engine: ObserverEngine,
    connector: C,
    timeout: Duration,
    policy: ReconnectPolicy,
    notice_tx: broadcast::Sender<ObserverNotice>,
    link_tx: watch::Sender<LinkStatus>,
    cancel: CancellationToken,
}

impl<C: Connector> EngineLoop<C> {
    async fn run(mut self, mut link: Link, mut cmd_rx: mpsc::Receiver<Command>) {
        let error = loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break None,

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break None };
                    self.handle_command(cmd, &link).await;
                }

                inbound = link.in_rx.recv() => {
                    let reason = match inbound {
                        Some(Inbound::Message(event)) => {
                            let notices = self.engine.apply(event);
                            self.publish(notices);
                            continue;
                        }
                        Some(Inbound::Closed { reason }) => reason,
                        None => "reader stopped".to_owned(),
                    };

                    warn!(reason, "relay subscription lost");
                    self.publish(vec![ObserverNotice::RelayError {
                        message: format!("subscription lost: {reason}"),
                    }]);
                    match self.resubscribe().await {
                        Ok(fresh) => link = fresh,
                        Err(err) => break Some(err.to_string()),
                    }
                }
            }
        };

        if let Some(ref error) = error {
            warn!(error, "observer stopped");
        } else {
            info!("observer stopped");
        }
        self.link_tx.send_replace(LinkStatus::Closed { error });
    }

    async fn resubscribe(&mut self) -> Result<Link> {
        let link_tx = &self.link_tx;
        let connector = &self.connector;
        let timeout = self.timeout;
        let cancel = &self.cancel;
        let (roster, link) = reconnect(
            self.policy,
            cancel,
            |attempt| {
                link_tx.send_replace(LinkStatus::Reconnecting { attempt });
            },
            || Link::open(connector, timeout, cancel),
        )
        .await?;

        self.link_tx.send_replace(LinkStatus::Connected);
        let notices = self.engine.apply(RelayEvent::InitialRoster { students: roster });
        self.publish(notices);
        Ok(link)
    }

    async fn handle_command(&mut self, cmd: Command, link: &Link) {
        match cmd {
            Command::ConfirmRemove { student_id, reply } => {
                let result = match self.engine.confirm_remove(&student_id) {
                    Ok(msg) => self.forward_removal(link, &student_id, msg).await,
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            Command::Remove {
                student_id,
                reason,
                reply,
            } => {
                let result = match self.engine.remove(&student_id, &reason) {
                    Ok(msg) => self.forward_removal(link, &student_id, msg).await,
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            Command::Dismiss { student_id, reply } => {
                let result = match self.engine.dismiss(&student_id) {
                    Ok((msg, notices)) => {
                        self.publish(notices);
                        Self::forward(link, Some(msg)).await.map(|_| ())
                    }
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            Command::Focus { student_id, reply } => {
                let _ = reply.send(self.engine.focus(&student_id));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.engine.clone());
            }
        }
    }

    /// Send a removal; an unsent command does not leave the student pending.
    async fn forward_removal(
        &mut self,
        link: &Link,
        student_id: &StudentId,
        msg: Option<ObserverMessage>,
    ) -> Result<bool> {
        let sent = Self::forward(link, msg).await;
        if sent.is_err() {
            let notices = self.engine.withdraw_removal(student_id);
            self.publish(notices);
        }
        sent
    }

    /// Send `msg` to the relay; `Ok(false)` when there was nothing to send.
    async fn forward(link: &Link, msg: Option<ObserverMessage>) -> Result<bool> {
        let Some(msg) = msg else {
            return Ok(false);
        };
        link.out_tx
            .send(msg)
            .await
            .map_err(|_| AppError::Channel("relay link is down".into()))?;
        Ok(true)
    }

    fn publish(&self, notices: Vec<ObserverNotice>) {
        for notice in notices {
            // No subscribers is fine.
            let _ = self.notice_tx.send(notice);
        }
    }
}
