#![forbid(unsafe_code)]

//! `lockin-ctl`: operator and test companion for `lockin-relay`.
//!
//! Subscribes as an observer to watch the live feed or issue removal and
//! dismissal decisions, downloads flagged audio, and can run a simulated
//! student session against synthetic capture devices.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{fmt, EnvFilter};

use lockin_proctor::capture::synthetic::{SyntheticControls, SyntheticDevices};
use lockin_proctor::config::GlobalConfig;
use lockin_proctor::models::alert::AudioClipRef;
use lockin_proctor::models::student::StudentId;
use lockin_proctor::observer::evidence::EvidenceClient;
use lockin_proctor::observer::{ObserverClient, ObserverNotice};
use lockin_proctor::protocol::transport::TcpConnector;
use lockin_proctor::student::{SessionEnd, StudentSession};
use lockin_proctor::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "lockin-ctl",
    about = "Operator CLI for lockin-relay",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Relay channel address (overrides `relay.bind_addr`).
    #[arg(long)]
    relay: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the live observer feed until interrupted.
    Watch,

    /// Remove a connected student.
    Remove {
        /// Student identity.
        student_id: String,
        /// Reason shown to the student.
        #[arg(long, default_value = "Removed by administrator.")]
        reason: String,
    },

    /// Dismiss a student's critical status as a false alarm.
    Dismiss {
        /// Student identity.
        student_id: String,
    },

    /// Download a flagged audio clip.
    FetchAudio {
        /// Server-assigned clip file name.
        filename: String,
        /// Where to write the clip (defaults to the file name).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Run a student session with synthetic camera and microphone.
    SimulateStudent {
        /// Student identity to join as.
        student_id: String,
        /// Leave after this many seconds (runs until interrupted if omitted).
        #[arg(long)]
        seconds: Option<u64>,
    },
}

fn main() {
    let args = Cli::parse();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("Error: failed to build tokio runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(args)) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match args.config {
        Some(ref path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(relay) = args.relay {
        config.relay.bind_addr = relay;
    }
    let connector = TcpConnector::new(config.relay.bind_addr);

    match args.command {
        Command::Watch => watch(connector, &config).await,
        Command::Remove { student_id, reason } => {
            let client = ObserverClient::connect(connector, &config).await?;
            let sent = client.remove(StudentId::new(student_id), reason).await?;
            println!("{}", if sent { "OK" } else { "removal already pending" });
            client.shutdown().await;
            Ok(())
        }
        Command::Dismiss { student_id } => {
            let client = ObserverClient::connect(connector, &config).await?;
            client.dismiss(StudentId::new(student_id)).await?;
            println!("OK");
            client.shutdown().await;
            Ok(())
        }
        Command::FetchAudio { filename, out } => {
            let evidence = EvidenceClient::for_relay(&config.relay);
            let clip = AudioClipRef { filename };
            let bytes = evidence.fetch(&clip).await?;
            let out = out.unwrap_or_else(|| PathBuf::from(&clip.filename));
            tokio::fs::write(&out, &bytes).await?;
            println!("wrote {} bytes to {}", bytes.len(), out.display());
            Ok(())
        }
        Command::SimulateStudent {
            student_id,
            seconds,
        } => simulate_student(connector, &config, StudentId::new(student_id), seconds).await,
    }
}

async fn watch(connector: TcpConnector, config: &GlobalConfig) -> Result<()> {
    let client = ObserverClient::connect(connector, config).await?;
    let mut notices = client.subscribe();
    let engine = client.snapshot().await?;
    for student in engine.store().iter() {
        println!(
            "student {} score={} status={} warnings={}",
            student.student_id, student.focus_score, student.status, student.warning_count
        );
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = notices.recv() => match notice {
                Ok(notice) => print_notice(&client, &notice).await,
                Err(RecvError::Lagged(skipped)) => eprintln!("(skipped {skipped} notices)"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn print_notice(client: &ObserverClient, notice: &ObserverNotice) {
    match notice {
        ObserverNotice::RosterSeeded { count } => println!("roster: {count} students"),
        ObserverNotice::StudentChanged { student_id } => {
            if let Ok(engine) = client.snapshot().await {
                if let Some(s) = engine.store().get(student_id) {
                    println!(
                        "student {} score={} status={} warnings={}",
                        s.student_id, s.focus_score, s.status, s.warning_count
                    );
                }
            }
        }
        ObserverNotice::StudentRemoved { student_id } => println!("left: {student_id}"),
        ObserverNotice::AlertAppended { alert } => {
            let clip = alert
                .evidence
                .as_ref()
                .and_then(|e| e.audio_clip.as_ref())
                .map(|c| format!(" audio={}", c.filename))
                .unwrap_or_default();
            println!(
                "alert [{:?}] {}: {}{clip}",
                alert.severity, alert.student_id, alert.message
            );
        }
        ObserverNotice::ReviewOpened { case } | ObserverNotice::ReviewUpdated { case } => {
            let reason = case
                .alert
                .as_ref()
                .map_or("no alert yet", |a| a.message.as_str());
            println!(
                "REVIEW {} status={} ({reason})",
                case.student_id(),
                case.student.status
            );
        }
        ObserverNotice::ReviewCancelled { student_id } => {
            println!("review cancelled: {student_id} left");
        }
        ObserverNotice::ReviewResolved {
            student_id,
            resolution,
        } => println!("review resolved: {student_id} {resolution:?}"),
        ObserverNotice::FocusCleared { student_id } => println!("focus cleared: {student_id}"),
        ObserverNotice::RelayError { message } => eprintln!("relay error: {message}"),
    }
}

async fn simulate_student(
    connector: TcpConnector,
    config: &GlobalConfig,
    student_id: StudentId,
    seconds: Option<u64>,
) -> Result<()> {
    let devices = Arc::new(SyntheticDevices::new(SyntheticControls::new()));
    let session = StudentSession::start(
        student_id,
        connector,
        devices,
        config,
        Box::new(|end| eprintln!("session ended: {end:?}")),
    );
    let mut phase = session.subscribe();

    let deadline = async {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                session.leave();
                break;
            }
            () = &mut deadline => {
                session.leave();
                break;
            }
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = phase.borrow_and_update().clone();
                println!("phase: {current:?}");
                if current.is_terminal() {
                    break;
                }
            }
        }
    }

    let end = session.wait().await;
    println!("ended: {end:?}");
    match end {
        SessionEnd::DeviceFailure { error } => Err(AppError::Device(error)),
        SessionEnd::HandshakeFailed { error } => Err(AppError::Handshake(error)),
        SessionEnd::Disconnected { error } => Err(AppError::Channel(error)),
        SessionEnd::Removed { .. } | SessionEnd::Left => Ok(()),
    }
}
