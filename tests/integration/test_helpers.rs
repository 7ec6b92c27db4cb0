//! Shared fixtures for integration tests.
//!
//! [`TestRelay`] runs a complete relay (channel listener plus HTTP side
//! channel) on ephemeral ports with fast capture and handshake timing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use lockin_proctor::config::GlobalConfig;
use lockin_proctor::models::alert::Severity;
use lockin_proctor::models::student::{Snapshot, StudentState};
use lockin_proctor::observer::ObserverNotice;
use lockin_proctor::protocol::transport::TcpConnector;
use lockin_proctor::relay::{http, spawn_relay, EvidenceAnalyzer, NoopAnalyzer, RelayHub, Verdict};
use lockin_proctor::student::{SessionEnd, SessionPhase, StopHook};

/// Upper bound for anything an integration test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

/// Running relay plus everything a test needs to reach it.
pub struct TestRelay {
    pub config: GlobalConfig,
    pub hub: Arc<RelayHub>,
    pub http_base: String,
    pub ct: CancellationToken,
    _audio_dir: tempfile::TempDir,
}

impl TestRelay {
    pub async fn start() -> Self {
        Self::with_analyzer(Arc::new(NoopAnalyzer)).await
    }

    pub async fn with_analyzer(analyzer: Arc<dyn EvidenceAnalyzer>) -> Self {
        let audio_dir = tempfile::tempdir().expect("tempdir");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind relay");
        let http_listener = http::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("bind http");

        let mut config = fast_config();
        config.relay.bind_addr = listener.local_addr().expect("relay addr");
        config.relay.http_port = http_listener.local_addr().expect("http addr").port();
        config.relay.audio_dir = audio_dir.path().to_path_buf();

        let hub = Arc::new(RelayHub::new(&config, analyzer).expect("hub"));
        let ct = CancellationToken::new();
        spawn_relay(
            Arc::clone(&hub),
            listener,
            config.session.handshake_timeout(),
            ct.clone(),
        );
        let http_ct = ct.clone();
        let dir = config.relay.audio_dir.clone();
        tokio::spawn(async move {
            let _ = http::serve_http(http_listener, dir, http_ct).await;
        });

        let http_base = format!("http://127.0.0.1:{}", config.relay.http_port);
        Self {
            config,
            hub,
            http_base,
            ct,
            _audio_dir: audio_dir,
        }
    }

    pub fn connector(&self) -> TcpConnector {
        TcpConnector::new(self.config.relay.bind_addr)
    }

    pub fn audio_dir(&self) -> &std::path::Path {
        &self.config.relay.audio_dir
    }

    /// Wait until the relay's roster satisfies `pred`.
    pub async fn wait_roster(&self, pred: impl Fn(&[StudentState]) -> bool) {
        tokio::time::timeout(WAIT, async {
            loop {
                if pred(&self.hub.roster().await) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("roster condition within timeout");
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

/// Configuration with sub-second capture cadence and short timeouts.
pub fn fast_config() -> GlobalConfig {
    let mut config = GlobalConfig::default();
    config.capture.snapshot_interval_ms = 100;
    config.capture.audio_segment_seconds = 1;
    config.session.handshake_timeout_seconds = 2;
    config.session.reconnect_max_attempts = 0;
    config.session.reconnect_backoff_ms = 50;
    config.relay.removal_grace_seconds = 1;
    config
}

/// Analyzer that flags the first frame it sees as an impersonation, and
/// optionally every audio segment as a voice detection.
#[derive(Default)]
pub struct ScriptedAnalyzer {
    frame_flagged: AtomicBool,
    pub flag_audio: bool,
}

impl ScriptedAnalyzer {
    pub fn flag_audio() -> Self {
        Self {
            flag_audio: true,
            ..Self::default()
        }
    }
}

pub const IMPERSONATION: &str = "Face does not match baseline";
pub const VOICE: &str = "Voice detected";

impl EvidenceAnalyzer for ScriptedAnalyzer {
    fn analyze_frame(&self, _student: &StudentState, _snapshot: &Snapshot) -> Option<Verdict> {
        if self.frame_flagged.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(
            Verdict::alert(Severity::Critical, IMPERSONATION)
                .with_status("CriticalImpersonation")
                .with_focus_score(0)
                .with_warnings(1),
        )
    }

    fn analyze_audio(
        &self,
        _student: &StudentState,
        _audio: &[u8],
        _snapshot: Option<&Snapshot>,
    ) -> Option<Verdict> {
        self.flag_audio
            .then(|| Verdict::alert(Severity::Warning, VOICE).with_warnings(1))
    }
}

/// Stop hook that records every invocation.
pub fn recording_hook() -> (StopHook, Arc<Mutex<Vec<SessionEnd>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    let hook: StopHook = Box::new(move |end| sink.lock().expect("hook lock").push(end));
    (hook, calls)
}

/// Wait for a notice matching `pred`, skipping everything else.
pub async fn next_notice(
    rx: &mut broadcast::Receiver<ObserverNotice>,
    pred: impl Fn(&ObserverNotice) -> bool,
) -> ObserverNotice {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(notice) if pred(&notice) => return notice,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("notice stream closed"),
            }
        }
    })
    .await
    .expect("notice within timeout")
}

/// Wait until the session reaches `phase`.
pub async fn wait_phase(rx: &mut watch::Receiver<SessionPhase>, pred: impl Fn(&SessionPhase) -> bool) {
    tokio::time::timeout(WAIT, rx.wait_for(|p| pred(p)))
        .await
        .expect("phase within timeout")
        .expect("session alive");
}
