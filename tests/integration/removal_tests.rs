//! Operator decisions travelling observer → relay → student.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use lockin_proctor::capture::synthetic::{SyntheticControls, SyntheticDevices};
use lockin_proctor::models::alert::Severity;
use lockin_proctor::observer::engine::REMOVAL_REASON;
use lockin_proctor::observer::{LinkStatus, ObserverClient, ObserverNotice, Resolution, ReviewPhase};
use lockin_proctor::protocol::messages::{decode_line, RelayEvent};
use lockin_proctor::relay::hub::DISMISSED_MESSAGE;
use lockin_proctor::student::{SessionEnd, SessionPhase, StudentSession};
use lockin_proctor::AppError;

use super::test_helpers::{
    next_notice, recording_hook, wait_phase, ScriptedAnalyzer, TestRelay, WAIT,
};

#[tokio::test]
async fn confirmed_removal_stops_student_exactly_once() {
    let relay = TestRelay::with_analyzer(Arc::new(ScriptedAnalyzer::default())).await;
    let observer = ObserverClient::connect(relay.connector(), &relay.config)
        .await
        .expect("observer subscribed");
    let mut notices = observer.subscribe();

    let controls = SyntheticControls::new();
    let devices = Arc::new(SyntheticDevices::new(Arc::clone(&controls)));
    let (hook, ends) = recording_hook();
    let session = StudentSession::start("s1".into(), relay.connector(), devices, &relay.config, hook);

    next_notice(&mut notices, |n| matches!(n, ObserverNotice::ReviewOpened { .. })).await;

    assert!(observer.confirm_remove("s1".into()).await.expect("under review"));
    // Either still in flight (no second command) or already gone.
    let second = observer.confirm_remove("s1".into()).await;
    assert!(
        matches!(second, Ok(false) | Err(AppError::NotFound(_))),
        "got {second:?}"
    );

    next_notice(&mut notices, |n| {
        *n == ObserverNotice::ReviewResolved {
            student_id: "s1".into(),
            resolution: Resolution::Removed,
        }
    })
    .await;

    let end = tokio::time::timeout(WAIT, session.wait()).await.expect("session ends");
    assert_eq!(
        end,
        SessionEnd::Removed {
            reason: REMOVAL_REASON.into()
        }
    );
    assert_eq!(
        *ends.lock().unwrap(),
        vec![SessionEnd::Removed {
            reason: REMOVAL_REASON.into()
        }]
    );
    assert_eq!(controls.released_handles(), 2);

    let engine = observer.snapshot().await.expect("engine");
    assert!(!engine.store().contains(&"s1".into()));
    assert!(!engine.removal_pending(&"s1".into()));
    assert!(engine
        .ledger()
        .recent()
        .any(|a| a.severity == Severity::Info && a.message == REMOVAL_REASON));

    observer.shutdown().await;
}

#[tokio::test]
async fn removal_of_reviewed_student_leaves_others_running() {
    let relay = TestRelay::with_analyzer(Arc::new(ScriptedAnalyzer::default())).await;
    let observer = ObserverClient::connect(relay.connector(), &relay.config)
        .await
        .expect("observer subscribed");
    let mut notices = observer.subscribe();

    let (hook_a, _) = recording_hook();
    let flagged = StudentSession::start(
        "flagged".into(),
        relay.connector(),
        Arc::new(SyntheticDevices::new(SyntheticControls::new())),
        &relay.config,
        hook_a,
    );
    next_notice(&mut notices, |n| matches!(n, ObserverNotice::ReviewOpened { .. })).await;

    let (hook_b, _) = recording_hook();
    let bystander = StudentSession::start(
        "bystander".into(),
        relay.connector(),
        Arc::new(SyntheticDevices::new(SyntheticControls::new())),
        &relay.config,
        hook_b,
    );
    let mut phase = bystander.subscribe();
    wait_phase(&mut phase, |p| *p == SessionPhase::Active).await;

    assert!(observer.confirm_remove("flagged".into()).await.expect("under review"));
    assert!(matches!(flagged.wait().await, SessionEnd::Removed { .. }));

    relay
        .wait_roster(|r| r.len() == 1 && r[0].student_id.as_str() == "bystander")
        .await;
    assert_eq!(bystander.phase(), SessionPhase::Active);

    bystander.leave();
    assert_eq!(bystander.wait().await, SessionEnd::Left);
    observer.shutdown().await;
}

#[tokio::test]
async fn dismissal_clears_status_at_relay_and_keeps_alert() {
    let relay = TestRelay::with_analyzer(Arc::new(ScriptedAnalyzer::default())).await;
    let observer = ObserverClient::connect(relay.connector(), &relay.config)
        .await
        .expect("observer subscribed");
    let mut notices = observer.subscribe();

    let (hook, ends) = recording_hook();
    let session = StudentSession::start(
        "s1".into(),
        relay.connector(),
        Arc::new(SyntheticDevices::new(SyntheticControls::new())),
        &relay.config,
        hook,
    );
    next_notice(&mut notices, |n| matches!(n, ObserverNotice::ReviewOpened { .. })).await;

    observer.dismiss("s1".into()).await.expect("under review");
    let engine = observer.snapshot().await.expect("engine");
    assert_eq!(engine.phase(&"s1".into()), ReviewPhase::Normal);

    relay
        .wait_roster(|r| r.iter().any(|s| s.student_id.as_str() == "s1" && s.status == "Focused"))
        .await;
    next_notice(&mut notices, |n| {
        matches!(n, ObserverNotice::AlertAppended { alert } if alert.message == DISMISSED_MESSAGE)
    })
    .await;

    let engine = observer.snapshot().await.expect("engine");
    assert!(engine
        .ledger()
        .recent()
        .any(|a| a.severity == Severity::Critical));
    assert_eq!(session.phase(), SessionPhase::Active);
    assert!(ends.lock().unwrap().is_empty(), "dismissal does not stop the student");

    session.leave();
    session.wait().await;
    observer.shutdown().await;
}

#[tokio::test]
async fn decisions_for_unknown_students_fail_locally() {
    let relay = TestRelay::start().await;
    let observer = ObserverClient::connect(relay.connector(), &relay.config)
        .await
        .expect("observer subscribed");
    assert_eq!(*observer.link_status().borrow(), LinkStatus::Connected);
    assert!(!observer.focus("ghost".into()).await.expect("running"));

    let err = observer.confirm_remove("ghost".into()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
    let err = observer.remove("ghost".into(), "x").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
    let err = observer.dismiss("ghost".into()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");

    observer.shutdown().await;
}

#[tokio::test]
async fn relay_reports_removal_of_unknown_student() {
    let relay = TestRelay::start().await;
    let stream = TcpStream::connect(relay.config.relay.bind_addr)
        .await
        .expect("connect");
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write.write_all(b"{\"type\":\"admin_join\"}\n").await.expect("hello");
    let roster = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("roster in time")
        .expect("read")
        .expect("line");
    assert!(matches!(
        decode_line::<RelayEvent>(&roster).expect("valid"),
        Some(RelayEvent::InitialRoster { ref students }) if students.is_empty()
    ));

    write
        .write_all(b"{\"type\":\"remove_student\",\"student_id\":\"ghost\",\"reason\":\"x\"}\n")
        .await
        .expect("send");
    let reply = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("reply in time")
        .expect("read")
        .expect("line");
    assert!(matches!(
        decode_line::<RelayEvent>(&reply).expect("valid"),
        Some(RelayEvent::ProtocolError { ref message }) if message.contains("ghost")
    ));
}
