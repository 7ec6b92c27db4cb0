use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use lockin_proctor::config::SessionConfig;
use lockin_proctor::protocol::transport::{reconnect, ReconnectPolicy};
use lockin_proctor::AppError;

fn policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        base_delay: Duration::from_millis(100),
    }
}

#[test]
fn delay_doubles_and_is_capped() {
    let p = policy(5);
    assert_eq!(p.delay_for(1), Duration::from_millis(100));
    assert_eq!(p.delay_for(2), Duration::from_millis(200));
    assert_eq!(p.delay_for(4), Duration::from_millis(800));
    assert_eq!(p.delay_for(40), Duration::from_secs(30));
}

#[test]
fn policy_follows_session_config() {
    let p = ReconnectPolicy::from_config(&SessionConfig::default());
    assert_eq!(p.max_attempts, 5);
    assert_eq!(p.base_delay, Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn succeeds_on_a_later_attempt() {
    let calls = AtomicU32::new(0);
    let mut seen = Vec::new();

    let value = reconnect(
        policy(5),
        &CancellationToken::new(),
        |attempt| seen.push(attempt),
        || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AppError::Channel("refused".into()))
            } else {
                Ok(42)
            }
        },
    )
    .await
    .expect("third attempt succeeds");

    assert_eq!(value, 42);
    assert_eq!(seen, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn gives_up_with_last_error() {
    let err = reconnect(
        policy(3),
        &CancellationToken::new(),
        |_| {},
        || async { Err::<(), _>(AppError::Channel("still down".into())) },
    )
    .await
    .unwrap_err();
    assert!(
        matches!(err, AppError::Channel(ref msg) if msg == "still down"),
        "got {err:?}"
    );
}

#[tokio::test]
async fn zero_attempts_disables_reconnection() {
    let err = reconnect(
        policy(0),
        &CancellationToken::new(),
        |_| panic!("no attempt expected"),
        || async { Ok::<(), AppError>(()) },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Channel(_)), "got {err:?}");
}

#[tokio::test]
async fn cancellation_stops_waiting() {
    let ct = CancellationToken::new();
    ct.cancel();
    let err = reconnect(
        ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(3600),
        },
        &ct,
        |_| {},
        || async { Ok::<(), AppError>(()) },
    )
    .await
    .unwrap_err();
    assert!(
        matches!(err, AppError::Channel(ref msg) if msg.contains("cancelled")),
        "got {err:?}"
    );
}
