//! Contract tests for the NDJSON wire format.
//!
//! Pins the exact JSON shape of each message family so that students,
//! observers, and relays built separately keep agreeing on it.

use serde_json::json;

use lockin_proctor::models::alert::{AlertEvent, AudioClipRef, Evidence, Severity};
use lockin_proctor::models::student::{Snapshot, StudentPatch, StudentState};
use lockin_proctor::protocol::messages::{
    decode_line, ClientHello, ObserverMessage, RelayEvent, StudentCommand, StudentMessage,
    WireMessage,
};

fn to_value<T: WireMessage>(msg: &T) -> serde_json::Value {
    serde_json::to_value(msg).expect("serialise")
}

#[test]
fn frame_carries_base64_snapshot() {
    let msg = StudentMessage::Frame {
        snapshot: Snapshot::new(vec![0xFF, 0xD8, 0xFF]),
    };
    assert_eq!(to_value(&msg), json!({"type": "frame", "snapshot": "/9j/"}));
}

#[test]
fn audio_segment_omits_missing_snapshot() {
    let msg = StudentMessage::AudioSegment {
        audio: b"abc".to_vec(),
        snapshot: None,
    };
    assert_eq!(to_value(&msg), json!({"type": "audio_segment", "audio": "YWJj"}));
}

#[test]
fn student_join_and_leave() {
    assert_eq!(
        to_value(&StudentMessage::Join {
            student_id: "s1".into()
        }),
        json!({"type": "join", "student_id": "s1"})
    );
    assert_eq!(
        to_value(&StudentMessage::Leave {
            student_id: "s1".into()
        }),
        json!({"type": "leave", "student_id": "s1"})
    );
}

#[test]
fn observer_messages() {
    assert_eq!(to_value(&ObserverMessage::AdminJoin), json!({"type": "admin_join"}));
    assert_eq!(
        to_value(&ObserverMessage::RemoveStudent {
            student_id: "s1".into(),
            reason: "Removed by administrator.".into(),
        }),
        json!({"type": "remove_student", "student_id": "s1", "reason": "Removed by administrator."})
    );
    assert_eq!(
        to_value(&ObserverMessage::DismissAlert {
            student_id: "s1".into()
        }),
        json!({"type": "dismiss_alert", "student_id": "s1"})
    );
}

#[test]
fn removal_command() {
    assert_eq!(
        to_value(&StudentCommand::Removal {
            reason: "bye".into()
        }),
        json!({"type": "removal", "reason": "bye"})
    );
}

#[test]
fn partial_update_omits_unchanged_fields() {
    let patch = StudentPatch::new("s1".into()).with_status("CriticalImpersonation");
    assert_eq!(
        to_value(&RelayEvent::StudentUpdated { patch }),
        json!({
            "type": "student_updated",
            "patch": {"student_id": "s1", "status": "CriticalImpersonation"}
        })
    );
}

#[test]
fn student_joined_record_shape() {
    let event = RelayEvent::StudentJoined {
        student: StudentState::joined("s1".into()),
    };
    assert_eq!(
        to_value(&event),
        json!({
            "type": "student_joined",
            "student": {
                "student_id": "s1",
                "focus_score": 100,
                "status": "Connected",
                "warning_count": 0
            }
        })
    );
}

#[test]
fn alert_with_evidence_round_trips_from_foreign_json() {
    let line = json!({
        "type": "alert",
        "alert": {
            "alert_id": "a-1",
            "student_id": "s1",
            "severity": "critical",
            "message": "Voice detected",
            "evidence": {
                "snapshot": "/9j/",
                "audio_clip": {"filename": "s1_20240101_120000_deadbeef.webm"}
            },
            "raised_at": "2024-01-01T12:00:00Z"
        }
    })
    .to_string();

    let Some(RelayEvent::Alert { alert }) = decode_line::<RelayEvent>(&line).expect("valid")
    else {
        panic!("expected an alert");
    };
    assert_eq!(alert.alert_id, "a-1");
    assert_eq!(alert.severity, Severity::Critical);
    assert_eq!(
        alert.evidence_snapshot(),
        Some(&Snapshot::new(vec![0xFF, 0xD8, 0xFF]))
    );
    assert_eq!(
        alert.evidence.and_then(|e| e.audio_clip),
        Some(AudioClipRef {
            filename: "s1_20240101_120000_deadbeef.webm".into()
        })
    );
}

#[test]
fn alert_without_evidence_omits_field() {
    let alert = AlertEvent::new("s1".into(), Severity::Info, "Removed by administrator.");
    let value = to_value(&RelayEvent::Alert { alert });
    assert!(value["alert"].get("evidence").is_none());
    assert_eq!(value["alert"]["severity"], "info");
}

#[test]
fn evidence_without_clip_omits_it() {
    let evidence = Evidence {
        snapshot: Some(Snapshot::new(vec![1])),
        audio_clip: None,
    };
    assert_eq!(
        serde_json::to_value(&evidence).expect("serialise"),
        json!({"snapshot": "AQ=="})
    );
}

#[test]
fn hello_accepts_both_roles() {
    assert_eq!(
        decode_line::<ClientHello>(r#"{"type":"join","student_id":"s1"}"#).expect("ok"),
        Some(ClientHello::Join {
            student_id: "s1".into()
        })
    );
    assert_eq!(
        decode_line::<ClientHello>(r#"{"type":"admin_join"}"#).expect("ok"),
        Some(ClientHello::AdminJoin)
    );
}

#[test]
fn invalid_base64_snapshot_is_rejected() {
    assert!(decode_line::<StudentMessage>(r#"{"type":"frame","snapshot":"***"}"#).is_err());
}
