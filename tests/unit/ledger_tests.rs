//! Unit tests for the bounded alert ledger.

use lockin_proctor::models::alert::{AlertEvent, Severity};
use lockin_proctor::observer::ledger::AlertLedger;

fn alert(student: &str, severity: Severity, message: &str) -> AlertEvent {
    AlertEvent::new(student.into(), severity, message)
}

#[test]
fn appending_past_capacity_evicts_oldest() {
    let mut ledger = AlertLedger::new(3);
    let first = alert("s1", Severity::Warning, "first");
    let first_id = first.alert_id.clone();
    ledger.append(first);
    for n in 0..3 {
        ledger.append(alert("s1", Severity::Info, &format!("later {n}")));
    }

    assert_eq!(ledger.len(), 3);
    assert!(ledger.recent().all(|a| a.alert_id != first_id));
}

#[test]
fn recent_is_newest_first() {
    let mut ledger = AlertLedger::new(15);
    ledger.append(alert("s1", Severity::Info, "one"));
    ledger.append(alert("s1", Severity::Info, "two"));
    ledger.append(alert("s2", Severity::Info, "three"));

    let order: Vec<&str> = ledger.recent().map(|a| a.message.as_str()).collect();
    assert_eq!(order, vec!["three", "two", "one"]);
}

#[test]
fn duplicate_alert_id_is_ignored() {
    let mut ledger = AlertLedger::new(15);
    let a = alert("s1", Severity::Critical, "dup");
    assert!(ledger.append(a.clone()));
    assert!(!ledger.append(a));
    assert_eq!(ledger.len(), 1);
}

#[test]
fn zero_capacity_is_raised_to_one() {
    let mut ledger = AlertLedger::new(0);
    assert_eq!(ledger.capacity(), 1);
    ledger.append(alert("s1", Severity::Info, "a"));
    ledger.append(alert("s1", Severity::Info, "b"));
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger.recent().next().map(|a| a.message.as_str()), Some("b"));
}

#[test]
fn most_severe_for_prefers_severity_then_recency() {
    let mut ledger = AlertLedger::new(15);
    ledger.append(alert("s1", Severity::Critical, "older critical"));
    ledger.append(alert("s1", Severity::Warning, "warning"));
    ledger.append(alert("s1", Severity::Critical, "newer critical"));
    ledger.append(alert("s2", Severity::Critical, "other student"));

    let best = ledger.most_severe_for(&"s1".into()).expect("has alerts");
    assert_eq!(best.message, "newer critical");
}

#[test]
fn latest_for_is_scoped_to_identity() {
    let mut ledger = AlertLedger::new(15);
    ledger.append(alert("s1", Severity::Warning, "s1 alert"));
    ledger.append(alert("s2", Severity::Info, "s2 alert"));

    assert_eq!(
        ledger.latest_for(&"s1".into()).map(|a| a.message.as_str()),
        Some("s1 alert")
    );
    assert!(ledger.latest_for(&"s3".into()).is_none());
    assert!(ledger.most_severe_for(&"s3".into()).is_none());
}

#[test]
fn resolve_closes_earlier_alerts_but_keeps_history() {
    let mut ledger = AlertLedger::new(15);
    ledger.append(alert("s1", Severity::Critical, "old impersonation"));
    ledger.append(alert("s2", Severity::Warning, "other student"));
    ledger.resolve(&"s1".into());

    assert!(ledger.most_severe_for(&"s1".into()).is_none());
    assert_eq!(
        ledger.most_severe_for(&"s2".into()).map(|a| a.message.as_str()),
        Some("other student")
    );
    assert_eq!(ledger.len(), 2);

    ledger.append(alert("s1", Severity::Warning, "new multiple faces"));
    assert_eq!(
        ledger.most_severe_for(&"s1".into()).map(|a| a.message.as_str()),
        Some("new multiple faces")
    );
    assert_eq!(
        ledger.latest_for(&"s1".into()).map(|a| a.message.as_str()),
        Some("new multiple faces")
    );
}
