//! Unit tests for line framing and message decoding.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use lockin_proctor::protocol::codec::{WireCodec, MAX_LINE_BYTES};
use lockin_proctor::protocol::messages::{
    decode_line, encode_line, ObserverMessage, RelayEvent, StudentCommand, StudentMessage,
};
use lockin_proctor::AppError;

#[test]
fn decoder_splits_on_newlines() {
    let mut codec = WireCodec::new();
    let mut buf = BytesMut::from("{\"type\":\"admin_join\"}\n{\"type\":");

    assert_eq!(
        codec.decode(&mut buf).expect("ok"),
        Some("{\"type\":\"admin_join\"}".to_owned())
    );
    assert_eq!(codec.decode(&mut buf).expect("ok"), None, "partial line waits");
}

#[test]
fn encoder_appends_newline() {
    let mut codec = WireCodec::new();
    let mut buf = BytesMut::new();
    codec.encode("{}".to_owned(), &mut buf).expect("encode");
    assert_eq!(&buf[..], b"{}\n");
}

#[test]
fn oversized_line_is_discarded_and_next_line_decodes() {
    let mut codec = WireCodec::new();
    let mut buf = BytesMut::from(vec![b'x'; MAX_LINE_BYTES + 10].as_slice());
    assert_eq!(codec.decode(&mut buf).expect("not an error"), None);

    buf.extend_from_slice(b"tail of the long line\n{\"type\":\"admin_join\"}\n");
    assert_eq!(
        codec.decode(&mut buf).expect("not an error"),
        Some("{\"type\":\"admin_join\"}".to_owned())
    );
    assert!(buf.is_empty());
}

#[test]
fn oversized_line_in_one_chunk_is_skipped() {
    let mut codec = WireCodec::new();
    let mut raw = vec![b'x'; MAX_LINE_BYTES + 1];
    raw.extend_from_slice(b"\nok\n");
    let mut buf = BytesMut::from(raw.as_slice());
    assert_eq!(codec.decode(&mut buf).expect("not an error"), Some("ok".to_owned()));
}

#[test]
fn unknown_type_is_skipped() {
    let decoded = decode_line::<RelayEvent>(r#"{"type":"heartbeat","at":1}"#).expect("not an error");
    assert_eq!(decoded, None);
}

#[test]
fn blank_line_is_skipped() {
    assert_eq!(decode_line::<StudentMessage>("   ").expect("ok"), None);
}

#[test]
fn missing_type_is_an_error() {
    let err = decode_line::<StudentMessage>(r#"{"student_id":"s1"}"#).unwrap_err();
    assert!(matches!(err, AppError::Protocol(_)), "got {err:?}");
}

#[test]
fn invalid_json_is_an_error() {
    let err = decode_line::<StudentMessage>("{not json").unwrap_err();
    assert!(matches!(err, AppError::Protocol(_)), "got {err:?}");
}

#[test]
fn known_type_with_missing_field_is_an_error() {
    let err = decode_line::<ObserverMessage>(r#"{"type":"remove_student"}"#).unwrap_err();
    assert!(
        matches!(err, AppError::Protocol(ref msg) if msg.contains("remove_student")),
        "got {err:?}"
    );
}

#[test]
fn encoded_line_has_no_newline_and_decodes_back() {
    let cmd = StudentCommand::Removal {
        reason: "Removed by administrator.".into(),
    };
    let line = encode_line(&cmd).expect("encode");
    assert!(!line.contains('\n'));
    assert_eq!(decode_line::<StudentCommand>(&line).expect("ok"), Some(cmd));
}
