//! Unit tests for the ACP wire codec and the reader/writer tasks.
//!
//! Covers:
//! - single, concatenated, and pretty-printed documents
//! - partial delivery buffered until the document completes
//! - malformed input skipped without stopping the stream
//! - oversized lines rejected before parsing
//! - EOF handling for unterminated input
//! - outbound encoding as one compact line
//! - reader skipping non-JSON-RPC documents, writer framing messages

use bytes::BytesMut;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use agent_relay::acp::codec::{AcpCodec, Frame, MAX_LINE_BYTES};
use agent_relay::acp::message::Message;
use agent_relay::acp::reader::run_reader;
use agent_relay::acp::writer::run_writer;

fn decode_all(codec: &mut AcpCodec, buf: &mut BytesMut) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(buf).expect("decode must not fail") {
        frames.push(frame);
    }
    frames
}

// ── Framing ──────────────────────────────────────────────────────────────────

#[test]
fn single_line_document_is_decoded() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from("{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n");

    let frames = decode_all(&mut codec, &mut buf);

    assert_eq!(
        frames,
        vec![Frame::Json(json!({"jsonrpc": "2.0", "method": "ping"}))]
    );
}

/// Two documents with no separator on one line come out one by one, in order.
#[test]
fn concatenated_documents_are_split_in_order() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from("{\"n\":1}{\"n\":2} {\"n\":3}\n");

    let frames = decode_all(&mut codec, &mut buf);

    assert_eq!(
        frames,
        vec![
            Frame::Json(json!({"n": 1})),
            Frame::Json(json!({"n": 2})),
            Frame::Json(json!({"n": 3})),
        ]
    );
}

/// A document pretty-printed over several lines is reassembled.
#[test]
fn multi_line_document_is_reassembled() {
    let mut codec = AcpCodec::new();
    let raw = "{\n  \"jsonrpc\": \"2.0\",\n  \"id\": 4,\n  \"result\": {}\n}\n";
    let mut buf = BytesMut::from(raw);

    let frames = decode_all(&mut codec, &mut buf);

    assert_eq!(
        frames,
        vec![Frame::Json(json!({"jsonrpc": "2.0", "id": 4, "result": {}}))]
    );
    assert_eq!(codec.buffered(), 0, "nothing may be held back");
}

/// Bytes arriving in several chunks are held until the document completes.
#[test]
fn partial_delivery_is_buffered() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from("{\"method\":\"session/");

    assert!(codec.decode(&mut buf).expect("decode").is_none());

    buf.extend_from_slice(b"update\"}\n");
    let frames = decode_all(&mut codec, &mut buf);

    assert_eq!(
        frames,
        vec![Frame::Json(json!({"method": "session/update"}))]
    );
}

#[test]
fn blank_lines_are_skipped() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from("\n   \n{\"ok\":true}\n\n");

    let frames = decode_all(&mut codec, &mut buf);

    assert_eq!(frames, vec![Frame::Json(json!({"ok": true}))]);
}

/// A syntax error yields one `Malformed` frame and decoding carries on with
/// the next line.
#[test]
fn malformed_line_is_reported_and_stream_continues() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from("{not json}\n{\"ok\":1}\n");

    let frames = decode_all(&mut codec, &mut buf);

    assert_eq!(frames.len(), 2, "got {frames:?}");
    assert!(matches!(&frames[0], Frame::Malformed(reason) if reason.contains("malformed json")));
    assert_eq!(frames[1], Frame::Json(json!({"ok": 1})));
}

/// Documents parsed before a syntax error on the same line are still
/// delivered, ahead of the `Malformed` frame.
#[test]
fn documents_before_a_syntax_error_are_kept() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from("{\"n\":1}{broken\n");

    let frames = decode_all(&mut codec, &mut buf);

    assert_eq!(frames.len(), 2, "got {frames:?}");
    assert_eq!(frames[0], Frame::Json(json!({"n": 1})));
    assert!(matches!(frames[1], Frame::Malformed(_)));
}

/// A truncated message followed by a complete one loses only the truncated
/// part; the complete message still comes through.
#[test]
fn unfinished_fragment_does_not_swallow_the_next_message() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from(
        "{\"jsonrpc\":\"2.0\",\"id\":1,\n{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{}}\n",
    );

    let frames = decode_all(&mut codec, &mut buf);

    assert_eq!(frames.len(), 2, "got {frames:?}");
    assert!(
        matches!(&frames[0], Frame::Malformed(reason) if reason.contains("unfinished")),
        "got {:?}",
        frames[0]
    );
    assert_eq!(
        frames[1],
        Frame::Json(json!({"jsonrpc": "2.0", "id": 2, "result": {}}))
    );
    assert_eq!(codec.buffered(), 0);
}

/// A fragment followed by the start of another multi-line message keeps the
/// new message pending until it completes.
#[test]
fn fragment_then_multi_line_message_is_reassembled() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from("{\"id\":1,\n{\"id\":2,\n\"result\":{}}\n");

    let frames = decode_all(&mut codec, &mut buf);

    assert_eq!(frames.len(), 2, "got {frames:?}");
    assert!(matches!(frames[0], Frame::Malformed(_)));
    assert_eq!(frames[1], Frame::Json(json!({"id": 2, "result": {}})));
}

/// A document kept open across many short lines is capped like a single
/// oversized line.
#[test]
fn accumulator_is_capped_across_lines() {
    let mut codec = AcpCodec::new();
    let chunk = format!("\"{}\",\n", "y".repeat(100_000));
    let mut raw = String::from("[\n");
    while raw.len() <= MAX_LINE_BYTES + chunk.len() {
        raw.push_str(&chunk);
    }
    let mut buf = BytesMut::from(raw.as_str());

    let frames = decode_all(&mut codec, &mut buf);

    assert!(
        frames
            .iter()
            .any(|f| matches!(f, Frame::Malformed(reason) if reason.contains("message too long"))),
        "got {} frames",
        frames.len()
    );
    assert!(codec.buffered() <= MAX_LINE_BYTES);

    let mut buf = BytesMut::from("{\"after\":true}\n");
    let frames = decode_all(&mut codec, &mut buf);
    assert_eq!(frames.last(), Some(&Frame::Json(json!({"after": true}))));
}

#[test]
fn oversized_line_is_rejected_then_decoding_resumes() {
    let mut codec = AcpCodec::new();
    let mut raw = "x".repeat(MAX_LINE_BYTES + 16);
    raw.push('\n');
    raw.push_str("{\"after\":true}\n");
    let mut buf = BytesMut::from(raw.as_str());

    let first = codec.decode(&mut buf).expect("decode").expect("frame");
    assert!(
        matches!(&first, Frame::Malformed(reason) if reason.contains("line too long")),
        "got {first:?}"
    );

    let frames = decode_all(&mut codec, &mut buf);
    assert_eq!(frames, vec![Frame::Json(json!({"after": true}))]);
}

#[test]
fn final_line_without_newline_is_decoded_at_eof() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from("{\"last\":1}");

    assert!(codec.decode(&mut buf).expect("decode").is_none());
    let frame = codec.decode_eof(&mut buf).expect("decode_eof");

    assert_eq!(frame, Some(Frame::Json(json!({"last": 1}))));
}

#[test]
fn unfinished_document_at_eof_is_malformed() {
    let mut codec = AcpCodec::new();
    let mut buf = BytesMut::from("{\"id\":1,\n\"result\":\n");

    assert!(decode_all(&mut codec, &mut buf).is_empty());
    let frame = codec.decode_eof(&mut buf).expect("decode_eof");

    assert!(matches!(frame, Some(Frame::Malformed(_))), "got {frame:?}");
    assert_eq!(codec.decode_eof(&mut buf).expect("decode_eof"), None);
}

// ── Encoding ─────────────────────────────────────────────────────────────────

#[test]
fn outbound_message_is_one_compact_line() {
    let mut codec = AcpCodec::new();
    let mut dst = BytesMut::new();

    codec
        .encode(
            Message::request(7, "initialize", json!({"protocolVersion": 1})),
            &mut dst,
        )
        .expect("encode");

    let text = std::str::from_utf8(&dst).expect("utf8");
    assert!(text.ends_with('\n'));
    assert_eq!(text.matches('\n').count(), 1, "exactly one line: {text}");

    let value: Value = serde_json::from_str(text.trim_end()).expect("valid json");
    assert_eq!(
        value,
        json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "initialize",
            "params": {"protocolVersion": 1},
        })
    );
}

// ── Reader / writer tasks ────────────────────────────────────────────────────

/// The reader forwards JSON-RPC messages and silently drops everything else,
/// then stops at EOF.
#[tokio::test]
async fn reader_skips_garbage_and_stops_at_eof() {
    let (mut agent_side, client_side) = tokio::io::duplex(4096);
    let (tx, mut rx) = mpsc::channel(8);
    let reader = tokio::spawn(run_reader(
        "test".to_owned(),
        client_side,
        tx,
        CancellationToken::new(),
    ));

    agent_side
        .write_all(
            concat!(
                "not json at all\n",
                "[1, 2, 3]\n",
                "{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"ok\":true}}\n",
                "{\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{}}\n",
            )
            .as_bytes(),
        )
        .await
        .expect("write");
    drop(agent_side);

    let first = rx.recv().await.expect("response");
    assert!(matches!(first, Message::Response { .. }), "got {first:?}");
    let second = rx.recv().await.expect("notification");
    assert_eq!(second.method(), Some("session/update"));
    assert!(rx.recv().await.is_none(), "reader must stop at EOF");

    reader.await.expect("reader task");
}

#[tokio::test]
async fn reader_stops_on_cancel() {
    let (_agent_side, client_side) = tokio::io::duplex(64);
    let (tx, mut rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let reader = tokio::spawn(run_reader("test".to_owned(), client_side, tx, cancel.clone()));

    cancel.cancel();

    reader.await.expect("reader task");
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn writer_frames_each_message_as_a_line() {
    let (client_side, agent_side) = tokio::io::duplex(4096);
    let (tx, rx) = mpsc::channel(8);
    let writer = tokio::spawn(run_writer(
        "test".to_owned(),
        client_side,
        rx,
        CancellationToken::new(),
    ));

    tx.send(Message::notification("session/cancel", json!({"sessionId": "s1"})))
        .await
        .expect("send");
    tx.send(Message::request(2, "session/new", json!({"cwd": "/tmp"})))
        .await
        .expect("send");
    drop(tx);

    writer.await.expect("writer task").expect("writer result");

    let mut lines = BufReader::new(agent_side).lines();
    let first: Value =
        serde_json::from_str(&lines.next_line().await.expect("read").expect("line")).expect("json");
    let second: Value =
        serde_json::from_str(&lines.next_line().await.expect("read").expect("line")).expect("json");

    assert_eq!(first["method"], "session/cancel");
    assert!(first.get("id").is_none(), "notifications carry no id");
    assert_eq!(second["id"], 2);
    assert_eq!(second["params"]["cwd"], "/tmp");
}
