//! Property-based tests for the STOMP codec and the tolerant JSON parser.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never panics `stomp::decode` (returns `Err` gracefully).
//! 2. Header values with STOMP special characters survive encode → decode.
//! 3. Bodies without NUL survive encode → decode with or without `content-length`.
//! 4. Arbitrary JSON-ish text never panics the inbound message parser.
//! 5. Timestamps rendered canonically parse back to the same value.

#![allow(clippy::expect_used, clippy::panic)]

use collaboraid_proto::message::{Timestamp, UserId};
use collaboraid_proto::stomp::{self, Command, Frame, HeartBeat, Inbound};
use collaboraid_proto::wire::WireMessage;
use proptest::prelude::*;

// --- Strategies ---

/// Header names: printable, no separators.
fn arb_header_name() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_-]{0,15}"
}

/// Header values including characters that require escaping.
fn arb_header_value() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 :\\\\\n\r/{}\"é]{0,64}"
}

/// Bodies that contain no NUL octet.
fn arb_body() -> impl Strategy<Value = String> {
    "[^\x00]{0,512}"
}

fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    // 2000-01-01 .. 2100-01-01 in whole seconds.
    (946_684_800_i64..4_102_444_800_i64).prop_filter_map("in range", |secs| {
        chrono::DateTime::from_timestamp(secs, 0).map(|dt| Timestamp::from_naive(dt.naive_utc()))
    })
}

fn only_frame(raw: &str) -> Frame {
    match stomp::decode(raw).expect("decode should succeed") {
        Inbound::Frame(frame) => frame,
        Inbound::Heartbeat => panic!("expected a frame, got a heart-beat"),
    }
}

// --- Property tests ---

proptest! {
    /// Random text never causes a panic when decoded.
    #[test]
    fn random_text_decode_no_panic(raw in "\\PC{0,512}") {
        let _ = stomp::decode(&raw);
    }

    /// Random text that starts like a frame never causes a panic either.
    #[test]
    fn frame_like_text_decode_no_panic(
        body in "[a-zA-Z:\\\\\n\r\x00]{0,128}",
        cmd in prop_oneof![Just("MESSAGE"), Just("CONNECTED"), Just("ERROR")],
    ) {
        let _ = stomp::decode(&format!("{cmd}\n{body}"));
    }

    /// Header values survive escaping on SEND frames.
    #[test]
    fn escaped_headers_survive(
        name in arb_header_name(),
        value in arb_header_value(),
    ) {
        let frame = Frame::new(Command::Send).with_header(name.clone(), value.clone());
        let decoded = only_frame(&stomp::encode(&frame));
        prop_assert_eq!(decoded.header(&name), Some(value.as_str()));
    }

    /// Bodies survive when framed by the NUL terminator alone.
    #[test]
    fn body_survives_without_length(body in arb_body()) {
        let frame = Frame::new(Command::Message).with_body(body.clone());
        let decoded = only_frame(&stomp::encode(&frame));
        prop_assert_eq!(decoded.body, body);
    }

    /// Bodies survive when a content-length header is present.
    #[test]
    fn body_survives_with_length(body in arb_body()) {
        let frame = Frame::send_json(stomp::SEND_DESTINATION, body.clone());
        let decoded = only_frame(&stomp::encode(&frame));
        prop_assert_eq!(decoded.command, Command::Send);
        prop_assert_eq!(decoded.body, body);
    }

    /// Heart-beat header values render and parse back.
    #[test]
    fn heartbeat_header_survives(cx in 0u64..1_000_000, cy in 0u64..1_000_000) {
        let hb = HeartBeat::from_millis(cx, cy);
        prop_assert_eq!(HeartBeat::parse(&hb.header_value()), Ok(hb));
    }

    /// The inbound parser never panics on arbitrary text.
    #[test]
    fn wire_parser_no_panic(raw in "\\PC{0,256}") {
        if let Ok(wire) = WireMessage::from_json(&raw) {
            let _ = wire.into_message();
        }
    }

    /// Canonically rendered timestamps parse back to the same instant.
    #[test]
    fn timestamp_display_parses_back(ts in arb_timestamp()) {
        prop_assert_eq!(Timestamp::parse(&ts.to_string()), Ok(ts));
    }

    /// Message ids in the personal topic are rendered verbatim.
    #[test]
    fn user_topic_contains_id(id in any::<i64>()) {
        prop_assert_eq!(stomp::user_topic(UserId::new(id)), format!("/topic/messages/{id}"));
    }
}
