#![cfg(feature = "transport-websocket")]
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire format tests for the socket.io framing used by the realtime channel.
//!
//! Decodes frames captured from a Respoke server, checks that content events
//! map onto [`ChannelEvent`]s, and that the frames this client sends have the
//! exact shape the server expects.

use std::time::Duration;

use respoke_client::channel::{ChannelEvent, ChannelEventKind, Verb};
use respoke_client::transports::{Handshake, Packet};
use serde_json::json;

// ════════════════════════════════════════════════════════════════════
// Helper
// ════════════════════════════════════════════════════════════════════

/// Decode a server frame carrying a named event into a channel event.
fn content_event(frame: &str) -> Option<ChannelEvent> {
    match Packet::decode(frame).expect("decode") {
        Packet::Event { name, mut args, .. } => {
            let payload = if args.is_empty() {
                serde_json::Value::Null
            } else {
                args.remove(0)
            };
            ChannelEvent::content(&name, payload)
        }
        other => panic!("expected an event frame, got {other:?}"),
    }
}

// ════════════════════════════════════════════════════════════════════
// Server frames
// ════════════════════════════════════════════════════════════════════

#[test]
fn handshake_fixture() {
    let handshake = Handshake::parse("Tz1mK7yQx9vL2nB:60:60:websocket,xhr-polling").unwrap();
    assert_eq!(handshake.sid, "Tz1mK7yQx9vL2nB");
    assert_eq!(handshake.heartbeat_timeout, Some(Duration::from_secs(60)));
    assert_eq!(handshake.close_timeout, Some(Duration::from_secs(60)));
    assert_eq!(handshake.transports, vec!["websocket", "xhr-polling"]);
}

#[test]
fn handshake_without_heartbeat() {
    let handshake = Handshake::parse("abc::60:websocket").unwrap();
    assert_eq!(handshake.heartbeat_timeout, None);
}

#[test]
fn handshake_without_sid_is_rejected() {
    assert!(Handshake::parse("").is_err());
    assert!(Handshake::parse(":60:60:websocket").is_err());
}

#[test]
fn message_frame_fixture() {
    let frame = r#"5:::{"name":"message","args":[{"header":{"from":"bob","fromConnection":"c-9","type":"message"},"body":"hi"}]}"#;
    match content_event(frame) {
        Some(ChannelEvent::Message(payload)) => {
            assert_eq!(payload["header"]["from"], "bob");
            assert_eq!(payload["body"], "hi");
        }
        other => panic!("expected a message event, got {other:?}"),
    }
}

#[test]
fn pubsub_frame_fixture() {
    let frame = r#"5:::{"name":"pubsub","args":[{"header":{"channel":"lobby","from":"bob"},"message":"hello: world"}]}"#;
    match content_event(frame) {
        Some(ChannelEvent::Pubsub(payload)) => {
            assert_eq!(payload["header"]["channel"], "lobby");
            assert_eq!(payload["message"], "hello: world");
        }
        other => panic!("expected a pubsub event, got {other:?}"),
    }
}

#[test]
fn presence_join_and_leave_fixtures() {
    let presence = r#"5:::{"name":"presence","args":[{"header":{"from":"bob","type":"presence"},"type":"away"}]}"#;
    assert_eq!(
        content_event(presence).map(|e| e.kind()),
        Some(ChannelEventKind::Presence)
    );

    let join = r#"5:::{"name":"join","args":[{"header":{"channel":"lobby"},"connectionId":"c-2","endpointId":"bob"}]}"#;
    assert_eq!(content_event(join).map(|e| e.kind()), Some(ChannelEventKind::Join));

    let leave = r#"5:::{"name":"leave","args":[{"header":{"channel":"lobby"},"connectionId":"c-2","endpointId":"bob"}]}"#;
    assert_eq!(content_event(leave).map(|e| e.kind()), Some(ChannelEventKind::Leave));
}

#[test]
fn unknown_event_names_are_not_content() {
    let frame = r#"5:::{"name":"signal","args":[{}]}"#;
    assert!(content_event(frame).is_none());
}

#[test]
fn ack_fixture_carries_the_response_body() {
    let frame = r#"6:::3+["{\"id\":\"conn-1\",\"endpointId\":\"alice\"}"]"#;
    match Packet::decode(frame).unwrap() {
        Packet::Ack { id, args } => {
            assert_eq!(id, 3);
            let body: serde_json::Value = serde_json::from_str(args[0].as_str().unwrap()).unwrap();
            assert_eq!(body["endpointId"], "alice");
        }
        other => panic!("expected an ack, got {other:?}"),
    }
}

#[test]
fn server_error_fixture() {
    assert_eq!(
        Packet::decode("7:::1+0").unwrap(),
        Packet::Error {
            reason: "1".into(),
            advice: Some("0".into()),
        }
    );
}

#[test]
fn control_frames() {
    assert_eq!(Packet::decode("1::").unwrap(), Packet::Connect);
    assert_eq!(Packet::decode("2::").unwrap(), Packet::Heartbeat);
    assert_eq!(Packet::decode("0::").unwrap(), Packet::Disconnect);
    assert_eq!(Packet::decode("8::").unwrap(), Packet::Noop);
}

#[test]
fn garbage_frames_are_rejected() {
    for frame in ["", "9::", "x:1::", "5:abc+::{}", "4:::{not json", "6:::"] {
        assert!(Packet::decode(frame).is_err(), "{frame:?} should not decode");
    }
}

// ════════════════════════════════════════════════════════════════════
// Client frames
// ════════════════════════════════════════════════════════════════════

#[test]
fn realtime_call_frame_shape() {
    let envelope = json!({
        "url": "https://api.respoke.io/v1/connections",
        "headers": { "App-Secret": "s3cret" },
        "data": { "endpointId": "alice", "clientType": "node" },
    });
    let packet = Packet::Event {
        id: Some(7),
        name: Verb::Post.as_str().into(),
        args: vec![envelope.clone()],
    };
    let frame = packet.encode().unwrap();
    assert!(frame.starts_with("5:7+::"), "unexpected frame {frame}");

    let body: serde_json::Value = serde_json::from_str(&frame["5:7+::".len()..]).unwrap();
    assert_eq!(body, json!({ "name": "post", "args": [envelope] }));
}

#[test]
fn client_frames_decode_back() {
    let packets = [
        Packet::Heartbeat,
        Packet::Disconnect,
        Packet::Ack {
            id: 4,
            args: vec![json!("ok")],
        },
        Packet::Event {
            id: None,
            name: "delete".into(),
            args: vec![json!({ "url": "/channels/a%20b/subscribers" })],
        },
    ];
    for packet in packets {
        let frame = packet.encode().unwrap();
        assert_eq!(Packet::decode(&frame).unwrap(), packet, "frame {frame}");
    }
}
