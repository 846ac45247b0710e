#![forbid(unsafe_code)]

//! Wire-contract tests: exact JSON shapes as a client library would see them.

use haven_protocol::{
	ApiFailure, ClientFrame, DEFAULT_MAX_FRAME_BYTES, FrameError, HistoryResponse, ServerFrame,
	decode_client_frame, encode_server_frame,
};

#[test]
fn client_frames_serialize_to_documented_shapes() {
	let cases = [
		(
			ClientFrame::Subscribe { group_id: "g1".to_string() },
			r#"{"type":"subscribe","group_id":"g1"}"#,
		),
		(
			ClientFrame::Unsubscribe { group_id: "g1".to_string() },
			r#"{"type":"unsubscribe","group_id":"g1"}"#,
		),
		(
			ClientFrame::Message { group_id: "g1".to_string(), text: "hi".to_string() },
			r#"{"type":"message","group_id":"g1","text":"hi"}"#,
		),
		(ClientFrame::Ping { group_id: None }, r#"{"type":"ping"}"#),
	];
	for (frame, expected) in cases {
		let text = serde_json::to_string(&frame).unwrap();
		assert_eq!(text, expected);
	}
}

#[test]
fn client_frames_round_trip_through_decode() {
	let frames = [
		ClientFrame::Subscribe { group_id: "g1".to_string() },
		ClientFrame::Unsubscribe { group_id: "g1".to_string() },
		ClientFrame::Message { group_id: "g1".to_string(), text: "payload".to_string() },
		ClientFrame::Ping { group_id: Some("g1".to_string()) },
	];
	for frame in frames {
		let text = serde_json::to_string(&frame).unwrap();
		let decoded = decode_client_frame(&text, DEFAULT_MAX_FRAME_BYTES).unwrap();
		assert_eq!(decoded, frame);
	}
}

#[test]
fn server_error_frame_carries_only_a_message() {
	let text = encode_server_frame(&ServerFrame::error("not a member of g1")).unwrap();
	assert_eq!(text, r#"{"type":"error","message":"not a member of g1"}"#);
}

#[test]
fn server_frames_decode_from_raw_json() {
	let frame: ServerFrame = serde_json::from_str(
		r#"{"type":"message","group_id":"g1","sender_id":"u1","username":"Ada","message":"hi","timestamp":1700000000000}"#,
	)
	.unwrap();
	match frame {
		ServerFrame::Message { group_id, sender_id, username, message, timestamp } => {
			assert_eq!(group_id, "g1");
			assert_eq!(sender_id, "u1");
			assert_eq!(username, "Ada");
			assert_eq!(message, "hi");
			assert_eq!(timestamp, 1_700_000_000_000);
		}
		other => panic!("expected message frame, got {other:?}"),
	}
}

#[test]
fn empty_history_is_a_successful_response() {
	let resp: HistoryResponse =
		serde_json::from_str(r#"{"success":true,"messages":[],"has_more":false}"#).unwrap();
	assert!(resp.success);
	assert!(resp.messages.is_empty());
	assert!(!resp.has_more);
}

#[test]
fn api_failure_shape() {
	let text = serde_json::to_string(&ApiFailure::new("group_id is required")).unwrap();
	assert_eq!(text, r#"{"success":false,"message":"group_id is required"}"#);
}

#[test]
fn decode_errors_render_for_humans() {
	let err = decode_client_frame("not json", DEFAULT_MAX_FRAME_BYTES).unwrap_err();
	assert!(err.to_string().starts_with("malformed frame:"));

	let err = decode_client_frame(&"x".repeat(10), 4).unwrap_err();
	match &err {
		FrameError::TooLarge { len: 10, max: 4 } => {}
		other => panic!("expected size error, got {other:?}"),
	}
	assert_eq!(err.to_string(), "frame too large: 10 bytes exceeds limit of 4");
}
