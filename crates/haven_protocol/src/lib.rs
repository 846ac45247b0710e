#![forbid(unsafe_code)]

//! Wire protocol for the haven chat gateway.
//!
//! Everything a client and the server exchange is defined here: the JSON
//! text frames that travel over the WebSocket in both directions, and the
//! JSON bodies served by the history HTTP endpoint. Frames are tagged by a
//! `type` field so clients can dispatch without peeking at the payload.

pub mod frames;

pub use frames::{
	ApiFailure, ClientFrame, DEFAULT_MAX_FRAME_BYTES, FrameError, HistoryMessage,
	HistoryResponse, ServerFrame, decode_client_frame, encode_server_frame,
};
