//! The length-prefixed frame protocol the daemon and a worker speak over
//! their dedicated socket pair.
//!
//! Framing mirrors the wire framer's style: pure functions over a buffer,
//! reporting back whether a frame is fully available yet.

// ----------

use bytes::{Buf, BufMut, BytesMut};

use crate::ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const TYPE_REQUEST: u8 = 0x01;
const TYPE_RESPONSE: u8 = 0x02;
const TYPE_UPGRADE_HANDOFF: u8 = 0x03;
const TYPE_LOG: u8 = 0x04;
const TYPE_SHUTDOWN: u8 = 0x05;
const TYPE_READY: u8 = 0x06;
const TYPE_HEARTBEAT: u8 = 0x07;

// --------------------------------------------------
// RequestMeta / ResponseFlags

/// The trailing meta block a `REQUEST` frame carries alongside the raw wire
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
	pub remote_addr: String,
	pub is_tls: bool,
	pub arrival_millis: u64,
}

/// The trailing flags a `RESPONSE` frame carries alongside the raw wire
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFlags {
	pub keep_alive: bool,
	pub did_upgrade: bool,
}

// --------------------------------------------------
// ControlFrame

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
	Request { bytes: Vec<u8>, meta: RequestMeta },
	Response { bytes: Vec<u8>, flags: ResponseFlags },
	UpgradeHandoff,
	Log(String),
	Shutdown,
	Ready,
	Heartbeat,
}

impl ControlFrame {
	fn type_byte(&self) -> u8 {
		match self {
			Self::Request { .. } => TYPE_REQUEST,
			Self::Response { .. } => TYPE_RESPONSE,
			Self::UpgradeHandoff => TYPE_UPGRADE_HANDOFF,
			Self::Log(_) => TYPE_LOG,
			Self::Shutdown => TYPE_SHUTDOWN,
			Self::Ready => TYPE_READY,
			Self::Heartbeat => TYPE_HEARTBEAT,
		}
	}

	/// Encodes this frame as `<u32 length><u8 type><payload>`, `length`
	/// covering the type byte and payload but not itself.
	pub fn encode(&self) -> BytesMut {
		let mut payload = BytesMut::new();

		match self {
			Self::Request { bytes, meta } => {
				payload.put_u32(bytes.len() as u32);
				payload.put_slice(bytes);
				payload.put_u16(meta.remote_addr.len() as u16);
				payload.put_slice(meta.remote_addr.as_bytes());
				payload.put_u8(meta.is_tls as u8);
				payload.put_u64(meta.arrival_millis);
			}
			Self::Response { bytes, flags } => {
				payload.put_u32(bytes.len() as u32);
				payload.put_slice(bytes);
				payload.put_u8(flags.keep_alive as u8);
				payload.put_u8(flags.did_upgrade as u8);
			}
			Self::Log(line) => payload.put_slice(line.as_bytes()),
			Self::UpgradeHandoff | Self::Shutdown | Self::Ready | Self::Heartbeat => {}
		}

		let mut out = BytesMut::with_capacity(payload.len() + 5);
		out.put_u32((payload.len() + 1) as u32);
		out.put_u8(self.type_byte());
		out.put_slice(&payload);

		out
	}
}

// --------------------------------------------------
// Parsing

pub enum FrameOutcome {
	Incomplete,
	Complete { consumed: usize, frame: ControlFrame },
	Invalid(ControlFrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ImplError)]
pub enum ControlFrameError {
	#[error("unknown control frame type {0:#x}")]
	UnknownType(u8),
	#[error("malformed request meta block")]
	MalformedRequestMeta,
	#[error("malformed response flags")]
	MalformedResponseFlags,
	#[error("non-UTF-8 log line")]
	MalformedLog,
}

/// Decodes one frame from the front of `buf`, following the same
/// incomplete/complete/invalid shape as [`serverino_core::http::try_parse_request`].
pub fn try_parse_frame(buf: &[u8]) -> FrameOutcome {
	if buf.len() < 4 {
		return FrameOutcome::Incomplete;
	}

	let mut length_bytes = [0u8; 4];
	length_bytes.copy_from_slice(&buf[..4]);
	let body_len = u32::from_be_bytes(length_bytes) as usize;

	if buf.len() < 4 + body_len {
		return FrameOutcome::Incomplete;
	}

	if body_len == 0 {
		return FrameOutcome::Invalid(ControlFrameError::UnknownType(0));
	}

	let mut body = &buf[4..4 + body_len];
	let frame_type = body[0];
	body = &body[1..];

	let frame = match frame_type {
		TYPE_REQUEST => match parse_request_payload(body) {
			Some(frame) => frame,
			None => return FrameOutcome::Invalid(ControlFrameError::MalformedRequestMeta),
		},
		TYPE_RESPONSE => match parse_response_payload(body) {
			Some(frame) => frame,
			None => return FrameOutcome::Invalid(ControlFrameError::MalformedResponseFlags),
		},
		TYPE_UPGRADE_HANDOFF => ControlFrame::UpgradeHandoff,
		TYPE_LOG => match std::str::from_utf8(body) {
			Ok(line) => ControlFrame::Log(line.to_owned()),
			Err(_) => return FrameOutcome::Invalid(ControlFrameError::MalformedLog),
		},
		TYPE_SHUTDOWN => ControlFrame::Shutdown,
		TYPE_READY => ControlFrame::Ready,
		TYPE_HEARTBEAT => ControlFrame::Heartbeat,
		other => return FrameOutcome::Invalid(ControlFrameError::UnknownType(other)),
	};

	FrameOutcome::Complete {
		consumed: 4 + body_len,
		frame,
	}
}

fn parse_request_payload(mut body: &[u8]) -> Option<ControlFrame> {
	if body.remaining() < 4 {
		return None;
	}
	let request_len = body.get_u32() as usize;
	if body.remaining() < request_len {
		return None;
	}
	let bytes = body[..request_len].to_vec();
	body.advance(request_len);

	if body.remaining() < 2 {
		return None;
	}
	let addr_len = body.get_u16() as usize;
	if body.remaining() < addr_len {
		return None;
	}
	let remote_addr = std::str::from_utf8(&body[..addr_len]).ok()?.to_owned();
	body.advance(addr_len);

	if body.remaining() < 9 {
		return None;
	}
	let is_tls = body.get_u8() != 0;
	let arrival_millis = body.get_u64();

	Some(ControlFrame::Request {
		bytes,
		meta: RequestMeta {
			remote_addr,
			is_tls,
			arrival_millis,
		},
	})
}

fn parse_response_payload(mut body: &[u8]) -> Option<ControlFrame> {
	if body.remaining() < 4 {
		return None;
	}
	let response_len = body.get_u32() as usize;
	if body.remaining() < response_len {
		return None;
	}
	let bytes = body[..response_len].to_vec();
	body.advance(response_len);

	if body.remaining() < 2 {
		return None;
	}
	let keep_alive = body.get_u8() != 0;
	let did_upgrade = body.get_u8() != 0;

	Some(ControlFrame::Response {
		bytes,
		flags: ResponseFlags { keep_alive, did_upgrade },
	})
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_a_request_frame() {
		let frame = ControlFrame::Request {
			bytes: b"GET / HTTP/1.1\r\n\r\n".to_vec(),
			meta: RequestMeta {
				remote_addr: "127.0.0.1:9001".to_owned(),
				is_tls: false,
				arrival_millis: 123,
			},
		};

		let encoded = frame.encode();
		match try_parse_frame(&encoded) {
			FrameOutcome::Complete { consumed, frame: decoded } => {
				assert_eq!(consumed, encoded.len());
				assert_eq!(decoded, frame);
			}
			_ => panic!("expected a complete frame"),
		}
	}

	#[test]
	fn round_trips_a_response_frame() {
		let frame = ControlFrame::Response {
			bytes: b"HTTP/1.1 200 OK\r\n\r\n".to_vec(),
			flags: ResponseFlags {
				keep_alive: true,
				did_upgrade: false,
			},
		};

		let encoded = frame.encode();
		match try_parse_frame(&encoded) {
			FrameOutcome::Complete { frame: decoded, .. } => assert_eq!(decoded, frame),
			_ => panic!("expected a complete frame"),
		}
	}

	#[test]
	fn reports_incomplete_for_a_partial_buffer() {
		let frame = ControlFrame::Ready;
		let encoded = frame.encode();

		assert!(matches!(try_parse_frame(&encoded[..encoded.len() - 1]), FrameOutcome::Incomplete));
	}

	#[test]
	fn shutdown_ready_and_heartbeat_round_trip_with_empty_payloads() {
		for frame in [ControlFrame::Shutdown, ControlFrame::Ready, ControlFrame::Heartbeat] {
			let encoded = frame.encode();
			match try_parse_frame(&encoded) {
				FrameOutcome::Complete { consumed, frame: decoded } => {
					assert_eq!(consumed, encoded.len());
					assert_eq!(decoded, frame);
				}
				_ => panic!("expected a complete frame"),
			}
		}
	}

	#[test]
	fn unknown_type_byte_is_invalid() {
		let mut buf = BytesMut::new();
		buf.put_u32(1);
		buf.put_u8(0xEE);

		assert!(matches!(try_parse_frame(&buf), FrameOutcome::Invalid(ControlFrameError::UnknownType(0xEE))));
	}
}
