//! RFC 6455 frame codec and handshake accept-value computation.
//!
//! Like [`crate::http`], this module is pure functions over byte buffers: it
//! knows nothing about sockets, running sessions, or the application's accept
//! policy. Fragment reassembly across calls and close-handshake state live in
//! the worker runtime crate; this module only encodes and decodes individual
//! frames.

// ----------

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};

use crate::ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const DEFAULT_MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;
const MAX_CONTROL_PAYLOAD: usize = 125;

/// Computes the `Sec-WebSocket-Accept` value for a given `Sec-WebSocket-Key`.
pub fn accept_value(sec_websocket_key: &str) -> String {
	let mut hasher = Sha1::new();
	hasher.update(sec_websocket_key.as_bytes());
	hasher.update(ACCEPT_GUID.as_bytes());
	let digest = hasher.finalize();

	STANDARD.encode(digest)
}

// --------------------------------------------------
// OpCode

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
	Continuation,
	Text,
	Binary,
	Close,
	Ping,
	Pong,
}

impl OpCode {
	pub fn is_control(&self) -> bool {
		matches!(self, Self::Close | Self::Ping | Self::Pong)
	}

	fn from_nibble(nibble: u8) -> Result<Self, FrameError> {
		match nibble {
			0x0 => Ok(Self::Continuation),
			0x1 => Ok(Self::Text),
			0x2 => Ok(Self::Binary),
			0x8 => Ok(Self::Close),
			0x9 => Ok(Self::Ping),
			0xA => Ok(Self::Pong),
			_ => Err(FrameError::UnknownOpcode),
		}
	}

	fn to_nibble(self) -> u8 {
		match self {
			Self::Continuation => 0x0,
			Self::Text => 0x1,
			Self::Binary => 0x2,
			Self::Close => 0x8,
			Self::Ping => 0x9,
			Self::Pong => 0xA,
		}
	}
}

// --------------------------------------------------
// Frame

/// One decoded WebSocket frame.
#[derive(Debug, Clone)]
pub struct Frame {
	pub fin: bool,
	pub opcode: OpCode,
	pub payload: Vec<u8>,
}

/// The peer role a frame is being encoded for, per RFC 6455's masking rule:
/// server-to-client frames must be unmasked, client-to-server frames must be
/// masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Server,
	Client,
}

/// Encodes one frame. `mask` is required (and used) when `role` is
/// [`Role::Client`]; the caller supplies the 4-byte masking key from its own
/// random source, keeping this module a pure function of its inputs.
pub fn encode_frame(role: Role, fin: bool, opcode: OpCode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
	let mut out = Vec::with_capacity(payload.len() + 14);

	let first_byte = (fin as u8) << 7 | opcode.to_nibble();
	out.push(first_byte);

	let mask_bit = match role {
		Role::Client => 0x80,
		Role::Server => 0x00,
	};

	let len = payload.len();

	if len <= 125 {
		out.push(mask_bit | len as u8);
	} else if len <= u16::MAX as usize {
		out.push(mask_bit | 126);
		out.extend_from_slice(&(len as u16).to_be_bytes());
	} else {
		out.push(mask_bit | 127);
		out.extend_from_slice(&(len as u64).to_be_bytes());
	}

	match (role, mask) {
		(Role::Client, Some(key)) => {
			out.extend_from_slice(&key);
			out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
		}
		(Role::Client, None) => {
			// No key supplied: emit unmasked anyway rather than lying about the bit.
			out.extend_from_slice(payload);
		}
		(Role::Server, _) => out.extend_from_slice(payload),
	}

	out
}

/// The result of attempting to decode one frame from the front of a buffer.
pub enum FrameOutcome {
	Incomplete,
	Complete { consumed: usize, frame: Frame },
	Invalid(FrameError),
}

/// Decodes one frame from the front of `buf`.
///
/// `expected_mask` encodes RFC 6455's masking enforcement: frames received by
/// a server MUST be masked, frames received by a client MUST NOT be.
/// Violations produce [`FrameError::MaskPolicyViolation`], which the caller
/// maps to WebSocket close code 1002.
pub fn decode_frame(buf: &[u8], received_by: Role, max_payload: Option<usize>) -> FrameOutcome {
	let max_payload = max_payload.unwrap_or(DEFAULT_MAX_FRAME_PAYLOAD);

	if buf.len() < 2 {
		return FrameOutcome::Incomplete;
	}

	let first = buf[0];
	let second = buf[1];

	let fin = first & 0x80 != 0;
	let reserved = first & 0x70;
	let opcode = match OpCode::from_nibble(first & 0x0F) {
		Ok(opcode) => opcode,
		Err(error) => return FrameOutcome::Invalid(error),
	};

	if reserved != 0 {
		return FrameOutcome::Invalid(FrameError::ReservedBitsSet);
	}

	let masked = second & 0x80 != 0;

	// The frames a server receives from a client MUST be masked; the frames a
	// client receives from a server MUST NOT be.
	let expects_masked = received_by == Role::Server;
	if masked != expects_masked {
		return FrameOutcome::Invalid(FrameError::MaskPolicyViolation);
	}

	if opcode.is_control() && !fin {
		return FrameOutcome::Invalid(FrameError::FragmentedControlFrame);
	}

	let len_byte = second & 0x7F;
	let mut cursor = 2usize;

	let payload_len: usize = match len_byte {
		126 => {
			if buf.len() < cursor + 2 {
				return FrameOutcome::Incomplete;
			}
			let len = u16::from_be_bytes([buf[cursor], buf[cursor + 1]]) as usize;
			cursor += 2;
			len
		}
		127 => {
			if buf.len() < cursor + 8 {
				return FrameOutcome::Incomplete;
			}
			let mut bytes = [0u8; 8];
			bytes.copy_from_slice(&buf[cursor..cursor + 8]);
			cursor += 8;
			u64::from_be_bytes(bytes) as usize
		}
		small => small as usize,
	};

	if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD {
		return FrameOutcome::Invalid(FrameError::ControlFrameTooLarge);
	}

	if payload_len > max_payload {
		return FrameOutcome::Invalid(FrameError::PayloadTooLarge);
	}

	let mask_key = if masked {
		if buf.len() < cursor + 4 {
			return FrameOutcome::Incomplete;
		}
		let mut key = [0u8; 4];
		key.copy_from_slice(&buf[cursor..cursor + 4]);
		cursor += 4;
		Some(key)
	} else {
		None
	};

	if buf.len() < cursor + payload_len {
		return FrameOutcome::Incomplete;
	}

	let mut payload = buf[cursor..cursor + payload_len].to_vec();
	cursor += payload_len;

	if let Some(key) = mask_key {
		for (i, byte) in payload.iter_mut().enumerate() {
			*byte ^= key[i % 4];
		}
	}

	FrameOutcome::Complete {
		consumed: cursor,
		frame: Frame { fin, opcode, payload },
	}
}

// --------------------------------------------------
// FrameError

#[derive(Debug, Clone, Copy, PartialEq, Eq, ImplError)]
pub enum FrameError {
	#[error("unknown WebSocket opcode")]
	UnknownOpcode,
	#[error("reserved bits set")]
	ReservedBitsSet,
	#[error("masking requirement violated")]
	MaskPolicyViolation,
	#[error("control frame was fragmented")]
	FragmentedControlFrame,
	#[error("control frame payload exceeds 125 bytes")]
	ControlFrameTooLarge,
	#[error("frame payload exceeds the configured maximum")]
	PayloadTooLarge,
}

impl FrameError {
	/// The WebSocket close code this violation maps to.
	pub fn close_code(&self) -> u16 {
		match self {
			Self::MaskPolicyViolation => 1002,
			Self::FragmentedControlFrame | Self::ControlFrameTooLarge => 1002,
			Self::UnknownOpcode | Self::ReservedBitsSet => 1002,
			Self::PayloadTooLarge => 1009,
		}
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accept_value_matches_rfc6455_example() {
		// The literal example from RFC 6455 §1.3.
		assert_eq!(
			accept_value("dGhlIHNhbXBsZSBub25jZQ=="),
			"s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
		);
	}

	#[test]
	fn round_trips_an_unmasked_server_text_frame() {
		let encoded = encode_frame(Role::Server, true, OpCode::Text, b"hello", None);

		match decode_frame(&encoded, Role::Client, None) {
			FrameOutcome::Complete { consumed, frame } => {
				assert_eq!(consumed, encoded.len());
				assert!(frame.fin);
				assert_eq!(frame.opcode, OpCode::Text);
				assert_eq!(frame.payload, b"hello");
			}
			_ => panic!("expected a complete frame"),
		}
	}

	#[test]
	fn round_trips_a_masked_client_frame_of_arbitrary_length() {
		for len in [0usize, 10, 125, 126, 1000, 70_000] {
			let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
			let encoded = encode_frame(Role::Client, true, OpCode::Binary, &payload, Some([1, 2, 3, 4]));

			match decode_frame(&encoded, Role::Server, None) {
				FrameOutcome::Complete { frame, .. } => assert_eq!(frame.payload, payload),
				_ => panic!("expected a complete frame for len {len}"),
			}
		}
	}

	#[test]
	fn server_receiving_unmasked_server_frame_is_rejected() {
		let encoded = encode_frame(Role::Server, true, OpCode::Text, b"hi", None);

		match decode_frame(&encoded, Role::Server, None) {
			FrameOutcome::Invalid(error) => assert_eq!(error.close_code(), 1002),
			_ => panic!("expected MaskPolicyViolation"),
		}
	}

	#[test]
	fn fragmented_control_frame_is_rejected() {
		let encoded = encode_frame(Role::Server, false, OpCode::Ping, b"hi", None);

		match decode_frame(&encoded, Role::Client, None) {
			FrameOutcome::Invalid(FrameError::FragmentedControlFrame) => {}
			_ => panic!("expected FragmentedControlFrame"),
		}
	}

	#[test]
	fn oversized_control_frame_is_rejected() {
		let payload = vec![0u8; 200];
		let encoded = encode_frame(Role::Server, true, OpCode::Ping, &payload, None);

		match decode_frame(&encoded, Role::Client, None) {
			FrameOutcome::Invalid(FrameError::ControlFrameTooLarge) => {}
			_ => panic!("expected ControlFrameTooLarge"),
		}
	}

	#[test]
	fn incomplete_frame_waits_for_more_bytes() {
		let encoded = encode_frame(Role::Server, true, OpCode::Text, b"hello world", None);
		assert!(matches!(
			decode_frame(&encoded[..4], Role::Client, None),
			FrameOutcome::Incomplete
		));
	}
}
