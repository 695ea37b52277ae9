//! The worker-side WebSocket session: the mutable state the wire frame codec
//! in `serverino_core::websocket` does not carry — reassembly buffers, the
//! outbound queue, and close-handshake bookkeeping.

// ----------

use std::collections::VecDeque;

use rand::{rngs::SmallRng, RngCore, SeedableRng};
use serverino_core::websocket::{self, Frame, FrameError, FrameOutcome, OpCode, Role};

pub use serverino_core::websocket::Role as WebSocketRole;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// A fully reassembled inbound message, reconstructed byte-identical across
/// any number of fragmented continuation frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
	Text(String),
	Binary(Vec<u8>),
}

/// One step of draining a session's inbound buffer.
pub enum SessionEvent {
	Message(Message),
	/// A ping was received and a pong was queued automatically.
	Ping,
	Pong,
	/// The peer sent a close frame; the session replies in kind and the
	/// worker should tear the connection down once the outbound queue drains.
	PeerClosed,
}

/// The live state of one upgraded connection. The client socket itself is
/// owned by the worker's connection loop, not by this type; this struct
/// only holds the framing-level state the loop consults.
pub struct WebSocketSession {
	role: Role,
	max_frame_payload: Option<usize>,
	inbound: Vec<u8>,
	reassembly: Option<(OpCode, Vec<u8>)>,
	outbound: VecDeque<Vec<u8>>,
	close_sent: bool,
	close_received: bool,
	rng: SmallRng,
}

impl WebSocketSession {
	pub fn new(role: Role) -> Self {
		Self {
			role,
			max_frame_payload: None,
			inbound: Vec::new(),
			reassembly: None,
			outbound: VecDeque::new(),
			close_sent: false,
			close_received: false,
			rng: SmallRng::from_entropy(),
		}
	}

	pub fn with_max_frame_payload(mut self, max_frame_payload: usize) -> Self {
		self.max_frame_payload = Some(max_frame_payload);
		self
	}

	pub fn role(&self) -> Role {
		self.role
	}

	pub fn close_sent(&self) -> bool {
		self.close_sent
	}

	pub fn close_received(&self) -> bool {
		self.close_received
	}

	/// Queues a complete text message as one unfragmented frame.
	pub fn send_text(&mut self, text: &str) {
		self.queue_frame(OpCode::Text, text.as_bytes());
	}

	/// Queues a complete binary message as one unfragmented frame.
	pub fn send_binary(&mut self, bytes: &[u8]) {
		self.queue_frame(OpCode::Binary, bytes);
	}

	/// Queues a close frame, if one hasn't already been sent.
	pub fn send_close(&mut self) {
		if self.close_sent {
			return;
		}

		self.queue_frame(OpCode::Close, &[]);
		self.close_sent = true;
	}

	fn queue_frame(&mut self, opcode: OpCode, payload: &[u8]) {
		let mask = match self.role {
			Role::Client => Some(self.mask_key()),
			Role::Server => None,
		};

		self.outbound.push_back(websocket::encode_frame(self.role, true, opcode, payload, mask));
	}

	fn mask_key(&mut self) -> [u8; 4] {
		let mut key = [0u8; 4];
		self.rng.fill_bytes(&mut key);
		key
	}

	/// The opposite role, i.e. the role the peer's frames are sent in and
	/// this session therefore expects to receive.
	fn peer_role(&self) -> Role {
		match self.role {
			Role::Server => Role::Client,
			Role::Client => Role::Server,
		}
	}

	/// Pops the next queued outbound frame, for the worker's write loop to
	/// flush to the socket.
	pub fn pop_outbound(&mut self) -> Option<Vec<u8>> {
		self.outbound.pop_front()
	}

	pub fn has_outbound(&self) -> bool {
		!self.outbound.is_empty()
	}

	/// Appends newly-read socket bytes to the inbound buffer.
	pub fn feed(&mut self, bytes: &[u8]) {
		self.inbound.extend_from_slice(bytes);
	}

	/// Decodes as many complete frames as the inbound buffer currently holds,
	/// reassembling fragmented messages and auto-handling control frames.
	/// Returns the events produced, in order.
	pub fn drain(&mut self) -> Result<Vec<SessionEvent>, FrameError> {
		let mut events = Vec::new();

		loop {
			match websocket::decode_frame(&self.inbound, self.peer_role(), self.max_frame_payload) {
				FrameOutcome::Incomplete => break,
				FrameOutcome::Invalid(error) => return Err(error),
				FrameOutcome::Complete { consumed, frame } => {
					self.inbound.drain(..consumed);

					if let Some(event) = self.handle_frame(frame)? {
						events.push(event);
					}
				}
			}
		}

		Ok(events)
	}

	fn handle_frame(&mut self, frame: Frame) -> Result<Option<SessionEvent>, FrameError> {
		match frame.opcode {
			OpCode::Continuation => {
				let (opcode, mut buffer) = self.reassembly.take().ok_or(FrameError::UnknownOpcode)?;
				buffer.extend_from_slice(&frame.payload);

				if frame.fin {
					Ok(Some(self.finish_message(opcode, buffer)))
				} else {
					self.reassembly = Some((opcode, buffer));
					Ok(None)
				}
			}
			OpCode::Text | OpCode::Binary => {
				if frame.fin {
					Ok(Some(self.finish_message(frame.opcode, frame.payload)))
				} else {
					self.reassembly = Some((frame.opcode, frame.payload));
					Ok(None)
				}
			}
			OpCode::Ping => {
				self.queue_frame(OpCode::Pong, &frame.payload);
				Ok(Some(SessionEvent::Ping))
			}
			OpCode::Pong => Ok(Some(SessionEvent::Pong)),
			OpCode::Close => {
				self.close_received = true;
				self.send_close();
				Ok(Some(SessionEvent::PeerClosed))
			}
		}
	}

	fn finish_message(&self, opcode: OpCode, payload: Vec<u8>) -> SessionEvent {
		let message = match opcode {
			OpCode::Text => Message::Text(String::from_utf8_lossy(&payload).into_owned()),
			_ => Message::Binary(payload),
		};

		SessionEvent::Message(message)
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reassembles_a_fragmented_text_message() {
		let mut session = WebSocketSession::new(Role::Server);

		let first = websocket::encode_frame(Role::Client, false, OpCode::Text, b"hel", None);
		let second = websocket::encode_frame(Role::Client, true, OpCode::Continuation, b"lo", None);

		session.feed(&first);
		assert!(session.drain().unwrap().is_empty());

		session.feed(&second);
		let events = session.drain().unwrap();

		assert_eq!(events.len(), 1);
		match &events[0] {
			SessionEvent::Message(Message::Text(text)) => assert_eq!(text, "hello"),
			_ => panic!("expected a reassembled text message"),
		}
	}

	#[test]
	fn round_trips_an_unfragmented_message_of_arbitrary_length() {
		let payload = vec![7u8; 70_000];
		let mut session = WebSocketSession::new(Role::Server);

		let masked = {
			let mut key = [0u8; 4];
			key.copy_from_slice(&[1, 2, 3, 4]);
			websocket::encode_frame(Role::Client, true, OpCode::Binary, &payload, Some(key))
		};

		session.feed(&masked);
		let events = session.drain().unwrap();

		assert_eq!(events.len(), 1);
		match &events[0] {
			SessionEvent::Message(Message::Binary(bytes)) => assert_eq!(bytes, &payload),
			_ => panic!("expected a binary message"),
		}
	}

	#[test]
	fn ping_is_answered_with_a_queued_pong() {
		let mut session = WebSocketSession::new(Role::Server);
		let ping = websocket::encode_frame(Role::Client, true, OpCode::Ping, b"hi", None);

		session.feed(&ping);
		let events = session.drain().unwrap();

		assert!(matches!(events.as_slice(), [SessionEvent::Ping]));
		assert!(session.has_outbound());
	}

	#[test]
	fn close_frame_marks_received_and_queues_a_reply() {
		let mut session = WebSocketSession::new(Role::Server);
		let close = websocket::encode_frame(Role::Client, true, OpCode::Close, &[], None);

		session.feed(&close);
		let events = session.drain().unwrap();

		assert!(matches!(events.as_slice(), [SessionEvent::PeerClosed]));
		assert!(session.close_received());
		assert!(session.close_sent());
	}
}
