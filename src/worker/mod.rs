//! The worker runtime: the process-local request/response state machine.
//!
//! [`process_request`] is the pure core — wire bytes in, response bytes (and
//! possibly a handed-off [`WebSocketSession`]) out — so the dispatch and
//! serialization logic is testable without a real control channel. [`Worker`]
//! is the thin loop around it that owns the control stream.

// ----------

use std::{
	io::{Read, Write},
	rc::Rc,
	time::{Duration, Instant},
};

use bytes::BytesMut;
use serverino_core::http::{self, ParseOutcome, Version};

use crate::{
	control_protocol::{self, ControlFrame, ControlFrameError, RequestMeta, ResponseFlags},
	endpoint::{
		dispatch::{dispatch, DispatchOutcome},
		EndpointTable,
	},
	error::WorkerError,
	output::Output,
	request::{FormDecoder, Request},
	websocket::WebSocketSession,
	ImplError,
};

mod upgrade;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// WorkerState

/// The worker-process state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
	Starting,
	Idle,
	Processing,
	WebSocketActive,
	Stopping,
}

// --------------------------------------------------
// RecyclingPolicy

#[derive(Debug, Clone, Copy)]
pub struct RecyclingPolicy {
	pub max_requests_per_worker: Option<u64>,
	pub max_worker_lifetime: Option<Duration>,
}

impl RecyclingPolicy {
	fn should_recycle(&self, requests_served: u64, started_at: Instant) -> bool {
		if let Some(max) = self.max_requests_per_worker {
			if requests_served >= max {
				return true;
			}
		}

		if let Some(lifetime) = self.max_worker_lifetime {
			if started_at.elapsed() >= lifetime {
				return true;
			}
		}

		false
	}
}

// --------------------------------------------------
// process_request

/// The framing-and-limits result of handling one REQUEST frame's payload.
pub struct ProcessedRequest {
	pub response_bytes: Vec<u8>,
	pub flags: ResponseFlags,
	pub websocket: Option<WebSocketSession>,
}

/// Runs one request through framing, the endpoint chain, and serialization.
/// `wire_bytes` is the raw HTTP message exactly as the daemon framed it.
pub fn process_request(
	endpoints: &EndpointTable,
	form_decoder: Option<&Rc<dyn FormDecoder>>,
	max_header_bytes: usize,
	max_request_size: usize,
	wire_bytes: &[u8],
) -> ProcessedRequest {
	let (head, body) = match http::try_parse_request(wire_bytes, max_header_bytes, max_request_size) {
		ParseOutcome::Complete { head, body, .. } => (head, body),
		ParseOutcome::Invalid(error) => {
			let error = WorkerError::Framing(error);
			return error_response(Version::Http11, false, error.status_code().unwrap_or(400), &error.to_string());
		}
		ParseOutcome::Incomplete => {
			return error_response(Version::Http11, false, 400, "incomplete request");
		}
	};

	let keep_alive = head.keep_alive();
	let version = head.version;
	let is_head = head.method.is_head();

	let mut request = Request::from_wire(head.clone(), body);
	if let Some(decoder) = form_decoder {
		request.set_form_decoder(Rc::clone(decoder));
	}

	let mut output = Output::new();

	let upgrade_attempt = upgrade::detect(&head.headers);

	let (did_upgrade, websocket) = match upgrade_attempt {
		Err(()) => {
			fill_error_output(&mut output, 400, "malformed WebSocket upgrade request");
			(false, None)
		}
		Ok(None) => {
			run_http_chain(endpoints, &request, &mut output);
			(false, None)
		}
		Ok(Some(upgrade)) => {
			let mut session = WebSocketSession::new(serverino_core::websocket::Role::Server);

			match dispatch(endpoints, &request, &mut output, Some(&mut session)) {
				DispatchOutcome::WebSocket => {
					write_upgrade_response(&mut output, &upgrade.sec_websocket_accept);
					(true, Some(session))
				}
				DispatchOutcome::NotFound => {
					let error = WorkerError::HandshakeRejected;
					fill_error_output(&mut output, error.status_code().unwrap_or(403), &error.to_string());
					(false, None)
				}
				DispatchOutcome::Responded => (false, None),
				DispatchOutcome::Panicked(message) => {
					let error = WorkerError::Internal(message);
					fill_error_output(&mut output, error.status_code().unwrap_or(500), &error.to_string());
					(false, None)
				}
			}
		}
	};

	let response_bytes = output.serialize(version, keep_alive && !did_upgrade, is_head && !did_upgrade);

	ProcessedRequest {
		response_bytes,
		flags: ResponseFlags {
			keep_alive: keep_alive && !did_upgrade,
			did_upgrade,
		},
		websocket,
	}
}

fn run_http_chain(endpoints: &EndpointTable, request: &Request, output: &mut Output) {
	match dispatch(endpoints, request, output, None) {
		DispatchOutcome::Responded => {}
		DispatchOutcome::WebSocket => unreachable!("no upgrade was offered to the dispatcher"),
		DispatchOutcome::NotFound => {
			let error = WorkerError::NotFound;
			fill_error_output(output, error.status_code().unwrap_or(404), &error.to_string());
		}
		DispatchOutcome::Panicked(message) => {
			let error = WorkerError::Internal(message);
			fill_error_output(output, error.status_code().unwrap_or(500), &error.to_string());
		}
	}
}

/// Error statuses carry a short `text/plain` body unless the chain already
/// supplied one.
fn fill_error_output(output: &mut Output, status: u16, message: &str) {
	if output.body().is_empty() {
		output.set_status(status);
		output.insert_header("content-type", "text/plain");
		output.set_body(message.as_bytes().to_vec());
	} else {
		output.set_status(status);
	}
}

fn write_upgrade_response(output: &mut Output, sec_websocket_accept: &str) {
	output.set_status(101);
	output.insert_header("upgrade", "websocket");
	output.insert_header("connection", "upgrade");
	output.insert_header("sec-websocket-accept", sec_websocket_accept.to_owned());
	output.mute();
}

fn error_response(version: Version, keep_alive: bool, status: u16, message: &str) -> ProcessedRequest {
	let mut output = Output::new();
	fill_error_output(&mut output, status, message);

	ProcessedRequest {
		response_bytes: output.serialize(version, keep_alive, false),
		flags: ResponseFlags {
			keep_alive,
			did_upgrade: false,
		},
		websocket: None,
	}
}

// --------------------------------------------------
// Worker

/// What the control-channel loop stopped for.
pub enum WorkerOutcome {
	/// The daemon asked the worker to exit, or recycling kicked in.
	ShutDown,
	/// The channel closed or sent a malformed frame.
	ChannelLost,
	/// A request upgraded to WebSocket; the caller should now drive
	/// `session` directly over the handed-off client socket.
	HandedOffToWebSocket(WebSocketSession),
}

/// Owns one worker process's control channel and drives its request loop.
pub struct Worker<S> {
	control: S,
	ingress: BytesMut,
	endpoints: Rc<EndpointTable>,
	form_decoder: Option<Rc<dyn FormDecoder>>,
	max_header_bytes: usize,
	max_request_size: usize,
	recycling: RecyclingPolicy,
	state: WorkerState,
	started_at: Instant,
	requests_served: u64,
}

#[derive(Debug, ImplError)]
pub enum WorkerLoopError {
	#[error("control channel I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("malformed control frame: {0}")]
	Framing(#[from] ControlFrameError),
}

impl<S: Read + Write> Worker<S> {
	pub fn new(
		control: S,
		endpoints: Rc<EndpointTable>,
		form_decoder: Option<Rc<dyn FormDecoder>>,
		max_header_bytes: usize,
		max_request_size: usize,
		recycling: RecyclingPolicy,
	) -> Self {
		Self {
			control,
			ingress: BytesMut::new(),
			endpoints,
			form_decoder,
			max_header_bytes,
			max_request_size,
			recycling,
			state: WorkerState::Starting,
			started_at: Instant::now(),
			requests_served: 0,
		}
	}

	pub fn state(&self) -> WorkerState {
		self.state
	}

	/// Sends `READY` and drives the request loop until shutdown, channel
	/// loss, or a WebSocket handoff.
	pub fn run(&mut self) -> Result<WorkerOutcome, WorkerLoopError> {
		self.write_frame(&ControlFrame::Ready)?;
		self.state = WorkerState::Idle;

		loop {
			let frame = match self.read_frame()? {
				Some(frame) => frame,
				None => return Ok(WorkerOutcome::ChannelLost),
			};

			match frame {
				ControlFrame::Shutdown => {
					self.state = WorkerState::Stopping;
					return Ok(WorkerOutcome::ShutDown);
				}
				ControlFrame::Request { bytes, .. } => {
					self.state = WorkerState::Processing;

					let processed = process_request(
						&self.endpoints,
						self.form_decoder.as_ref(),
						self.max_header_bytes,
						self.max_request_size,
						&bytes,
					);

					self.write_frame(&ControlFrame::Response {
						bytes: processed.response_bytes,
						flags: processed.flags,
					})?;

					self.requests_served += 1;

					if let Some(session) = processed.websocket {
						self.state = WorkerState::WebSocketActive;
						return Ok(WorkerOutcome::HandedOffToWebSocket(session));
					}

					if self.recycling.should_recycle(self.requests_served, self.started_at) {
						self.state = WorkerState::Stopping;
						return Ok(WorkerOutcome::ShutDown);
					}

					self.state = WorkerState::Idle;
				}
				// These are worker-initiated or daemon-internal frame kinds; a
				// worker never expects to receive them on this channel.
				ControlFrame::Response { .. }
				| ControlFrame::UpgradeHandoff
				| ControlFrame::Log(_)
				| ControlFrame::Ready
				| ControlFrame::Heartbeat => {}
			}
		}
	}

	fn write_frame(&mut self, frame: &ControlFrame) -> Result<(), WorkerLoopError> {
		self.control.write_all(&frame.encode())?;
		Ok(())
	}

	/// Reclaims the control channel after [`Worker::run`] returns, so the
	/// caller can receive the handed-off client socket over it.
	pub fn into_control(self) -> S {
		self.control
	}

	/// Reads and decodes the next control frame, blocking on the stream as
	/// needed. Returns `Ok(None)` on a clean EOF.
	fn read_frame(&mut self) -> Result<Option<ControlFrame>, WorkerLoopError> {
		loop {
			match control_protocol::try_parse_frame(&self.ingress) {
				control_protocol::FrameOutcome::Complete { consumed, frame } => {
					let _ = self.ingress.split_to(consumed);
					return Ok(Some(frame));
				}
				control_protocol::FrameOutcome::Invalid(error) => return Err(error.into()),
				control_protocol::FrameOutcome::Incomplete => {}
			}

			let mut chunk = [0u8; 4096];
			let read = self.control.read(&mut chunk)?;
			if read == 0 {
				return Ok(None);
			}

			self.ingress.extend_from_slice(&chunk[..read]);
		}
	}
}

// --------------------------------------------------
// drive_websocket

/// Drives a handed-off WebSocket session to completion: reads bytes off
/// `client`, feeds them to `session`, and flushes whatever it queues in
/// response (auto pong, the close reply) until both sides have sent a close
/// frame or the socket closes.
///
/// The registered `RequestWebSocket` endpoint runs once, at the moment of
/// upgrade, to seed the session (e.g. queue a greeting); this loop is what
/// actually keeps it alive afterward. It does not surface further inbound
/// messages back to application code — this worker runtime guarantees
/// correct frame-level session mechanics, not a per-message callback.
pub fn drive_websocket(client: &mut (impl Read + Write), session: &mut WebSocketSession) -> std::io::Result<()> {
	let mut chunk = [0u8; 8192];

	loop {
		flush_outbound(client, session)?;

		if session.close_sent() && session.close_received() {
			return Ok(());
		}

		let read = client.read(&mut chunk)?;
		if read == 0 {
			return Ok(());
		}

		session.feed(&chunk[..read]);

		if session.drain().is_err() {
			session.send_close();
			flush_outbound(client, session)?;
			return Ok(());
		}
	}
}

fn flush_outbound(client: &mut impl Write, session: &mut WebSocketSession) -> std::io::Result<()> {
	while let Some(frame) = session.pop_outbound() {
		client.write_all(&frame)?;
	}
	Ok(())
}

/// Builds the `REQUEST` frame meta block the daemon attaches; kept here
/// alongside the worker since only the worker interprets it.
pub fn request_meta(remote_addr: String, is_tls: bool, arrival_millis: u64) -> RequestMeta {
	RequestMeta {
		remote_addr,
		is_tls,
		arrival_millis,
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use std::{
		collections::VecDeque,
		io::{self, Read, Write},
	};

	use super::*;
	use crate::{endpoint::EndpointEntry, output::Output, request::Request};

	struct MockChannel {
		inbound: VecDeque<u8>,
		outbound: Vec<u8>,
	}

	impl MockChannel {
		fn preloaded(frames: &[ControlFrame]) -> Self {
			let mut inbound = VecDeque::new();
			for frame in frames {
				inbound.extend(frame.encode());
			}
			Self { inbound, outbound: Vec::new() }
		}
	}

	impl Read for MockChannel {
		fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
			let n = self.inbound.len().min(buf.len());
			for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
				*slot = byte;
			}
			Ok(n)
		}
	}

	impl Write for MockChannel {
		fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
			self.outbound.extend_from_slice(buf);
			Ok(buf.len())
		}

		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}

	fn simple_endpoints() -> Rc<EndpointTable> {
		let mut table = EndpointTable::new();
		table.register(EndpointEntry::output_only(0, crate::endpoint::route("/simple"), |output: &mut Output| {
			output.set_body(b"simple".to_vec());
			output.insert_header("content-type", "text/plain");
			()
		}));
		Rc::new(table)
	}

	#[test]
	fn process_request_runs_the_matching_endpoint() {
		let endpoints = simple_endpoints();
		let processed = process_request(&endpoints, None, 8192, 65536, b"GET /simple HTTP/1.0\r\n\r\n");

		let text = String::from_utf8(processed.response_bytes).unwrap();
		assert!(text.starts_with("HTTP/1.0 200 OK"));
		assert!(text.ends_with("simple"));
	}

	#[test]
	fn process_request_emits_404_for_unmatched_routes() {
		let endpoints = simple_endpoints();
		let processed = process_request(&endpoints, None, 8192, 65536, b"GET /nope HTTP/1.0\r\n\r\n");

		let text = String::from_utf8(processed.response_bytes).unwrap();
		assert!(text.starts_with("HTTP/1.0 404"));
	}

	#[test]
	fn process_request_enforces_max_request_size() {
		let endpoints = simple_endpoints();
		let body = "hello".repeat(5000);
		let wire = format!("POST /simple HTTP/1.1\r\ncontent-length: {}\r\n\r\n{}", body.len(), body);

		let processed = process_request(&endpoints, None, 8192, 2000, wire.as_bytes());
		let text = String::from_utf8(processed.response_bytes).unwrap();
		assert!(text.starts_with("HTTP/1.1 413"));
	}

	#[test]
	fn worker_loop_answers_a_request_then_shuts_down() {
		let endpoints = simple_endpoints();
		let request_frame = ControlFrame::Request {
			bytes: b"GET /simple HTTP/1.0\r\n\r\n".to_vec(),
			meta: request_meta("127.0.0.1:1".to_owned(), false, 0),
		};

		let channel = MockChannel::preloaded(&[request_frame, ControlFrame::Shutdown]);
		let mut worker = Worker::new(
			channel,
			endpoints,
			None,
			8192,
			65536,
			RecyclingPolicy {
				max_requests_per_worker: None,
				max_worker_lifetime: None,
			},
		);

		let outcome = worker.run().unwrap();
		assert!(matches!(outcome, WorkerOutcome::ShutDown));
		assert_eq!(worker.state(), WorkerState::Stopping);
	}

	#[test]
	fn worker_recycles_after_max_requests() {
		let endpoints = simple_endpoints();
		let request_frame = ControlFrame::Request {
			bytes: b"GET /simple HTTP/1.0\r\n\r\n".to_vec(),
			meta: request_meta("127.0.0.1:1".to_owned(), false, 0),
		};

		let channel = MockChannel::preloaded(&[request_frame]);
		let mut worker = Worker::new(
			channel,
			endpoints,
			None,
			8192,
			65536,
			RecyclingPolicy {
				max_requests_per_worker: Some(1),
				max_worker_lifetime: None,
			},
		);

		let outcome = worker.run().unwrap();
		assert!(matches!(outcome, WorkerOutcome::ShutDown));
	}

	#[test]
	fn drive_websocket_answers_a_ping_then_stops_on_mutual_close() {
		use serverino_core::websocket::{encode_frame, OpCode, Role};

		let ping = encode_frame(Role::Client, true, OpCode::Ping, b"hi", None);
		let close = encode_frame(Role::Client, true, OpCode::Close, &[], None);

		let mut inbound = VecDeque::new();
		inbound.extend(ping);
		inbound.extend(close);

		let mut client = MockChannel { inbound, outbound: Vec::new() };
		let mut session = WebSocketSession::new(Role::Server);

		drive_websocket(&mut client, &mut session).unwrap();

		assert!(session.close_sent());
		assert!(session.close_received());
		assert!(!client.outbound.is_empty());
	}
}
