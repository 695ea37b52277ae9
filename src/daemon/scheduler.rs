//! The daemon's tick loop: drains the poller, accepts new connections, frames
//! client bytes into requests, dispatches them to idle workers, and relays
//! worker responses back out.

// ----------

use std::{
	collections::{HashMap, VecDeque},
	io::{self, ErrorKind, Read, Write},
	net::TcpListener,
	os::fd::AsFd,
	rc::Rc,
	time::{Duration, Instant},
};

use bytes::BytesMut;
use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use serverino_core::http::{self, ParseOutcome};

use crate::{
	config::Config,
	control_protocol::{self, ControlFrame, FrameOutcome, RequestMeta, ResponseFlags},
	daemon::{
		connection::{ClientConnection, ConnectionTable},
		poller::{Interest, Poller, Readiness},
		worker_table::{WorkerState, WorkerTable},
	},
	endpoint::EndpointTable,
	error::{DaemonError, WorkerError},
	process::{self, WorkerSide},
	request::FormDecoder,
	worker::{self, RecyclingPolicy, Worker, WorkerOutcome},
};

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// What a poller key refers to; the scheduler hands out keys from one
/// namespace and remembers which table each belongs to here.
#[derive(Debug, Clone, Copy)]
enum Token {
	Listener(usize),
	Connection(usize),
	Worker(usize),
}

/// Owns the listeners, the connection and worker tables, and the poller, and
/// drives one iteration of the request/response cycle per [`Scheduler::tick`].
pub struct Scheduler {
	config: Config,
	endpoints: Rc<EndpointTable>,
	form_decoder: Option<Rc<dyn FormDecoder>>,
	listeners: Vec<TcpListener>,
	poller: Poller,
	connections: ConnectionTable,
	workers: WorkerTable,
	/// Requests framed off a connection's ingress buffer but not yet handed
	/// to a worker, keyed by connection id.
	staged: HashMap<usize, Vec<u8>>,
	/// Connection ids with a staged request, in arrival order.
	pending: VecDeque<usize>,
	worker_ingress: HashMap<usize, BytesMut>,
	tokens: HashMap<usize, Token>,
	next_key: usize,
	accept_backoff: Duration,
	suspended: bool,
}

impl Scheduler {
	pub fn new(
		config: Config,
		endpoints: Rc<EndpointTable>,
		form_decoder: Option<Rc<dyn FormDecoder>>,
		listeners: Vec<TcpListener>,
	) -> Result<Self, DaemonError> {
		let poller = Poller::new()?;

		let mut scheduler = Self {
			workers: WorkerTable::new(config.max_workers, config.min_workers, config.idle_hangover_time),
			config,
			endpoints,
			form_decoder,
			listeners,
			poller,
			connections: ConnectionTable::new(),
			staged: HashMap::new(),
			pending: VecDeque::new(),
			worker_ingress: HashMap::new(),
			tokens: HashMap::new(),
			next_key: 0,
			accept_backoff: ACCEPT_BACKOFF_INITIAL,
			suspended: false,
		};

		for (index, listener) in scheduler.listeners.iter().enumerate() {
			listener.set_nonblocking(true).map_err(DaemonError::Io)?;
			let key = scheduler.bind_token(Token::Listener(index));
			unsafe { scheduler.poller.register(listener.as_fd(), key, Interest::READABLE)? };
		}

		for _ in 0..scheduler.config.min_workers {
			scheduler.spawn_worker()?;
		}

		Ok(scheduler)
	}

	fn bind_token(&mut self, token: Token) -> usize {
		let key = self.next_key;
		self.next_key += 1;
		self.tokens.insert(key, token);
		key
	}

	/// Suspends accepting new connections; in-flight requests still drain.
	pub fn suspend(&mut self) {
		self.suspended = true;
	}

	pub fn resume(&mut self) {
		self.suspended = false;
	}

	pub fn worker_count(&self) -> usize {
		self.workers.len()
	}

	pub fn connection_count(&self) -> usize {
		self.connections.len()
	}

	// --------------------------------------------------
	// Worker lifecycle

	fn spawn_worker(&mut self) -> Result<(), DaemonError> {
		let endpoints = Rc::clone(&self.endpoints);
		let form_decoder = self.form_decoder.clone();
		let max_header_bytes = self.config.max_header_bytes;
		let max_request_size = self.config.max_request_size;
		let recycling = RecyclingPolicy {
			max_requests_per_worker: Some(self.config.max_requests_per_worker),
			max_worker_lifetime: Some(self.config.max_worker_lifetime),
		};
		let worker_user = self.config.worker_user.clone();
		let worker_group = self.config.worker_group.clone();

		let handle = unsafe {
			process::spawn_worker(move |side: WorkerSide| -> ! {
				if worker_user.is_some() || worker_group.is_some() {
					if let Err(error) = process::drop_privileges(worker_user.as_deref(), worker_group.as_deref()) {
						eprintln!("serverino: failed to drop worker privileges: {error}");
						std::process::exit(1);
					}
				}

				let mut instance = Worker::new(side.control, endpoints, form_decoder, max_header_bytes, max_request_size, recycling);

				if let Ok(WorkerOutcome::HandedOffToWebSocket(mut session)) = instance.run() {
					let control = instance.into_control();
					match process::receive_socket(&control) {
						Ok(fd) => {
							let mut client = std::net::TcpStream::from(fd);
							let _ = worker::drive_websocket(&mut client, &mut session);
						}
						Err(error) => eprintln!("serverino: failed to receive handed-off socket: {error}"),
					}
				}

				std::process::exit(0);
			})
		}?;

		handle.control.set_nonblocking(true).map_err(DaemonError::Io)?;

		let id = self.workers.insert(handle).expect("capacity was checked by the caller");
		self.worker_ingress.insert(id, BytesMut::new());

		let key = self.bind_token(Token::Worker(id));
		let fd = self.workers.get(id).expect("just inserted").handle.control.as_fd();
		unsafe { self.poller.register(fd, key, Interest::READABLE)? };

		debug!("spawned worker {id} (pid {})", self.workers.get(id).expect("just inserted").handle.pid);
		Ok(())
	}

	fn retire_idle_workers(&mut self) {
		for id in self.workers.idle_workers_to_retire() {
			self.shutdown_worker(id);
		}
	}

	/// Kills and respawns workers that never sent `READY` within
	/// `worker_startup_timeout`.
	fn reap_stuck_starting_workers(&mut self) -> Result<(), DaemonError> {
		for id in self.workers.stuck_starting_workers(self.config.worker_startup_timeout) {
			warn!("worker {id} did not become ready in time, killing and respawning");
			self.force_kill_worker(id);
			self.spawn_worker()?;
		}

		Ok(())
	}

	fn shutdown_worker(&mut self, id: usize) {
		if let Some(slot) = self.workers.get_mut(id) {
			if self.poller.unregister(slot.handle.control.as_fd()).is_ok() {
				let _ = slot.handle.control.write_all(&ControlFrame::Shutdown.encode());
			}
		}
		self.workers.remove(id);
		self.worker_ingress.remove(&id);
	}

	/// Recycles the whole fleet (the `SIGUSR1`/canary-deletion signal): idle
	/// workers stop immediately; busy ones are marked to stop as soon as
	/// they next report `Ready`, so no in-flight request is lost. The fleet
	/// is then topped back up to `min_workers` with fresh processes.
	pub fn recycle_all_workers(&mut self) -> Result<(), DaemonError> {
		let ids: Vec<usize> = self.workers.iter_ids().collect();

		for id in ids {
			let Some(slot) = self.workers.get_mut(id) else { continue };
			match slot.state {
				WorkerState::Idle => self.shutdown_worker(id),
				WorkerState::Starting | WorkerState::Processing => slot.state = WorkerState::Stopping,
				WorkerState::Stopping | WorkerState::Dead => {}
			}
		}

		while self.workers.len() < self.config.min_workers {
			self.spawn_worker()?;
		}

		Ok(())
	}

	/// Shuts down every worker outright, with no replacement spawned. Called
	/// once the daemon has stopped accepting connections and drained (or
	/// timed out waiting for) whatever was in flight.
	pub fn shutdown_all_workers(&mut self) {
		let ids: Vec<usize> = self.workers.iter_ids().collect();
		for id in ids {
			self.shutdown_worker(id);
		}
	}

	/// Reaps worker processes the kernel has already reported as exited
	/// (driven by `SIGCHLD`), tearing down whatever client connection they
	/// were serving.
	pub fn reap_crashed_workers(&mut self) {
		use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

		loop {
			let status = match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
				Ok(status) => status,
				Err(_) => break,
			};

			let pid = match status {
				WaitStatus::StillAlive => break,
				WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => pid,
				_ => continue,
			};

			let found = self.workers.iter().find(|(_, slot)| slot.handle.pid == pid).map(|(id, _)| id);
			if let Some(id) = found {
				self.worker_crashed(id);
			}
		}
	}

	// --------------------------------------------------
	// Tick

	/// Runs one pass: waits for readiness (bounded by `timeout`), services
	/// every ready descriptor, then sweeps expired connections and retires
	/// surplus idle workers.
	pub fn tick(&mut self, timeout: Duration) -> Result<(), DaemonError> {
		let ready = self.poller.wait(timeout)?;

		for readiness in ready {
			self.service(readiness);
		}

		self.enforce_deadlines();
		self.reap_stuck_starting_workers()?;
		self.drain_pending();
		self.retire_idle_workers();

		Ok(())
	}

	fn service(&mut self, readiness: Readiness) {
		let Some(token) = self.tokens.get(&readiness.key).copied() else {
			return;
		};

		match token {
			Token::Listener(index) => self.accept_all(index),
			Token::Connection(id) => self.read_connection(id),
			Token::Worker(id) => self.read_worker(id),
		}
	}

	// --------------------------------------------------
	// Accepting

	fn accept_all(&mut self, listener_index: usize) {
		if self.suspended {
			return;
		}

		loop {
			match self.listeners[listener_index].accept() {
				Ok((stream, remote_addr)) => {
					self.accept_backoff = ACCEPT_BACKOFF_INITIAL;

					if let Err(error) = stream.set_nonblocking(true) {
						warn!("failed to set accepted socket nonblocking: {error}");
						continue;
					}

					let connection = ClientConnection::new(stream, remote_addr, self.config.keep_alive_timeout);
					let fd = connection.fd();
					let id = self.connections.insert(connection);
					let key = self.bind_token(Token::Connection(id));

					if let Err(error) = unsafe { self.poller.register(fd, key, Interest::READABLE) } {
						warn!("failed to register accepted connection: {error}");
						self.connections.remove(id);
					}
				}
				Err(error) if error.kind() == ErrorKind::WouldBlock => return,
				Err(error) if is_transient_accept_error(&error) => {
					warn!("accept failed ({error}), backing off {:?}", self.accept_backoff);
					std::thread::sleep(self.accept_backoff);
					self.accept_backoff = (self.accept_backoff * 2).min(ACCEPT_BACKOFF_MAX);
					return;
				}
				Err(error) => {
					warn!("accept failed: {error}");
					return;
				}
			}
		}
	}

	// --------------------------------------------------
	// Client connections

	fn read_connection(&mut self, id: usize) {
		let Some(connection) = self.connections.get_mut(id) else { return };

		let mut chunk = [0u8; 8192];
		loop {
			match (&connection.socket).read(&mut chunk) {
				Ok(0) => {
					self.close_connection(id);
					return;
				}
				Ok(n) => {
					connection.touch();
					connection.ingress.extend_from_slice(&chunk[..n]);
				}
				Err(error) if error.kind() == ErrorKind::WouldBlock => break,
				Err(_) => {
					self.close_connection(id);
					return;
				}
			}
		}

		self.frame_pending_requests(id);
		self.flush_egress(id);
	}

	fn frame_pending_requests(&mut self, id: usize) {
		let Some(connection) = self.connections.get(id) else { return };
		if connection.is_pinned() || connection.is_websocket {
			return;
		}

		let outcome = http::try_parse_request(&connection.ingress, self.config.max_header_bytes, self.config.max_request_size);

		match outcome {
			ParseOutcome::Incomplete => {}
			ParseOutcome::Invalid(error) => {
				let error = WorkerError::Framing(error);
				let status = error.status_code().unwrap_or(400);
				let message = error.to_string();
				self.respond_without_worker(id, status, &message);
			}
			ParseOutcome::Complete { consumed, .. } => {
				let Some(connection) = self.connections.get_mut(id) else { return };
				let message = connection.ingress.split_to(consumed).to_vec();
				connection.renew_request_deadline(self.config.max_request_time);

				self.staged.insert(id, message);
				self.pending.push_back(id);
			}
		}
	}

	/// Writes a response the daemon produced itself (framing errors,
	/// timeouts) without ever involving a worker.
	fn respond_without_worker(&mut self, id: usize, status: u16, message: &str) {
		if let Some(connection) = self.connections.get_mut(id) {
			let body = format!(
				"HTTP/1.1 {status} {reason}\r\ncontent-type: text/plain\r\ncontent-length: {len}\r\nconnection: close\r\n\r\n{message}",
				reason = reason_phrase(status),
				len = message.len(),
			);
			connection.egress.extend_from_slice(body.as_bytes());
			connection.keep_alive = false;
		}
		self.flush_egress(id);
	}

	fn flush_egress(&mut self, id: usize) {
		let Some(connection) = self.connections.get_mut(id) else { return };
		if !connection.has_pending_egress() {
			if !connection.keep_alive && !connection.is_pinned() {
				self.close_connection(id);
			}
			return;
		}

		match (&connection.socket).write(&connection.egress) {
			Ok(n) => {
				let _ = connection.egress.split_to(n);
			}
			Err(error) if error.kind() == ErrorKind::WouldBlock => {}
			Err(_) => {
				self.close_connection(id);
				return;
			}
		}

		if !connection.has_pending_egress() && !connection.keep_alive && !connection.is_pinned() {
			self.close_connection(id);
		}
	}

	fn close_connection(&mut self, id: usize) {
		if let Some(connection) = self.connections.remove(id) {
			let _ = self.poller.unregister(connection.fd());
		}
		self.staged.remove(&id);
		self.pending.retain(|&pending_id| pending_id != id);
	}

	fn enforce_deadlines(&mut self) {
		let now = Instant::now();
		for id in self.connections.expired(now) {
			let request_in_flight = self.staged.contains_key(&id)
				|| self.connections.get(id).is_some_and(ClientConnection::is_pinned);

			if !request_in_flight {
				debug!("connection {id} exceeded its idle keep-alive timeout");
				self.close_connection(id);
				continue;
			}

			debug!("connection {id} exceeded its request deadline");

			if let Some(worker_id) = self.connections.get(id).and_then(|connection| connection.assigned_worker) {
				self.force_kill_worker(worker_id);
			}

			self.respond_without_worker(id, 504, "request timed out");
			self.close_connection(id);
		}
	}

	/// A worker stuck past `max_request_time` won't read an ordinary
	/// `SHUTDOWN` frame off its control channel, so it is killed outright and
	/// dropped from the table; `SIGCHLD` reaps the process once the kernel
	/// delivers it.
	fn force_kill_worker(&mut self, worker_id: usize) {
		if let Some(slot) = self.workers.get(worker_id) {
			let _ = signal::kill(slot.handle.pid, Signal::SIGKILL);
			let _ = self.poller.unregister(slot.handle.control.as_fd());
		}
		self.workers.remove(worker_id);
		self.worker_ingress.remove(&worker_id);
	}

	// --------------------------------------------------
	// Dispatch to workers

	fn drain_pending(&mut self) {
		while let Some(&id) = self.pending.front() {
			if self.workers.should_spawn(self.pending.len()) {
				if let Err(error) = self.spawn_worker() {
					warn!("failed to spawn worker: {error}");
					break;
				}
				continue;
			}

			if self.workers.idle_count() == 0 {
				break;
			}

			let Some(worker_id) = self.workers.take_idle(id) else { break };
			self.pending.pop_front();

			let Some(message) = self.staged.remove(&id) else { continue };
			let Some(connection) = self.connections.get_mut(id) else { continue };
			connection.assigned_worker = Some(worker_id);
			let remote_addr = connection.remote_addr.to_string();

			let frame = ControlFrame::Request {
				bytes: message,
				meta: RequestMeta {
					remote_addr,
					is_tls: false,
					arrival_millis: 0,
				},
			};

			let Some(slot) = self.workers.get_mut(worker_id) else { continue };
			if slot.handle.control.write_all(&frame.encode()).is_err() {
				self.workers.mark_dead(worker_id);
			}
		}
	}

	fn read_worker(&mut self, id: usize) {
		let Some(slot) = self.workers.get_mut(id) else { return };

		let mut chunk = [0u8; 8192];
		loop {
			match (&slot.handle.control).read(&mut chunk) {
				Ok(0) => {
					self.worker_crashed(id);
					return;
				}
				Ok(n) => {
					self.worker_ingress.entry(id).or_default().extend_from_slice(&chunk[..n]);
				}
				Err(error) if error.kind() == ErrorKind::WouldBlock => break,
				Err(_) => {
					self.worker_crashed(id);
					return;
				}
			}
		}

		loop {
			let Some(buffer) = self.worker_ingress.get(&id) else { break };
			let outcome = control_protocol::try_parse_frame(buffer);

			match outcome {
				FrameOutcome::Incomplete => break,
				FrameOutcome::Invalid(error) => {
					warn!("worker {id} sent a malformed control frame: {error}");
					self.worker_crashed(id);
					break;
				}
				FrameOutcome::Complete { consumed, frame } => {
					if let Some(buffer) = self.worker_ingress.get_mut(&id) {
						let _ = buffer.split_to(consumed);
					}
					self.handle_worker_frame(id, frame);
				}
			}
		}
	}

	fn handle_worker_frame(&mut self, worker_id: usize, frame: ControlFrame) {
		match frame {
			ControlFrame::Ready => {
				let marked_for_recycle = self.workers.get(worker_id).is_some_and(|slot| slot.state == WorkerState::Stopping);
				if marked_for_recycle {
					self.shutdown_worker(worker_id);
				} else {
					self.workers.mark_idle(worker_id);
				}
			}
			ControlFrame::Response { bytes, flags } => self.relay_response(worker_id, bytes, flags),
			ControlFrame::UpgradeHandoff => self.hand_off_websocket(worker_id),
			ControlFrame::Log(line) => info!("worker {worker_id}: {line}"),
			ControlFrame::Heartbeat => {}
			ControlFrame::Request { .. } | ControlFrame::Shutdown => {
				warn!("worker {worker_id} sent a frame kind the daemon never expects to receive");
			}
		}
	}

	fn relay_response(&mut self, worker_id: usize, bytes: Vec<u8>, flags: ResponseFlags) {
		let Some(connection_id) = self.workers.get(worker_id).and_then(|slot| slot.assigned_connection) else {
			return;
		};

		if let Some(connection) = self.connections.get_mut(connection_id) {
			connection.egress.extend_from_slice(&bytes);
			connection.keep_alive = flags.keep_alive;
			if !flags.did_upgrade {
				connection.assigned_worker = None;
				connection.renew_keep_alive_deadline();
			}
		}

		self.flush_egress(connection_id);

		if !flags.did_upgrade {
			let marked_for_recycle = self.workers.get(worker_id).is_some_and(|slot| slot.state == WorkerState::Stopping);
			if marked_for_recycle {
				self.shutdown_worker(worker_id);
			} else {
				self.workers.mark_idle(worker_id);
			}
		}
	}

	/// The client socket is hand off to the worker via `SCM_RIGHTS`; the
	/// daemon stops polling it and forgets the connection outright.
	fn hand_off_websocket(&mut self, worker_id: usize) {
		let Some(connection_id) = self.workers.get(worker_id).and_then(|slot| slot.assigned_connection) else {
			return;
		};

		let Some(connection) = self.connections.remove(connection_id) else { return };
		let _ = self.poller.unregister(connection.fd());
		self.pending.retain(|&pending_id| pending_id != connection_id);

		let Some(slot) = self.workers.get(worker_id) else { return };
		if let Err(error) = process::transfer_socket(&slot.handle.control, connection.socket.as_fd()) {
			warn!("failed to hand off upgraded socket to worker {worker_id}: {error}");
			self.workers.mark_dead(worker_id);
		}
	}

	fn worker_crashed(&mut self, worker_id: usize) {
		warn!("worker {worker_id} control channel lost");

		if let Some(connection_id) = self.workers.get(worker_id).and_then(|slot| slot.assigned_connection) {
			self.respond_without_worker(connection_id, 502, "worker process crashed");
			self.close_connection(connection_id);
		}

		self.workers.remove(worker_id);
		self.worker_ingress.remove(&worker_id);
	}
}

fn is_transient_accept_error(error: &io::Error) -> bool {
	matches!(error.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ECONNABORTED))
}

fn reason_phrase(status: u16) -> &'static str {
	match status {
		400 => "Bad Request",
		403 => "Forbidden",
		404 => "Not Found",
		413 => "Payload Too Large",
		500 => "Internal Server Error",
		502 => "Bad Gateway",
		504 => "Gateway Timeout",
		_ => "Error",
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use std::net::TcpStream;

	use super::*;

	fn listener_on_loopback() -> TcpListener {
		TcpListener::bind("127.0.0.1:0").expect("bind")
	}

	#[test]
	fn new_scheduler_spawns_the_configured_minimum_workers() {
		let config = Config::new().with_min_workers(2).with_max_workers(4);
		let endpoints = Rc::new(EndpointTable::new());
		let scheduler = Scheduler::new(config, endpoints, None, vec![listener_on_loopback()]).expect("scheduler starts");

		assert_eq!(scheduler.worker_count(), 2);
		assert_eq!(scheduler.connection_count(), 0);
	}

	#[test]
	fn suspend_stops_accepting_new_connections() {
		let config = Config::new().with_min_workers(1).with_max_workers(2);
		let endpoints = Rc::new(EndpointTable::new());
		let mut scheduler = Scheduler::new(config, endpoints, None, vec![listener_on_loopback()]).expect("scheduler starts");

		scheduler.suspend();
		scheduler.accept_all(0);
		assert_eq!(scheduler.connection_count(), 0);
	}

	#[test]
	fn recycling_the_fleet_keeps_the_configured_minimum_alive() {
		let config = Config::new().with_min_workers(2).with_max_workers(4);
		let endpoints = Rc::new(EndpointTable::new());
		let mut scheduler = Scheduler::new(config, endpoints, None, vec![listener_on_loopback()]).expect("scheduler starts");

		scheduler.recycle_all_workers().expect("recycle succeeds");
		assert_eq!(scheduler.worker_count(), 2);
	}

	fn connected_pair() -> (TcpStream, TcpStream) {
		let listener = listener_on_loopback();
		let addr = listener.local_addr().unwrap();
		let client = TcpStream::connect(addr).expect("connect");
		let (server, _) = listener.accept().expect("accept");
		(client, server)
	}

	#[test]
	fn enforce_deadlines_closes_an_idle_connection_without_writing_a_response() {
		let config = Config::new().with_min_workers(0).with_max_workers(1);
		let endpoints = Rc::new(EndpointTable::new());
		let mut scheduler = Scheduler::new(config, endpoints, None, vec![listener_on_loopback()]).expect("scheduler starts");

		let (mut client, server) = connected_pair();
		server.set_nonblocking(true).unwrap();
		let mut connection = ClientConnection::new(server, "127.0.0.1:0".parse().unwrap(), Duration::from_secs(0));
		connection.renew_keep_alive_deadline();
		scheduler.connections.insert(connection);

		scheduler.enforce_deadlines();

		assert_eq!(scheduler.connection_count(), 0);
		client.set_nonblocking(true).unwrap();
		let mut buf = [0u8; 16];
		assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
	}

	#[test]
	fn enforce_deadlines_responds_with_504_when_a_request_is_staged() {
		let config = Config::new().with_min_workers(0).with_max_workers(1);
		let endpoints = Rc::new(EndpointTable::new());
		let mut scheduler = Scheduler::new(config, endpoints, None, vec![listener_on_loopback()]).expect("scheduler starts");

		let (mut client, server) = connected_pair();
		server.set_nonblocking(true).unwrap();
		let mut connection = ClientConnection::new(server, "127.0.0.1:0".parse().unwrap(), Duration::from_secs(0));
		connection.renew_keep_alive_deadline();
		let id = scheduler.connections.insert(connection);
		scheduler.staged.insert(id, b"GET / HTTP/1.1\r\n\r\n".to_vec());

		scheduler.enforce_deadlines();

		assert_eq!(scheduler.connection_count(), 0);
		client.set_nonblocking(true).unwrap();
		let mut buf = [0u8; 4096];
		let n = client.read(&mut buf).expect("server wrote a response before closing");
		let response = String::from_utf8_lossy(&buf[..n]);
		assert!(response.starts_with("HTTP/1.1 504"));
	}

	#[test]
	fn reap_stuck_starting_workers_respawns_a_worker_past_the_startup_timeout() {
		let config = Config::new().with_min_workers(1).with_max_workers(1).with_worker_startup_timeout(Duration::from_secs(0));
		let endpoints = Rc::new(EndpointTable::new());
		let mut scheduler = Scheduler::new(config, endpoints, None, vec![listener_on_loopback()]).expect("scheduler starts");

		assert_eq!(scheduler.worker_count(), 1);
		scheduler.reap_stuck_starting_workers().expect("reap succeeds");
		assert_eq!(scheduler.worker_count(), 1);
	}

	#[test]
	fn shutdown_all_workers_empties_the_fleet() {
		let config = Config::new().with_min_workers(2).with_max_workers(2);
		let endpoints = Rc::new(EndpointTable::new());
		let mut scheduler = Scheduler::new(config, endpoints, None, vec![listener_on_loopback()]).expect("scheduler starts");

		scheduler.shutdown_all_workers();
		assert_eq!(scheduler.worker_count(), 0);
	}
}
