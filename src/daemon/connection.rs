//! A client's connection state as the scheduler tracks it between poller
//! wakeups: ingress/egress buffers, the worker it's currently pinned to, and
//! its deadline.

// ----------

use std::{
	net::{SocketAddr, TcpStream},
	os::fd::{AsFd, BorrowedFd},
	time::{Duration, Instant},
};

use bytes::BytesMut;
use serverino_core::http::Version;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// One accepted TCP connection, from the first byte read to the last byte
/// written. Lives in the scheduler's connection table, keyed by the same id
/// it registers with the poller.
pub struct ClientConnection {
	pub socket: TcpStream,
	pub remote_addr: SocketAddr,
	pub ingress: BytesMut,
	pub egress: BytesMut,
	pub keep_alive: bool,
	/// Negotiated once the first request line is framed; `None` beforehand.
	pub version: Option<Version>,
	/// The worker table id this connection is currently pinned to while a
	/// request is in flight, or while a WebSocket session is active on it.
	pub assigned_worker: Option<usize>,
	/// Either a request deadline (renewed against `maxRequestTime` once a
	/// request is framed) or an idle-keep-alive deadline (renewed against
	/// `keepAliveTimeout` whenever the connection has no request in flight),
	/// depending on which window the connection is currently in.
	pub deadline: Instant,
	pub last_activity: Instant,
	pub is_websocket: bool,
	keep_alive_timeout: Duration,
}

impl ClientConnection {
	pub fn new(socket: TcpStream, remote_addr: SocketAddr, keep_alive_timeout: Duration) -> Self {
		let now = Instant::now();
		Self {
			socket,
			remote_addr,
			ingress: BytesMut::new(),
			egress: BytesMut::new(),
			keep_alive: true,
			version: None,
			assigned_worker: None,
			deadline: now + keep_alive_timeout,
			last_activity: now,
			is_websocket: false,
			keep_alive_timeout,
		}
	}

	pub fn fd(&self) -> BorrowedFd<'_> {
		self.socket.as_fd()
	}

	pub fn is_pinned(&self) -> bool {
		self.assigned_worker.is_some()
	}

	pub fn touch(&mut self) {
		self.last_activity = Instant::now();
	}

	/// Enters the request-in-flight window: a complete request has just been
	/// framed and the clock now bounds how long the worker has to respond.
	pub fn renew_request_deadline(&mut self, request_timeout: Duration) {
		self.deadline = Instant::now() + request_timeout;
	}

	/// Enters the idle window: no request in flight, waiting on the client
	/// for more bytes (either the first request line or the next one on a
	/// keep-alive connection).
	pub fn renew_keep_alive_deadline(&mut self) {
		self.deadline = Instant::now() + self.keep_alive_timeout;
	}

	pub fn has_expired(&self, now: Instant) -> bool {
		now >= self.deadline
	}

	pub fn has_pending_egress(&self) -> bool {
		!self.egress.is_empty()
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Fixed free-list-backed table of live connections, mirroring
/// [`crate::daemon::worker_table::WorkerTable`]'s slot shape so the poller's
/// `key` can address either table from one namespace split by a tag bit.
pub struct ConnectionTable {
	slots: Vec<Option<ClientConnection>>,
	free: Vec<usize>,
}

impl ConnectionTable {
	pub fn new() -> Self {
		Self { slots: Vec::new(), free: Vec::new() }
	}

	pub fn insert(&mut self, connection: ClientConnection) -> usize {
		if let Some(id) = self.free.pop() {
			self.slots[id] = Some(connection);
			return id;
		}

		self.slots.push(Some(connection));
		self.slots.len() - 1
	}

	pub fn get(&self, id: usize) -> Option<&ClientConnection> {
		self.slots.get(id).and_then(Option::as_ref)
	}

	pub fn get_mut(&mut self, id: usize) -> Option<&mut ClientConnection> {
		self.slots.get_mut(id).and_then(Option::as_mut)
	}

	pub fn remove(&mut self, id: usize) -> Option<ClientConnection> {
		let removed = self.slots.get_mut(id).and_then(Option::take);
		if removed.is_some() {
			self.free.push(id);
		}
		removed
	}

	pub fn iter(&self) -> impl Iterator<Item = (usize, &ClientConnection)> {
		self.slots.iter().enumerate().filter_map(|(id, slot)| slot.as_ref().map(|slot| (id, slot)))
	}

	pub fn len(&self) -> usize {
		self.slots.iter().filter(|slot| slot.is_some()).count()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Ids of connections whose deadline has already passed.
	pub fn expired(&self, now: Instant) -> Vec<usize> {
		self.iter().filter(|(_, connection)| connection.has_expired(now)).map(|(id, _)| id).collect()
	}
}

impl Default for ConnectionTable {
	fn default() -> Self {
		Self::new()
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	fn dummy_socket() -> TcpStream {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
		let addr = listener.local_addr().unwrap();
		let client = TcpStream::connect(addr).expect("connect");
		let _ = listener.accept();
		client
	}

	fn dummy_addr() -> SocketAddr {
		"127.0.0.1:0".parse().unwrap()
	}

	#[test]
	fn fresh_connection_defaults_to_keep_alive_and_is_unpinned() {
		let connection = ClientConnection::new(dummy_socket(), dummy_addr(), Duration::from_secs(30));
		assert!(connection.keep_alive);
		assert!(!connection.is_pinned());
	}

	#[test]
	fn expiry_is_relative_to_the_keep_alive_timeout() {
		let connection = ClientConnection::new(dummy_socket(), dummy_addr(), Duration::from_secs(0));
		assert!(connection.has_expired(Instant::now()));
	}

	#[test]
	fn request_deadline_overrides_the_keep_alive_deadline_while_in_flight() {
		let mut connection = ClientConnection::new(dummy_socket(), dummy_addr(), Duration::from_secs(0));
		connection.renew_request_deadline(Duration::from_secs(30));
		assert!(!connection.has_expired(Instant::now()));

		connection.renew_keep_alive_deadline();
		assert!(connection.has_expired(Instant::now()));
	}

	#[test]
	fn table_reuses_freed_slots() {
		let mut table = ConnectionTable::new();
		let a = table.insert(ClientConnection::new(dummy_socket(), dummy_addr(), Duration::from_secs(30)));
		table.remove(a);
		let b = table.insert(ClientConnection::new(dummy_socket(), dummy_addr(), Duration::from_secs(30)));
		assert_eq!(a, b);
	}

	#[test]
	fn expired_lists_only_connections_past_deadline() {
		let mut table = ConnectionTable::new();
		let fresh = table.insert(ClientConnection::new(dummy_socket(), dummy_addr(), Duration::from_secs(30)));
		let stale = table.insert(ClientConnection::new(dummy_socket(), dummy_addr(), Duration::from_secs(0)));

		let expired = table.expired(Instant::now());
		assert_eq!(expired, vec![stale]);
		assert!(table.get(fresh).is_some());
	}
}
