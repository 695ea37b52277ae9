//! A uniform `register`/`modify`/`unregister`/`wait` readiness interface over
//! a platform poller, backed by the `polling` crate so the scheduler never
//! deals with `epoll`/`kqueue`/IOCP directly.

// ----------

use std::{io, os::fd::BorrowedFd, time::Duration};

use polling::{Event, Events, Poller as PlatformPoller};

use crate::ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// The readiness interests the scheduler can register for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
	pub readable: bool,
	pub writable: bool,
}

impl Interest {
	pub const READABLE: Self = Self { readable: true, writable: false };
	pub const WRITABLE: Self = Self { readable: false, writable: true };
	pub const BOTH: Self = Self { readable: true, writable: true };
}

/// One readiness notification. `hangup`/`error` are reported as additional
/// flags on top of whichever interest fired, matching `polling`'s event
/// shape rather than a fourth interest a caller could register for.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
	pub key: usize,
	pub readable: bool,
	pub writable: bool,
	pub hangup: bool,
}

#[derive(Debug, ImplError)]
pub enum PollerError {
	#[error("poller setup failed: {0}")]
	Setup(#[source] io::Error),
	#[error("poller operation failed: {0}")]
	Op(#[source] io::Error),
}

/// Wraps a [`polling::Poller`] behind a `register`/`modify`/`unregister`/
/// `wait` shape. `key` is the caller's own correlation id (typically a
/// connection or worker table index), threaded straight through to
/// [`Readiness::key`].
pub struct Poller {
	inner: PlatformPoller,
	events: Events,
}

impl Poller {
	pub fn new() -> Result<Self, PollerError> {
		let inner = PlatformPoller::new().map_err(PollerError::Setup)?;
		Ok(Self { inner, events: Events::new() })
	}

	fn event_for(key: usize, interest: Interest) -> Event {
		let mut event = Event::none(key);
		event.readable = interest.readable;
		event.writable = interest.writable;
		event
	}

	/// # Safety
	/// `fd` must remain open and valid for as long as it is registered.
	pub unsafe fn register(&self, fd: BorrowedFd<'_>, key: usize, interest: Interest) -> Result<(), PollerError> {
		unsafe { self.inner.add(fd, Self::event_for(key, interest)).map_err(PollerError::Op) }
	}

	pub fn modify(&self, fd: BorrowedFd<'_>, key: usize, interest: Interest) -> Result<(), PollerError> {
		self.inner.modify(fd, Self::event_for(key, interest)).map_err(PollerError::Op)
	}

	pub fn unregister(&self, fd: BorrowedFd<'_>) -> Result<(), PollerError> {
		self.inner.delete(fd).map_err(PollerError::Op)
	}

	/// Blocks until at least one descriptor is ready or `timeout` elapses.
	/// Minimum resolution is 1 ms. A hangup is not a distinct event on this
	/// backend: it surfaces as a readable notification whose subsequent read
	/// returns zero bytes, which the caller treats as the connection closing.
	pub fn wait(&mut self, timeout: Duration) -> Result<Vec<Readiness>, PollerError> {
		self.events.clear();
		self.inner.wait(&mut self.events, Some(timeout)).map_err(PollerError::Op)?;

		Ok(
			self
				.events
				.iter()
				.map(|event| Readiness {
					key: event.key,
					readable: event.readable,
					writable: event.writable,
					hangup: false,
				})
				.collect(),
		)
	}
}
