//! POSIX worker process management: `fork` + `socketpair` spawn, privilege
//! drop, and the `SCM_RIGHTS` descriptor handoff behind a
//! `transfer_socket(peer, fd) -> ()` operation.
//!
//! Windows support (`WSADuplicateSocket` + `WSAPROTOCOL_INFO` over the
//! control pipe) is not implemented here: this crate's process-control idiom
//! is POSIX-only, and a faithful Windows path needs winapi bindings this
//! crate doesn't depend on.

// ----------

use std::os::{
	fd::{AsFd, AsRawFd, RawFd},
	unix::net::UnixStream,
};

use nix::{
	sys::socket::{self, ControlMessage, MsgFlags, SockFlag},
	unistd::{self, ForkResult, Gid, Pid, Uid},
};

use crate::ImplError;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[derive(Debug, ImplError)]
pub enum ProcessError {
	#[error("fork failed: {0}")]
	Fork(#[source] nix::Error),
	#[error("socketpair failed: {0}")]
	SocketPair(#[source] nix::Error),
	#[error("unknown user {0:?}")]
	UnknownUser(String),
	#[error("unknown group {0:?}")]
	UnknownGroup(String),
	#[error("privilege drop failed: {0}")]
	PrivilegeDrop(#[source] nix::Error),
	#[error("descriptor transfer failed: {0}")]
	Transfer(#[source] nix::Error),
}

/// What the daemon holds for one spawned worker process.
pub struct WorkerHandle {
	pub pid: Pid,
	pub control: UnixStream,
}

impl WorkerHandle {
	#[cfg(test)]
	pub fn for_test(pid: i32) -> Self {
		let (control, _peer) = UnixStream::pair().expect("socketpair");
		Self { pid: Pid::from_raw(pid), control }
	}
}

/// The child side of a freshly forked worker: its end of the control
/// channel. The parent never sees this value; it lives only in the child
/// branch of [`spawn_worker`].
pub struct WorkerSide {
	pub control: UnixStream,
}

/// Forks a new worker process connected to the daemon over a fresh
/// `socketpair`. In the parent, returns the new [`WorkerHandle`]; the child
/// never returns from this function — the caller's `child_entry` runs
/// instead and the process exits when it returns.
///
/// # Safety
/// `fork()` in a multi-threaded process is inherently constrained (only
/// async-signal-safe calls are sound before the child calls `exec` or exits);
/// the daemon must call this before spawning any other threads.
pub unsafe fn spawn_worker(child_entry: impl FnOnce(WorkerSide) -> !) -> Result<WorkerHandle, ProcessError> {
	let (parent_socket, child_socket) = socket::socketpair(
		socket::AddressFamily::Unix,
		socket::SockType::Stream,
		None,
		SockFlag::empty(),
	)
	.map_err(ProcessError::SocketPair)?;

	match unsafe { unistd::fork() }.map_err(ProcessError::Fork)? {
		ForkResult::Parent { child } => {
			drop(child_socket);
			Ok(WorkerHandle {
				pid: child,
				control: UnixStream::from(parent_socket),
			})
		}
		ForkResult::Child => {
			drop(parent_socket);
			child_entry(WorkerSide {
				control: UnixStream::from(child_socket),
			})
		}
	}
}

/// Drops the worker's privileges to `user`/`group` post-bind. Group is
/// switched first, matching the usual POSIX ordering requirement (dropping
/// the user first would forfeit the ability to change group).
pub fn drop_privileges(user: Option<&str>, group: Option<&str>) -> Result<(), ProcessError> {
	if let Some(group) = group {
		let gid = lookup_group(group)?;
		unistd::setgid(gid).map_err(ProcessError::PrivilegeDrop)?;
	}

	if let Some(user) = user {
		let uid = lookup_user(user)?;
		unistd::setuid(uid).map_err(ProcessError::PrivilegeDrop)?;
	}

	Ok(())
}

fn lookup_user(name: &str) -> Result<Uid, ProcessError> {
	nix::unistd::User::from_name(name)
		.map_err(ProcessError::PrivilegeDrop)?
		.map(|user| user.uid)
		.ok_or_else(|| ProcessError::UnknownUser(name.to_owned()))
}

fn lookup_group(name: &str) -> Result<Gid, ProcessError> {
	nix::unistd::Group::from_name(name)
		.map_err(ProcessError::PrivilegeDrop)?
		.map(|group| group.gid)
		.ok_or_else(|| ProcessError::UnknownGroup(name.to_owned()))
}

/// Transfers ownership of `fd` to the process on the other end of
/// `control`, via `sendmsg` with `SCM_RIGHTS`. The caller must
/// stop polling `fd` before calling this — ownership, and the daemon's
/// interest in it, move atomically from the caller's perspective.
pub fn transfer_socket(control: &UnixStream, fd: impl AsFd) -> Result<(), ProcessError> {
	let raw: RawFd = fd.as_fd().as_raw_fd();
	let fds = [raw];
	let control_message = [ControlMessage::ScmRights(&fds)];

	// A single zero byte as the ordinary payload: SCM_RIGHTS rides alongside
	// at least one byte of real data on most platforms.
	let iov = [std::io::IoSlice::new(&[0u8])];

	socket::sendmsg::<()>(control.as_raw_fd(), &iov, &control_message, MsgFlags::empty(), None)
		.map_err(ProcessError::Transfer)?;

	Ok(())
}

/// The worker side of [`transfer_socket`]: receives the handed-off
/// descriptor and takes ownership of it.
pub fn receive_socket(control: &UnixStream) -> Result<std::os::fd::OwnedFd, ProcessError> {
	use std::os::fd::FromRawFd;

	let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
	let mut payload = [0u8; 1];
	let mut iov = [std::io::IoSliceMut::new(&mut payload)];

	let message = socket::recvmsg::<()>(control.as_raw_fd(), &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())
		.map_err(ProcessError::Transfer)?;

	for cmsg in message.cmsgs().map_err(|_| ProcessError::Transfer(nix::Error::EINVAL))? {
		if let socket::ControlMessageOwned::ScmRights(fds) = cmsg {
			if let Some(&raw) = fds.first() {
				return Ok(unsafe { std::os::fd::OwnedFd::from_raw_fd(raw) });
			}
		}
	}

	Err(ProcessError::Transfer(nix::Error::EINVAL))
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn worker_handle_for_test_carries_the_given_pid() {
		let handle = WorkerHandle::for_test(42);
		assert_eq!(handle.pid, Pid::from_raw(42));
	}
}
