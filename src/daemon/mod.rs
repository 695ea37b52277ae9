//! The daemon: binds listeners, spawns the worker fleet, and drives the
//! scheduler until a shutdown signal arrives.

// ----------

use std::{
	net::{TcpListener, ToSocketAddrs},
	path::PathBuf,
	rc::Rc,
	sync::atomic::{AtomicBool, Ordering},
	time::{Duration, Instant},
};

use nix::sys::signal::{self, SigHandler, Signal};
use sha2::{Digest, Sha256};

use crate::{config::Config, endpoint::EndpointTable, error::DaemonError, request::FormDecoder};

pub mod connection;
pub mod poller;
mod scheduler;
pub mod worker_table;

use scheduler::Scheduler;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

const TICK_TIMEOUT: Duration = Duration::from_millis(250);

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static RECYCLE_REQUESTED: AtomicBool = AtomicBool::new(false);
static REAP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_: libc::c_int) {
	SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_recycle_signal(_: libc::c_int) {
	RECYCLE_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_child_signal(_: libc::c_int) {
	REAP_REQUESTED.store(true, Ordering::SeqCst);
}

/// # Safety
/// Installs process-wide signal handlers; must run before any other thread
/// is spawned and must not be called more than once per process.
unsafe fn install_signal_handlers() -> Result<(), DaemonError> {
	unsafe {
		signal::signal(Signal::SIGTERM, SigHandler::Handler(on_shutdown_signal)).map_err(DaemonError::Signal)?;
		signal::signal(Signal::SIGINT, SigHandler::Handler(on_shutdown_signal)).map_err(DaemonError::Signal)?;
		signal::signal(Signal::SIGUSR1, SigHandler::Handler(on_recycle_signal)).map_err(DaemonError::Signal)?;
		signal::signal(Signal::SIGCHLD, SigHandler::Handler(on_child_signal)).map_err(DaemonError::Signal)?;
	}

	Ok(())
}

/// `<temp>/serverino-pid-<sha256(pid)>.canary`, touched at startup and
/// removed on clean shutdown. Its deletion is the Windows equivalent of
/// `SIGUSR1`-triggered recycling; this crate only runs on POSIX, so the
/// path is computed and the file is kept present, but nothing polls for
/// its disappearance.
fn canary_path(pid: i32) -> PathBuf {
	let mut hasher = Sha256::new();
	hasher.update(pid.to_string().as_bytes());
	let digest = hasher.finalize();
	let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();

	std::env::temp_dir().join(format!("serverino-pid-{hex}.canary"))
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// The supervisor daemon: owns the listener(s), the worker fleet, and the
/// endpoint table, and drives requests between them until shut down.
///
/// Built with chainable `with_*` setters.
pub struct Daemon {
	config: Config,
	endpoints: Rc<EndpointTable>,
	form_decoder: Option<Rc<dyn FormDecoder>>,
}

impl Daemon {
	pub fn new(config: Config, endpoints: EndpointTable) -> Self {
		Self {
			config,
			endpoints: Rc::new(endpoints),
			form_decoder: None,
		}
	}

	/// Injects the multipart/urlencoded body decoder; form decoding is an
	/// external collaborator, not something the core parses.
	pub fn with_form_decoder(mut self, decoder: Rc<dyn FormDecoder>) -> Self {
		self.form_decoder = Some(decoder);
		self
	}

	/// Binds `listener_addresses`, spawns the worker fleet, and runs until a
	/// `SIGTERM`/`SIGINT` is received.
	///
	/// # Panics
	/// If there is no valid address with an unused port to bind.
	pub fn run<A: ToSocketAddrs>(self, listener_addresses: A) -> Result<(), DaemonError> {
		self.config.validate()?;

		let mut addresses = listener_addresses.to_socket_addrs().map_err(DaemonError::BindFailed)?;
		let Some(address) = addresses.next() else {
			panic!("no valid address with an unbound port given");
		};

		let listener = TcpListener::bind(address).map_err(DaemonError::BindFailed)?;

		unsafe { install_signal_handlers()? };

		let pid = std::process::id() as i32;
		let canary = canary_path(pid);
		let _ = std::fs::write(&canary, b"");

		let mut scheduler = Scheduler::new(self.config.clone(), self.endpoints, self.form_decoder, vec![listener])?;

		loop {
			if SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst) {
				break;
			}

			if RECYCLE_REQUESTED.swap(false, Ordering::SeqCst) {
				scheduler.recycle_all_workers()?;
			}

			if REAP_REQUESTED.swap(false, Ordering::SeqCst) {
				scheduler.reap_crashed_workers();
			}

			scheduler.tick(TICK_TIMEOUT)?;
		}

		// Stop accepting new connections, then let in-flight requests drain;
		// no single request can run longer than `max_request_time`, so that's
		// the outside bound for how long a clean shutdown is allowed to wait.
		scheduler.suspend();
		let drain_deadline = Instant::now() + self.config.max_request_time;
		while scheduler.connection_count() > 0 && Instant::now() < drain_deadline {
			scheduler.tick(TICK_TIMEOUT)?;
		}

		scheduler.shutdown_all_workers();
		let _ = std::fs::remove_file(&canary);

		Ok(())
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn canary_path_is_deterministic_for_a_given_pid() {
		let a = canary_path(4242);
		let b = canary_path(4242);
		assert_eq!(a, b);
		assert!(a.to_string_lossy().contains("serverino-pid-"));
	}

	#[test]
	fn canary_path_differs_across_pids() {
		assert_ne!(canary_path(1), canary_path(2));
	}
}
