//! Iterates an [`EndpointTable`] in priority order and applies the chain and
//! fallthrough rules.

// ----------

use std::panic::{catch_unwind, AssertUnwindSafe};

use super::{EndpointTable, Fallthrough, Handler};
use crate::{output::Output, request::Request, websocket::WebSocketSession};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// What happened when a request ran through the endpoint chain.
pub enum DispatchOutcome {
	/// Some endpoint wrote to `Output`; it is ready to serialize.
	Responded,
	/// A WebSocket-declaring endpoint accepted the upgrade and took over the
	/// connection; `Output` is irrelevant from here on.
	WebSocket,
	/// No endpoint in the chain ever touched `Output`.
	NotFound,
	/// An endpoint panicked; carries the panic payload rendered as text.
	Panicked(String),
}

/// Runs `request` through `table`, writing into `output` as endpoints fire.
///
/// `accepted_upgrade` is `Some` when the request is a WebSocket upgrade the
/// framing layer has already validated and answered with `101`; in that case
/// the first matching endpoint that declares a [`WebSocketSession`] parameter
/// takes the connection over outright, independent of whatever `output` holds
/// so far.
pub fn dispatch(
	table: &EndpointTable,
	request: &Request,
	output: &mut Output,
	mut accepted_upgrade: Option<&mut WebSocketSession>,
) -> DispatchOutcome {
	for entry in table.iter() {
		if !entry.predicate.matches(request) {
			continue;
		}

		let result = catch_unwind(AssertUnwindSafe(|| call(entry, request, output, accepted_upgrade.as_deref_mut())));

		let fallthrough = match result {
			Ok(DispatchStep::WebSocketTaken) => return DispatchOutcome::WebSocket,
			Ok(DispatchStep::NotApplicable) => continue,
			Ok(DispatchStep::Ran(fallthrough)) => fallthrough,
			Err(panic) => return DispatchOutcome::Panicked(panic_message(panic)),
		};

		if output.touched() && fallthrough == Fallthrough::No {
			return DispatchOutcome::Responded;
		}
	}

	if output.touched() {
		DispatchOutcome::Responded
	} else {
		DispatchOutcome::NotFound
	}
}

enum DispatchStep {
	Ran(Fallthrough),
	WebSocketTaken,
	NotApplicable,
}

fn call(
	entry: &super::EndpointEntry,
	request: &Request,
	output: &mut Output,
	accepted_upgrade: Option<&mut WebSocketSession>,
) -> DispatchStep {
	match &entry.handler {
		Handler::RequestWebSocket(handler) => match accepted_upgrade {
			Some(session) => {
				handler(request, session);
				DispatchStep::WebSocketTaken
			}
			None => DispatchStep::NotApplicable,
		},
		Handler::RequestOutput(handler) => DispatchStep::Ran(handler(request, output)),
		Handler::RequestOnly(handler) => DispatchStep::Ran(handler(request)),
		Handler::OutputOnly(handler) => DispatchStep::Ran(handler(output)),
	}
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
	if let Some(message) = panic.downcast_ref::<&str>() {
		(*message).to_owned()
	} else if let Some(message) = panic.downcast_ref::<String>() {
		message.clone()
	} else {
		"endpoint panicked with a non-string payload".to_owned()
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use std::{cell::RefCell, rc::Rc};

	use serverino_core::http::{HeaderMap, Method, RequestHead, Version};

	use super::*;
	use crate::endpoint::{EndpointEntry, RoutePredicate};

	fn blank_request() -> Request {
		Request::from_wire(
			RequestHead {
				method: Method::Get,
				target: b"/".as_slice().into(),
				version: Version::Http11,
				headers: HeaderMap::new(),
			},
			Vec::new(),
		)
	}

	#[test]
	fn dumps_appenders_by_priority_then_runs_the_dumper_last() {
		let appended: Rc<RefCell<Vec<i32>>> = Rc::new(RefCell::new(Vec::new()));
		let mut table = EndpointTable::new();

		for (priority, tag) in [(0, 1), (-15, 2), (-7, 3), (-9, 4), (-2, 5)] {
			let appended = Rc::clone(&appended);
			table.register(EndpointEntry::output_only(priority, RoutePredicate::Any, move |_output| {
				appended.borrow_mut().push(tag);
				Fallthrough::Yes
			}));
		}

		table.register(EndpointEntry::output_only(-30, RoutePredicate::Any, |output| {
			output.set_status(200);
			Fallthrough::No
		}));

		let request = blank_request();
		let mut output = Output::new();
		let outcome = dispatch(&table, &request, &mut output, None);

		assert!(matches!(outcome, DispatchOutcome::Responded));
		assert_eq!(*appended.borrow(), vec![1, 5, 3, 4, 2]);
	}

	#[test]
	fn stops_at_the_first_endpoint_that_touches_output_without_fallthrough() {
		let mut table = EndpointTable::new();
		let ran_second = Rc::new(RefCell::new(false));

		table.register(EndpointEntry::output_only(10, RoutePredicate::Any, |output| {
			output.set_status(403);
			Fallthrough::No
		}));

		let flag = Rc::clone(&ran_second);
		table.register(EndpointEntry::output_only(5, RoutePredicate::Any, move |_output| {
			*flag.borrow_mut() = true;
			Fallthrough::No
		}));

		let request = blank_request();
		let mut output = Output::new();
		dispatch(&table, &request, &mut output, None);

		assert_eq!(output.status(), 403);
		assert!(!*ran_second.borrow());
	}

	#[test]
	fn no_matching_endpoint_is_not_found() {
		let table = EndpointTable::new();
		let request = blank_request();
		let mut output = Output::new();

		assert!(matches!(dispatch(&table, &request, &mut output, None), DispatchOutcome::NotFound));
	}

	#[test]
	fn a_panicking_endpoint_is_caught_and_reported() {
		let mut table = EndpointTable::new();
		table.register(EndpointEntry::output_only(0, RoutePredicate::Any, |_output| -> Fallthrough {
			panic!("boom");
		}));

		let request = blank_request();
		let mut output = Output::new();
		let outcome = dispatch(&table, &request, &mut output, None);

		match outcome {
			DispatchOutcome::Panicked(message) => assert_eq!(message, "boom"),
			_ => panic!("expected a caught panic"),
		}
	}

	#[test]
	fn websocket_endpoint_takes_the_connection_regardless_of_prior_output() {
		let mut table = EndpointTable::new();

		table.register(EndpointEntry::output_only(10, RoutePredicate::Any, |output| {
			output.append_body(b"ignored");
			Fallthrough::Yes
		}));

		table.register(EndpointEntry::request_websocket(5, RoutePredicate::Any, |_request, session| {
			session.send_text("hi");
		}));

		let request = blank_request();
		let mut output = Output::new();
		let mut session = WebSocketSession::new(serverino_core::websocket::Role::Server);
		let outcome = dispatch(&table, &request, &mut output, Some(&mut session));

		assert!(matches!(outcome, DispatchOutcome::WebSocket));
		assert!(session.has_outbound());
	}
}
