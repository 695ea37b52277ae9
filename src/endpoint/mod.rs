//! The endpoint registry: an explicit table of route predicates, priorities,
//! and handlers, built once at program start and walked per request.

// ----------

use std::rc::Rc;

use crate::{output::Output, request::Request, websocket::WebSocketSession};

pub mod dispatch;

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

// --------------------------------------------------
// Fallthrough

/// Whether the endpoint chain should keep iterating after this endpoint ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fallthrough {
	Yes,
	#[default]
	No,
}

/// Lets an endpoint return either `()` (an implicit `Fallthrough::No`) or an
/// explicit [`Fallthrough`].
pub trait IntoFallthrough {
	fn into_fallthrough(self) -> Fallthrough;
}

impl IntoFallthrough for () {
	fn into_fallthrough(self) -> Fallthrough {
		Fallthrough::No
	}
}

impl IntoFallthrough for Fallthrough {
	fn into_fallthrough(self) -> Fallthrough {
		self
	}
}

// --------------------------------------------------
// RoutePredicate

/// Either a literal path equality or a user predicate over [`Request`].
/// Multiple paths on one entry combine as OR, so one endpoint can answer
/// several routes.
pub enum RoutePredicate {
	/// Matches any path — the entry has no `@route`.
	Any,
	Paths(Vec<Box<str>>),
	Custom(Rc<dyn Fn(&Request) -> bool>),
}

impl RoutePredicate {
	pub fn path(path: impl Into<Box<str>>) -> Self {
		Self::Paths(vec![path.into()])
	}

	pub fn paths<I, S>(paths: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<Box<str>>,
	{
		Self::Paths(paths.into_iter().map(Into::into).collect())
	}

	pub fn custom(predicate: impl Fn(&Request) -> bool + 'static) -> Self {
		Self::Custom(Rc::new(predicate))
	}

	fn matches(&self, request: &Request) -> bool {
		match self {
			Self::Any => true,
			Self::Paths(paths) => paths.iter().any(|path| path.as_ref() == request.path()),
			Self::Custom(predicate) => predicate(request),
		}
	}
}

// --------------------------------------------------
// Handler

/// The four recognized endpoint signatures.
enum Handler {
	RequestOutput(Box<dyn Fn(&Request, &mut Output) -> Fallthrough>),
	RequestOnly(Box<dyn Fn(&Request) -> Fallthrough>),
	OutputOnly(Box<dyn Fn(&mut Output) -> Fallthrough>),
	RequestWebSocket(Box<dyn Fn(&Request, &mut WebSocketSession)>),
}

// --------------------------------------------------
// EndpointEntry

/// One registered endpoint: a handler, its priority, its route predicate, and
/// whether it requests fallthrough.
pub struct EndpointEntry {
	priority: i64,
	predicate: RoutePredicate,
	handler: Handler,
	registration_order: usize,
}

impl EndpointEntry {
	pub fn request_output<F, R>(priority: i64, predicate: RoutePredicate, handler: F) -> Self
	where
		F: Fn(&Request, &mut Output) -> R + 'static,
		R: IntoFallthrough,
	{
		Self {
			priority,
			predicate,
			handler: Handler::RequestOutput(Box::new(move |request, output| {
				handler(request, output).into_fallthrough()
			})),
			registration_order: 0,
		}
	}

	pub fn request_only<F, R>(priority: i64, predicate: RoutePredicate, handler: F) -> Self
	where
		F: Fn(&Request) -> R + 'static,
		R: IntoFallthrough,
	{
		Self {
			priority,
			predicate,
			handler: Handler::RequestOnly(Box::new(move |request| handler(request).into_fallthrough())),
			registration_order: 0,
		}
	}

	pub fn output_only<F, R>(priority: i64, predicate: RoutePredicate, handler: F) -> Self
	where
		F: Fn(&mut Output) -> R + 'static,
		R: IntoFallthrough,
	{
		Self {
			priority,
			predicate,
			handler: Handler::OutputOnly(Box::new(move |output| handler(output).into_fallthrough())),
			registration_order: 0,
		}
	}

	pub fn request_websocket<F>(priority: i64, predicate: RoutePredicate, handler: F) -> Self
	where
		F: Fn(&Request, &mut WebSocketSession) + 'static,
	{
		Self {
			priority,
			predicate,
			handler: Handler::RequestWebSocket(Box::new(handler)),
			registration_order: 0,
		}
	}

	/// Whether this entry declares a [`WebSocketSession`] parameter.
	pub fn is_websocket_endpoint(&self) -> bool {
		matches!(self.handler, Handler::RequestWebSocket(_))
	}
}

// --------------------------------------------------
// EndpointTable

/// The fixed, built-at-startup registration table, kept sorted by descending
/// priority with registration order as the tiebreaker.
#[derive(Default)]
pub struct EndpointTable {
	entries: Vec<EndpointEntry>,
}

impl EndpointTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, mut entry: EndpointEntry) -> &mut Self {
		entry.registration_order = self.entries.len();
		self.entries.push(entry);
		self.resort();
		self
	}

	fn resort(&mut self) {
		self
			.entries
			.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.registration_order.cmp(&b.registration_order)));
	}

	pub fn iter(&self) -> impl Iterator<Item = &EndpointEntry> {
		self.entries.iter()
	}
}

/// Shorthand for [`RoutePredicate::path`], for building entries inline:
/// `EndpointEntry::request_output(0, route("/simple"), handler)`.
pub fn route(path: impl Into<Box<str>>) -> RoutePredicate {
	RoutePredicate::path(path)
}
