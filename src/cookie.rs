//! Request cookie map and response `Set-Cookie` jar.
//!
//! Parsing the incoming `Cookie` header into a name/value map is a small,
//! local job; building attributed `Set-Cookie` lines is delegated to the
//! `cookie` crate.

// ----------

use std::collections::HashMap;

#[cfg(feature = "cookies")]
pub use cookie::{Cookie, CookieBuilder, Expiration, SameSite};

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------

/// Splits a `Cookie` request header into a name/value map. This is a plain
/// `; `-separated split, not a full cookie-attribute parser — request cookies
/// never carry attributes, only `name=value` pairs.
pub fn parse_cookie_header(header_value: &str) -> HashMap<String, String> {
	let mut map = HashMap::new();

	for pair in header_value.split(';') {
		let pair = pair.trim();
		if pair.is_empty() {
			continue;
		}

		if let Some((name, value)) = pair.split_once('=') {
			map.insert(name.trim().to_owned(), value.trim().to_owned());
		}
	}

	map
}

// --------------------------------------------------
// OutgoingCookies

/// The `Set-Cookie` cookies accumulated on an [`Output`](crate::output::Output)
/// over the lifetime of a request. Insertion order is preserved.
#[cfg(feature = "cookies")]
#[derive(Debug, Clone, Default)]
pub struct OutgoingCookies {
	cookies: Vec<Cookie<'static>>,
}

#[cfg(feature = "cookies")]
impl OutgoingCookies {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&mut self, cookie: Cookie<'static>) {
		self.cookies.push(cookie);
	}

	/// Marks a cookie for removal on the client by re-emitting it expired.
	pub fn remove(&mut self, name: impl Into<std::borrow::Cow<'static, str>>) {
		let mut cookie = Cookie::new(name, "");
		cookie.make_removal();
		self.cookies.push(cookie);
	}

	pub fn iter(&self) -> impl Iterator<Item = &Cookie<'static>> {
		self.cookies.iter()
	}

	pub fn is_empty(&self) -> bool {
		self.cookies.is_empty()
	}
}

// --------------------------------------------------------------------------------
// --------------------------------------------------------------------------------
