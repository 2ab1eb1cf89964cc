//! Request routing — match inbound requests against registered mock routes.
//!
//! A [`Route`] is a pattern: an HTTP method, a path *regular expression*, and
//! a set of required query parameters. The [`Router`] holds the table of
//! registered routes and resolves each inbound request to the handler of the
//! first route that survives three checks:
//!
//! 1. the method is equal,
//! 2. the path regex matches the literal request path (patterns are not
//!    anchored implicitly — register `^/users$`, not `/users`, for an exact
//!    match),
//! 3. every required query parameter is present in the request with exactly
//!    the required value (subset containment; extra request parameters are
//!    ignored).
//!
//! Capture groups in the path regex are extracted in order and handed to the
//! matched handler.
//!
//! The table iterates in `HashMap` order, which is unspecified. When two
//! registered routes could both match the same request, which one wins is
//! therefore non-deterministic — register disjoint patterns if the
//! distinction matters. A request that matches nothing is a routing miss; the
//! server treats that as fatal rather than answering 404, so an incomplete
//! mock set surfaces the moment the application under test strays off
//! script.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use regex::Regex;
use thiserror::Error;

use crate::http::{Method, Request, Response};

/// Errors produced by route registration and dispatch.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The route's path string is not a valid regular expression. This is a
    /// programmer error in the test setup and is raised at registration,
    /// never silently skipped at match time.
    #[error("route pattern {pattern:?} is not a valid regex: {source}")]
    MalformedPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// No registered route matches the request. Fatal by policy: the caller
    /// converts this into a process abort instead of a 404 so that missing
    /// mocks fail the test run immediately.
    #[error("{method} request with path {path} is not mocked")]
    UnmatchedRequest { method: Method, path: String },
}

/// A route pattern: method + path regex + required query parameters.
///
/// Routes are immutable values and serve as keys in the route table.
/// Equality and hashing are structural over the *raw pattern string* — two
/// different regexes that happen to match the same set of paths are distinct
/// routes. The query map is ordered ([`BTreeMap`]) so equality is
/// independent of insertion order.
///
/// # Examples
///
/// ```
/// use canned::router::Route;
/// use canned::http::Method;
///
/// let a = Route::get(r"^/scores/(\d+)$");
/// let b = Route::new(Method::Get, r"^/scores/(\d+)$").query("lang", "en");
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    method: Method,
    path: String,
    query: BTreeMap<String, String>,
}

impl Route {
    /// Creates a route with the given method and path pattern and no
    /// required query parameters.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
        }
    }

    /// Creates a GET route — the common case for fixture traffic.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Adds a required query parameter. A request only matches this route if
    /// it carries `key` with exactly `value`.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Returns the HTTP method this route matches.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Returns the raw path pattern string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the required query parameters.
    pub fn query_params(&self) -> &BTreeMap<String, String> {
        &self.query
    }
}

/// A matched request as seen by a handler: the parsed request plus the path
/// substrings captured by the route's regex, in group order (group 0, the
/// whole match, is excluded).
#[derive(Debug)]
pub struct MockRequest {
    request: Request,
    captures: Vec<String>,
}

impl MockRequest {
    pub(crate) fn new(request: Request, captures: Vec<String>) -> Self {
        Self { request, captures }
    }

    /// Returns the underlying request.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Returns all captured path segments in group order.
    pub fn captures(&self) -> &[String] {
        &self.captures
    }

    /// Returns the capture at `index` (0 is the first parenthesized group).
    pub fn capture(&self, index: usize) -> Option<&str> {
        self.captures.get(index).map(String::as_str)
    }
}

/// Type-erased, heap-allocated async handler that turns a [`MockRequest`]
/// into a [`Response`].
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so route-table entries can be
/// cloned out of the critical section and invoked without holding the lock.
pub type Handler = Arc<
    dyn Fn(MockRequest) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(MockRequest) -> impl Future<Output = Response> + Send` that is
/// also `Send + Sync + 'static` implements this automatically via the
/// blanket impl, so registration sites can take `impl IntoHandler` instead
/// of repeating the two-type-parameter where-bound.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the matched request, boxing the returned future.
    fn call(&self, request: MockRequest) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(MockRequest) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, request: MockRequest) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(request))
    }
}

// A table entry: the regex compiled from the route's pattern at registration
// time, plus the handler to invoke on a match.
struct Mock {
    pattern: Regex,
    handler: Handler,
}

/// The thread-safe route table and matcher.
///
/// Registration (test setup threads) and dispatch (the server's worker) run
/// concurrently, so the table lives behind a single [`Mutex`]. The lock is
/// held only for the map access itself — handlers run outside the critical
/// section, and the lock is never held across an `.await`.
#[derive(Default)]
pub struct Router {
    routes: Mutex<HashMap<Route, Mock>>,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `route`, compiling the route's path pattern.
    ///
    /// Registering the same route again replaces the previous handler.
    ///
    /// # Errors
    ///
    /// [`RouterError::MalformedPattern`] if the path string is not a valid
    /// regular expression.
    pub fn register(&self, route: Route, handler: impl IntoHandler) -> Result<(), RouterError> {
        let pattern =
            Regex::new(route.path()).map_err(|source| RouterError::MalformedPattern {
                pattern: route.path().to_owned(),
                source,
            })?;
        let handler: Handler = Arc::new(move |request| handler.call(request));
        let mut routes = self.routes.lock().expect("route table lock poisoned");
        routes.insert(route, Mock { pattern, handler });
        Ok(())
    }

    /// Returns the number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.lock().expect("route table lock poisoned").len()
    }

    /// Returns `true` if no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `route` is present in the table (by key equality,
    /// not by matching semantics).
    pub fn is_registered(&self, route: &Route) -> bool {
        self.routes
            .lock()
            .expect("route table lock poisoned")
            .contains_key(route)
    }

    /// Searches the table for the first route matching `request`.
    ///
    /// Returns the route's handler together with the path substrings
    /// captured by its regex, or `None` if no route survives the method,
    /// path, and query checks. "First" is first in table-iteration order,
    /// which is unspecified — see the module docs.
    pub fn match_route(&self, request: &Request) -> Option<(Handler, Vec<String>)> {
        let routes = self.routes.lock().expect("route table lock poisoned");

        'candidates: for (route, mock) in routes.iter() {
            if route.method() != request.method() {
                continue;
            }

            let Some(captures) = mock.pattern.captures(request.path()) else {
                continue;
            };

            // Subset containment: every required pair must be present in the
            // request verbatim. A miss rejects this candidate only.
            for (key, required) in route.query_params() {
                if request.query_param(key) != Some(required.as_str()) {
                    continue 'candidates;
                }
            }

            let captured = captures
                .iter()
                .skip(1)
                .map(|group| group.map(|m| m.as_str().to_owned()).unwrap_or_default())
                .collect();

            return Some((Arc::clone(&mock.handler), captured));
        }

        None
    }

    /// Resolves `request` to a handler and awaits its response.
    ///
    /// # Errors
    ///
    /// [`RouterError::UnmatchedRequest`] when no registered route matches;
    /// the message names the offending method and path. The server adapter
    /// escalates this to a process abort.
    pub async fn dispatch(&self, request: Request) -> Result<Response, RouterError> {
        let (handler, captures) =
            self.match_route(&request)
                .ok_or_else(|| RouterError::UnmatchedRequest {
                    method: request.method(),
                    path: request.path().to_owned(),
                })?;

        Ok(handler(MockRequest::new(request, captures)).await)
    }
}
