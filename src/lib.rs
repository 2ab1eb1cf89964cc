//! # canned
//!
//! An embeddable test-double HTTP server: register canned responses for
//! request patterns, point the application under test at a real socket, and
//! every request it makes gets scripted behavior instead of a live backend.
//!
//! Route paths are regular expressions with capture groups, required query
//! parameters match by subset containment, and a request that matches no
//! registered mock aborts the process — incomplete mocking should stop a
//! test run on the spot, not fail it three assertions later.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use canned::{FixtureServer, Route, Response, StatusCode};
//!
//! let mut server = FixtureServer::new();
//! server.start().unwrap();
//!
//! // Exact-match GET served from fixtures/scores.json
//! server.mock("/api/scores", "scores");
//!
//! // General form: any method, regex path, required query parameters
//! server.mock_route(
//!     Route::get(r"^/api/users/(\d+)$").query("lang", "en"),
//!     |req: canned::MockRequest| {
//!         let id = req.capture(0).unwrap_or_default().to_owned();
//!         async move { Response::new(StatusCode::Ok).body(id) }
//!     },
//! );
//!
//! // ... drive the application under test ...
//! server.stop();
//! ```

pub mod fixtures;
pub mod http;
pub mod router;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use fixtures::{DirSource, FixtureServer, FixtureSource};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::{Handler, IntoHandler, MockRequest, Route, Router, RouterError};
pub use server::{Server, ServerError};
