//! The fixtures server — lifecycle control around the listener and router.
//!
//! [`FixtureServer`] is what a test suite holds: it owns the route table, a
//! dedicated worker thread running the listener on its own Tokio runtime,
//! and the channels used to start and stop that worker deterministically.
//! The intended shape of a UI/integration test:
//!
//! ```no_run
//! use canned::FixtureServer;
//!
//! let mut server = FixtureServer::new();
//! server.start().unwrap();
//! server.mock("/api/scores", "scores");
//! // ... launch the application under test, run assertions ...
//! server.stop();
//! ```
//!
//! The failure policy is deliberately harsh. A request nothing was mocked
//! for aborts the whole process with a message naming the path — an
//! incomplete mock set must stop the test run, not surface later as a
//! confusing assertion failure on an unexpected body. Likewise, a worker
//! that fails to exit within the stop deadline is treated as a leaked
//! resource that would poison every subsequent test, and `stop()` panics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::http::{Request, Response, StatusCode};
use crate::router::{IntoHandler, MockRequest, Route, Router};
use crate::server::{Server, ServerError};

mod source;

pub use source::{DirSource, FixtureSource};

/// Interface and port used by [`FixtureServer::new`].
pub const DEFAULT_ADDR: &str = "0.0.0.0:8090";

/// Directory used for fixture payloads by [`FixtureServer::new`].
pub const DEFAULT_FIXTURE_DIR: &str = "fixtures";

/// How long `stop()` waits for the worker thread to confirm termination.
const STOP_DEADLINE: Duration = Duration::from_secs(10);

// Handles to a started worker: the thread itself, the shutdown signal into
// its accept loop, and the channel it signals just before exiting.
struct Worker {
    thread: thread::JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    exited: mpsc::Receiver<()>,
}

/// An embedded test-double HTTP server.
///
/// Lifecycle is `Created → Started → Stopped`, driven by [`start`] and
/// [`stop`]; there is no restart. Mocks can be registered before or after
/// `start`, from any thread, including while requests are being served.
///
/// [`start`]: Self::start
/// [`stop`]: Self::stop
pub struct FixtureServer {
    addr: String,
    router: Arc<Router>,
    source: Arc<dyn FixtureSource>,
    local_addr: Option<SocketAddr>,
    worker: Option<Worker>,
}

impl FixtureServer {
    /// Creates a server that will listen on [`DEFAULT_ADDR`] and read
    /// fixture payloads from [`DEFAULT_FIXTURE_DIR`].
    pub fn new() -> Self {
        Self::with_config(DEFAULT_ADDR, DirSource::new(DEFAULT_FIXTURE_DIR))
    }

    /// Creates a server with an explicit bind address and fixture source.
    ///
    /// Binding port 0 picks a free port; [`local_addr`](Self::local_addr)
    /// reports the actual one after `start`.
    pub fn with_config(addr: impl Into<String>, source: impl FixtureSource) -> Self {
        Self {
            addr: addr.into(),
            router: Arc::new(Router::new()),
            source: Arc::new(source),
            local_addr: None,
            worker: None,
        }
    }

    /// Binds the listener and starts serving on a dedicated worker thread.
    ///
    /// Blocks until the worker reports the bound address, so a bind failure
    /// surfaces here rather than racing the first request. Calling `start`
    /// on a server that is already running is a programmer error.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the address cannot be bound, or
    /// [`ServerError::Io`] if the worker thread or its runtime cannot be
    /// created.
    pub fn start(&mut self) -> Result<(), ServerError> {
        assert!(self.worker.is_none(), "fixture server is already started");

        let (addr_tx, addr_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = mpsc::sync_channel(1);

        let bind_addr = self.addr.clone();
        let router = Arc::clone(&self.router);
        let thread = thread::Builder::new()
            .name("canned-mock-server".into())
            .spawn(move || worker_main(bind_addr, router, addr_tx, shutdown_rx, exit_tx))?;

        let local_addr = match addr_rx.recv() {
            Ok(result) => result?,
            // The worker died without reporting — collect it and bail.
            Err(_) => {
                let _ = thread.join();
                return Err(ServerError::WorkerExited);
            }
        };

        self.local_addr = Some(local_addr);
        self.worker = Some(Worker {
            thread,
            shutdown: shutdown_tx,
            exited: exit_rx,
        });
        info!(address = %local_addr, "fixture server started");
        Ok(())
    }

    /// Returns `true` while the worker thread is serving.
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Returns the bound address. `None` before [`start`](Self::start).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns a full URL for `path` on this server.
    ///
    /// # Panics
    ///
    /// Panics if the server has not been started.
    pub fn url(&self, path: &str) -> String {
        let addr = self
            .local_addr
            .unwrap_or_else(|| panic!("fixture server is not started"));
        format!("http://{addr}{path}")
    }

    /// Registers a GET mock for `path`, served from the named fixture.
    ///
    /// The path is anchored (`^{path}$`), so this is an exact match unless
    /// the string itself contains regex syntax. The fixture payload is
    /// loaded immediately and served as `200 OK` with
    /// `Content-Type: application/json`.
    ///
    /// # Panics
    ///
    /// Panics if the fixture cannot be loaded or the anchored path is not a
    /// valid regex — both are programmer errors in the test setup.
    pub fn mock(&self, path: &str, fixture: &str) {
        let payload = self
            .source
            .load(fixture)
            .unwrap_or_else(|e| panic!("failed to load fixture {fixture:?}: {e}"));
        self.mock_route(Route::get(format!("^{path}$")), json_response(payload));
    }

    /// Registers `handler` for `route` — the general form.
    ///
    /// Thread-safe; may be called concurrently with in-flight dispatch.
    ///
    /// # Panics
    ///
    /// Panics if the route's path pattern is not a valid regex.
    pub fn mock_route(&self, route: Route, handler: impl IntoHandler) {
        if let Err(e) = self.router.register(route, handler) {
            panic!("{e}");
        }
    }

    /// Removes all registered mocks.
    ///
    /// Part of the public contract but not implemented yet; always panics.
    /// TODO: empty the route table once tests need per-case mock resets.
    pub fn clear_mocks(&self) {
        unimplemented!("clearing registered mocks");
    }

    /// Stops the listener and blocks until the worker thread has exited.
    ///
    /// Sends the shutdown signal, waits up to ten seconds for the worker's
    /// exit confirmation, then joins the thread. A no-op if the server was
    /// never started or is already stopped.
    ///
    /// # Panics
    ///
    /// Panics if the worker does not confirm termination within the
    /// deadline — a leaked background loop would corrupt subsequent tests,
    /// so this is fatal rather than a silent timeout. Also re-raises any
    /// panic the worker thread died with.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        let _ = worker.shutdown.send(true);
        if worker.exited.recv_timeout(STOP_DEADLINE).is_err() {
            panic!("mock server worker failed to exit within {STOP_DEADLINE:?}");
        }
        if let Err(panic) = worker.thread.join() {
            std::panic::resume_unwind(panic);
        }
        info!("fixture server stopped");
    }
}

impl Default for FixtureServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FixtureServer {
    // Nudge the worker to exit if the owner forgot to stop(). Non-blocking;
    // only stop() gives the deadline-checked join.
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(true);
        }
    }
}

// Body of the worker thread: build a single-threaded runtime, bind, report
// the address back, then serve until the shutdown signal fires. The exit
// channel is signalled last, after the runtime (and with it the listener
// socket) has been torn down.
fn worker_main(
    addr: String,
    router: Arc<Router>,
    addr_tx: mpsc::Sender<Result<SocketAddr, ServerError>>,
    shutdown: watch::Receiver<bool>,
    exit_tx: mpsc::SyncSender<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = addr_tx.send(Err(ServerError::Io(e)));
            return;
        }
    };

    runtime.block_on(async move {
        let server = match Server::bind(&addr).await {
            Ok(server) => server,
            Err(e) => {
                let _ = addr_tx.send(Err(e));
                return;
            }
        };
        let _ = addr_tx.send(Ok(server.local_addr()));

        let dispatch = move |request: Request| {
            let router = Arc::clone(&router);
            async move {
                match router.dispatch(request).await {
                    Ok(response) => response,
                    Err(e) => {
                        // Crash the whole run rather than answer 404: an
                        // unmocked request means the test is incomplete.
                        error!(error = %e, "refusing to answer an unmocked request");
                        eprintln!("fatal: {e}");
                        std::process::abort();
                    }
                }
            }
        };

        if let Err(e) = server.run(dispatch, shutdown).await {
            error!(error = %e, "listener failed");
        }
    });

    let _ = exit_tx.send(());
}

/// Builds a handler serving a fixed `200 OK` JSON payload — the response
/// shape [`FixtureServer::mock`] registers.
pub fn json_response(body: impl Into<String>) -> impl IntoHandler {
    let body = body.into();
    move |_request: MockRequest| {
        let response = Response::new(StatusCode::Ok)
            .header("Content-Type", "application/json")
            .body(body.clone());
        async move { response }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    // In-memory fixture source so tests do not depend on a directory layout.
    struct MapSource(HashMap<&'static str, &'static str>);

    impl FixtureSource for MapSource {
        fn load(&self, name: &str) -> std::io::Result<String> {
            self.0
                .get(name)
                .map(|s| (*s).to_owned())
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, name.to_owned()))
        }
    }

    fn local_server(fixtures: &[(&'static str, &'static str)]) -> FixtureServer {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("canned=debug")
            .with_test_writer()
            .try_init();
        FixtureServer::with_config(
            "127.0.0.1:0",
            MapSource(fixtures.iter().copied().collect()),
        )
    }

    fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        write!(
            stream,
            "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn serves_mocked_fixture_payload() {
        let mut server = local_server(&[("scores", r#"{"home":2,"away":1}"#)]);
        server.start().unwrap();
        server.mock("/api/scores", "scores");

        let response = get(server.local_addr().unwrap(), "/api/scores");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: application/json\r\n"));

        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        let payload: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(payload["home"], 2);
        assert_eq!(payload["away"], 1);

        server.stop();
    }

    #[test]
    fn handler_sees_path_captures() {
        let mut server = local_server(&[]);
        server.start().unwrap();
        server.mock_route(Route::get(r"^/users/(\d+)$"), |req: MockRequest| {
            let id = req.capture(0).unwrap_or_default().to_owned();
            async move { Response::new(StatusCode::Ok).body(id) }
        });

        let response = get(server.local_addr().unwrap(), "/users/42");
        assert!(response.ends_with("42"));

        server.stop();
    }

    #[test]
    fn start_then_stop_leaves_nothing_running() {
        let mut server = local_server(&[]);
        server.start().unwrap();
        assert!(server.is_running());
        let addr = server.local_addr().unwrap();

        server.stop();
        assert!(!server.is_running());
        // The listener socket is gone once stop() returns.
        assert!(TcpStream::connect(addr).is_err());
        // Stopping again is a no-op.
        server.stop();
    }

    #[test]
    fn start_surfaces_bind_failure() {
        let mut first = local_server(&[]);
        first.start().unwrap();
        let taken = first.local_addr().unwrap();

        let mut second =
            FixtureServer::with_config(taken.to_string(), MapSource(HashMap::new()));
        let err = second.start().unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert!(!second.is_running());

        first.stop();
    }

    #[test]
    #[should_panic(expected = "not a valid regex")]
    fn malformed_pattern_panics_at_registration() {
        let server = local_server(&[]);
        server.mock_route(Route::get("^/broken/(unclosed$"), |_req: MockRequest| async {
            Response::new(StatusCode::Ok)
        });
    }

    #[test]
    #[should_panic(expected = "failed to load fixture")]
    fn missing_fixture_panics_at_registration() {
        let server = local_server(&[]);
        server.mock("/api/ghost", "ghost");
    }

    #[test]
    #[should_panic(expected = "not implemented")]
    fn clear_mocks_is_an_explicit_stub() {
        let server = local_server(&[]);
        server.clear_mocks();
    }

    #[test]
    fn unmocked_request_aborts_the_process() {
        // Child half, selected by env var: serve with no mocks and hit an
        // unmocked path. The worker must abort the process before any
        // response arrives, so reaching the exit(0) means the fail-fast
        // policy is broken.
        if std::env::var_os("CANNED_UNMOCKED_ABORT").is_some() {
            let mut server = local_server(&[]);
            server.start().unwrap();
            let _ = get(server.local_addr().unwrap(), "/missing");
            std::process::exit(0);
        }

        let exe = std::env::current_exe().unwrap();
        let output = std::process::Command::new(exe)
            .args([
                "fixtures::tests::unmocked_request_aborts_the_process",
                "--exact",
                "--nocapture",
            ])
            .env("CANNED_UNMOCKED_ABORT", "1")
            .output()
            .unwrap();

        assert!(
            !output.status.success(),
            "child exited cleanly instead of aborting"
        );
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("/missing"), "stderr was: {stderr}");
    }

    #[test]
    fn mocks_can_be_registered_while_serving() {
        let mut server = local_server(&[]);
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        server.mock_route(Route::get("^/first$"), |_req: MockRequest| async {
            Response::new(StatusCode::Ok).body("first")
        });
        assert!(get(addr, "/first").ends_with("first"));

        // Registration after traffic has flowed is picked up immediately.
        server.mock_route(Route::get("^/second$"), |_req: MockRequest| async {
            Response::new(StatusCode::Ok).body("second")
        });
        assert!(get(addr, "/second").ends_with("second"));

        server.stop();
    }
}
