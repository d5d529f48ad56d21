//! Listener lifecycle and request plumbing.
//!
//! `MockServer` owns the listener, the compiled rules and the supervisor
//! task that escalates [`Violation`]s. Requests flow through
//! `access_log -> error_fault -> delay_fault -> handle_request`, the two
//! fault layers being present only when enabled.

use crate::config::{FatalPolicy, MockServerConfig, ServerOptions};
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, MockServerError, Result, Violation};
use crate::fault::{self, FaultInjector};
use crate::matcher::IncomingRequest;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Largest request body accepted.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// How long in-flight requests may run once `close` is called.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Listening,
    ShuttingDown,
    Closed,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Created => "created",
            Lifecycle::Listening => "listening",
            Lifecycle::ShuttingDown => "shutting down",
            Lifecycle::Closed => "closed",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared by every request handler.
struct AppState {
    dispatcher: Dispatcher,
    read_timeout: Duration,
    write_timeout: Duration,
    violations: mpsc::UnboundedSender<Violation>,
}

/// A mock HTTP server.
///
/// Everything that can be wrong with the configuration is reported by
/// [`MockServer::new`]; [`MockServer::start`] only fails on I/O.
pub struct MockServer {
    options: ServerOptions,
    state: Arc<AppState>,
    faults: FaultInjector,
    lifecycle: Lifecycle,
    handle: Handle,
    local_addr: Option<SocketAddr>,
    serve_task: Option<JoinHandle<std::io::Result<()>>>,
    supervisor: Option<JoinHandle<()>>,
    violations: Option<mpsc::UnboundedReceiver<Violation>>,
    violation: Arc<OnceLock<Violation>>,
}

impl MockServer {
    /// Load the rules file named by `options.config_path` and compile it.
    pub fn new(options: ServerOptions) -> Result<Self> {
        options.validate()?;
        let path = options
            .config_path
            .as_deref()
            .ok_or(ConfigError::MissingConfigPath)?;
        info!(path = %path.display(), "Loading configuration");
        let config = MockServerConfig::from_file(path)?;
        Self::with_config(options, config)
    }

    /// Compile an already loaded rules document.
    pub fn with_config(options: ServerOptions, config: MockServerConfig) -> Result<Self> {
        options.validate()?;
        let dispatcher = Dispatcher::new(&config, options.exit_on_unmatched_rule)?;
        let faults = FaultInjector::from_options(&options);
        if faults.is_enabled() {
            warn!("Fault injection is enabled, some requests will be delayed or failed");
        }
        let (tx, rx) = mpsc::unbounded_channel();

        let state = Arc::new(AppState {
            dispatcher,
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
            violations: tx,
        });

        Ok(Self {
            options,
            state,
            faults,
            lifecycle: Lifecycle::Created,
            handle: Handle::new(),
            local_addr: None,
            serve_task: None,
            supervisor: None,
            violations: Some(rx),
            violation: Arc::new(OnceLock::new()),
        })
    }

    /// Bind the listener and serve in the background.
    ///
    /// Returns the bound address once the socket is listening.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.lifecycle != Lifecycle::Created {
            return Err(MockServerError::InvalidState {
                action: "start",
                state: self.lifecycle.as_str(),
            });
        }

        let tls = match self.options.tls_files() {
            Some((cert, key)) => Some(
                RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(MockServerError::Tls)?,
            ),
            None => None,
        };

        let listener = bind(&self.options.addr).await?;
        let addr = listener.local_addr()?;
        let listener = listener.into_std()?;
        let app = self.router().into_make_service();

        let serve_task = match tls {
            Some(config) => {
                info!(%addr, "Listening on https");
                tokio::spawn(
                    axum_server::from_tcp_rustls(listener, config)
                        .handle(self.handle.clone())
                        .serve(app),
                )
            }
            None => {
                info!(%addr, "Listening on http");
                tokio::spawn(
                    axum_server::from_tcp(listener)
                        .handle(self.handle.clone())
                        .serve(app),
                )
            }
        };

        if let Some(rx) = self.violations.take() {
            self.supervisor = Some(tokio::spawn(supervise(
                rx,
                self.options.fatal_policy,
                self.handle.clone(),
                self.violation.clone(),
            )));
        }

        self.serve_task = Some(serve_task);
        self.local_addr = Some(addr);
        self.lifecycle = Lifecycle::Listening;
        Ok(addr)
    }

    /// Stop accepting connections, give in-flight requests a short grace
    /// period, then force-close.
    pub async fn close(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Listening => {}
            Lifecycle::Created => {
                self.lifecycle = Lifecycle::Closed;
                return Ok(());
            }
            other => {
                return Err(MockServerError::InvalidState {
                    action: "close",
                    state: other.as_str(),
                })
            }
        }

        info!("shutting down http-server...");
        self.lifecycle = Lifecycle::ShuttingDown;
        self.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));

        if let Some(task) = self.serve_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "http-server stopped with error"),
                Err(e) => warn!(error = %e, "http-server task failed"),
            }
        }
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }

        self.lifecycle = Lifecycle::Closed;
        let dispatcher = &self.state.dispatcher;
        info!(
            requests_total = dispatcher.total_requests(),
            requests_matched = dispatcher.total_matched(),
            requests_unmatched = dispatcher.total_unmatched(),
            "http-server closed"
        );
        Ok(())
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn state(&self) -> Lifecycle {
        self.lifecycle
    }

    /// The violation that forced the server closed, under
    /// [`FatalPolicy::Shutdown`].
    pub fn violation(&self) -> Option<Violation> {
        self.violation.get().cloned()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.state.dispatcher
    }

    fn router(&self) -> Router {
        let mut router = Router::new().fallback(handle_request);

        if let Some(delay) = self.faults.delay {
            info!(
                participation = delay.participation,
                delay_ms = delay.duration.as_millis() as u64,
                "Delay fault enabled"
            );
            router = router.layer(middleware::from_fn_with_state(delay, fault::delay_fault));
        }
        if let Some(error) = self.faults.error {
            info!(
                participation = error.participation,
                status = error.status.as_u16(),
                "Error fault enabled"
            );
            router = router.layer(middleware::from_fn_with_state(error, fault::error_fault));
        }

        router
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
            .layer(middleware::from_fn(access_log))
            .with_state(self.state.clone())
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if self.lifecycle == Lifecycle::Listening {
            self.handle.shutdown();
        }
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }
}

/// Resolve `addr` and bind the first candidate, IPv4 addresses before IPv6.
async fn bind(addr: &str) -> Result<TcpListener> {
    let bind_error = |source| MockServerError::Bind {
        addr: addr.to_string(),
        source,
    };

    let mut candidates: Vec<SocketAddr> = tokio::net::lookup_host(addr)
        .await
        .map_err(bind_error)?
        .collect();
    candidates.sort_by_key(|candidate| candidate.is_ipv6());

    let mut last_error = None;
    for candidate in candidates {
        match TcpListener::bind(candidate).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!(addr = %candidate, error = %e, "bind failed, trying next address");
                last_error = Some(e);
            }
        }
    }

    Err(bind_error(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address resolved")
    })))
}

/// Escalate violations according to the fatal policy.
async fn supervise(
    mut violations: mpsc::UnboundedReceiver<Violation>,
    policy: FatalPolicy,
    handle: Handle,
    record: Arc<OnceLock<Violation>>,
) {
    while let Some(violation) = violations.recv().await {
        error!(error = %violation, "Fatal test violation");
        match policy {
            FatalPolicy::Exit => std::process::exit(1),
            FatalPolicy::Shutdown => {
                let _ = record.set(violation);
                handle.shutdown();
            }
        }
    }
}

async fn handle_request(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();

    let body = match bounded(state.read_timeout, Bytes::from_request(request, &())).await {
        Some(Ok(body)) => body,
        Some(Err(rejection)) => return rejection.into_response(),
        None => {
            warn!(%method, %uri, "timed out reading request body");
            return StatusCode::REQUEST_TIMEOUT.into_response();
        }
    };

    let incoming = IncomingRequest::new(method, &uri, headers, body);
    let outcome = match bounded(state.write_timeout, state.dispatcher.dispatch(incoming)).await {
        Some(outcome) => outcome,
        None => {
            warn!(%uri, "timed out producing response");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    match outcome {
        Ok(response) => response,
        Err(violation) => {
            // The offending request is never answered.
            let _ = state.violations.send(violation);
            std::future::pending::<Response>().await
        }
    }
}

/// Run `fut` under `limit`; a zero limit means no bound.
async fn bounded<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    if limit.is_zero() {
        Some(fut.await)
    } else {
        tokio::time::timeout(limit, fut).await.ok()
    }
}

async fn access_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}
