//! Fault injection.
//!
//! Two optional middlewares sit in front of the dispatcher: the error fault
//! (outer) short-circuits a fraction of requests with a fixed status, the
//! delay fault (inner) holds a fraction of the remaining requests for a fixed
//! duration. Each samples independently per request.

use crate::config::ServerOptions;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Sleep before forwarding a fraction of requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayFault {
    pub participation: f32,
    pub duration: Duration,
}

/// Answer a fraction of requests with a fixed status instead of forwarding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorFault {
    pub participation: f32,
    pub status: StatusCode,
}

/// The configured faults; a fault with zero participation is left out.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultInjector {
    pub delay: Option<DelayFault>,
    pub error: Option<ErrorFault>,
}

impl FaultInjector {
    /// Build from validated server options.
    pub fn from_options(options: &ServerOptions) -> Self {
        let delay = (options.delay_participation > 0.0).then_some(DelayFault {
            participation: options.delay_participation,
            duration: options.delay_duration,
        });
        let error = (options.fault_participation > 0.0)
            .then(|| StatusCode::from_u16(options.fault_error_code).ok())
            .flatten()
            .map(|status| ErrorFault {
                participation: options.fault_participation,
                status,
            });
        Self { delay, error }
    }

    pub fn is_enabled(&self) -> bool {
        self.delay.is_some() || self.error.is_some()
    }
}

/// Whether this request takes part, given a participation rate in `[0, 1]`.
pub fn participates(participation: f32) -> bool {
    participation > 0.0 && rand::thread_rng().gen::<f32>() < participation
}

/// Middleware for [`DelayFault`].
pub async fn delay_fault(State(fault): State<DelayFault>, request: Request, next: Next) -> Response {
    if participates(fault.participation) {
        debug!(delay_ms = fault.duration.as_millis() as u64, "Injecting delay");
        tokio::time::sleep(fault.duration).await;
    }
    next.run(request).await
}

/// Middleware for [`ErrorFault`].
pub async fn error_fault(State(fault): State<ErrorFault>, request: Request, next: Next) -> Response {
    if participates(fault.participation) {
        debug!(status = fault.status.as_u16(), "Injecting error");
        return (fault.status, fault.status.canonical_reason().unwrap_or_default()).into_response();
    }
    next.run(request).await
}
