//! Mock HTTP Server
//!
//! A rule-driven mock HTTP server for scripted integration tests. Requests
//! are matched against an ordered list of rules and answered with templated
//! responses.
//!
//! # Features
//!
//! - **Request Matching**: Match by method, path pattern, query parameters,
//!   headers, basic auth credentials and body
//! - **Response Rotation**: A rule cycles through its responses on each hit
//! - **Strict Sequencing**: Optionally require rules to be hit in declared order
//! - **Dynamic Templates**: Handlebars templates with request data and helpers
//! - **Fault Injection**: Delay or fail a fraction of requests
//!
//! # Example Configuration
//!
//! ```yaml
//! as_sequence: false
//! rules:
//!   - path: "/page/{pagenum:[0-9]}"
//!     methods: [GET]
//!     responses:
//!       - status_code: 200
//!         headers:
//!           content-type: ["text/plain"]
//!         body: "page {{request.vars.pagenum}}, hit {{req_num}}"
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fault;
pub mod functions;
pub mod matcher;
pub mod sequencer;
pub mod server;
pub mod template;

pub use config::{FatalPolicy, MockServerConfig, ServerOptions};
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, MockServerError, Violation};
pub use server::{Lifecycle, MockServer};
