//! Request dispatch: match, sequence, render.

use crate::config::MockServerConfig;
use crate::error::{ConfigError, Violation};
use crate::matcher::{IncomingRequest, Matcher};
use crate::sequencer::Sequencer;
use crate::template::{RenderContext, ResponseRenderer};
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Turns normalized requests into responses according to the rules.
///
/// Built once from the configuration and shared read-only by every request;
/// the only mutable state is inside the [`Sequencer`].
pub struct Dispatcher {
    matcher: Matcher,
    sequencer: Sequencer,
    renderer: Arc<ResponseRenderer>,
    exit_on_unmatched_rule: bool,
    /// Total requests processed.
    requests_total: AtomicU64,
    /// Total requests matched to rules.
    requests_matched: AtomicU64,
    /// Total requests unmatched.
    requests_unmatched: AtomicU64,
}

impl Dispatcher {
    /// Compile all rules. Nothing is built unless every rule is valid.
    pub fn new(config: &MockServerConfig, exit_on_unmatched_rule: bool) -> Result<Self, ConfigError> {
        config.validate()?;
        for (i, rule) in config.rules.iter().enumerate() {
            debug!(rule = i, path = %rule.path, "Setting up rule");
        }

        let matcher = Matcher::new(&config.rules)?;
        let renderer = ResponseRenderer::new(&config.rules)?;
        let sequencer = Sequencer::new(
            config.as_sequence,
            config.rules.iter().map(|r| r.responses.len()).collect(),
        );

        info!(
            rules = config.rules.len(),
            as_sequence = config.as_sequence,
            sequence_len = config.sequence_len(),
            "Mock server rules loaded"
        );

        Ok(Self {
            matcher,
            sequencer,
            renderer: Arc::new(renderer),
            exit_on_unmatched_rule,
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        })
    }

    /// Create from a YAML rules string.
    pub fn from_yaml(yaml: &str, exit_on_unmatched_rule: bool) -> Result<Self, ConfigError> {
        let config = MockServerConfig::from_yaml(yaml)?;
        Self::new(&config, exit_on_unmatched_rule)
    }

    /// Produce the response for a request.
    ///
    /// `Err` means a broken test assumption (out-of-sequence request, or an
    /// unmatched one while unmatched requests are fatal); the caller must not
    /// answer the request.
    pub async fn dispatch(&self, request: IncomingRequest) -> Result<Response, Violation> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let Some(found) = self.matcher.find_match(&request) else {
            self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
            debug!("request did not match with any rule: {}", request.summary());
            if self.exit_on_unmatched_rule {
                return Err(Violation::UnmatchedRule {
                    method: request.method.to_string(),
                    uri: request.href(),
                });
            }
            return Ok(StatusCode::NOT_FOUND.into_response());
        };

        let hit = self.sequencer.advance(found.rule).await?;
        self.requests_matched.fetch_add(1, Ordering::Relaxed);
        debug!(
            rule = found.rule,
            req_num = hit.req_num,
            "Rule #{} matched: request #{} => {}",
            found.rule,
            hit.req_num,
            request.summary()
        );

        // A rule without responses still counts, but writes nothing
        let Some(response) = hit.response else {
            return Ok(StatusCode::OK.into_response());
        };

        let ctx = RenderContext::new(hit.req_num, &request, found.vars);
        let renderer = self.renderer.clone();
        let rule = found.rule;
        // file/glob helpers do blocking I/O
        let rendered =
            tokio::task::spawn_blocking(move || renderer.render(rule, response, &ctx)).await;

        match rendered {
            Ok(Some(rendered)) => {
                let mut builder = Response::builder().status(rendered.status);
                for (name, value) in rendered.headers {
                    builder = builder.header(name, value);
                }
                Ok(builder
                    .body(Body::from(rendered.body))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
            }
            Ok(None) => Ok(StatusCode::OK.into_response()),
            Err(e) => {
                error!(rule, error = %e, "rendering task failed");
                Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
        }
    }

    /// Get total requests processed.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Get total requests matched.
    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    /// Get total requests unmatched.
    pub fn total_unmatched(&self) -> u64 {
        self.requests_unmatched.load(Ordering::Relaxed)
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, HeaderValue, Method};

    fn test_config() -> &'static str {
        r#"
rules:
  - path: /ping
    methods: [GET]
    responses:
      - status_code: 200
        body: pong

  - path: /rotate
    responses:
      - status_code: 200
        headers:
          x-req: ["{{req_num}}"]
        body: "first {{req_num}}"
      - status_code: 202
        body: "second {{req_num}}"

  - path: /silent
"#
    }

    fn request(method: Method, uri: &str) -> IncomingRequest {
        IncomingRequest::new(method, &uri.parse().unwrap(), HeaderMap::new(), Bytes::new())
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_simple_match() {
        let dispatcher = Dispatcher::from_yaml(test_config(), false).unwrap();
        let response = dispatcher.dispatch(request(Method::GET, "/ping")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "pong");

        let response = dispatcher.dispatch(request(Method::POST, "/ping")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rotation() {
        let dispatcher = Dispatcher::from_yaml(test_config(), false).unwrap();

        let expected = [
            (StatusCode::OK, "first 1"),
            (StatusCode::ACCEPTED, "second 2"),
            (StatusCode::OK, "first 3"),
            (StatusCode::ACCEPTED, "second 4"),
            (StatusCode::OK, "first 5"),
        ];
        for (status, body) in expected {
            let response = dispatcher.dispatch(request(Method::GET, "/rotate")).await.unwrap();
            assert_eq!(response.status(), status);
            if status == StatusCode::OK {
                assert_eq!(
                    response.headers().get("x-req"),
                    Some(&HeaderValue::from_str(&body[6..]).unwrap())
                );
            }
            assert_eq!(body_string(response).await, body);
        }
    }

    #[tokio::test]
    async fn test_rule_without_responses() {
        let dispatcher = Dispatcher::from_yaml(test_config(), false).unwrap();
        let response = dispatcher.dispatch(request(Method::GET, "/silent")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "");
        assert_eq!(dispatcher.sequencer().hits(2).await, 1);
    }

    #[tokio::test]
    async fn test_unmatched_is_fatal_when_configured() {
        let dispatcher = Dispatcher::from_yaml(test_config(), true).unwrap();
        let err = dispatcher
            .dispatch(request(Method::GET, "/nope?x=1"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Violation::UnmatchedRule {
                method: "GET".to_string(),
                uri: "/nope?x=1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_sequence_violation_is_returned() {
        let yaml = r#"
as_sequence: true
rules:
  - path: /a
    responses: [{body: a1}, {body: a2}]
  - path: /b
    responses: [{body: b1}, {body: b2}]
"#;
        let dispatcher = Dispatcher::from_yaml(yaml, false).unwrap();
        dispatcher.dispatch(request(Method::GET, "/a")).await.unwrap();
        let err = dispatcher.dispatch(request(Method::GET, "/b")).await.unwrap_err();
        assert!(matches!(err, Violation::OutOfSequence { rule: 1, .. }));
    }

    #[tokio::test]
    async fn test_sum_of_req_num() {
        let yaml = r#"
rules:
  - path: /next
    responses:
      - body: "{{sum req_num 1}}"
"#;
        let dispatcher = Dispatcher::from_yaml(yaml, false).unwrap();
        let response = dispatcher.dispatch(request(Method::GET, "/next")).await.unwrap();
        assert_eq!(body_string(response).await, "2");
    }

    #[tokio::test]
    async fn test_request_counters() {
        let dispatcher = Dispatcher::from_yaml(test_config(), false).unwrap();
        assert_eq!(dispatcher.total_requests(), 0);

        dispatcher.dispatch(request(Method::GET, "/ping")).await.unwrap();
        dispatcher.dispatch(request(Method::GET, "/missing")).await.unwrap();

        assert_eq!(dispatcher.total_requests(), 2);
        assert_eq!(dispatcher.total_matched(), 1);
        assert_eq!(dispatcher.total_unmatched(), 1);
    }

    #[test]
    fn test_sample_config_compiles() {
        let yaml = include_str!("../demos/default-config.yaml");
        assert!(Dispatcher::from_yaml(yaml, false).is_ok());
    }

    #[test]
    fn test_invalid_rules_build_nothing() {
        let yaml = r#"
rules:
  - path: /fine
    responses: [{body: ok}]
  - path: /broken
    responses: [{body: "{{#each}}"}]
"#;
        assert!(Dispatcher::from_yaml(yaml, false).is_err());
    }
}
