//! Response rendering.
//!
//! Every header value and body of every response is a Handlebars template.
//! They are all parsed once when the rules are loaded; rendering looks them
//! up by position.

use crate::config::RuleDefinition;
use crate::error::ConfigError;
use crate::functions;
use crate::matcher::IncomingRequest;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use handlebars::Handlebars;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::error;

/// Data available to response templates, built once per request.
#[derive(Debug, Clone, Serialize)]
pub struct RenderContext {
    /// 1-based hit count of the matched rule
    pub req_num: usize,
    /// The request that matched
    pub request: RequestData,
}

/// Request fields exposed as `request.*`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestData {
    /// Request method
    pub method: String,
    /// Variables captured by the route and query patterns
    pub vars: BTreeMap<String, String>,
    /// Request URL
    pub url: UrlData,
    /// Request headers, keyed by lower-case name
    pub headers: BTreeMap<String, Vec<String>>,
    /// Request body (lossy UTF-8)
    pub body: String,
}

/// URL fields exposed as `request.url.*`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UrlData {
    pub path: String,
    /// Query string after form fields were merged in
    pub raw_query: String,
    pub query: BTreeMap<String, Vec<String>>,
    /// Path plus query string
    pub href: String,
}

impl RenderContext {
    /// Build the context for a matched request.
    pub fn new(req_num: usize, request: &IncomingRequest, vars: BTreeMap<String, String>) -> Self {
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &request.headers {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        Self {
            req_num,
            request: RequestData {
                method: request.method.to_string(),
                vars,
                url: UrlData {
                    path: request.path.clone(),
                    raw_query: request.raw_query.clone(),
                    query: request.query.clone(),
                    href: request.href(),
                },
                headers,
                body: String::from_utf8_lossy(&request.body).into_owned(),
            },
        }
    }
}

/// Output of rendering one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedResponse {
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Vec<u8>,
}

struct CompiledResponse {
    status: StatusCode,
    /// Header name plus the registered template names for its occurrences
    headers: Vec<(HeaderName, Vec<String>)>,
    body: String,
}

/// Renders the configured responses.
pub struct ResponseRenderer {
    handlebars: Handlebars<'static>,
    /// Indexed by rule, then by response
    responses: Vec<Vec<CompiledResponse>>,
}

impl ResponseRenderer {
    /// Parse every template of every rule. Fails on the first template that
    /// does not parse or header name that is not a valid token.
    pub fn new(rules: &[RuleDefinition]) -> Result<Self, ConfigError> {
        let mut handlebars = Handlebars::new();
        // Not rendering HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        functions::register(&mut handlebars);

        let mut responses = Vec::with_capacity(rules.len());
        for (i, rule) in rules.iter().enumerate() {
            let mut compiled = Vec::with_capacity(rule.responses.len());
            for (j, response) in rule.responses.iter().enumerate() {
                let status = StatusCode::from_u16(response.status_code).map_err(|_| {
                    ConfigError::StatusCode {
                        rule: i,
                        response: j,
                        status: response.status_code,
                    }
                })?;

                let mut headers = Vec::with_capacity(response.headers.len());
                for (name, templates) in &response.headers {
                    let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                        ConfigError::HeaderName {
                            rule: i,
                            response: j,
                            name: name.clone(),
                        }
                    })?;
                    let mut names = Vec::with_capacity(templates.len());
                    for (k, template) in templates.iter().enumerate() {
                        let key = format!("rules[{}].responses[{}].headers.{}[{}]", i, j, name, k);
                        register(&mut handlebars, &key, template)?;
                        names.push(key);
                    }
                    headers.push((header, names));
                }

                let body = format!("rules[{}].responses[{}].body", i, j);
                register(&mut handlebars, &body, &response.body)?;

                compiled.push(CompiledResponse {
                    status,
                    headers,
                    body,
                });
            }
            responses.push(compiled);
        }

        Ok(Self {
            handlebars,
            responses,
        })
    }

    /// Render response `response` of rule `rule`.
    ///
    /// A header whose template fails is logged and left out. A body whose
    /// template fails is logged and whatever was produced before the failure
    /// is kept.
    pub fn render(&self, rule: usize, response: usize, ctx: &RenderContext) -> Option<RenderedResponse> {
        let compiled = self.responses.get(rule)?.get(response)?;

        let mut headers = Vec::new();
        for (name, templates) in &compiled.headers {
            for template in templates {
                let rendered = match self.handlebars.render(template, ctx) {
                    Ok(rendered) => rendered,
                    Err(e) => {
                        error!(template = %template, error = %e, "executing header template");
                        continue;
                    }
                };
                match HeaderValue::from_str(&rendered) {
                    Ok(value) => headers.push((name.clone(), value)),
                    Err(e) => {
                        error!(template = %template, error = %e, "rendered header value is invalid");
                    }
                }
            }
        }

        let mut body = Vec::new();
        if let Err(e) = self.handlebars.render_to_write(&compiled.body, ctx, &mut body) {
            error!(template = %compiled.body, error = %e, "executing body template");
        }

        Some(RenderedResponse {
            status: compiled.status,
            headers,
            body,
        })
    }
}

fn register(handlebars: &mut Handlebars<'static>, name: &str, template: &str) -> Result<(), ConfigError> {
    handlebars
        .register_template_string(name, template)
        .map_err(|e| ConfigError::Template {
            location: name.to_string(),
            source: Box::new(e),
        })
}
