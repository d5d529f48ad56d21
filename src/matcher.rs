//! Request matching logic.
//!
//! Matches normalized requests against the configured rules, in declaration
//! order, and captures route variables for templates.

use crate::config::RuleDefinition;
use crate::error::ConfigError;
use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderName, Method, Uri};
use base64::Engine;
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::collections::BTreeMap;
use url::form_urlencoded;

/// A request normalized for matching: form fields merged into the query,
/// body read once and shared.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,
    /// Percent-decoded path, what route patterns see
    pub path: String,
    /// Path as sent on the wire
    pub raw_path: String,
    /// Query parameters, form fields first, then URL parameters
    pub query: BTreeMap<String, Vec<String>>,
    /// `query` re-encoded, keys sorted
    pub raw_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IncomingRequest {
    pub fn new(method: Method, uri: &Uri, headers: HeaderMap, body: Bytes) -> Self {
        let mut query: BTreeMap<String, Vec<String>> = BTreeMap::new();

        if is_form(&method, &headers) {
            for (key, value) in form_urlencoded::parse(&body) {
                query.entry(key.into_owned()).or_default().push(value.into_owned());
            }
        }
        if let Some(raw) = uri.query() {
            for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
                query.entry(key.into_owned()).or_default().push(value.into_owned());
            }
        }

        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, values) in &query {
            for value in values {
                serializer.append_pair(key, value);
            }
        }

        Self {
            method,
            path: percent_decode_str(uri.path()).decode_utf8_lossy().into_owned(),
            raw_path: uri.path().to_string(),
            query,
            raw_query: serializer.finish(),
            headers,
            body,
        }
    }

    /// Path plus the merged query string.
    pub fn href(&self) -> String {
        if self.raw_query.is_empty() {
            self.raw_path.clone()
        } else {
            format!("{}?{}", self.raw_path, self.raw_query)
        }
    }

    /// Credentials from an `Authorization: Basic` header.
    pub fn basic_auth(&self) -> Option<(String, String)> {
        let value = self.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let (scheme, encoded) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some((user.to_string(), password.to_string()))
    }

    /// One-line description for debug logs.
    pub fn summary(&self) -> String {
        let headers: Vec<String> = self
            .headers
            .iter()
            .map(|(k, v)| format!("'{}: {}'", k, String::from_utf8_lossy(v.as_bytes())))
            .collect();
        format!(
            "Request path: {} {}, Request Headers: {}, Request Body: {}",
            self.method,
            self.href(),
            headers.join(" "),
            String::from_utf8_lossy(&self.body)
        )
    }
}

fn is_form(method: &Method, headers: &HeaderMap) -> bool {
    if !matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
        return false;
    }
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// Result of matching a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    /// Index of the matched rule
    pub rule: usize,
    /// Variables captured by the route and query patterns
    pub vars: BTreeMap<String, String>,
}

/// Request matcher engine.
pub struct Matcher {
    rules: Vec<CompiledRule>,
}

struct CompiledRule {
    /// Upper-cased; empty matches any method
    methods: Vec<String>,
    route: Pattern,
    queries: Vec<QueryMatcher>,
    excluded_queries: Vec<String>,
    headers: Vec<(HeaderName, Vec<Regex>)>,
    credentials: Option<Credentials>,
    body: BodyMatcher,
}

/// Basic auth requirement. Only the configured parts are compared.
struct Credentials {
    user: Option<String>,
    password: Option<String>,
}

impl Credentials {
    fn matches(&self, request: &IncomingRequest) -> bool {
        let (user, password) = request.basic_auth().unwrap_or_default();
        self.user.as_ref().map_or(true, |u| *u == user)
            && self.password.as_ref().map_or(true, |p| *p == password)
    }
}

struct QueryMatcher {
    key: String,
    values: Vec<Pattern>,
}

enum BodyMatcher {
    Any,
    Exact(String),
    Regex(regex::bytes::Regex),
}

impl BodyMatcher {
    fn parse(rule: usize, body: &str) -> Result<Self, ConfigError> {
        if body.is_empty() {
            return Ok(BodyMatcher::Any);
        }
        if body.len() >= 2 && body.starts_with('/') && body.ends_with('/') {
            let pattern = &body[1..body.len() - 1];
            let regex = regex::bytes::Regex::new(pattern).map_err(|source| ConfigError::Regex {
                rule,
                pattern: pattern.to_string(),
                source,
            })?;
            return Ok(BodyMatcher::Regex(regex));
        }
        Ok(BodyMatcher::Exact(body.to_string()))
    }

    fn matches(&self, body: &[u8]) -> bool {
        match self {
            BodyMatcher::Any => true,
            BodyMatcher::Exact(value) => body == value.as_bytes(),
            BodyMatcher::Regex(regex) => regex.is_match(body),
        }
    }
}

/// A route template such as `/users/{id}` or `/page/{n:[0-9]+}`, compiled to
/// an anchored regex. Variables without an explicit pattern use the default
/// given at parse time.
struct Pattern {
    regex: Regex,
    vars: Vec<String>,
}

impl Pattern {
    fn parse(rule: usize, template: &str, default_var: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::Pattern {
            rule,
            pattern: template.to_string(),
            reason: reason.to_string(),
        };

        let mut source = String::from("^");
        let mut vars = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();

        while let Some(ch) = chars.next() {
            match ch {
                '{' => {
                    source.push_str(&regex::escape(&literal));
                    literal.clear();

                    let mut depth = 1;
                    let mut var = String::new();
                    for inner in chars.by_ref() {
                        match inner {
                            '{' => depth += 1,
                            '}' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                        var.push(inner);
                    }
                    if depth != 0 {
                        return Err(invalid("unbalanced braces"));
                    }

                    let (name, pattern) = match var.split_once(':') {
                        Some((name, pattern)) => (name.trim(), pattern),
                        None => (var.trim(), default_var),
                    };
                    if name.is_empty() {
                        return Err(invalid("missing variable name"));
                    }
                    source.push_str(&format!("(?P<v{}>{})", vars.len(), pattern));
                    vars.push(name.to_string());
                }
                '}' => return Err(invalid("unbalanced braces")),
                _ => literal.push(ch),
            }
        }
        source.push_str(&regex::escape(&literal));
        source.push('$');

        let regex = Regex::new(&source).map_err(|source_err| ConfigError::Regex {
            rule,
            pattern: template.to_string(),
            source: source_err,
        })?;
        Ok(Self { regex, vars })
    }

    fn captures(&self, value: &str) -> Option<Vec<(String, String)>> {
        let captures = self.regex.captures(value)?;
        Some(
            self.vars
                .iter()
                .enumerate()
                .filter_map(|(i, name)| {
                    captures
                        .name(&format!("v{}", i))
                        .map(|m| (name.clone(), m.as_str().to_string()))
                })
                .collect(),
        )
    }
}

impl Matcher {
    /// Compile the predicates of every rule.
    pub fn new(rules: &[RuleDefinition]) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .enumerate()
            .map(|(i, rule)| compile_rule(i, rule))
            .collect::<Result<_, _>>()?;
        Ok(Self { rules })
    }

    /// Find the first matching rule for a request.
    pub fn find_match(&self, request: &IncomingRequest) -> Option<RouteMatch> {
        self.rules
            .iter()
            .enumerate()
            .find_map(|(i, rule)| rule.matches(request).map(|vars| RouteMatch { rule: i, vars }))
    }
}

fn compile_rule(index: usize, rule: &RuleDefinition) -> Result<CompiledRule, ConfigError> {
    let route = Pattern::parse(index, &rule.path, "[^/]+")?;

    let mut queries = Vec::new();
    let mut excluded_queries = Vec::new();
    for (key, values) in &rule.query_params {
        if values.is_empty() {
            excluded_queries.push(key.clone());
            continue;
        }
        let values = values
            .iter()
            .map(|v| Pattern::parse(index, v, ".*"))
            .collect::<Result<_, _>>()?;
        queries.push(QueryMatcher {
            key: key.clone(),
            values,
        });
    }

    let mut headers = Vec::new();
    for (name, patterns) in &rule.request_headers {
        if patterns.is_empty() {
            continue;
        }
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| ConfigError::Pattern {
            rule: index,
            pattern: name.clone(),
            reason: "invalid header name".to_string(),
        })?;
        let regexes = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| ConfigError::Regex {
                    rule: index,
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<_, _>>()?;
        headers.push((header, regexes));
    }

    let credentials = rule.requires_auth().then(|| Credentials {
        user: rule.user.clone().filter(|u| !u.is_empty()),
        password: rule.password.clone().filter(|p| !p.is_empty()),
    });

    Ok(CompiledRule {
        methods: rule.methods.iter().map(|m| m.to_uppercase()).collect(),
        route,
        queries,
        excluded_queries,
        headers,
        credentials,
        body: BodyMatcher::parse(index, &rule.request_body)?,
    })
}

impl CompiledRule {
    fn matches(&self, request: &IncomingRequest) -> Option<BTreeMap<String, String>> {
        // Check method
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m == request.method.as_str()) {
            return None;
        }

        // Check path
        let mut vars: BTreeMap<String, String> =
            self.route.captures(&request.path)?.into_iter().collect();

        // Check query parameters
        for excluded in &self.excluded_queries {
            if request.query.contains_key(excluded) {
                return None;
            }
        }
        for query in &self.queries {
            let values = request.query.get(&query.key)?;
            let captured = values
                .iter()
                .find_map(|value| query.values.iter().find_map(|p| p.captures(value)))?;
            vars.extend(captured);
        }

        // Check headers
        for (name, regexes) in &self.headers {
            let matched = request
                .headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| regexes.iter().any(|r| r.is_match(v)));
            if !matched {
                return None;
            }
        }

        // Check credentials
        if let Some(credentials) = &self.credentials {
            if !credentials.matches(request) {
                return None;
            }
        }

        // Check body
        if !self.body.matches(&request.body) {
            return None;
        }

        Some(vars)
    }
}
