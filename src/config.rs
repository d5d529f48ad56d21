//! Configuration for the mock HTTP server.
//!
//! Defines the rules document (request matchers plus response rotations)
//! and the options that control how the server listens and misbehaves.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Rules document loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockServerConfig {
    /// Require rules to be hit strictly in declaration + rotation order
    #[serde(default)]
    pub as_sequence: bool,

    /// Rules, matched in declaration order
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

impl MockServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Route patterns, regexes and templates are checked when the rules are
    /// compiled; this covers what can be judged from the document alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate(i)?;
        }
        Ok(())
    }

    /// Total number of responses across all rules, i.e. the length of one
    /// full pass through the sequence.
    pub fn sequence_len(&self) -> usize {
        self.rules.iter().map(|r| r.responses.len()).sum()
    }
}

/// A single rule: request predicates plus a rotation of responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    /// Route pattern, e.g. `/users/{id}` or `/page/{n:[0-9]+}`
    pub path: String,

    /// HTTP methods to match (empty = any)
    #[serde(default)]
    pub methods: Vec<String>,

    /// Required basic auth user
    #[serde(default)]
    pub user: Option<String>,

    /// Required basic auth password
    #[serde(default)]
    pub password: Option<String>,

    /// Allowed values per query parameter; an empty list means absent
    #[serde(default, with = "ordered_lists")]
    pub query_params: Vec<(String, Vec<String>)>,

    /// Regexes per header, OR'd within a header and AND'd across headers
    #[serde(default, with = "ordered_lists")]
    pub request_headers: Vec<(String, Vec<String>)>,

    /// Literal body, or a `/regex/`
    #[serde(default)]
    pub request_body: String,

    /// Responses, selected round-robin
    #[serde(default)]
    pub responses: Vec<ResponseDefinition>,
}

impl RuleDefinition {
    /// Validate the rule definition.
    pub fn validate(&self, index: usize) -> Result<(), ConfigError> {
        if self.path.is_empty() {
            return Err(ConfigError::MissingPath { rule: index });
        }
        for (j, response) in self.responses.iter().enumerate() {
            if !(100..=599).contains(&response.status_code) {
                return Err(ConfigError::StatusCode {
                    rule: index,
                    response: j,
                    status: response.status_code,
                });
            }
        }
        Ok(())
    }

    /// Whether the rule requires basic auth credentials. An empty user or
    /// password is the same as none.
    pub fn requires_auth(&self) -> bool {
        let set = |v: &Option<String>| v.as_deref().is_some_and(|v| !v.is_empty());
        set(&self.user) || set(&self.password)
    }
}

/// Response definition. Header values and body are templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status_code: u16,

    /// Header templates; every entry produces one header occurrence
    #[serde(default, with = "ordered_lists")]
    pub headers: Vec<(String, Vec<String>)>,

    /// Body template
    #[serde(default)]
    pub body: String,
}

fn default_status() -> u16 {
    200
}

/// What to do when a test assumption breaks (out-of-sequence request, or an
/// unmatched request while `exit_on_unmatched_rule` is set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Log and terminate the process with a non-zero status.
    #[default]
    Exit,
    /// Log, record the violation on the server and force it closed.
    Shutdown,
}

/// Options controlling the listener and fault injection.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Listen address, e.g. `localhost:8080`
    pub addr: String,
    /// TLS certificate file path (PEM)
    pub tls_certificate: Option<PathBuf>,
    /// TLS key file path (PEM)
    pub tls_key: Option<PathBuf>,
    /// Bound on reading a request body (zero = none)
    pub read_timeout: Duration,
    /// Bound on producing a response (zero = none)
    pub write_timeout: Duration,
    /// Rules file path
    pub config_path: Option<PathBuf>,
    /// Fraction of requests that will be delayed
    pub delay_participation: f32,
    /// How long delayed requests sleep
    pub delay_duration: Duration,
    /// Fraction of requests that will fail
    pub fault_participation: f32,
    /// Status returned by failed requests
    pub fault_error_code: u16,
    /// Treat a request matching no rule as fatal
    pub exit_on_unmatched_rule: bool,
    /// How fatal violations are escalated
    pub fatal_policy: FatalPolicy,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            addr: "localhost:8080".to_string(),
            tls_certificate: None,
            tls_key: None,
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            config_path: None,
            delay_participation: 0.0,
            delay_duration: Duration::ZERO,
            fault_participation: 0.0,
            fault_error_code: 500,
            exit_on_unmatched_rule: false,
            fatal_policy: FatalPolicy::Exit,
        }
    }
}

impl ServerOptions {
    /// Validate the options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addr.is_empty() {
            return Err(ConfigError::MissingAddress);
        }
        if self.tls_certificate.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::TlsPairing);
        }
        check_participation("delay participation", self.delay_participation)?;
        check_participation("fault participation", self.fault_participation)?;
        if self.fault_participation > 0.0 && !(100..=599).contains(&self.fault_error_code) {
            return Err(ConfigError::FaultErrorCode(self.fault_error_code));
        }
        Ok(())
    }

    /// TLS certificate and key, when both are configured.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_certificate, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

fn check_participation(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Participation { name, value })
    }
}

/// (De)serializes a YAML mapping of `name -> [values]` keeping declaration
/// order. A `null` value is read as an empty list.
mod ordered_lists {
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    type Lists = Vec<(String, Vec<String>)>;

    pub fn serialize<S: Serializer>(lists: &Lists, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(lists.len()))?;
        for (key, values) in lists {
            map.serialize_entry(key, values)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Lists, D::Error> {
        struct ListsVisitor;

        impl<'de> Visitor<'de> for ListsVisitor {
            type Value = Lists;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of names to lists of strings")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Lists, E> {
                Ok(Vec::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Lists, A::Error> {
                let mut lists = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, values)) =
                    access.next_entry::<String, Option<Vec<String>>>()?
                {
                    lists.push((key, values.unwrap_or_default()));
                }
                Ok(lists)
            }
        }

        deserializer.deserialize_any(ListsVisitor)
    }
}
