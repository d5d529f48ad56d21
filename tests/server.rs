//! End-to-end tests against a live server on a loopback port.

use mock_http_server::{
    FatalPolicy, Lifecycle, MockServer, MockServerConfig, MockServerError, ServerOptions,
    Violation,
};
use reqwest::StatusCode;
use std::time::{Duration, Instant};

async fn start(yaml: &str, options: ServerOptions) -> (MockServer, String) {
    let config = MockServerConfig::from_yaml(yaml).unwrap();
    let mut server = MockServer::with_config(options, config).unwrap();
    let addr = server.start().await.unwrap();
    (server, format!("http://{}", addr))
}

fn options() -> ServerOptions {
    ServerOptions {
        addr: "127.0.0.1:0".to_string(),
        fatal_policy: FatalPolicy::Shutdown,
        ..Default::default()
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

async fn wait_for_violation(server: &MockServer) -> Option<Violation> {
    for _ in 0..100 {
        if let Some(violation) = server.violation() {
            return Some(violation);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

#[tokio::test]
async fn test_ping() {
    let yaml = r#"
rules:
  - path: /ping
    methods: [GET]
    responses:
      - status_code: 200
        body: pong
"#;
    let (mut server, base) = start(yaml, options()).await;
    let client = client();

    let response = client.get(format!("{}/ping", base)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "pong");

    let response = client.post(format!("{}/ping", base)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    assert_eq!(server.dispatcher().total_matched(), 1);
    assert_eq!(server.dispatcher().total_unmatched(), 1);
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_header_and_query_constraints() {
    let yaml = r#"
rules:
  - path: /data
    query_params:
      p1: ["v1"]
    request_headers:
      accept: ["application/json"]
    responses:
      - status_code: 200
        headers:
          content-type: ["application/json"]
        body: '{"ok": true}'
"#;
    let (mut server, base) = start(yaml, options()).await;
    let client = client();

    let response = client
        .get(format!("{}/data?p1=v1", base))
        .header("Accept", "application/json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    assert_eq!(response.text().await.unwrap(), r#"{"ok": true}"#);

    let response = client
        .get(format!("{}/data?p1=v1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client
        .get(format!("{}/data?p1=v2", base))
        .header("Accept", "application/json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_form_fields_match_query_params() {
    let yaml = r#"
rules:
  - path: /submit
    methods: [POST]
    query_params:
      p1: ["v1"]
    responses:
      - body: "{{request.url.raw_query}}"
"#;
    let (mut server, base) = start(yaml, options()).await;

    let response = client()
        .post(format!("{}/submit?z=1", base))
        .form(&[("p1", "v1")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "p1=v1&z=1");

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_sequence_in_order() {
    let yaml = r#"
as_sequence: true
rules:
  - path: /a
    responses:
      - body: "a{{req_num}}"
      - body: "a{{req_num}}"
  - path: /b
    responses:
      - body: "b{{req_num}}"
      - body: "b{{req_num}}"
"#;
    let (mut server, base) = start(yaml, options()).await;
    let client = client();

    let mut bodies = Vec::new();
    for path in ["a", "a", "b", "b"] {
        let response = client
            .get(format!("{}/{}", base, path))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        bodies.push(response.text().await.unwrap());
    }
    assert_eq!(bodies, ["a1", "a2", "b1", "b2"]);
    assert!(server.violation().is_none());

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_sequence_violation_stops_server() {
    let yaml = r#"
as_sequence: true
rules:
  - path: /a
    responses: [{body: a1}, {body: a2}]
  - path: /b
    responses: [{body: b1}, {body: b2}]
"#;
    let (mut server, base) = start(yaml, options()).await;
    let client = client();

    let response = client.get(format!("{}/a", base)).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "a1");

    // Out of order: never answered
    assert!(client.get(format!("{}/b", base)).send().await.is_err());

    assert_eq!(
        wait_for_violation(&server).await,
        Some(Violation::OutOfSequence {
            rule: 1,
            expected: 1,
            actual: 2
        })
    );
    assert!(client.get(format!("{}/a", base)).send().await.is_err());

    server.close().await.unwrap();
    assert_eq!(server.state(), Lifecycle::Closed);
}

#[tokio::test]
async fn test_unmatched_rule_is_fatal_when_enabled() {
    let yaml = r#"
rules:
  - path: /known
"#;
    let options = ServerOptions {
        exit_on_unmatched_rule: true,
        ..options()
    };
    let (mut server, base) = start(yaml, options).await;
    let client = client();

    let response = client.get(format!("{}/known", base)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "");

    assert!(client
        .delete(format!("{}/unknown?x=1", base))
        .send()
        .await
        .is_err());
    assert_eq!(
        wait_for_violation(&server).await,
        Some(Violation::UnmatchedRule {
            method: "DELETE".to_string(),
            uri: "/unknown?x=1".to_string()
        })
    );

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_templates() {
    let yaml = r#"
rules:
  - path: "/users/{id:[0-9]+}"
    responses:
      - headers:
          x-user: ["{{request.vars.id}}"]
          x-next: ["{{sum req_num 1}}"]
        body: "{{request.method}} user {{request.vars.id}} #{{req_num}}"
  - path: /echo
    methods: [PUT]
    request_body: '/^\{.*\}$/'
    responses:
      - body: "{{minify_json request.body}}"
"#;
    let (mut server, base) = start(yaml, options()).await;
    let client = client();

    let response = client.get(format!("{}/users/42", base)).send().await.unwrap();
    assert_eq!(response.headers().get("x-user").unwrap(), "42");
    assert_eq!(response.headers().get("x-next").unwrap(), "2");
    assert_eq!(response.text().await.unwrap(), "GET user 42 #1");

    let response = client.get(format!("{}/users/abc", base)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client
        .put(format!("{}/echo", base))
        .body(r#"{ "a" : [1, 2] }"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), r#"{"a":[1,2]}"#);

    let response = client
        .put(format!("{}/echo", base))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_basic_auth() {
    let yaml = r#"
rules:
  - path: /secure
    user: username
    password: passwd
    responses:
      - body: welcome
"#;
    let (mut server, base) = start(yaml, options()).await;
    let client = client();

    let response = client
        .get(format!("{}/secure", base))
        .basic_auth("username", Some("passwd"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = client.get(format!("{}/secure", base)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client
        .get(format!("{}/secure", base))
        .basic_auth("username", Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_error_fault() {
    let yaml = r#"
rules:
  - path: /ping
    responses: [{body: pong}]
"#;
    let options = ServerOptions {
        fault_participation: 1.0,
        fault_error_code: 418,
        ..options()
    };
    let (mut server, base) = start(yaml, options).await;

    let response = client().get(format!("{}/ping", base)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    // Short-circuited before dispatch
    assert_eq!(server.dispatcher().total_requests(), 0);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_delay_fault() {
    let yaml = r#"
rules:
  - path: /ping
    responses: [{body: pong}]
"#;
    let options = ServerOptions {
        delay_participation: 1.0,
        delay_duration: Duration::from_millis(200),
        ..options()
    };
    let (mut server, base) = start(yaml, options).await;

    let started = Instant::now();
    let response = client().get(format!("{}/ping", base)).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "pong");
    assert!(started.elapsed() >= Duration::from_millis(200));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_server_from_rules_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.yaml");
    std::fs::write(
        &path,
        "rules:\n  - path: /file\n    responses:\n      - status_code: 201\n        body: created\n",
    )
    .unwrap();

    let mut server = MockServer::new(ServerOptions {
        config_path: Some(path),
        ..options()
    })
    .unwrap();
    let addr = server.start().await.unwrap();

    let response = client()
        .post(format!("http://{}/file", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.text().await.unwrap(), "created");

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_creates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.yaml");
    std::fs::write(&path, "rules:\n  - path: /ok\n  - path: \"/bad/{id:[}\"\n").unwrap();

    let err = MockServer::new(ServerOptions {
        config_path: Some(path),
        ..options()
    })
    .err()
    .unwrap();
    assert!(matches!(err, MockServerError::Config(_)));
}

#[tokio::test]
async fn test_close_waits_for_in_flight_requests() {
    let yaml = r#"
rules:
  - path: /slow
    responses: [{body: done}]
"#;
    let options = ServerOptions {
        delay_participation: 1.0,
        delay_duration: Duration::from_millis(300),
        ..options()
    };
    let (mut server, base) = start(yaml, options).await;

    let request = tokio::spawn(async move {
        client()
            .get(format!("{}/slow", base))
            .send()
            .await?
            .text()
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.close().await.unwrap();

    assert_eq!(request.await.unwrap().unwrap(), "done");
}

/// The test build links two rustls providers; pick one for the process.
fn ensure_crypto_provider() {
    static INSTALL: std::sync::Once = std::sync::Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

#[tokio::test]
async fn test_tls() {
    ensure_crypto_provider();

    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

    let yaml = r#"
rules:
  - path: /ping
    responses: [{body: secure pong}]
"#;
    let options = ServerOptions {
        tls_certificate: Some(cert_path),
        tls_key: Some(key_path),
        ..options()
    };
    let config = MockServerConfig::from_yaml(yaml).unwrap();
    let mut server = MockServer::with_config(options, config).unwrap();
    let addr = server.start().await.unwrap();

    let tls_client = reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_pem(cert.pem().as_bytes()).unwrap())
        .resolve("localhost", addr)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let response = tls_client
        .get(format!("https://localhost:{}/ping", addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "secure pong");

    // Plain HTTP against the TLS listener fails
    assert!(client()
        .get(format!("http://{}/ping", addr))
        .send()
        .await
        .map(|r| r.status() != StatusCode::OK)
        .unwrap_or(true));

    server.close().await.unwrap();
}
