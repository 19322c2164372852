//! Reqwest-based client for the Backend.AI kernel API.

pub mod auth;

use std::time::Duration;

use chrono::Utc;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, DATE},
    Method, StatusCode, Url,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::Config;
use auth::{Credentials, SignInput};

const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{status} {reason} ({title})")]
    Server { status: u16, reason: String, title: String },

    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("missing API keypair: set BACKEND_ACCESS_KEY and BACKEND_SECRET_KEY")]
    MissingCredentials,

    #[error("unsupported BACKEND_HASH_TYPE: {0} (only sha256 is supported)")]
    UnsupportedHash(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Server { status, .. } => Some(*status),
            ApiError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND.as_u16())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Query,
    Input,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum RunStatus {
    Finished,
    WaitingInput,
    Continued,
    BuildFinished,
    Other(String),
}

impl From<String> for RunStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "finished" => RunStatus::Finished,
            "waiting-input" => RunStatus::WaitingInput,
            "continued" => RunStatus::Continued,
            "build-finished" => RunStatus::BuildFinished,
            _ => RunStatus::Other(s),
        }
    }
}

/// One `[kind, payload]` entry of an execution result's console.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "(String, Value)")]
pub enum ConsoleItem {
    Stdout(String),
    Stderr(String),
    Media { mime: String, data: Value },
    Html(String),
    Other(String),
}

fn payload_text(v: Value) -> String {
    match v {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl From<(String, Value)> for ConsoleItem {
    fn from((kind, payload): (String, Value)) -> Self {
        match kind.as_str() {
            "stdout" => ConsoleItem::Stdout(payload_text(payload)),
            "stderr" => ConsoleItem::Stderr(payload_text(payload)),
            "html" => ConsoleItem::Html(payload_text(payload)),
            "media" => match payload {
                Value::Array(mut parts) if parts.len() == 2 => {
                    let data = parts.pop().unwrap_or(Value::Null);
                    let mime = parts.pop().map(payload_text).unwrap_or_default();
                    ConsoleItem::Media { mime, data }
                }
                _ => ConsoleItem::Other(kind),
            },
            _ => ConsoleItem::Other(kind),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    #[serde(default)]
    pub run_id: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub console: Vec<ConsoleItem>,
    #[serde(default)]
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteKernel {
    pub kernel_id: String,
    #[serde(default)]
    pub created: bool,
}

/// Cursor context sent along with a completion query.
#[derive(Debug, Clone, Serialize)]
pub struct CompleteOptions {
    pub row: usize,
    pub col: usize,
    pub line: String,
    pub post: String,
}

#[derive(Deserialize)]
struct ResultEnvelope<T> {
    result: Option<T>,
}

#[derive(Deserialize)]
struct Completions {
    #[serde(default)]
    completions: Vec<String>,
}

#[derive(Debug)]
pub struct BackendClient {
    http: reqwest::Client,
    endpoint: Url,
    api_version: String,
    creds: Credentials,
}

impl BackendClient {
    pub fn from_config(cfg: &Config) -> Result<Self, ApiError> {
        // Request signing is HMAC-SHA256 only.
        let hash_type = cfg.get_non_empty("BACKEND_HASH_TYPE").unwrap_or_else(|| "sha256".into());
        if !hash_type.eq_ignore_ascii_case("sha256") {
            return Err(ApiError::UnsupportedHash(hash_type));
        }
        let access_key = cfg.get_non_empty("BACKEND_ACCESS_KEY");
        let secret_key = cfg.get_non_empty("BACKEND_SECRET_KEY");
        let (Some(access_key), Some(secret_key)) = (access_key, secret_key) else {
            return Err(ApiError::MissingCredentials);
        };
        let timeout = cfg.get_u64("REQUEST_TIMEOUT").unwrap_or(60);
        Self::new(
            &cfg.endpoint(),
            &cfg.api_version(),
            Credentials { access_key, secret_key },
            Duration::from_secs(timeout),
            cfg.get_bool("BACKEND_SKIP_SSLCERT_VALIDATION"),
        )
    }

    pub fn new(
        endpoint: &str,
        api_version: &str,
        creds: Credentials,
        timeout: Duration,
        skip_ssl_verify: bool,
    ) -> Result<Self, ApiError> {
        let endpoint = Url::parse(endpoint).map_err(|e| ApiError::Endpoint(format!("{endpoint}: {e}")))?;
        if endpoint.host_str().is_none() {
            return Err(ApiError::Endpoint(endpoint.to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(skip_ssl_verify)
            .build()?;
        Ok(Self { http, endpoint, api_version: api_version.to_string(), creds })
    }

    /// The major version prefix used in request paths, e.g. `v3`.
    fn path_prefix(&self) -> &str {
        self.api_version.split('.').next().unwrap_or("v3")
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> Result<reqwest::Response, ApiError> {
        let base_path = self.endpoint.path().trim_end_matches('/');
        let rel_url = format!("{}/{}/{}", base_path, self.path_prefix(), path.trim_start_matches('/'));
        let mut url = self.endpoint.clone();
        url.set_path(&rel_url);

        let payload = match body {
            Some(b) => serde_json::to_vec(b)?,
            None => Vec::new(),
        };
        let date = Utc::now();
        let host = self.host();
        let signature = auth::sign(
            &self.creds,
            &SignInput {
                method: method.as_str(),
                rel_url: &rel_url,
                date,
                host: &host,
                content_type: JSON_CONTENT_TYPE,
                api_version: &self.api_version,
                body: &payload,
            },
        );

        let date_str = auth::format_date(&date);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        headers.insert(DATE, header_value(&date_str)?);
        headers.insert("x-backendai-date", header_value(&date_str)?);
        headers.insert("x-backendai-version", header_value(&self.api_version)?);
        headers.insert(
            AUTHORIZATION,
            header_value(&auth::authorization_header(&self.creds, &signature))?,
        );

        tracing::debug!(%method, %url, "backend.ai request");
        let resp = self
            .http
            .request(method, url)
            .headers(headers)
            .body(payload)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let reason = status.canonical_reason().unwrap_or("").to_string();
        let text = resp.text().await.unwrap_or_default();
        let title = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("title").and_then(|t| t.as_str()).map(str::to_string))
            .unwrap_or(text);
        Err(ApiError::Server { status: status.as_u16(), reason, title })
    }

    pub async fn get_or_create(&self, lang: &str, client_token: &str) -> Result<RemoteKernel, ApiError> {
        let body = json!({ "lang": lang, "clientSessionToken": client_token });
        let resp = self.call(Method::POST, "kernel/create", Some(&body)).await?;
        Ok(resp.json::<RemoteKernel>().await?)
    }

    pub async fn execute(
        &self,
        kernel_id: &str,
        run_id: Option<&str>,
        code: &str,
        mode: RunMode,
    ) -> Result<ExecutionResult, ApiError> {
        let body = json!({ "mode": mode, "code": code, "runId": run_id });
        let resp = self.call(Method::POST, &format!("kernel/{kernel_id}"), Some(&body)).await?;
        let text = resp.text().await?;
        let envelope: ResultEnvelope<ExecutionResult> = serde_json::from_str(&text)?;
        envelope.result.ok_or_else(|| ApiError::Server {
            status: 200,
            reason: "OK".into(),
            title: "execution result is missing".into(),
        })
    }

    pub async fn complete(
        &self,
        kernel_id: &str,
        code: &str,
        opts: &CompleteOptions,
    ) -> Result<Vec<String>, ApiError> {
        let body = json!({ "code": code, "options": opts });
        let resp = self
            .call(Method::POST, &format!("kernel/{kernel_id}/complete"), Some(&body))
            .await?;
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let envelope: ResultEnvelope<Completions> = serde_json::from_str(&text)?;
        Ok(envelope.result.map(|r| r.completions).unwrap_or_default())
    }

    pub async fn interrupt(&self, kernel_id: &str) -> Result<(), ApiError> {
        self.call(Method::POST, &format!("kernel/{kernel_id}/interrupt"), None).await?;
        Ok(())
    }

    pub async fn destroy(&self, kernel_id: &str) -> Result<(), ApiError> {
        self.call(Method::DELETE, &format!("kernel/{kernel_id}"), None).await?;
        Ok(())
    }
}

fn header_value(s: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(s).map_err(|e| ApiError::Endpoint(format!("invalid header value: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(uri: &str) -> BackendClient {
        BackendClient::new(
            uri,
            "v3.20170615",
            Credentials { access_key: "AKIATEST".into(), secret_key: "secret".into() },
            Duration::from_secs(5),
            false,
        )
        .unwrap()
    }

    #[test]
    fn console_items_decode_from_pairs() {
        let json = r#"[["stdout","hi\n"],["stderr","oops"],["media",["image/png","AAAA"]],["html","<b>x</b>"],["goto","x"]]"#;
        let items: Vec<ConsoleItem> = serde_json::from_str(json).unwrap();
        assert_eq!(items[0], ConsoleItem::Stdout("hi\n".into()));
        assert_eq!(items[1], ConsoleItem::Stderr("oops".into()));
        assert_eq!(items[2], ConsoleItem::Media { mime: "image/png".into(), data: json!("AAAA") });
        assert_eq!(items[3], ConsoleItem::Html("<b>x</b>".into()));
        assert_eq!(items[4], ConsoleItem::Other("goto".into()));
    }

    #[test]
    fn run_status_parses_known_and_unknown() {
        let r: ExecutionResult = serde_json::from_str(
            r#"{"runId":"r1","status":"waiting-input","console":[],"exitCode":null}"#,
        )
        .unwrap();
        assert_eq!(r.status, RunStatus::WaitingInput);
        assert_eq!(r.run_id.as_deref(), Some("r1"));
        assert_eq!(RunStatus::from("clean-finished".to_string()), RunStatus::Other("clean-finished".into()));
    }

    #[test]
    fn run_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_value(RunMode::Continue).unwrap(), json!("continue"));
    }

    #[tokio::test]
    async fn create_kernel_signs_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/kernel/create"))
            .and(header_exists("authorization"))
            .and(header_exists("x-backendai-version"))
            .and(body_partial_json(json!({ "lang": "python:3.6", "clientSessionToken": "sess" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "kernelId": "k-1", "created": true })))
            .mount(&server)
            .await;

        let kernel = client(&server.uri()).get_or_create("python:3.6", "sess").await.unwrap();
        assert_eq!(kernel.kernel_id, "k-1");
        assert!(kernel.created);
    }

    #[tokio::test]
    async fn execute_returns_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/kernel/k-1"))
            .and(body_partial_json(json!({ "mode": "query", "code": "print(1)" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": { "runId": "r1", "status": "finished", "console": [["stdout", "1\n"]] }
            })))
            .mount(&server)
            .await;

        let result = client(&server.uri())
            .execute("k-1", None, "print(1)", RunMode::Query)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Finished);
        assert_eq!(result.console, vec![ConsoleItem::Stdout("1\n".into())]);
    }

    #[tokio::test]
    async fn complete_treats_null_result_as_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/kernel/k-1/complete"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": null })))
            .mount(&server)
            .await;

        let opts = CompleteOptions { row: 1, col: 2, line: "pr".into(), post: String::new() };
        let matches = client(&server.uri()).complete("k-1", "pr", &opts).await.unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn complete_returns_matches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/kernel/k-1/complete"))
            .and(body_partial_json(json!({ "options": { "row": 1, "col": 2 } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": { "completions": ["print", "property"] }
            })))
            .mount(&server)
            .await;

        let opts = CompleteOptions { row: 1, col: 2, line: "pr".into(), post: String::new() };
        let matches = client(&server.uri()).complete("k-1", "pr", &opts).await.unwrap();
        assert_eq!(matches, vec!["print".to_string(), "property".to_string()]);
    }

    #[tokio::test]
    async fn destroy_maps_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v3/kernel/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "title": "No such kernel." })))
            .mount(&server)
            .await;

        let err = client(&server.uri()).destroy("gone").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "404 Not Found (No such kernel.)");
    }

    #[tokio::test]
    async fn interrupt_posts_to_kernel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/kernel/k-1/interrupt"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v3/kernel/busy/interrupt"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "title": "Agent is unreachable." })))
            .mount(&server)
            .await;

        let api = client(&server.uri());
        api.interrupt("k-1").await.unwrap();
        let err = api.interrupt("busy").await.unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "500 Internal Server Error (Agent is unreachable.)");
    }

    #[test]
    fn only_sha256_signing_is_accepted() {
        use std::io::Write;

        let mut rc = tempfile::NamedTempFile::new().unwrap();
        writeln!(rc, "BACKEND_HASH_TYPE=md5").unwrap();
        writeln!(rc, "BACKEND_ACCESS_KEY=AKIATEST").unwrap();
        writeln!(rc, "BACKEND_SECRET_KEY=secret").unwrap();
        let cfg = Config::load_from(rc.path());

        let err = BackendClient::from_config(&cfg).unwrap_err();
        assert!(matches!(err, ApiError::UnsupportedHash(ref h) if h == "md5"), "{err}");
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let creds = Credentials { access_key: "a".into(), secret_key: "b".into() };
        assert!(BackendClient::new("not a url", "v3.20170615", creds, Duration::from_secs(1), false).is_err());
    }
}
