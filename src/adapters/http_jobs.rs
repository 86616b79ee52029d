//! HTTP Job API Adapter
//!
//! Implements the `JobApi` port against the scan engine and backup service
//! REST endpoints: JSON start request returning a job id, status lookup by
//! id, explicit cancel.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::domain::model::{JobHandle, JobState, JobStatus};
use crate::domain::ports::{JobApi, JobRequest};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Endpoint layout of one job API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpJobApiConfig {
    /// Base URL, e.g. `https://scanner.example.com/api`
    pub base_url: String,

    /// Session bootstrap path; when set, a `sessionid` header replaces
    /// bearer auth after the first request
    pub session_path: Option<String>,

    pub start_path: String,
    pub status_path: String,
    pub cancel_path: String,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Skip TLS certificate verification (lab appliances with self-signed certs)
    pub accept_invalid_certs: bool,

    /// Environment variable holding the bearer token
    pub token_env: Option<String>,
}

impl Default for HttpJobApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            session_path: None,
            start_path: "/PolicyExec".to_string(),
            status_path: "/JobStatus".to_string(),
            cancel_path: "/JobCancel".to_string(),
            request_timeout_secs: 30,
            accept_invalid_certs: false,
            token_env: None,
        }
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// `JobApi` over HTTP.
pub struct HttpJobApi {
    client: Client,
    config: HttpJobApiConfig,
    token: Option<String>,
    session: Mutex<Option<String>>,
}

impl std::fmt::Debug for HttpJobApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpJobApi")
            .field("base_url", &self.config.base_url)
            .field("has_token", &self.token.is_some())
            .finish()
    }
}

impl HttpJobApi {
    /// Build the client. The bearer token is read from the environment
    /// variable named by `token_env`.
    pub fn new(config: HttpJobApiConfig) -> Result<Self> {
        let token = match &config.token_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                Error::config(format!("environment variable {} is not set", var))
            })?),
            None => None,
        };
        Self::with_token(config, token)
    }

    pub fn with_token(config: HttpJobApiConfig, token: Option<String>) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(Error::config("job API base_url must not be empty"));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            token,
            session: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Attach credentials: the session id once established, else the
    /// bearer token.
    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let Some(session_path) = &self.config.session_path else {
            return Ok(self.bearer(request));
        };

        let mut session = self.session.lock().await;
        if session.is_none() {
            let response = self
                .bearer(self.client.post(self.url(session_path)))
                .send()
                .await?;
            let body = checked_json(response, |status, text| {
                Error::Protocol(format!("session request returned {}: {}", status, text))
            })
            .await?;
            let id = body
                .get("sessionid")
                .and_then(json_string)
                .ok_or_else(|| Error::Protocol(format!("no sessionid in {}", body)))?;
            debug!("Established job API session");
            *session = Some(id);
        }

        match session.as_deref() {
            Some(id) => Ok(request.header("sessionid", id)),
            None => Ok(self.bearer(request)),
        }
    }

    fn bearer(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

// =============================================================================
// Wire Format
// =============================================================================

/// JSON body of a start request.
fn start_payload(request: &JobRequest) -> Value {
    match request {
        JobRequest::Scan {
            policy,
            export_path,
            extras,
        } => {
            let mut body = json!({
                "policy": policy,
                "nfs_export": export_path,
            });
            let fields = [
                ("mtree", &extras.mtree),
                ("copyid", &extras.copy_id),
                ("vault_fqdn", &extras.vault_fqdn),
                ("vault_ip", &extras.vault_ip),
            ];
            for (key, value) in fields {
                if let Some(value) = value {
                    body[key] = json!(value);
                }
            }
            if !extras.notify.is_empty() {
                body["List_of_email_addresses"] = json!(extras.notify);
            }
            body
        }
        JobRequest::Backup { path } => json!({ "path": path }),
    }
}

/// A JSON string, or a number rendered as a string.
fn json_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_job_id(body: &Value) -> Option<String> {
    ["job_id", "jobid", "id"]
        .iter()
        .find_map(|key| body.get(*key).and_then(json_string))
}

fn parse_state(body: &Value) -> Result<JobState> {
    let raw = ["state", "status"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .ok_or_else(|| Error::Protocol(format!("no state in {}", body)))?;
    JobState::from_api(raw).ok_or_else(|| Error::Protocol(format!("unknown job state {:?}", raw)))
}

/// Server-side trouble the poller may retry through.
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Read a JSON body, mapping non-success statuses: retryable ones to
/// `Transport`, the rest through `reject`.
async fn checked_json<F>(response: Response, reject: F) -> Result<Value>
where
    F: FnOnce(StatusCode, String) -> Error,
{
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        if is_retryable_status(status) {
            return Err(Error::Transport(format!("HTTP {}: {}", status, text)));
        }
        return Err(reject(status, text));
    }
    let text = response.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text)
        .map_err(|e| Error::Protocol(format!("invalid JSON ({}): {}", e, text)))
}

// =============================================================================
// Port Implementation
// =============================================================================

#[async_trait]
impl JobApi for HttpJobApi {
    #[instrument(skip(self, request), fields(kind = %request.kind()))]
    async fn start(&self, request: &JobRequest) -> Result<JobHandle> {
        let kind = request.kind();
        let payload = start_payload(request);
        let builder = self.client.post(self.url(&self.config.start_path)).json(&payload);

        let response = self.authorize(builder).await?.send().await?;
        let body = checked_json(response, |status, text| Error::JobStart {
            kind,
            reason: format!("HTTP {}: {}", status, text),
        })
        .await?;

        let job_id = parse_job_id(&body).ok_or_else(|| Error::JobStart {
            kind,
            reason: format!("response carries no job id: {}", body),
        })?;
        info!("Started {} job {}", kind, job_id);
        Ok(JobHandle::new(job_id, kind))
    }

    #[instrument(skip(self, handle), fields(job_id = %handle.job_id))]
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let builder = self
            .client
            .get(self.url(&self.config.status_path))
            .query(&[("job_id", handle.job_id.as_str())]);

        let response = self.authorize(builder).await?.send().await?;
        let body = checked_json(response, |status, text| {
            Error::Protocol(format!("status returned HTTP {}: {}", status, text))
        })
        .await?;

        let state = parse_state(&body)?;
        Ok(JobStatus::new(handle, state, body.to_string()))
    }

    #[instrument(skip(self, handle), fields(job_id = %handle.job_id))]
    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let builder = self
            .client
            .post(self.url(&self.config.cancel_path))
            .json(&json!({ "job_id": handle.job_id }));

        let response = self.authorize(builder).await?.send().await?;
        checked_json(response, |status, text| {
            Error::Protocol(format!("cancel returned HTTP {}: {}", status, text))
        })
        .await?;
        warn!("Requested cancellation of {} job {}", handle.kind, handle.job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::JobKind;
    use crate::domain::ports::ScanExtras;
    use assert_matches::assert_matches;

    #[test]
    fn test_scan_payload_includes_extras() {
        let request = JobRequest::Scan {
            policy: "DailyIntegrity".to_string(),
            export_path: "/data1".to_string(),
            extras: ScanExtras {
                mtree: Some("ReplicationMTree".to_string()),
                copy_id: Some("safecopy_20240930010000".to_string()),
                vault_fqdn: None,
                vault_ip: Some("10.9.9.9".to_string()),
                notify: vec!["ops@example.com".to_string()],
            },
        };
        let body = start_payload(&request);
        assert_eq!(body["policy"], "DailyIntegrity");
        assert_eq!(body["nfs_export"], "/data1");
        assert_eq!(body["mtree"], "ReplicationMTree");
        assert_eq!(body["copyid"], "safecopy_20240930010000");
        assert_eq!(body["vault_ip"], "10.9.9.9");
        assert!(body.get("vault_fqdn").is_none());
        assert_eq!(body["List_of_email_addresses"][0], "ops@example.com");
    }

    #[test]
    fn test_backup_payload() {
        let body = start_payload(&JobRequest::Backup {
            path: "/mnt/data1".to_string(),
        });
        assert_eq!(body, json!({ "path": "/mnt/data1" }));
    }

    #[test]
    fn test_job_id_string_or_number() {
        assert_eq!(parse_job_id(&json!({"job_id": "abc"})), Some("abc".to_string()));
        assert_eq!(parse_job_id(&json!({"job_id": 4711})), Some("4711".to_string()));
        assert_eq!(parse_job_id(&json!({"id": 9})), Some("9".to_string()));
        assert_eq!(parse_job_id(&json!({"job_id": ""})), None);
        assert_eq!(parse_job_id(&json!({"message": "ok"})), None);
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state(&json!({"state": "Done"})).unwrap(), JobState::Done);
        assert_eq!(parse_state(&json!({"status": "InProgress"})).unwrap(), JobState::Running);
        assert_matches!(parse_state(&json!({"state": "Paused"})), Err(Error::Protocol(_)));
        assert_matches!(parse_state(&json!({})), Err(Error::Protocol(_)));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_requires_base_url() {
        assert_matches!(
            HttpJobApi::with_token(HttpJobApiConfig::default(), None),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_missing_token_env_is_config_error() {
        let config = HttpJobApiConfig {
            base_url: "https://scanner.invalid".to_string(),
            token_env: Some("SAFECOPY_TEST_TOKEN_THAT_IS_NOT_SET".to_string()),
            ..Default::default()
        };
        assert_matches!(HttpJobApi::new(config), Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport() {
        let config = HttpJobApiConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            request_timeout_secs: 2,
            ..Default::default()
        };
        let api = HttpJobApi::with_token(config, Some("t".to_string())).unwrap();
        let handle = JobHandle::new("1", JobKind::Scan);

        let err = api.status(&handle).await.unwrap_err();
        assert!(err.is_transient());
    }
}
