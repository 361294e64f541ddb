use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Method;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::{self, TokenCache, cookie_header};
use crate::config::{Credentials, Endpoints, Settings};
use crate::runtime::{ResolvedPaths, ensure_parent_dir};
use crate::transport::{
    FormPart, HttpRequest, HttpResponse, ReqwestTransport, RequestBody, Transport, TransportConfig,
};

pub const FORBIDDEN_HINT: &str = "Try to use a different Auth Method such as TOTP CODE or APP KEY";
pub const WORKSET_HEADER: &str = "X-CC-Workset";

const WORKSET_BYPASS_APIS: [&str; 2] = ["login", "worksets"];

#[derive(Debug, Error)]
pub enum OccError {
    #[error("OCC rejected the credentials (HTTP 401)")]
    Unauthorized,
    #[error("{message}\n\n {hint}", hint = FORBIDDEN_HINT)]
    Forbidden { message: String },
    #[error("OCC error {error_code} (HTTP {status}): {message}")]
    Platform {
        status: u16,
        error_code: String,
        message: String,
    },
    #[error("occtool has reached the max attempts ({attempts}) while waiting for the publish process")]
    PublishWaitExceeded { attempts: usize },
    #[error("OCC request failed after {attempts} attempts")]
    AttemptsExhausted { attempts: usize },
}

impl OccError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized => Some(401),
            Self::Forbidden { .. } => Some(403),
            Self::Platform { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// HTTP status carried by an `OccError` wrapped in `error`, if any.
pub fn error_status(error: &anyhow::Error) -> Option<u16> {
    error.downcast_ref::<OccError>().and_then(OccError::status)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Path relative to the admin endpoint.
    Api(String),
    Url(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: Method,
    pub target: Target,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub download: Option<PathBuf>,
}

impl RequestSpec {
    pub fn new(method: Method, api: impl AsRef<str>) -> Self {
        Self {
            method,
            target: Target::Api(api.as_ref().trim_start_matches('/').to_string()),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::None,
            download: None,
        }
    }

    pub fn get(api: impl AsRef<str>) -> Self {
        Self::new(Method::GET, api)
    }

    pub fn post(api: impl AsRef<str>) -> Self {
        Self::new(Method::POST, api)
    }

    pub fn put(api: impl AsRef<str>) -> Self {
        Self::new(Method::PUT, api)
    }

    pub fn delete(api: impl AsRef<str>) -> Self {
        Self::new(Method::DELETE, api)
    }

    pub fn head(api: impl AsRef<str>) -> Self {
        Self::new(Method::HEAD, api)
    }

    pub fn url(method: Method, url: impl Into<String>) -> Self {
        Self {
            target: Target::Url(url.into()),
            ..Self::new(method, "")
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn multipart(mut self, parts: Vec<FormPart>) -> Self {
        self.body = RequestBody::Multipart(parts);
        self
    }

    pub fn download_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.download = Some(path.into());
        self
    }

    /// Admin path or absolute URL, for logging and matching.
    pub fn path(&self) -> &str {
        match &self.target {
            Target::Api(path) | Target::Url(path) => path,
        }
    }
}

/// Request seam every OCC workflow talks through.
pub trait OccApi: Sync {
    fn request(&self, spec: RequestSpec) -> Result<Value>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub publish_poll_interval: Duration,
    pub publish_max_polls: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            publish_poll_interval: Duration::from_millis(5_000),
            publish_max_polls: 40,
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: defaults.max_attempts,
            publish_poll_interval: Duration::from_millis(env_value_u64("OCC_PUBLISH_POLL_MS", 5_000)),
            publish_max_polls: env_value_u64("OCC_PUBLISH_MAX_POLLS", 40) as usize,
        }
    }
}

/// Interval and ceiling for long-running platform jobs (bulk imports, publishes).
#[derive(Debug, Clone, Copy)]
pub struct JobPolling {
    pub interval: Duration,
    pub max_polls: usize,
}

impl Default for JobPolling {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5_000),
            max_polls: 720,
        }
    }
}

impl JobPolling {
    pub fn from_env() -> Self {
        Self {
            interval: Duration::from_millis(env_value_u64("OCC_JOB_POLL_MS", 5_000)),
            max_polls: env_value_u64("OCC_JOB_MAX_POLLS", 720) as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorksetBinding {
    pub id: String,
    pub name: String,
}

pub struct OccClient {
    transport: Box<dyn Transport>,
    endpoints: Endpoints,
    credentials: Credentials,
    workset_name: String,
    tokens: TokenCache,
    policy: RetryPolicy,
    token_valid: AtomicBool,
    workset: OnceLock<WorksetBinding>,
    workset_failed: AtomicBool,
    workset_init: Mutex<()>,
}

impl OccClient {
    pub fn new(
        transport: Box<dyn Transport>,
        endpoints: Endpoints,
        credentials: Credentials,
        tokens: TokenCache,
        policy: RetryPolicy,
    ) -> Self {
        let workset_name = crate::config::workset_name_for(&credentials.username);
        Self {
            transport,
            endpoints,
            credentials,
            workset_name,
            tokens,
            policy,
            token_valid: AtomicBool::new(false),
            workset: OnceLock::new(),
            workset_failed: AtomicBool::new(false),
            workset_init: Mutex::new(()),
        }
    }

    pub fn from_settings(settings: &Settings, paths: &ResolvedPaths) -> Result<Self> {
        let transport = ReqwestTransport::new(&TransportConfig {
            timeout_ms: env_value_u64("OCC_HTTP_TIMEOUT_MS", 60_000),
            ..TransportConfig::default()
        })?;
        Ok(Self::new(
            Box::new(transport),
            settings.endpoints.clone(),
            settings.credentials.clone(),
            TokenCache::from_paths(paths),
            RetryPolicy::from_env(),
        ))
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn workset(&self) -> Option<&WorksetBinding> {
        self.workset.get()
    }

    /// Force a fresh login and cache the token.
    pub fn login(&self) -> Result<String> {
        let token = auth::login(self.transport.as_ref(), &self.endpoints, &self.credentials)?;
        self.tokens.store(&token)?;
        Ok(token.access_token)
    }

    fn resolve_url(&self, target: &Target) -> String {
        match target {
            Target::Api(path) => format!("{}{}", self.endpoints.admin, path),
            Target::Url(url) => url.clone(),
        }
    }

    fn apply_workset(&self, url: &str, headers: &mut Vec<(String, String)>) {
        if WORKSET_BYPASS_APIS.iter().any(|api| url.contains(api)) {
            if let Some(binding) = self.workset.get() {
                headers.push((WORKSET_HEADER.to_string(), binding.id.clone()));
            }
            return;
        }

        if self.workset.get().is_none() && !self.workset_failed.load(Ordering::SeqCst) {
            self.ensure_workset();
        }
        if let Some(binding) = self.workset.get() {
            headers.push((WORKSET_HEADER.to_string(), binding.id.clone()));
        }
    }

    fn ensure_workset(&self) {
        let Ok(_guard) = self.workset_init.lock() else {
            self.workset_failed.store(true, Ordering::SeqCst);
            return;
        };
        if self.workset.get().is_some() || self.workset_failed.load(Ordering::SeqCst) {
            return;
        }

        match crate::worksets::create(self, &self.workset_name) {
            Ok(report) => {
                let id = report
                    .worksets
                    .first()
                    .and_then(|workset| workset.get("repositoryId"))
                    .and_then(Value::as_str);
                match id {
                    Some(id) => {
                        let _ = self.workset.set(WorksetBinding {
                            id: id.to_string(),
                            name: self.workset_name.clone(),
                        });
                        info!("Adding changes to the workset \"{}\"...", self.workset_name);
                    }
                    None => {
                        warn!("Problem while fetching/creating the workset...");
                        self.workset_failed.store(true, Ordering::SeqCst);
                    }
                }
            }
            Err(error) => {
                warn!("Error while fetching/creating the workset... {error:#}");
                self.workset_failed.store(true, Ordering::SeqCst);
            }
        }
    }

    fn current_token(&self) -> Result<String> {
        match self.tokens.access_token() {
            Some(token) => Ok(token),
            None => self.login(),
        }
    }

    fn relogin(&self) -> Result<String> {
        self.token_valid.store(false, Ordering::SeqCst);
        self.tokens.invalidate()?;
        self.login()
    }

    fn wait_for_publish(&self, token: &str) -> Result<()> {
        let url = format!("{}publish", self.endpoints.admin);
        let max_polls = self.policy.publish_max_polls;
        for poll in 1..=max_polls {
            let mut request = HttpRequest::new(Method::GET, url.clone());
            request.query.push(("lastPublished".to_string(), "true".to_string()));
            request.bearer = Some(token.to_string());
            let response = self.transport.send(&request)?;
            let body = match classify_response(&response) {
                Outcome::Success(body) => body,
                Outcome::Unauthorized => return Err(OccError::Unauthorized.into()),
                Outcome::Failed(error) => {
                    return Err(anyhow::Error::new(error).context("failed to check the publish status"));
                }
            };
            if !body
                .get("publishRunning")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                return Ok(());
            }
            info!("There is a publish in progress, waiting for this process to be finished...");
            if poll < max_polls {
                sleep(self.policy.publish_poll_interval);
            }
        }
        Err(OccError::PublishWaitExceeded {
            attempts: self.policy.publish_max_polls,
        }
        .into())
    }

    fn build_http_request(
        &self,
        spec: &RequestSpec,
        url: &str,
        headers: &[(String, String)],
        token: &str,
    ) -> HttpRequest {
        let mut request = HttpRequest::new(spec.method.clone(), url);
        request.query = spec.query.clone();
        request.headers = headers.to_vec();
        request.bearer = Some(token.to_string());
        request.body = spec.body.clone();
        if spec.download.is_some()
            && let Some(cookies) = cookie_header(&self.tokens.file_cookies())
        {
            request.headers.push(("Cookie".to_string(), cookies));
        }
        request
    }
}

impl OccApi for OccClient {
    fn request(&self, spec: RequestSpec) -> Result<Value> {
        let url = self.resolve_url(&spec.target);
        let mut headers = spec.headers.clone();
        self.apply_workset(&url, &mut headers);
        let mut token = self.current_token()?;

        for attempt in 1..=self.policy.max_attempts {
            if self.token_valid.load(Ordering::SeqCst) && spec.method != Method::GET {
                self.wait_for_publish(&token)?;
            }

            let request = self.build_http_request(&spec, &url, &headers, &token);
            debug!(method = %spec.method, url = %url, attempt, "requesting OCC");
            let response = self.transport.send(&request)?;
            if spec.download.is_some() && response.status >= 400 && response.status != 401 {
                self.token_valid.store(true, Ordering::SeqCst);
                warn!(status = response.status, url = %url, "download failed");
                return Ok(json!({ "status": response.status }));
            }

            match classify_response(&response) {
                Outcome::Unauthorized if attempt == self.policy.max_attempts => break,
                Outcome::Unauthorized => {
                    debug!(attempt, "OCC token rejected, logging in again");
                    token = self.relogin()?;
                    continue;
                }
                Outcome::Failed(error) => {
                    self.token_valid.store(false, Ordering::SeqCst);
                    return Err(error.into());
                }
                Outcome::Success(body) => {
                    self.token_valid.store(true, Ordering::SeqCst);
                    if let Some(path) = &spec.download {
                        return write_download(path, &response);
                    }
                    if spec.method == Method::HEAD {
                        return Ok(head_summary(&response));
                    }
                    return Ok(body);
                }
            }
        }

        Err(OccError::AttemptsExhausted {
            attempts: self.policy.max_attempts,
        }
        .into())
    }
}

enum Outcome {
    Success(Value),
    Unauthorized,
    Failed(OccError),
}

fn classify_response(response: &HttpResponse) -> Outcome {
    if response.status == 204 {
        return Outcome::Success(Value::Null);
    }

    let parsed = serde_json::from_slice::<Value>(&response.body).ok();
    let body_status = parsed
        .as_ref()
        .and_then(|body| body.get("status"))
        .and_then(status_number);

    if response.status == 401 || body_status == Some(401) {
        return Outcome::Unauthorized;
    }

    let message = parsed
        .as_ref()
        .and_then(|body| body.get("message"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .unwrap_or_else(|| response.text());

    if response.status == 403 || body_status == Some(403) {
        return Outcome::Failed(OccError::Forbidden { message });
    }

    if let Some(code) = parsed.as_ref().and_then(|body| body.get("errorCode")) {
        return Outcome::Failed(OccError::Platform {
            status: body_status.unwrap_or(response.status),
            error_code: code
                .as_str()
                .map(ToString::to_string)
                .unwrap_or_else(|| code.to_string()),
            message,
        });
    }

    if response.status >= 400 {
        return Outcome::Failed(OccError::Platform {
            status: response.status,
            error_code: String::new(),
            message,
        });
    }

    Outcome::Success(parsed.unwrap_or_else(|| Value::String(response.text())))
}

fn status_number(value: &Value) -> Option<u16> {
    match value {
        Value::Number(number) => number.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn head_summary(response: &HttpResponse) -> Value {
    let headers = response
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), Value::String(value.clone())))
        .collect::<serde_json::Map<_, _>>();
    json!({ "statusCode": response.status, "headers": headers })
}

fn write_download(path: &Path, response: &HttpResponse) -> Result<Value> {
    ensure_parent_dir(path)?;
    fs::write(path, &response.body).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(json!({ "status": response.status, "file": path.to_string_lossy() }))
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
