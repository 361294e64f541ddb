use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::config::{Credentials, Endpoints};
use crate::runtime::{ResolvedPaths, ensure_parent_dir};
use crate::transport::{HttpRequest, RequestBody, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub access_token: String,
    /// `Set-Cookie` values needed by file download endpoints.
    pub file_cookies: Vec<String>,
}

/// Access token cached in memory and mirrored to disk.
pub struct TokenCache {
    access_path: PathBuf,
    file_path: PathBuf,
    memory: Mutex<Option<String>>,
}

impl TokenCache {
    pub fn new(access_path: PathBuf, file_path: PathBuf) -> Self {
        Self {
            access_path,
            file_path,
            memory: Mutex::new(None),
        }
    }

    pub fn from_paths(paths: &ResolvedPaths) -> Self {
        Self::new(
            paths.access_token_path.clone(),
            paths.file_token_path.clone(),
        )
    }

    /// In-memory token first, then the file mirror.
    pub fn access_token(&self) -> Option<String> {
        if let Ok(guard) = self.memory.lock()
            && let Some(token) = guard.as_ref()
        {
            return Some(token.clone());
        }
        let token = fs::read_to_string(&self.access_path)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())?;
        if let Ok(mut guard) = self.memory.lock() {
            *guard = Some(token.clone());
        }
        Some(token)
    }

    pub fn file_cookies(&self) -> Vec<String> {
        fs::read_to_string(&self.file_path)
            .ok()
            .and_then(|content| serde_json::from_str::<Vec<String>>(&content).ok())
            .unwrap_or_default()
    }

    pub fn store(&self, token: &AuthToken) -> Result<()> {
        if let Ok(mut guard) = self.memory.lock() {
            *guard = Some(token.access_token.clone());
        }
        ensure_parent_dir(&self.access_path)?;
        fs::write(&self.access_path, &token.access_token)
            .with_context(|| format!("failed to write {}", self.access_path.display()))?;
        let cookies = serde_json::to_string(&token.file_cookies)
            .context("failed to serialize file cookies")?;
        ensure_parent_dir(&self.file_path)?;
        fs::write(&self.file_path, cookies)
            .with_context(|| format!("failed to write {}", self.file_path.display()))?;
        Ok(())
    }

    pub fn invalidate(&self) -> Result<()> {
        if let Ok(mut guard) = self.memory.lock() {
            *guard = None;
        }
        if self.access_path.exists() {
            fs::remove_file(&self.access_path)
                .with_context(|| format!("failed to remove {}", self.access_path.display()))?;
        }
        Ok(())
    }
}

/// Password grant against `{admin}login`, with the TOTP code when MFA is on.
pub fn login(
    transport: &dyn Transport,
    endpoints: &Endpoints,
    credentials: &Credentials,
) -> Result<AuthToken> {
    let mut form = vec![
        ("grant_type".to_string(), "password".to_string()),
        ("username".to_string(), credentials.username.clone()),
        ("password".to_string(), credentials.password.clone()),
    ];
    if let Some(code) = &credentials.totp_code {
        form.push(("totp_code".to_string(), code.clone()));
    }

    let mut request = HttpRequest::new(Method::POST, format!("{}login", endpoints.admin));
    request.body = RequestBody::Form(form);
    debug!(username = %credentials.username, "logging in to OCC");

    let response = transport.send(&request).context("failed to call OCC login")?;
    let payload: Value = serde_json::from_slice(&response.body).unwrap_or(Value::Null);
    if response.status >= 400 {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| response.text());
        bail!("OCC login failed with HTTP {}: {message}", response.status);
    }
    let Some(access_token) = payload.get("access_token").and_then(Value::as_str) else {
        bail!("OCC login response did not include an access_token");
    };

    Ok(AuthToken {
        access_token: access_token.to_string(),
        file_cookies: response
            .header_values("set-cookie")
            .map(ToString::to_string)
            .collect(),
    })
}

/// Render stored `Set-Cookie` values as a `Cookie` request header.
pub fn cookie_header(cookies: &[String]) -> Option<String> {
    let pairs = cookies
        .iter()
        .filter_map(|cookie| cookie.split(';').next())
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .collect::<Vec<_>>();
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}
