use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use reqwest::Method;
use serde_json::Value;

use crate::config::{Credentials, Endpoints, Settings};
use crate::request::{OccApi, OccError, RequestSpec};
use crate::transport::RequestBody;

/// Project settings rooted at `root`, with the storefront under `root/storefront`.
pub fn settings(root: &Path) -> Settings {
    Settings {
        project_name: "acme".to_string(),
        environment: "tst".to_string(),
        project_base: root.to_path_buf(),
        storefront_dir_name: "storefront".to_string(),
        storefront_root: root.join("storefront"),
        endpoints: Endpoints::from_base_url("https://ccadmin.test"),
        credentials: Credentials {
            username: "jane@acme.test".to_string(),
            password: String::new(),
            totp_code: None,
        },
        use_mfa_login: false,
        theme_name: None,
        theme_id: None,
        files_config: Vec::new(),
        assets_version: None,
        email_sites: vec!["siteUS".to_string()],
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Body(Value),
    Status(u16),
}

struct Route {
    method: Method,
    path: String,
    replies: VecDeque<Reply>,
}

/// Scripted `OccApi`: replies are keyed by method and exact path, the last reply repeats.
#[derive(Default)]
pub struct MockApi {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<RequestSpec>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, method: Method, path: &str, body: Value) -> Self {
        self.push(method, path, Reply::Body(body))
    }

    pub fn on_status(self, method: Method, path: &str, status: u16) -> Self {
        self.push(method, path, Reply::Status(status))
    }

    fn push(self, method: Method, path: &str, reply: Reply) -> Self {
        {
            let mut routes = self.routes.lock().expect("lock");
            if let Some(route) = routes
                .iter_mut()
                .find(|route| route.method == method && route.path == path)
            {
                route.replies.push_back(reply);
            } else {
                routes.push(Route {
                    method,
                    path: path.to_string(),
                    replies: VecDeque::from([reply]),
                });
            }
        }
        self
    }

    pub fn calls(&self, method: Method, path: &str) -> Vec<RequestSpec> {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|spec| spec.method == method && spec.path() == path)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.calls(method, path).len()
    }

    pub fn bodies(&self, method: Method, path: &str) -> Vec<Value> {
        self.calls(method, path)
            .into_iter()
            .filter_map(|spec| match spec.body {
                RequestBody::Json(value) => Some(value),
                _ => None,
            })
            .collect()
    }

    pub fn all_calls(&self) -> Vec<(Method, String)> {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .map(|spec| (spec.method.clone(), spec.path().to_string()))
            .collect()
    }
}

impl OccApi for MockApi {
    fn request(&self, spec: RequestSpec) -> Result<Value> {
        let method = spec.method.clone();
        let path = spec.path().to_string();
        self.calls.lock().expect("lock").push(spec);

        let reply = {
            let mut routes = self.routes.lock().expect("lock");
            let route = routes
                .iter_mut()
                .find(|route| route.method == method && route.path == path)
                .ok_or_else(|| anyhow!("unexpected request {method} {path}"))?;
            if route.replies.len() > 1 {
                route.replies.pop_front()
            } else {
                route.replies.front().cloned()
            }
        };

        match reply {
            Some(Reply::Body(value)) => Ok(value),
            Some(Reply::Status(status)) => Err(OccError::Platform {
                status,
                error_code: status.to_string(),
                message: format!("scripted HTTP {status}"),
            }
            .into()),
            None => Err(anyhow!("no reply scripted for {method} {path}")),
        }
    }
}
