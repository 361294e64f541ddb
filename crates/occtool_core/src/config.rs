use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const OCC_DEFAULT_LIMIT: usize = 250;
pub const WORKSET_NAME_LIMIT: usize = 25;
pub const DEFAULT_EMAIL_SITES: [&str; 2] = ["siteUS", "siteCA"];

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectConfig {
    #[serde(default)]
    pub projects: ProjectsSection,
    pub use_mfa_login: Option<bool>,
    pub totp_code: Option<String>,
    #[serde(default)]
    pub files_config: Vec<FileRule>,
    pub assets_version: Option<String>,
    #[serde(default)]
    pub email_sites: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectsSection {
    #[serde(default)]
    pub current: CurrentProject,
    pub storefront_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CurrentProject {
    pub name: Option<String>,
    pub url: Option<String>,
    pub env: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub theme: ThemeSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsSection {
    pub username: Option<String>,
    pub password: Option<String>,
    pub mfa_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ThemeSection {
    pub name: Option<String>,
    pub id: Option<String>,
}

/// Per-file settings for storefront files matched by a glob `path`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileRule {
    #[serde(alias = "pattern")]
    pub path: String,
    #[serde(default)]
    pub transpile: bool,
    #[serde(rename = "libraryTarget", default, skip_serializing_if = "Option::is_none")]
    pub library_target: Option<String>,
    #[serde(rename = "page-tag-configs", default, skip_serializing_if = "Option::is_none")]
    pub page_tag_configs: Option<PageTagConfig>,
}

/// Page tag defaults a `files-config` rule applies to the file it matches.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageTagConfig {
    pub area: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub script_type: Option<String>,
    pub order: Option<String>,
    pub enabled: Option<bool>,
    pub append_version: Option<bool>,
    pub tag_id: Option<String>,
}

impl FileRule {
    /// Whether `relative` (a `/`-separated path under the storefront) matches this rule.
    pub fn matches(&self, relative: &str) -> bool {
        glob::Pattern::new(&self.path)
            .map(|pattern| pattern.matches(relative))
            .unwrap_or(false)
    }
}

/// First rule matching `relative`, in file order.
pub fn file_rule_for<'a>(rules: &'a [FileRule], relative: &str) -> Option<&'a FileRule> {
    rules.iter().find(|rule| rule.matches(relative))
}

/// Load and parse the JSON project file.
pub fn load_project_config(config_path: &Path) -> Result<ProjectConfig> {
    if !config_path.exists() {
        bail!(
            "project config not found at {}; pass --config or set OCCTOOL_CONFIG",
            config_path.display()
        );
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ProjectConfig = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub base_url: String,
    pub admin: String,
    pub admin_x: String,
    pub search: String,
    pub admin_ui: String,
    pub store: String,
}

impl Endpoints {
    pub fn from_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            base_url: base.to_string(),
            admin: format!("{base}/ccadmin/v1/"),
            admin_x: format!("{base}/ccadminx/custom/v1/"),
            search: format!("{base}/gsadmin/v1/"),
            admin_ui: format!("{base}/ccadminui/v1/"),
            store: base.replace("ccadmin", "ccstore"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub totp_code: Option<String>,
}

/// Resolved view of the project config with env overrides applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_name: String,
    pub environment: String,
    pub project_base: PathBuf,
    pub storefront_dir_name: String,
    pub storefront_root: PathBuf,
    pub endpoints: Endpoints,
    pub credentials: Credentials,
    pub use_mfa_login: bool,
    pub theme_name: Option<String>,
    pub theme_id: Option<String>,
    pub files_config: Vec<FileRule>,
    pub assets_version: Option<String>,
    pub email_sites: Vec<String>,
}

impl Settings {
    pub fn from_project<F>(config: &ProjectConfig, config_dir: &Path, lookup_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let current = &config.projects.current;
        let env_or = |key: &str, fallback: Option<&String>| -> Option<String> {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .or_else(|| fallback.cloned())
        };

        let Some(url) = env_or("OCC_ADMIN_URL", current.url.as_ref()) else {
            bail!("projects.current.url is not configured (or set OCC_ADMIN_URL)");
        };
        let Some(username) = env_or("OCC_USERNAME", current.credentials.username.as_ref()) else {
            bail!("projects.current.credentials.username is not configured (or set OCC_USERNAME)");
        };
        let password =
            env_or("OCC_PASSWORD", current.credentials.password.as_ref()).unwrap_or_default();

        let use_mfa_login = config.use_mfa_login.unwrap_or(true);
        let totp_code = if use_mfa_login {
            env_or("OCC_TOTP_CODE", config.totp_code.as_ref())
        } else {
            None
        };

        let project_base = match current.path.as_deref() {
            Some(path) if Path::new(path).is_absolute() => PathBuf::from(path),
            Some(path) => config_dir.join(path),
            None => config_dir.to_path_buf(),
        };
        let storefront_dir_name = config
            .projects
            .storefront_dir
            .clone()
            .unwrap_or_else(|| "storefront".to_string());
        let storefront_root = project_base.join(&storefront_dir_name);

        let email_sites = if config.email_sites.is_empty() {
            DEFAULT_EMAIL_SITES.iter().map(ToString::to_string).collect()
        } else {
            config.email_sites.clone()
        };

        Ok(Self {
            project_name: current.name.clone().unwrap_or_default(),
            environment: current.env.clone().unwrap_or_default(),
            project_base,
            storefront_dir_name,
            storefront_root,
            endpoints: Endpoints::from_base_url(&url),
            credentials: Credentials {
                username,
                password,
                totp_code,
            },
            use_mfa_login,
            theme_name: current.theme.name.clone(),
            theme_id: current.theme.id.clone(),
            files_config: config.files_config.clone(),
            assets_version: config.assets_version.clone(),
            email_sites,
        })
    }

    /// Workset owned by the current user: username before `@`, truncated.
    pub fn workset_name(&self) -> String {
        workset_name_for(&self.credentials.username)
    }

    pub fn server_side_root(&self) -> PathBuf {
        self.project_base.join("server-side-extensions")
    }

    pub fn search_root(&self) -> PathBuf {
        self.project_base.join("search")
    }
}

pub fn workset_name_for(username: &str) -> String {
    let local = username.split('@').next().unwrap_or(username);
    local.chars().take(WORKSET_NAME_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
  "projects": {
    "current": {
      "name": "acme",
      "url": "https://admin.acme.test/",
      "env": "tst",
      "path": "repo",
      "credentials": { "username": "jane.doe@acme.test", "password": "secret", "mfaSecret": "abc" },
      "theme": { "name": "AcmeTheme", "id": "100001" }
    },
    "storefront-dir": "storefront"
  },
  "use-mfa-login": true,
  "totp-code": "123456",
  "files-config": [
    { "pattern": "files/general/*.json", "transpile": true },
    {
      "path": "page-tags/head/*.js",
      "libraryTarget": "umd",
      "page-tag-configs": { "area": "body-end", "name": "tracking", "order": "2", "enabled": false }
    }
  ],
  "assets-version": "42"
}"#;

    fn load_sample() -> (tempfile::TempDir, ProjectConfig) {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("occ-tools.project.json");
        fs::write(&config_path, SAMPLE).expect("write config");
        let config = load_project_config(&config_path).expect("load config");
        (temp, config)
    }

    #[test]
    fn load_project_config_parses_kebab_keys() {
        let (_temp, config) = load_sample();
        assert_eq!(config.projects.current.name.as_deref(), Some("acme"));
        assert_eq!(config.projects.storefront_dir.as_deref(), Some("storefront"));
        assert_eq!(config.use_mfa_login, Some(true));
        assert_eq!(config.totp_code.as_deref(), Some("123456"));
        assert_eq!(config.files_config.len(), 2);
        assert!(config.files_config[0].transpile);
        assert_eq!(config.files_config[0].path, "files/general/*.json");
        assert_eq!(
            config.projects.current.credentials.mfa_secret.as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn files_config_accepts_path_and_page_tag_configs() {
        let (_temp, config) = load_sample();
        let rule = file_rule_for(&config.files_config, "page-tags/head/gtm.js").expect("rule");
        assert_eq!(rule.path, "page-tags/head/*.js");
        assert!(!rule.transpile);
        assert_eq!(rule.library_target.as_deref(), Some("umd"));
        let tag = rule.page_tag_configs.as_ref().expect("page tag configs");
        assert_eq!(tag.area.as_deref(), Some("body-end"));
        assert_eq!(tag.name.as_deref(), Some("tracking"));
        assert_eq!(tag.enabled, Some(false));
        assert!(tag.append_version.is_none());
        assert!(file_rule_for(&config.files_config, "page-tags/body-end/gtm.js").is_none());
    }

    #[test]
    fn load_project_config_reports_missing_file() {
        let error = load_project_config(Path::new("/nonexistent/occ.json")).expect_err("must fail");
        assert!(error.to_string().contains("project config not found"));
    }

    #[test]
    fn load_project_config_reports_invalid_json() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("occ.json");
        fs::write(&config_path, "{ \"projects\": ").expect("write config");
        let error = load_project_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn endpoints_are_derived_from_base_url() {
        let endpoints = Endpoints::from_base_url("https://ccadmin-z1.oracleoutsourcing.com/");
        assert_eq!(
            endpoints.admin,
            "https://ccadmin-z1.oracleoutsourcing.com/ccadmin/v1/"
        );
        assert_eq!(
            endpoints.admin_x,
            "https://ccadmin-z1.oracleoutsourcing.com/ccadminx/custom/v1/"
        );
        assert_eq!(
            endpoints.search,
            "https://ccadmin-z1.oracleoutsourcing.com/gsadmin/v1/"
        );
        assert_eq!(endpoints.store, "https://ccstore-z1.oracleoutsourcing.com");
    }

    #[test]
    fn settings_apply_env_overrides() {
        let (temp, config) = load_sample();
        let env = HashMap::from([
            ("OCC_ADMIN_URL".to_string(), "https://other.test".to_string()),
            ("OCC_TOTP_CODE".to_string(), "999999".to_string()),
        ]);
        let settings =
            Settings::from_project(&config, temp.path(), |key| env.get(key).cloned()).expect("settings");
        assert_eq!(settings.endpoints.admin, "https://other.test/ccadmin/v1/");
        assert_eq!(settings.credentials.totp_code.as_deref(), Some("999999"));
        assert_eq!(settings.credentials.password, "secret");
        assert_eq!(settings.project_base, temp.path().join("repo"));
        assert_eq!(
            settings.storefront_root,
            temp.path().join("repo").join("storefront")
        );
        assert_eq!(settings.email_sites, vec!["siteUS", "siteCA"]);
    }

    #[test]
    fn settings_drop_totp_when_mfa_disabled() {
        let (temp, mut config) = load_sample();
        config.use_mfa_login = Some(false);
        let settings = Settings::from_project(&config, temp.path(), |_| None).expect("settings");
        assert!(settings.credentials.totp_code.is_none());
    }

    #[test]
    fn settings_require_url() {
        let config = ProjectConfig::default();
        let error = Settings::from_project(&config, Path::new("/"), |_| None).expect_err("must fail");
        assert!(error.to_string().contains("projects.current.url"));
    }

    #[test]
    fn workset_name_strips_domain_and_truncates() {
        assert_eq!(workset_name_for("jane.doe@acme.test"), "jane.doe");
        assert_eq!(
            workset_name_for("a.really.long.username.value@acme.test"),
            "a.really.long.username.va"
        );
        assert_eq!(workset_name_for("nodomain"), "nodomain");
    }
}
