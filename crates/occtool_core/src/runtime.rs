use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;

pub const DEFAULT_CONFIG_FILENAME: &str = "occ-tools.project.json";
pub const TEMP_DIR_NAME: &str = "occ-tools-data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub config: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub os_temp_dir: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self {
            cwd,
            os_temp_dir: env::temp_dir(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub config_path: PathBuf,
    pub temp_root: PathBuf,
    pub access_token_path: PathBuf,
    pub file_token_path: PathBuf,
    pub backup_dir: PathBuf,
    pub config_source: ValueSource,
    pub temp_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "config_path={} ({})\ntemp_root={} ({})\naccess_token_path={}\nfile_token_path={}\nbackup_dir={}",
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.temp_root),
            self.temp_source.as_str(),
            normalize_for_display(&self.access_token_path),
            normalize_for_display(&self.file_token_path),
            normalize_for_display(&self.backup_dir),
        )
    }

    /// Directory holding the project file; relative project paths resolve against it.
    pub fn config_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

pub fn resolve_paths(context: &ResolutionContext, overrides: &PathOverrides) -> ResolvedPaths {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> ResolvedPaths
where
    F: Fn(&str) -> Option<String>,
{
    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("OCCTOOL_CONFIG")) {
        (absolutize(Path::new(&value), &context.cwd), ValueSource::Env)
    } else {
        (
            context.cwd.join(DEFAULT_CONFIG_FILENAME),
            ValueSource::Default,
        )
    };

    let (temp_root, temp_source) = if let Some(path) = overrides.temp_dir.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env("OCCTOOL_TEMP_DIR")) {
        (absolutize(Path::new(&value), &context.cwd), ValueSource::Env)
    } else {
        (context.os_temp_dir.join(TEMP_DIR_NAME), ValueSource::Default)
    };

    let token_dir = temp_root.join("tokens").join("admin");
    ResolvedPaths {
        config_path,
        access_token_path: token_dir.join("token.txt"),
        file_token_path: token_dir.join("file_token.txt"),
        backup_dir: temp_root.join("backups"),
        temp_root,
        config_source,
        temp_source,
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    Ok(())
}

/// Pretty-print `value` to `path`, creating parent directories.
pub fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent_dir(path)?;
    let rendered = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))
}

pub fn read_json_file(path: &Path) -> Result<serde_json::Value> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn unix_timestamp_ms() -> Result<u128> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_millis())
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use serde_json::json;
    use tempfile::tempdir;

    use super::{
        PathOverrides, ResolutionContext, ValueSource, read_json_file, resolve_paths_with_lookup,
        write_json_file,
    };

    fn context(root: &std::path::Path) -> ResolutionContext {
        ResolutionContext {
            cwd: root.join("cwd"),
            os_temp_dir: root.join("tmp"),
        }
    }

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let from_flag = temp.path().join("flag.json");
        let overrides = PathOverrides {
            config: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let env = HashMap::from([(
            "OCCTOOL_CONFIG".to_string(),
            temp.path().join("env.json").to_string_lossy().to_string(),
        )]);

        let resolved =
            resolve_paths_with_lookup(&context(temp.path()), &overrides, |key| env.get(key).cloned());
        assert_eq!(resolved.config_path, from_flag);
        assert_eq!(resolved.config_source, ValueSource::Flag);
    }

    #[test]
    fn resolve_paths_uses_env_then_defaults() {
        let temp = tempdir().expect("tempdir");
        let env = HashMap::from([("OCCTOOL_TEMP_DIR".to_string(), "scratch".to_string())]);
        let resolved = resolve_paths_with_lookup(
            &context(temp.path()),
            &PathOverrides::default(),
            |key| env.get(key).cloned(),
        );
        assert_eq!(resolved.config_source, ValueSource::Default);
        assert_eq!(
            resolved.config_path,
            temp.path().join("cwd").join("occ-tools.project.json")
        );
        assert_eq!(resolved.temp_source, ValueSource::Env);
        assert_eq!(resolved.temp_root, temp.path().join("cwd").join("scratch"));
        assert!(
            resolved
                .access_token_path
                .ends_with("tokens/admin/token.txt")
        );
        assert!(resolved.diagnostics().contains("temp_root="));
    }

    #[test]
    fn default_temp_root_lives_under_os_temp() {
        let temp = tempdir().expect("tempdir");
        let resolved =
            resolve_paths_with_lookup(&context(temp.path()), &PathOverrides::default(), |_| None);
        assert_eq!(
            resolved.temp_root,
            temp.path().join("tmp").join("occ-tools-data")
        );
        assert_eq!(resolved.backup_dir, resolved.temp_root.join("backups"));
    }

    #[test]
    fn write_json_file_creates_parents() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("a").join("b").join("out.json");
        write_json_file(&path, &json!({ "operations": [] })).expect("write");
        let content = fs::read_to_string(&path).expect("read");
        assert!(content.contains("\"operations\""));
        assert_eq!(read_json_file(&path).expect("parse")["operations"], json!([]));
    }
}
