use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::Settings;
use crate::files::upload_as;
use crate::request::{OccApi, RequestSpec};
use crate::runtime::{ResolvedPaths, ensure_parent_dir, normalize_for_display, unix_timestamp_ms};
use crate::site_settings::{self, SiteSettingsSnapshot};
use crate::transport::FormPart;
use crate::worksets::items;
use crate::{widget_backup, widget_restore};

const DEVELOPER_ID: &str = "999999";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtensionKind {
    Widget,
    AppLevel,
    Config,
    Gateway,
}

impl ExtensionKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "widget" => Ok(Self::Widget),
            "app-level" | "appLevel" => Ok(Self::AppLevel),
            "config" => Ok(Self::Config),
            "gateway" => Ok(Self::Gateway),
            other => bail!("unknown extension type \"{other}\" (expected widget, app-level, config or gateway)"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Widget => "widget",
            Self::AppLevel => "app-level",
            Self::Config => "config",
            Self::Gateway => "gateway",
        }
    }

    pub fn source_dir(self, settings: &Settings, name: &str) -> PathBuf {
        let root = &settings.storefront_root;
        match self {
            Self::Widget => root.join("widgets").join("objectedge").join(name),
            Self::AppLevel => root.join("app-level").join(name),
            Self::Config => root.join("settings").join("config").join(name),
            Self::Gateway => root.join("settings").join("gateway").join(name),
        }
    }

    /// Folder the sources occupy inside the extension zip.
    fn zip_prefix(self, name: &str) -> String {
        match self {
            Self::Widget => format!("widget/{name}/"),
            Self::AppLevel => "global/".to_string(),
            Self::Config => format!("config/{name}/"),
            Self::Gateway => format!("gateway/{name}/"),
        }
    }
}

/// Project settings plus the scratch and backup folders extension work writes to.
#[derive(Debug, Clone)]
pub struct ExtensionContext<'a> {
    pub settings: &'a Settings,
    pub work_dir: PathBuf,
    pub backup_dir: PathBuf,
}

impl<'a> ExtensionContext<'a> {
    pub fn new(settings: &'a Settings, paths: &ResolvedPaths) -> Self {
        Self {
            settings,
            work_dir: paths.temp_root.join("extensions"),
            backup_dir: paths.backup_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub name: String,
    pub kind: ExtensionKind,
    pub application_id: String,
    pub remote_file: String,
    pub files: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpgradeReport {
    pub name: String,
    pub kind: ExtensionKind,
    pub backup_file: Option<PathBuf>,
    pub removed_extension: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SseUploadReport {
    pub name: String,
    pub files: usize,
}

fn ensure_source(ctx: &ExtensionContext<'_>, kind: ExtensionKind, name: &str) -> Result<PathBuf> {
    info!("Checking path consistency");
    let dir = kind.source_dir(ctx.settings, name);
    if !dir.is_dir() {
        error!("The {} does not exist locally", kind.as_str());
        bail!("Path not found: {}", dir.display());
    }
    Ok(dir)
}

fn item_id(item: &Value) -> Option<String> {
    item.get("repositoryId")
        .or_else(|| item.get("id"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

/// Application id registered for `name`, creating one when missing.
pub fn application_id(api: &dyn OccApi, name: &str) -> Result<String> {
    let response = api.request(RequestSpec::get("applicationIds"))?;
    if let Some(existing) = items(&response)
        .iter()
        .find(|item| item.get("name").and_then(Value::as_str) == Some(name))
        .and_then(item_id)
    {
        return Ok(existing);
    }

    let created = api.request(
        RequestSpec::post("applicationIds").json(json!({ "type": "extension", "name": name })),
    )?;
    let Some(id) = item_id(&created) else {
        bail!("OCC did not return an application id for {name}");
    };
    info!("New extension ID generated {id}");
    Ok(id)
}

/// Installed extension whose name matches, if any.
pub fn find_installed(api: &dyn OccApi, name: &str) -> Result<Option<Value>> {
    let response = api.request(RequestSpec::get("extensions"))?;
    Ok(items(&response)
        .into_iter()
        .find(|item| item.get("name").and_then(Value::as_str) == Some(name)))
}

pub fn delete(api: &dyn OccApi, extension: &Value) -> Result<String> {
    let Some(id) = item_id(extension) else {
        bail!("extension payload is missing its id: {extension}");
    };
    info!("Deactivating extension {id}");
    api.request(RequestSpec::post(format!("extensions/{id}/unpublish")))?;
    info!("Deleting extension {id}");
    api.request(RequestSpec::delete(format!("extensions/{id}")))?;
    Ok(id)
}

pub fn upload(
    api: &dyn OccApi,
    ctx: &ExtensionContext<'_>,
    kind: ExtensionKind,
    name: &str,
) -> Result<UploadReport> {
    let source = ensure_source(ctx, kind, name)?;
    let application_id = application_id(api, name)?;

    let timestamp = unix_timestamp_ms()?;
    let ext_json = serde_json::to_vec_pretty(&json!({
        "extensionID": application_id,
        "developerID": DEVELOPER_ID,
        "createdBy": ctx.settings.credentials.username,
        "name": name,
        "version": 1,
        "timeCreated": utc_date(timestamp),
        "description": format!("{} {name}", kind.as_str()),
    }))?;

    let zip_path = ctx.work_dir.join(format!("{name}.zip"));
    let files = zip_directory(
        &source,
        &kind.zip_prefix(name),
        &[("ext.json", ext_json)],
        &[],
        &zip_path,
    )?;

    let remote_file = format!("{timestamp}_{name}.zip");
    upload_as(api, &zip_path, &format!("/extensions/{remote_file}"))?;

    let response = api.request(RequestSpec::post("extensions").json(json!({ "name": remote_file })))?;
    let messages = |key: &str| {
        response
            .get(key)
            .and_then(Value::as_array)
            .map(|list| list.iter().map(message_text).collect::<Vec<_>>())
            .unwrap_or_default()
    };
    if !response.get("success").and_then(Value::as_bool).unwrap_or(false) {
        for problem in messages("errors") {
            error!("{problem}");
        }
        bail!("Error uploading the extension {name}");
    }
    let warnings = messages("warnings");
    for warning in &warnings {
        warn!("{warning}");
    }
    info!("Extension was uploaded");
    let _ = fs::remove_file(&zip_path);

    Ok(UploadReport {
        name: name.to_string(),
        kind,
        application_id,
        remote_file,
        files,
        warnings,
    })
}

/// State taken before an extension is removed so it can be replayed after the upload.
enum Backup {
    Widget(PathBuf),
    SiteSettings(PathBuf, SiteSettingsSnapshot),
}

impl Backup {
    fn path(&self) -> &Path {
        match self {
            Self::Widget(path) | Self::SiteSettings(path, _) => path,
        }
    }
}

fn take_backup(
    api: &dyn OccApi,
    ctx: &ExtensionContext<'_>,
    kind: ExtensionKind,
    name: &str,
) -> Result<Option<Backup>> {
    Ok(match kind {
        ExtensionKind::Widget => Some(Backup::Widget(widget_backup::backup_to_file(
            api,
            name,
            &ctx.backup_dir,
        )?)),
        ExtensionKind::Config | ExtensionKind::Gateway => {
            let (path, snapshot) =
                site_settings::backup_to_file(api, kind.as_str(), name, &ctx.backup_dir)?;
            Some(Backup::SiteSettings(path, snapshot))
        }
        ExtensionKind::AppLevel => None,
    })
}

fn restore_backup(api: &dyn OccApi, ctx: &ExtensionContext<'_>, name: &str, backup: &Backup) -> Result<()> {
    match backup {
        Backup::Widget(path) => widget_restore::restore_from_file(api, ctx, name, path).map(|_| ()),
        Backup::SiteSettings(_, snapshot) => site_settings::restore(api, snapshot).map(|_| ()),
    }
}

/// Backup, remove, re-upload and restore each named extension in turn.
pub fn upgrade(
    api: &dyn OccApi,
    ctx: &ExtensionContext<'_>,
    kind: ExtensionKind,
    names: &[String],
    auto_restore: bool,
) -> Result<Vec<UpgradeReport>> {
    names
        .iter()
        .map(|name| upgrade_one(api, ctx, kind, name, auto_restore))
        .collect()
}

fn upgrade_one(
    api: &dyn OccApi,
    ctx: &ExtensionContext<'_>,
    kind: ExtensionKind,
    name: &str,
    auto_restore: bool,
) -> Result<UpgradeReport> {
    info!("Upgrading {} {name}", kind.as_str());
    ensure_source(ctx, kind, name)?;
    let backup = take_backup(api, ctx, kind, name)?;

    let attempt = || -> Result<Option<String>> {
        let removed = match find_installed(api, name)? {
            Some(extension) => Some(delete(api, &extension)?),
            None => None,
        };
        upload(api, ctx, kind, name)?;
        if let Some(backup) = &backup {
            restore_backup(api, ctx, name, backup)?;
        }
        Ok(removed)
    };

    match attempt() {
        Ok(removed_extension) => Ok(UpgradeReport {
            name: name.to_string(),
            kind,
            backup_file: backup.as_ref().map(|backup| backup.path().to_path_buf()),
            removed_extension,
        }),
        Err(failure) => {
            let Some(backup) = backup else {
                return Err(failure);
            };
            let failure = failure.context(format!("upgrade of {} {name}", kind.as_str()));
            match backup {
                Backup::Widget(path) => Err(widget_restore::recover(api, ctx, name, &path, auto_restore, failure)),
                Backup::SiteSettings(path, _) => {
                    Err(failure.context(format!("backup stored at {}", path.display())))
                }
            }
        }
    }
}

/// Server-side extension folders, minus the `logs` folder.
pub fn list_local_sse(settings: &Settings) -> Result<Vec<String>> {
    let root = settings.server_side_root();
    let mut names = fs::read_dir(&root)
        .with_context(|| format!("failed to read {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "logs")
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

fn sse_ignore_patterns(source: &Path) -> Result<Vec<glob::Pattern>> {
    let mut raw = vec!["package-lock.json".to_string()];
    let package_json = source.join("package.json");
    if package_json.is_file() {
        let package = crate::runtime::read_json_file(&package_json)?;
        if let Some(config) = package.get("occToolsConfig").and_then(Value::as_object) {
            for key in config.keys().filter(|key| key.as_str() != "ignore") {
                warn!("Unrecognized SSE config: {key}");
            }
            match config.get("ignore") {
                Some(Value::String(pattern)) => raw.push(pattern.clone()),
                Some(Value::Array(patterns)) if patterns.iter().all(Value::is_string) => {
                    raw.extend(patterns.iter().filter_map(Value::as_str).map(ToString::to_string));
                }
                Some(_) => warn!(
                    "Invalid value passed to SSE config: ignore. It should be an array of strings or an string."
                ),
                None => {}
            }
        }
    }
    raw.iter()
        .map(|pattern| {
            glob::Pattern::new(pattern).with_context(|| format!("invalid SSE ignore pattern {pattern}"))
        })
        .collect()
}

pub fn upload_sse(api: &dyn OccApi, ctx: &ExtensionContext<'_>, name: &str) -> Result<SseUploadReport> {
    info!("Preparing upload for SSE \"{name}\"...");
    let source = ctx.settings.server_side_root().join(name);
    if !source.is_dir() {
        bail!("Extension does not exist locally: {}", source.display());
    }
    let ignore = sse_ignore_patterns(&source)?;

    info!("Zipping files to upload...");
    let zip_path = ctx.work_dir.join(format!("{name}.zip"));
    let files = zip_directory(&source, "", &[], &ignore, &zip_path)?;

    info!("Uploading {name} server side extension...");
    let response = api.request(RequestSpec::post("serverExtensions").multipart(vec![
        FormPart::Text {
            name: "filename".to_string(),
            value: format!("{name}.zip"),
        },
        FormPart::Text {
            name: "uploadType".to_string(),
            value: "extensions".to_string(),
        },
        FormPart::Text {
            name: "force".to_string(),
            value: "true".to_string(),
        },
        FormPart::File {
            name: "fileUpload".to_string(),
            path: zip_path.clone(),
        },
    ]))?;
    if response.get("success").and_then(Value::as_bool) == Some(false) {
        bail!("Error uploading server side extension {name}: {response}");
    }

    info!("Removing temporary files...");
    let _ = fs::remove_file(&zip_path);
    Ok(SseUploadReport {
        name: name.to_string(),
        files,
    })
}

/// Upload several SSEs in order, or every local one when `names` is empty.
pub fn upload_sses(
    api: &dyn OccApi,
    ctx: &ExtensionContext<'_>,
    names: &[String],
    skip: &[String],
) -> Result<Vec<SseUploadReport>> {
    let names = if names.is_empty() {
        list_local_sse(ctx.settings)?
    } else {
        names.to_vec()
    };
    names
        .iter()
        .filter(|name| !skip.contains(name))
        .map(|name| upload_sse(api, ctx, name))
        .collect()
}

/// Write every file under `source` into a zip at `output`, prefixing entry names.
fn zip_directory(
    source: &Path,
    prefix: &str,
    extra: &[(&str, Vec<u8>)],
    ignore: &[glob::Pattern],
    output: &Path,
) -> Result<usize> {
    ensure_parent_dir(output)?;
    let file = fs::File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, content) in extra {
        writer.start_file(*name, options)?;
        writer.write_all(content)?;
    }

    let mut count = 0;
    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", source.display()))?;
        if !entry.file_type().is_file() || entry.path() == output {
            continue;
        }
        let relative = normalize_for_display(entry.path().strip_prefix(source)?);
        if relative.ends_with(".zip") || ignore.iter().any(|pattern| pattern.matches(&relative)) {
            continue;
        }
        let content = fs::read(entry.path())
            .with_context(|| format!("failed to read {}", entry.path().display()))?;
        writer.start_file(format!("{prefix}{relative}"), options)?;
        writer.write_all(&content)?;
        count += 1;
    }
    writer.finish()?;
    Ok(count)
}

fn message_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

/// `YYYY-MM-DD` for a UTC millisecond timestamp.
pub(crate) fn utc_date(timestamp_ms: u128) -> String {
    let days = (timestamp_ms / 86_400_000) as i64;
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let day_of_era = z.rem_euclid(146_097);
    let year_of_era = (day_of_era - day_of_era / 1_460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let mp = (5 * day_of_year + 2) / 153;
    let day = day_of_year - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = year_of_era + era * 400 + i64::from(month <= 2);
    format!("{year:04}-{month:02}-{day:02}")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use reqwest::Method;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::config::Settings;
    use crate::test_support::{self, MockApi};
    use crate::transport::RequestBody;

    fn settings(temp: &TempDir) -> Settings {
        test_support::settings(temp.path())
    }

    fn context<'a>(settings: &'a Settings, temp: &TempDir) -> ExtensionContext<'a> {
        ExtensionContext {
            settings,
            work_dir: temp.path().join("work"),
            backup_dir: temp.path().join("backups"),
        }
    }

    fn zip_names(path: &Path) -> Vec<String> {
        let file = fs::File::open(path).expect("open zip");
        let archive = zip::ZipArchive::new(file).expect("zip");
        let mut names = archive.file_names().map(ToString::to_string).collect::<Vec<_>>();
        names.sort();
        names
    }

    #[test]
    fn kinds_map_to_storefront_folders() {
        let temp = tempdir().expect("tempdir");
        let settings = settings(&temp);
        assert_eq!(ExtensionKind::parse("appLevel").expect("kind"), ExtensionKind::AppLevel);
        assert!(ExtensionKind::parse("theme").is_err());
        assert!(
            ExtensionKind::Gateway
                .source_dir(&settings, "pay")
                .ends_with("storefront/settings/gateway/pay")
        );
        assert!(
            ExtensionKind::Widget
                .source_dir(&settings, "oeCart")
                .ends_with("storefront/widgets/objectedge/oeCart")
        );
    }

    #[test]
    fn utc_date_formats_calendar_day() {
        assert_eq!(utc_date(0), "1970-01-01");
        assert_eq!(utc_date(951_782_400_000), "2000-02-29");
        assert_eq!(utc_date(1_791_158_400_000), "2026-10-05");
    }

    #[test]
    fn zip_directory_prefixes_and_ignores() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("src");
        fs::create_dir_all(source.join("js")).expect("mkdir");
        fs::create_dir_all(source.join("node_modules/left-pad")).expect("mkdir");
        fs::write(source.join("widget.json"), "{}").expect("write");
        fs::write(source.join("js/main.js"), "x").expect("write");
        fs::write(source.join("node_modules/left-pad/index.js"), "x").expect("write");
        fs::write(source.join("old.zip"), "x").expect("write");

        let output = temp.path().join("out/w.zip");
        let ignore = vec![glob::Pattern::new("node_modules/**").expect("pattern")];
        let count = zip_directory(&source, "widget/w/", &[("ext.json", b"{}".to_vec())], &ignore, &output)
            .expect("zip");
        assert_eq!(count, 2);
        assert_eq!(
            zip_names(&output),
            vec!["ext.json", "widget/w/js/main.js", "widget/w/widget.json"]
        );
    }

    #[test]
    fn upload_creates_application_and_posts_extension() {
        let temp = tempdir().expect("tempdir");
        let settings = settings(&temp);
        let dir = ExtensionKind::Config.source_dir(&settings, "oeSettings");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("config.json"), "{}").expect("write");

        let api = MockApi::new()
            .on(Method::GET, "applicationIds", json!({ "items": [{ "name": "other", "repositoryId": "a0" }] }))
            .on(Method::POST, "applicationIds", json!({ "repositoryId": "a1" }))
            .on(Method::PUT, "files", json!({ "token": "t" }))
            .on(Method::POST, "files/t", json!({ "success": true }))
            .on(Method::POST, "extensions", json!({ "success": true, "warnings": ["minor"] }));

        let ctx = context(&settings, &temp);
        let report = upload(&api, &ctx, ExtensionKind::Config, "oeSettings").expect("upload");
        assert_eq!(report.application_id, "a1");
        assert_eq!(report.files, 1);
        assert_eq!(report.warnings, vec!["minor"]);
        assert!(report.remote_file.ends_with("_oeSettings.zip"));

        let reserved = &api.bodies(Method::PUT, "files")[0];
        assert_eq!(reserved["filename"], format!("/extensions/{}", report.remote_file));
        assert_eq!(api.bodies(Method::POST, "extensions")[0]["name"], report.remote_file);
    }

    #[test]
    fn upload_reports_platform_errors() {
        let temp = tempdir().expect("tempdir");
        let settings = settings(&temp);
        let dir = ExtensionKind::AppLevel.source_dir(&settings, "oeCore");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("oeCore.js"), "x").expect("write");

        let api = MockApi::new()
            .on(Method::GET, "applicationIds", json!({ "items": [{ "name": "oeCore", "repositoryId": "a9" }] }))
            .on(Method::PUT, "files", json!({ "token": "t" }))
            .on(Method::POST, "files/t", json!({ "success": true }))
            .on(Method::POST, "extensions", json!({ "success": false, "errors": [{ "message": "bad ext.json" }] }));
        let ctx = context(&settings, &temp);
        let error = upload(&api, &ctx, ExtensionKind::AppLevel, "oeCore").expect_err("must fail");
        assert!(error.to_string().contains("Error uploading the extension oeCore"));
        assert_eq!(api.count(Method::POST, "applicationIds"), 0);
    }

    #[test]
    fn missing_source_folder_fails_before_any_call() {
        let temp = tempdir().expect("tempdir");
        let settings = settings(&temp);
        let api = MockApi::new();
        let ctx = context(&settings, &temp);
        let error = upload(&api, &ctx, ExtensionKind::Gateway, "nope").expect_err("must fail");
        assert!(error.to_string().starts_with("Path not found"));
        assert!(api.all_calls().is_empty());
    }

    #[test]
    fn upgrade_of_config_removes_installed_extension_first() {
        let temp = tempdir().expect("tempdir");
        let settings = settings(&temp);
        let dir = ExtensionKind::Config.source_dir(&settings, "oeSettings");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("config.json"), "{}").expect("write");

        let api = MockApi::new()
            .on(Method::GET, "sites", json!({ "items": [] }))
            .on(Method::GET, "extensions", json!({ "items": [{ "name": "oeSettings", "repositoryId": "e1" }] }))
            .on(Method::POST, "extensions/e1/unpublish", json!({}))
            .on(Method::DELETE, "extensions/e1", json!({}))
            .on(Method::GET, "applicationIds", json!({ "items": [{ "name": "oeSettings", "repositoryId": "a1" }] }))
            .on(Method::PUT, "files", json!({ "token": "t" }))
            .on(Method::POST, "files/t", json!({ "success": true }))
            .on(Method::POST, "extensions", json!({ "success": true }));

        let ctx = context(&settings, &temp);
        let reports = upgrade(&api, &ctx, ExtensionKind::Config, &["oeSettings".to_string()], false)
            .expect("upgrade");
        assert_eq!(reports[0].removed_extension.as_deref(), Some("e1"));
        assert!(reports[0].backup_file.as_ref().is_some_and(|path| path.is_file()));
        let order = api
            .all_calls()
            .into_iter()
            .map(|(method, path)| format!("{method} {path}"))
            .collect::<Vec<_>>();
        let unpublish = order.iter().position(|call| call == "POST extensions/e1/unpublish").expect("unpublish");
        let posted = order.iter().position(|call| call == "POST extensions").expect("post");
        assert!(unpublish < posted);
    }

    #[test]
    fn upgrade_of_gateway_restores_site_settings_after_upload() {
        let temp = tempdir().expect("tempdir");
        let settings = settings(&temp);
        let dir = ExtensionKind::Gateway.source_dir(&settings, "pay");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("gateway.json"), "{}").expect("write");

        let api = MockApi::new()
            .on(
                Method::GET,
                "sites",
                json!({ "items": [{ "repositoryId": "siteUS" }, { "repositoryId": "siteCA" }] }),
            )
            .on(Method::GET, "sitesettings/pay", json!({ "data": { "merchant": "us-1" } }))
            .on(Method::GET, "sitesettings/pay", json!({ "data": null }))
            .on(Method::GET, "extensions", json!({ "items": [{ "name": "pay", "repositoryId": "e7" }] }))
            .on(Method::POST, "extensions/e7/unpublish", json!({}))
            .on(Method::DELETE, "extensions/e7", json!({}))
            .on(Method::GET, "applicationIds", json!({ "items": [{ "name": "pay", "repositoryId": "a7" }] }))
            .on(Method::PUT, "files", json!({ "token": "t" }))
            .on(Method::POST, "files/t", json!({ "success": true }))
            .on(Method::POST, "extensions", json!({ "success": true }))
            .on(Method::PUT, "sitesettings/pay", json!({ "success": true }));

        let ctx = context(&settings, &temp);
        upgrade(&api, &ctx, ExtensionKind::Gateway, &["pay".to_string()], true).expect("upgrade");

        let restored = api.calls(Method::PUT, "sitesettings/pay");
        assert_eq!(restored.len(), 1);
        assert!(restored[0].headers.contains(&("x-ccsite".to_string(), "siteUS".to_string())));
        assert_eq!(api.bodies(Method::PUT, "sitesettings/pay")[0], json!({ "merchant": "us-1" }));

        let order = api
            .all_calls()
            .into_iter()
            .map(|(method, path)| format!("{method} {path}"))
            .collect::<Vec<_>>();
        let snapshot = order.iter().position(|call| call == "GET sitesettings/pay").expect("get");
        let deleted = order.iter().position(|call| call == "DELETE extensions/e7").expect("delete");
        let uploaded = order.iter().position(|call| call == "POST extensions").expect("post");
        let restore = order.iter().position(|call| call == "PUT sitesettings/pay").expect("put");
        assert!(snapshot < deleted && uploaded < restore);
    }

    #[test]
    fn upload_sse_zips_with_package_ignores() {
        let temp = tempdir().expect("tempdir");
        let settings = settings(&temp);
        let source = settings.server_side_root().join("oe-payments");
        fs::create_dir_all(source.join("tests")).expect("mkdir");
        fs::write(
            source.join("package.json"),
            r#"{ "name": "oe-payments", "occToolsConfig": { "ignore": ["tests/**"] } }"#,
        )
        .expect("write");
        fs::write(source.join("package-lock.json"), "{}").expect("write");
        fs::write(source.join("index.js"), "x").expect("write");
        fs::write(source.join("tests/a.test.js"), "x").expect("write");
        fs::create_dir_all(settings.server_side_root().join("logs")).expect("mkdir");

        let api = MockApi::new().on(Method::POST, "serverExtensions", json!({ "success": true }));
        let ctx = context(&settings, &temp);

        assert_eq!(list_local_sse(&settings).expect("list"), vec!["oe-payments"]);
        let report = upload_sse(&api, &ctx, "oe-payments").expect("upload");
        assert_eq!(report.files, 2);

        let call = &api.calls(Method::POST, "serverExtensions")[0];
        let RequestBody::Multipart(parts) = &call.body else {
            panic!("expected multipart body");
        };
        assert!(parts.contains(&FormPart::Text {
            name: "force".to_string(),
            value: "true".to_string(),
        }));
    }
}
