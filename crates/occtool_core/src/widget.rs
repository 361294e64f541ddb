//! Widget code upload: pushes the local template, LESS, locales and
//! JavaScript of a widget type to its descriptor and live instances.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::extension::{ExtensionContext, utc_date};
use crate::files::upload_as;
use crate::parallel::{MAX_PARALLEL_WIDGET_CALLS, run_bounded};
use crate::request::{OccApi, RequestSpec};
use crate::runtime::{read_json_file, unix_timestamp_ms};
use crate::{widget_backup, widget_restore};

/// Local widget folders and the OCC descriptor source each one maps to.
pub const WIDGET_FOLDERS: [(&str, &str); 2] = [("objectedge", "101"), ("oracle", "100")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetFile {
    Js,
    Less,
    Template,
    Locales,
}

impl WidgetFile {
    pub const ALL: [Self; 4] = [Self::Js, Self::Less, Self::Template, Self::Locales];

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "js" => Ok(Self::Js),
            "less" => Ok(Self::Less),
            "template" => Ok(Self::Template),
            "locales" => Ok(Self::Locales),
            other => bail!("Cannot process unknown file: {other} (expected js, less, template or locales)"),
        }
    }
}

/// One widget descriptor as OCC lists it, with the local folder it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct WidgetInfo {
    pub folder: String,
    pub descriptor: Value,
}

impl WidgetInfo {
    pub fn widget_type(&self) -> &str {
        self.descriptor
            .get("widgetType")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    fn descriptor_id(&self) -> Result<&str> {
        match self
            .descriptor
            .get("repositoryId")
            .or_else(|| self.descriptor.get("id"))
            .and_then(Value::as_str)
        {
            Some(id) => Ok(id),
            None => bail!("descriptor of widget {} has no id", self.widget_type()),
        }
    }

    fn instance_ids(&self) -> Vec<String> {
        self.descriptor
            .get("instances")
            .and_then(Value::as_array)
            .map(|instances| {
                instances
                    .iter()
                    .filter_map(|instance| {
                        instance
                            .get("repositoryId")
                            .or_else(|| instance.get("id"))
                            .and_then(Value::as_str)
                            .map(ToString::to_string)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_global(&self) -> bool {
        self.descriptor
            .get("global")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn local_dir(&self, settings: &Settings) -> PathBuf {
        settings
            .storefront_root
            .join("widgets")
            .join(&self.folder)
            .join(self.widget_type())
    }
}

/// Descriptors from every widget folder, optionally narrowed to one widget type.
pub fn info(api: &dyn OccApi, widget_type: Option<&str>) -> Result<Vec<WidgetInfo>> {
    let mut widgets = Vec::new();
    for (folder, source) in WIDGET_FOLDERS {
        info!("Fetching widgets info from {folder} folder...");
        let response = api.request(RequestSpec::get("widgetDescriptors/instances").query("source", source))?;
        let Some(items) = response.get("items").and_then(Value::as_array) else {
            warn!("Undefined response for folder {folder}");
            continue;
        };
        widgets.extend(items.iter().map(|item| WidgetInfo {
            folder: folder.to_string(),
            descriptor: item.clone(),
        }));
    }
    if let Some(widget_type) = widget_type {
        widgets.retain(|widget| widget.widget_type() == widget_type);
    }
    Ok(widgets)
}

/// Stamp written at the top of every uploaded template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub last_uploaded: String,
    pub latest_commit: String,
    pub has_unstaged_changes: bool,
}

impl VersionInfo {
    /// Current time plus the HEAD commit and dirty state of the repository at `repo_root`.
    pub fn from_git(repo_root: &Path) -> Result<Self> {
        let git = |args: &[&str]| -> Option<String> {
            debug!("git {}", args.join(" "));
            let output = Command::new("git").args(args).current_dir(repo_root).output().ok()?;
            output
                .status
                .success()
                .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
        };
        let latest_commit = git(&["rev-parse", "HEAD"]).unwrap_or_else(|| {
            warn!("Unable to read the latest commit in {}", repo_root.display());
            "unknown".to_string()
        });
        let has_unstaged_changes = git(&["status", "--porcelain"]).is_some_and(|status| !status.is_empty());
        Ok(Self {
            last_uploaded: utc_datetime(unix_timestamp_ms()?),
            latest_commit,
            has_unstaged_changes,
        })
    }

    fn template_header(&self) -> String {
        let mut header = format!(
            "<!-- Last uploaded: {} -->\n<!-- Latest commit: {} -->\n",
            self.last_uploaded, self.latest_commit
        );
        if self.has_unstaged_changes {
            header.push_str("<!-- CONTAINS UNSTAGED CHANGES -->\n");
        }
        header
    }
}

fn utc_datetime(timestamp_ms: u128) -> String {
    let seconds = (timestamp_ms / 1_000) % 86_400;
    format!(
        "{} {:02}:{:02}:{:02} UTC",
        utc_date(timestamp_ms),
        seconds / 3_600,
        seconds % 3_600 / 60,
        seconds % 60
    )
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub files: Vec<WidgetFile>,
    /// Single JavaScript files to push instead of the whole `jsFiles` list.
    pub js_files: Vec<String>,
    pub backup: bool,
    pub auto_restore: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            files: WidgetFile::ALL.to_vec(),
            js_files: Vec::new(),
            backup: true,
            auto_restore: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub widget_type: String,
    pub folders: Vec<String>,
    pub instances: usize,
    /// Local files pushed, relative to the widget folder.
    pub uploaded: Vec<String>,
    pub backup_file: Option<PathBuf>,
}

pub fn upload(
    api: &dyn OccApi,
    ctx: &ExtensionContext<'_>,
    widget_type: &str,
    options: &UploadOptions,
    version: &VersionInfo,
) -> Result<UploadReport> {
    let widgets = info(api, Some(widget_type))?;
    if widgets.is_empty() {
        bail!("No widget with name \"{widget_type}\" found in OCC.");
    }
    let backup_file = if options.backup {
        info!("Making a backup of the widget {widget_type}... ");
        Some(widget_backup::backup_to_file(api, widget_type, &ctx.backup_dir)?)
    } else {
        None
    };

    let mut report = UploadReport {
        widget_type: widget_type.to_string(),
        folders: widgets.iter().map(|widget| widget.folder.clone()).collect(),
        instances: widgets.iter().map(|widget| widget.instance_ids().len()).sum(),
        uploaded: Vec::new(),
        backup_file,
    };

    let total = widgets.len();
    for (index, widget) in widgets.iter().enumerate() {
        info!("Uploading widget {widget_type} ({} of {total})...", index + 1);
        match upload_widget_files(api, ctx.settings, widget, options, version) {
            Ok(uploaded) => report.uploaded.extend(uploaded),
            Err(failure) => {
                let failure = failure.context(format!("upload of widget {widget_type}"));
                return Err(match &report.backup_file {
                    Some(path) => widget_restore::recover(api, ctx, widget_type, path, options.auto_restore, failure),
                    None => failure,
                });
            }
        }
    }
    info!("Widget {widget_type} uploaded");
    Ok(report)
}

fn upload_widget_files(
    api: &dyn OccApi,
    settings: &Settings,
    widget: &WidgetInfo,
    options: &UploadOptions,
    version: &VersionInfo,
) -> Result<Vec<String>> {
    let mut uploaded = Vec::new();
    for file in &options.files {
        match file {
            WidgetFile::Js if widget.folder == "oracle" => {}
            WidgetFile::Js => {
                let base = js_base_dir(settings, widget)?;
                uploaded.extend(upload_all_js(api, widget, &base)?);
            }
            WidgetFile::Less => uploaded.push(upload_less(api, settings, widget)?),
            WidgetFile::Template => uploaded.extend(upload_template(api, settings, widget, version)?),
            WidgetFile::Locales => uploaded.extend(upload_locales(api, settings, widget)?),
        }
    }
    if !options.js_files.is_empty() {
        let base = js_base_dir(settings, widget)?;
        for name in &options.js_files {
            let name = name.rsplit('/').next().unwrap_or(name);
            uploaded.push(upload_js(api, widget, &base, name)?);
        }
    }
    Ok(uploaded)
}

/// `js/` of the widget, or its transpiled output when `widgetMeta.json` flags ES6.
fn js_base_dir(settings: &Settings, widget: &WidgetInfo) -> Result<PathBuf> {
    let dir = widget.local_dir(settings);
    let meta_path = dir.join("widgetMeta.json");
    if meta_path.is_file() {
        let meta = read_json_file(&meta_path).context("Error reading widget metadata")?;
        if meta.get("ES6").and_then(Value::as_bool).unwrap_or(false) {
            let transpiled = settings
                .storefront_root
                .join(".occ-transpiled")
                .join("widgets")
                .join(widget.widget_type());
            if !transpiled.is_dir() {
                bail!(
                    "widget {} is flagged ES6 but {} does not exist; transpile it first",
                    widget.widget_type(),
                    transpiled.display()
                );
            }
            return Ok(transpiled);
        }
    }
    Ok(dir.join("js"))
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn upload_template(
    api: &dyn OccApi,
    settings: &Settings,
    widget: &WidgetInfo,
    version: &VersionInfo,
) -> Result<Option<String>> {
    let widget_type = widget.widget_type();
    info!("Uploading \"display.template\" file for widget {widget_type}...");
    let path = widget.local_dir(settings).join("templates").join("display.template");
    let source = format!("{}{}", version.template_header(), read_source(&path)?);

    let spec = if widget.is_global() {
        let Some(instance_id) = widget.instance_ids().into_iter().next() else {
            warn!("No global instance to update the template");
            return Ok(None);
        };
        RequestSpec::put(format!("widgets/{instance_id}/code"))
    } else {
        RequestSpec::put(format!("widgetDescriptors/{}/code", widget.descriptor_id()?))
            .query("updateInstances", "true")
    };
    api.request(spec.json(json!({ "source": source })))
        .with_context(|| format!("{widget_type}: template upload failed"))?;
    info!("Template uploaded for widget {widget_type}.");
    Ok(Some("templates/display.template".to_string()))
}

fn upload_less(api: &dyn OccApi, settings: &Settings, widget: &WidgetInfo) -> Result<String> {
    let widget_type = widget.widget_type();
    let source = read_source(&widget.local_dir(settings).join("less").join("widget.less"))?;

    let instance_ids = widget.instance_ids();
    if instance_ids.is_empty() {
        info!("No instances to upload LESS for widget {widget_type}...");
    } else {
        info!("Uploading LESS of {} instance(s)...", instance_ids.len());
        run_bounded(&instance_ids, MAX_PARALLEL_WIDGET_CALLS, "instance LESS upload", |instance_id| {
            info!("Uploading LESS for instance {instance_id}");
            match api.request(RequestSpec::put(format!("widgets/{instance_id}/less")).json(json!({ "source": source }))) {
                Ok(_) => info!("Uploaded LESS for instance {instance_id}"),
                Err(failure) => error!("LESS upload for instance {instance_id} failed: {failure:#}"),
            }
            Ok(())
        })?;
    }

    api.request(
        RequestSpec::put(format!("widgetDescriptors/{}/less", widget.descriptor_id()?))
            .json(json!({ "source": source })),
    )
    .with_context(|| format!("{widget_type}: LESS upload failed"))?;
    info!("LESS uploaded for widget {widget_type}.");
    Ok("less/widget.less".to_string())
}

fn locale_names(locales_dir: &Path) -> Result<Vec<String>> {
    let mut names = fs::read_dir(locales_dir)
        .with_context(|| format!("failed to read {}", locales_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

/// Local `ns.*.json` payloads keep the instance's non-empty `custom` strings.
fn upload_locales(api: &dyn OccApi, settings: &Settings, widget: &WidgetInfo) -> Result<Vec<String>> {
    let widget_type = widget.widget_type();
    let locales_dir = widget.local_dir(settings).join("locales");
    let names = locale_names(&locales_dir)?;
    let resource = widget
        .descriptor
        .get("i18nresources")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .unwrap_or(widget_type);
    let file_name = format!("ns.{resource}.json");
    let payloads = names
        .iter()
        .map(|locale| Ok((locale.clone(), read_json_file(&locales_dir.join(locale).join(&file_name))?)))
        .collect::<Result<Vec<_>>>()?;

    let instance_ids = widget.instance_ids();
    info!("Uploading locales for {} instances...", instance_ids.len());
    for instance_id in &instance_ids {
        info!("Uploading locales for instance {instance_id}");
        run_bounded(&payloads, MAX_PARALLEL_WIDGET_CALLS, "locale upload", |(locale, payload)| {
            let mut payload = payload.clone();
            match api.request(RequestSpec::get(format!("widgets/{instance_id}/locale/{locale}"))) {
                Ok(current) => {
                    let custom = current
                        .pointer("/localeData/custom")
                        .filter(|custom| custom.as_object().is_some_and(|map| !map.is_empty()));
                    if let (Some(custom), Some(map)) = (custom, payload.as_object_mut()) {
                        map.insert("custom".to_string(), custom.clone());
                    }
                }
                Err(failure) => {
                    warn!("Could not get locale \"{locale}\" for instance {instance_id}: {failure:#}");
                }
            }
            if let Err(failure) = api.request(
                RequestSpec::put(format!("widgets/{instance_id}/locale/{locale}"))
                    .header("X-CCAsset-Language", locale.as_str())
                    .json(payload),
            ) {
                warn!("Could not update locale \"{locale}\" for instance {instance_id}: {failure:#}");
            }
            Ok(())
        })?;
        info!("Uploaded locales for instance {instance_id}");
    }
    info!("All locales uploaded for widget {widget_type}.");
    Ok(names
        .iter()
        .map(|locale| format!("locales/{locale}/{file_name}"))
        .collect())
}

/// Every file OCC lists under the descriptor's `jsFiles`, plus local source maps.
fn upload_all_js(api: &dyn OccApi, widget: &WidgetInfo, base: &Path) -> Result<Vec<String>> {
    let descriptor_id = widget.descriptor_id()?;
    let listed = api.request(RequestSpec::get(format!("widgetDescriptors/{descriptor_id}/javascript")))?;
    let names = listed
        .get("jsFiles")
        .and_then(Value::as_array)
        .map(|files| {
            files
                .iter()
                .filter_map(|file| file.get("name").and_then(Value::as_str))
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let uploaded = run_bounded(&names, MAX_PARALLEL_WIDGET_CALLS, "widget javascript upload", |name| {
        let mut uploaded = vec![upload_js(api, widget, base, name)?];
        uploaded.extend(upload_source_maps(api, widget, base, name)?);
        Ok(uploaded)
    })?;
    info!("All javascript files uploaded.");
    Ok(uploaded.into_iter().flatten().collect())
}

fn upload_js(api: &dyn OccApi, widget: &WidgetInfo, base: &Path, name: &str) -> Result<String> {
    let widget_type = widget.widget_type();
    info!("Uploading {name} of widget {widget_type}...");
    let source = read_source(&base.join(name))?;
    api.request(
        RequestSpec::put(format!("widgetDescriptors/{}/javascript/{name}", widget.descriptor_id()?))
            .json(json!({ "source": source })),
    )
    .with_context(|| format!("{widget_type}: upload of {name} failed"))?;
    Ok(format!("js/{name}"))
}

/// Maps go to `/oe-source-maps/<type>/` since OCC minifies what it serves from `js/`.
fn upload_source_maps(api: &dyn OccApi, widget: &WidgetInfo, base: &Path, name: &str) -> Result<Vec<String>> {
    let stem = name.strip_suffix(".js").unwrap_or(name);
    let mut uploaded = Vec::new();
    for map_name in [format!("{stem}.js.map"), format!("{stem}.min.js.map")] {
        let path = base.join(&map_name);
        if !path.is_file() {
            continue;
        }
        info!("Uploading source map \"{map_name}\" file...");
        upload_as(api, &path, &format!("/oe-source-maps/{}/{map_name}", widget.widget_type()))?;
        uploaded.push(format!("js/{map_name}"));
    }
    Ok(uploaded)
}
