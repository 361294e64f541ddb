use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

use crate::config::{FileRule, Settings, file_rule_for};
use crate::parallel::{MAX_PARALLEL_UPLOADS, run_bounded};
use crate::request::{OccApi, RequestSpec};
use crate::runtime::normalize_for_display;

/// Where a local storefront file lands on OCC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMapping {
    pub filename: String,
    pub file_path: PathBuf,
    pub folder: String,
    pub thirdparty: bool,
    pub remote: String,
    pub remote_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileUploadReport {
    pub uploaded: Vec<FileMapping>,
}

/// Storefront `files/` directory, the root of every uploadable asset.
pub fn asset_files_root(settings: &Settings) -> PathBuf {
    settings.storefront_root.join("files")
}

/// Root a file is mapped against: `files/` for assets, the storefront root for
/// anything living elsewhere (images, page tags).
pub fn mapping_root(settings: &Settings, file: &Path) -> PathBuf {
    let assets_root = asset_files_root(settings);
    if file.starts_with(&assets_root) {
        assets_root
    } else {
        settings.storefront_root.clone()
    }
}

pub fn generate_file_path_mapping(
    file_path: &Path,
    assets_root: &Path,
    store_url: &str,
    settings_folder: Option<&str>,
) -> Result<FileMapping> {
    let relative = file_path.strip_prefix(assets_root).with_context(|| {
        format!(
            "{} is not inside {}",
            file_path.display(),
            assets_root.display()
        )
    })?;
    let base_path = normalize_for_display(relative);
    let file_name = relative
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base_folder = base_path.split('/').next().unwrap_or_default().to_string();

    let mut folder = match settings_folder {
        Some(settings_folder) => format!("/{settings_folder}/{file_name}"),
        None => relative
            .parent()
            .map(normalize_for_display)
            .unwrap_or_default(),
    };

    let thirdparty = base_folder == "thirdparty";
    let remote_path = if thirdparty {
        base_path
            .strip_prefix("thirdparty")
            .unwrap_or(&base_path)
            .to_string()
    } else {
        folder = base_folder;
        format!("/file/{base_path}")
    };

    let filename = if settings_folder.is_some() {
        folder.clone()
    } else if folder.is_empty() {
        file_name
    } else {
        format!("{folder}/{file_name}")
    };

    Ok(FileMapping {
        filename,
        file_path: file_path.to_path_buf(),
        folder,
        thirdparty,
        remote: format!("{}{}", store_url.trim_end_matches('/'), remote_path),
        remote_path,
    })
}

/// Two-step OCC upload: reserve a token, then post the base64 payload.
pub fn upload_file(api: &dyn OccApi, mapping: &FileMapping, transpile: bool) -> Result<Value> {
    let init = api.request(
        RequestSpec::put("files").json(json!({ "filename": mapping.filename, "segments": 1 })),
    )?;
    let Some(token) = init.get("token").and_then(Value::as_str) else {
        bail!("OCC did not return an upload token for {}", mapping.filename);
    };

    let content = read_upload_content(&mapping.file_path, transpile)?;
    api.request(RequestSpec::post(format!("files/{token}")).json(json!({
        "filename": mapping.filename,
        "token": token,
        "index": 0,
        "file": STANDARD.encode(content),
    })))
}

/// Upload a local file under an explicit OCC file name, such as `/extensions/x.zip`.
pub fn upload_as(api: &dyn OccApi, file_path: &Path, filename: &str) -> Result<Value> {
    let mapping = FileMapping {
        filename: filename.to_string(),
        file_path: file_path.to_path_buf(),
        folder: filename
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string(),
        thirdparty: false,
        remote: String::new(),
        remote_path: filename.to_string(),
    };
    upload_file(api, &mapping, false)
}

fn read_upload_content(path: &Path, transpile: bool) -> Result<Vec<u8>> {
    let content = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
    if transpile && is_json {
        let parsed: Value = serde_json::from_slice(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        return serde_json::to_vec(&parsed)
            .with_context(|| format!("failed to minify {}", path.display()));
    }
    Ok(content)
}

/// Expand a glob pattern relative to `root` into files.
pub fn resolve_files(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full_pattern = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        normalize_for_display(&root.join(pattern))
    };
    let mut files = glob::glob(&full_pattern)
        .with_context(|| format!("invalid file pattern {pattern}"))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();
    files.sort();
    if files.is_empty() {
        bail!("No file matching the pattern {pattern}");
    }
    Ok(files)
}

/// `transpile` flag of the first `files-config` rule matching the file, if any.
pub fn transpile_setting(rules: &[FileRule], storefront_root: &Path, file: &Path) -> Option<bool> {
    let relative = file.strip_prefix(storefront_root).unwrap_or(file);
    file_rule_for(rules, &normalize_for_display(relative)).map(|rule| rule.transpile)
}

pub fn upload_files(
    api: &dyn OccApi,
    settings: &Settings,
    pattern: &str,
    settings_folder: Option<&str>,
) -> Result<FileUploadReport> {
    let files = resolve_files(&settings.storefront_root, pattern)?;
    info!("Total Files Found: {}", files.len());

    let mappings = files
        .iter()
        .map(|file| {
            generate_file_path_mapping(
                file,
                &mapping_root(settings, file),
                &settings.endpoints.store,
                settings_folder,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    run_bounded(&mappings, MAX_PARALLEL_UPLOADS, "file upload", |mapping| {
        info!(
            "Uploading file \"{}\" to folder \"{}\" ({})",
            normalize_for_display(&mapping.file_path),
            mapping.folder,
            mapping.remote
        );
        let transpile = transpile_setting(
            &settings.files_config,
            &settings.storefront_root,
            &mapping.file_path,
        )
        .unwrap_or(false);
        upload_file(api, mapping, transpile)
    })?;

    Ok(FileUploadReport { uploaded: mappings })
}
