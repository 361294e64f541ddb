use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::config::{PageTagConfig, Settings, file_rule_for};
use crate::files::{generate_file_path_mapping, mapping_root, resolve_files, upload_file};
use crate::request::{OccApi, RequestSpec, error_status};
use crate::runtime::normalize_for_display;
use crate::worksets::items;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PageTagArea {
    Head,
    BodyStart,
    BodyEnd,
}

impl PageTagArea {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "head" => Ok(Self::Head),
            "body-start" => Ok(Self::BodyStart),
            "body-end" => Ok(Self::BodyEnd),
            other => bail!(
                "The provided area \"{other}\" is not valid (expected head, body-start or body-end)"
            ),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::BodyStart => "body-start",
            Self::BodyEnd => "body-end",
        }
    }

    fn api_path(self) -> &'static str {
        match self {
            Self::Head => "headTags",
            Self::BodyStart => "bodyStartTags",
            Self::BodyEnd => "bodyEndTags",
        }
    }

    /// Area taken from the folder after `page-tags` in the file path.
    pub fn from_file(file: &Path) -> Result<Self> {
        let segments = file
            .components()
            .filter_map(|component| match component {
                Component::Normal(value) => Some(value.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>();
        let Some(index) = segments.iter().position(|segment| segment == "page-tags") else {
            bail!(
                "There is no way to determine the \"area\" since no area argument was provided and the file is not placed inside the /page-tags/[area] path."
            );
        };
        match segments.get(index + 1) {
            Some(area) => Self::parse(area),
            None => bail!("The file {} has no area folder under page-tags", file.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptType {
    /// Reference the uploaded file through `src`.
    #[default]
    File,
    /// Inline the file body.
    Content,
}

impl ScriptType {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "file" => Ok(Self::File),
            "content" => Ok(Self::Content),
            other => bail!("unknown page tag type \"{other}\" (expected file or content)"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteResponse {
    pub site_id: String,
    pub not_found: bool,
    pub body: Value,
}

#[derive(Debug, Clone, Default)]
pub struct PageTagOptions {
    pub area: Option<PageTagArea>,
    pub file: String,
    pub name: Option<String>,
    pub script_type: ScriptType,
    pub order: Option<String>,
    pub enabled: bool,
    pub append_version: bool,
    pub tag_id: Option<String>,
}

fn site_request(
    api: &dyn OccApi,
    area: PageTagArea,
    site_id: &str,
    build: impl FnOnce(String) -> RequestSpec,
) -> Result<SiteResponse> {
    let spec = build(format!("sites/{site_id}/{}/", area.api_path()))
        .header("X-CCAsset-Language", "en");
    match api.request(spec) {
        Ok(body) => Ok(SiteResponse {
            site_id: site_id.to_string(),
            not_found: false,
            body,
        }),
        Err(error) if error_status(&error) == Some(404) => Ok(SiteResponse {
            site_id: site_id.to_string(),
            not_found: true,
            body: Value::Null,
        }),
        Err(error) => {
            Err(error.context(format!("Problem found while making request for site \"{site_id}\"")))
        }
    }
}

pub fn list(
    api: &dyn OccApi,
    area: PageTagArea,
    site_ids: &[String],
    query: Option<&str>,
) -> Result<Vec<SiteResponse>> {
    info!("Fetching Page tags for {}", area.as_str());
    site_ids
        .iter()
        .map(|site_id| {
            site_request(api, area, site_id, |base| {
                let spec = RequestSpec::get(base);
                match query {
                    Some(query) => spec.query("q", query),
                    None => spec,
                }
            })
        })
        .collect()
}

pub fn get(
    api: &dyn OccApi,
    area: PageTagArea,
    site_ids: &[String],
    tag_id: &str,
) -> Result<Vec<SiteResponse>> {
    info!("Fetching Page tag {tag_id} for {}", area.as_str());
    site_ids
        .iter()
        .map(|site_id| site_request(api, area, site_id, |base| RequestSpec::get(format!("{base}{tag_id}"))))
        .collect()
}

pub fn script_tag(
    name: &str,
    script_type: ScriptType,
    source: &str,
    asset_version: Option<&str>,
    append_version: bool,
) -> String {
    let version_attr = match (append_version, asset_version) {
        (true, Some(version)) => format!(" data-asset-version=\"{version}\""),
        _ => String::new(),
    };
    let (src, content) = match script_type {
        ScriptType::File => {
            let src = match asset_version {
                Some(version) => format!(" src=\"{source}?_av={version}\""),
                None => format!(" src=\"{source}\""),
            };
            (src, "")
        }
        ScriptType::Content => (String::new(), source),
    };
    format!(
        "<script class=\"occ-custom-script\"{version_attr} data-identifier=\"{name}\"{src}>{content}</script>"
    )
}

/// Per-site name: `{name}-{site}` unless the site id is already part of it.
pub fn name_for_site(name: &str, site_id: &str) -> String {
    if name.contains(site_id) {
        name.to_string()
    } else {
        format!("{name}-{site_id}")
    }
}

struct PreparedTag {
    area: PageTagArea,
    name: String,
    script_type: ScriptType,
    append_version: bool,
    source: String,
    base_body: Map<String, Value>,
}

fn resolve_single_file(settings: &Settings, pattern: &str) -> Result<PathBuf> {
    let mut files = resolve_files(&settings.storefront_root, pattern)
        .with_context(|| format!("File {pattern} not found!"))?;
    if files.len() > 1 {
        let listed = files
            .iter()
            .map(|file| file.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        bail!(
            "More than one file have been found matching this pattern {pattern}! Only one file is allowed.\n\nFiles found:\n{listed}"
        );
    }
    files
        .pop()
        .ok_or_else(|| anyhow::anyhow!("File {pattern} not found!"))
}

/// Options overlaid with the `page-tag-configs` of the `files-config` rule matching `file`.
fn with_file_configs(settings: &Settings, file: &Path, options: &PageTagOptions) -> Result<PageTagOptions> {
    let relative = normalize_for_display(file.strip_prefix(&settings.storefront_root).unwrap_or(file));
    let Some(configs) = file_rule_for(&settings.files_config, &relative)
        .and_then(|rule| rule.page_tag_configs.as_ref())
    else {
        return Ok(options.clone());
    };
    apply_page_tag_config(options, configs)
}

fn apply_page_tag_config(options: &PageTagOptions, configs: &PageTagConfig) -> Result<PageTagOptions> {
    let mut merged = options.clone();
    if let Some(area) = &configs.area {
        merged.area = Some(PageTagArea::parse(area)?);
    }
    if let Some(script_type) = &configs.script_type {
        merged.script_type = ScriptType::parse(script_type)?;
    }
    if configs.name.is_some() {
        merged.name = configs.name.clone();
    }
    if configs.order.is_some() {
        merged.order = configs.order.clone();
    }
    if configs.tag_id.is_some() {
        merged.tag_id = configs.tag_id.clone();
    }
    if let Some(enabled) = configs.enabled {
        merged.enabled = enabled;
    }
    if let Some(append_version) = configs.append_version {
        merged.append_version = append_version;
    }
    Ok(merged)
}

fn prepare(api: &dyn OccApi, settings: &Settings, options: &PageTagOptions) -> Result<PreparedTag> {
    let file = resolve_single_file(settings, &options.file)?;
    let options = &with_file_configs(settings, &file, options)?;
    let area = match options.area {
        Some(area) => area,
        None => PageTagArea::from_file(&file)?,
    };
    let name = match &options.name {
        Some(name) => name.clone(),
        None => file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };

    let source = match options.script_type {
        ScriptType::File => {
            let mapping = generate_file_path_mapping(
                &file,
                &mapping_root(settings, &file),
                &settings.endpoints.store,
                None,
            )?;
            upload_file(api, &mapping, false)?;
            mapping.remote_path
        }
        ScriptType::Content => fs::read_to_string(&file)
            .with_context(|| format!("failed to read {}", file.display()))?,
    };

    let mut base_body = Map::new();
    base_body.insert("enabled".to_string(), Value::Bool(options.enabled));
    if let Some(order) = &options.order {
        base_body.insert("order".to_string(), Value::String(order.clone()));
    }
    if let Some(tag_id) = &options.tag_id {
        base_body.insert("id".to_string(), Value::String(tag_id.clone()));
    }

    Ok(PreparedTag {
        area,
        name,
        script_type: options.script_type,
        append_version: options.append_version,
        source,
        base_body,
    })
}

fn tag_body(settings: &Settings, tag: &PreparedTag, site_id: &str) -> Value {
    let name = name_for_site(&tag.name, site_id);
    let mut body = tag.base_body.clone();
    body.insert(
        "content".to_string(),
        Value::String(script_tag(
            &name,
            tag.script_type,
            &tag.source,
            settings.assets_version.as_deref(),
            tag.append_version,
        )),
    );
    body.insert("name".to_string(), Value::String(name));
    Value::Object(body)
}

pub fn create(
    api: &dyn OccApi,
    settings: &Settings,
    site_ids: &[String],
    options: &PageTagOptions,
) -> Result<Vec<SiteResponse>> {
    let tag = prepare(api, settings, options)?;
    let mut responses = Vec::new();
    for site_id in site_ids {
        info!("Page tag for {} for {site_id}...", tag.area.as_str());
        let body = tag_body(settings, &tag, site_id);
        let response = site_request(api, tag.area, site_id, |base| RequestSpec::post(base).json(body))?;
        info!("Tag {} created for site {site_id}!", name_for_site(&tag.name, site_id));
        responses.push(response);
    }
    Ok(responses)
}

/// Update every tag matched by `query` on each site, keeping its name and order when unset.
pub fn update(
    api: &dyn OccApi,
    settings: &Settings,
    site_ids: &[String],
    options: &PageTagOptions,
    query: Option<&str>,
) -> Result<Vec<SiteResponse>> {
    let area = match options.area {
        Some(area) => area,
        None => PageTagArea::from_file(Path::new(&options.file))?,
    };
    let mut responses = Vec::new();
    for listed in list(api, area, site_ids, query)? {
        let found = items(&listed.body);
        if found.is_empty() {
            info!("No tags found for {}", listed.site_id);
            continue;
        }
        for item in found {
            let Some(tag_id) = item.get("id").and_then(Value::as_str) else {
                continue;
            };
            let item_options = PageTagOptions {
                area: Some(area),
                name: options.name.clone().or_else(|| {
                    item.get("name").and_then(Value::as_str).map(ToString::to_string)
                }),
                order: options.order.clone().or_else(|| item.get("order").map(value_text)),
                tag_id: Some(tag_id.to_string()),
                ..options.clone()
            };
            info!("Updating Tag {}", item_options.name.as_deref().unwrap_or(tag_id));
            let tag = prepare(api, settings, &item_options)?;
            let body = tag_body(settings, &tag, &listed.site_id);
            responses.push(site_request(api, area, &listed.site_id, |base| {
                RequestSpec::put(format!("{base}{tag_id}")).json(body)
            })?);
        }
    }
    Ok(responses)
}

/// Create the tag on sites where it does not exist yet, update it elsewhere.
pub fn upsert(
    api: &dyn OccApi,
    settings: &Settings,
    site_ids: &[String],
    options: &PageTagOptions,
) -> Result<Vec<SiteResponse>> {
    let tag = prepare(api, settings, options)?;
    let mut responses = Vec::new();
    for site_id in site_ids {
        let name = name_for_site(&tag.name, site_id);
        let query = format!("name eq \"{name}\"");
        let existing = list(api, tag.area, std::slice::from_ref(site_id), Some(&query))?;
        let existing_id = existing
            .first()
            .map(|listed| items(&listed.body))
            .and_then(|found| found.into_iter().next())
            .and_then(|item| item.get("id").and_then(Value::as_str).map(ToString::to_string));

        let body = tag_body(settings, &tag, site_id);
        let response = match existing_id {
            Some(tag_id) => {
                info!("Updating Tag {name} on {site_id}");
                site_request(api, tag.area, site_id, |base| {
                    RequestSpec::put(format!("{base}{tag_id}")).json(body)
                })?
            }
            None => {
                info!("Creating Tag {name} on {site_id}");
                site_request(api, tag.area, site_id, |base| RequestSpec::post(base).json(body))?
            }
        };
        responses.push(response);
    }
    Ok(responses)
}

/// Delete one tag by id, or every tag matched by `query`, on each site.
pub fn delete(
    api: &dyn OccApi,
    area: PageTagArea,
    site_ids: &[String],
    tag_id: Option<&str>,
    query: Option<&str>,
) -> Result<Vec<String>> {
    if tag_id.is_none() && query.is_none() {
        bail!("You must provide the --tag-id=<id> or --query=<SCIM Query> for the delete");
    }

    let mut deleted = Vec::new();
    for site_id in site_ids {
        let targets = match tag_id {
            Some(tag_id) => vec![tag_id.to_string()],
            None => {
                let listed = list(api, area, std::slice::from_ref(site_id), query)?;
                listed
                    .iter()
                    .flat_map(|response| items(&response.body))
                    .filter_map(|item| item.get("id").and_then(Value::as_str).map(ToString::to_string))
                    .collect()
            }
        };
        if targets.is_empty() {
            info!("No tags found for {site_id}");
        }
        for target in targets {
            info!("Deleting Tag {target} on {site_id}");
            site_request(api, area, site_id, |base| RequestSpec::delete(format!("{base}{target}")))?;
            deleted.push(format!("{site_id}/{target}"));
        }
    }
    Ok(deleted)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Inline page tags skip the upload step entirely.
pub fn requires_upload(options: &PageTagOptions) -> bool {
    options.script_type == ScriptType::File
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use reqwest::Method;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::config::{FileRule, PageTagConfig, Settings};
    use crate::test_support::{self, MockApi};

    fn settings(temp: &TempDir) -> Settings {
        Settings {
            assets_version: Some("7".to_string()),
            ..test_support::settings(temp.path())
        }
    }

    fn write_tag_file(temp: &TempDir, relative: &str, content: &str) {
        let path = temp.path().join("storefront").join(relative);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    #[test]
    fn area_is_inferred_from_page_tags_folder() {
        let area = PageTagArea::from_file(Path::new("/repo/storefront/files/general/page-tags/body-end/gtm.js"))
            .expect("area");
        assert_eq!(area, PageTagArea::BodyEnd);
        assert!(PageTagArea::from_file(Path::new("/repo/files/gtm.js")).is_err());
        assert!(PageTagArea::parse("footer").is_err());
    }

    #[test]
    fn script_tag_for_file_and_content() {
        assert_eq!(
            script_tag("gtm-siteUS", ScriptType::File, "/file/general/gtm.js", Some("7"), true),
            "<script class=\"occ-custom-script\" data-asset-version=\"7\" data-identifier=\"gtm-siteUS\" src=\"/file/general/gtm.js?_av=7\"></script>"
        );
        assert_eq!(
            script_tag("inline", ScriptType::Content, "console.log(1);", Some("7"), false),
            "<script class=\"occ-custom-script\" data-identifier=\"inline\">console.log(1);</script>"
        );
    }

    #[test]
    fn name_for_site_appends_missing_site() {
        assert_eq!(name_for_site("gtm", "siteUS"), "gtm-siteUS");
        assert_eq!(name_for_site("gtm-siteUS", "siteUS"), "gtm-siteUS");
    }

    #[test]
    fn list_marks_missing_sites_as_not_found() {
        let api = MockApi::new()
            .on(Method::GET, "sites/siteUS/headTags/", json!({ "items": [{ "id": "t1" }] }))
            .on_status(Method::GET, "sites/siteCA/headTags/", 404);
        let responses = list(
            &api,
            PageTagArea::Head,
            &["siteUS".to_string(), "siteCA".to_string()],
            Some("name co \"gtm\""),
        )
        .expect("list");
        assert!(!responses[0].not_found);
        assert!(responses[1].not_found);

        let call = &api.calls(Method::GET, "sites/siteUS/headTags/")[0];
        assert!(call.headers.contains(&("X-CCAsset-Language".to_string(), "en".to_string())));
        assert_eq!(call.query, vec![("q".to_string(), "name co \"gtm\"".to_string())]);
    }

    #[test]
    fn create_uploads_file_and_posts_per_site() {
        let temp = tempdir().expect("tempdir");
        write_tag_file(&temp, "files/general/page-tags/head/gtm.js", "window.gtm = 1;");
        let settings = settings(&temp);
        let api = MockApi::new()
            .on(Method::PUT, "files", json!({ "token": "t" }))
            .on(Method::POST, "files/t", json!({ "success": true }))
            .on(Method::POST, "sites/siteUS/headTags/", json!({ "id": "new" }));

        let options = PageTagOptions {
            file: "files/general/page-tags/head/gtm.js".to_string(),
            enabled: false,
            ..PageTagOptions::default()
        };
        create(&api, &settings, &["siteUS".to_string()], &options).expect("create");

        let body = &api.bodies(Method::POST, "sites/siteUS/headTags/")[0];
        assert_eq!(body["name"], "gtm-siteUS");
        assert_eq!(body["enabled"], false);
        assert_eq!(
            body["content"],
            "<script class=\"occ-custom-script\" data-identifier=\"gtm-siteUS\" src=\"/file/general/page-tags/head/gtm.js?_av=7\"></script>"
        );
        assert_eq!(api.count(Method::PUT, "files"), 1);
    }

    #[test]
    fn content_type_inlines_without_upload() {
        let temp = tempdir().expect("tempdir");
        write_tag_file(&temp, "files/general/page-tags/body-start/inline.js", "run();");
        let settings = settings(&temp);
        let api = MockApi::new().on(Method::POST, "sites/siteUS/bodyStartTags/", json!({}));
        let options = PageTagOptions {
            file: "files/general/page-tags/body-start/inline.js".to_string(),
            script_type: ScriptType::Content,
            name: Some("boot".to_string()),
            order: Some("2".to_string()),
            enabled: true,
            ..PageTagOptions::default()
        };
        assert!(!requires_upload(&options));
        create(&api, &settings, &["siteUS".to_string()], &options).expect("create");
        let body = &api.bodies(Method::POST, "sites/siteUS/bodyStartTags/")[0];
        assert_eq!(body["order"], "2");
        assert!(body["content"].as_str().expect("content").contains(">run();</script>"));
        assert_eq!(api.count(Method::PUT, "files"), 0);
    }

    #[test]
    fn upsert_updates_existing_tag() {
        let temp = tempdir().expect("tempdir");
        write_tag_file(&temp, "files/general/page-tags/head/gtm.js", "x");
        let settings = settings(&temp);
        let api = MockApi::new()
            .on(Method::GET, "sites/siteUS/headTags/", json!({ "items": [{ "id": "t9", "name": "gtm-siteUS" }] }))
            .on(Method::PUT, "sites/siteUS/headTags/t9", json!({ "id": "t9" }));
        let options = PageTagOptions {
            file: "files/general/page-tags/head/gtm.js".to_string(),
            script_type: ScriptType::Content,
            enabled: true,
            ..PageTagOptions::default()
        };
        upsert(&api, &settings, &["siteUS".to_string()], &options).expect("upsert");
        assert_eq!(api.count(Method::PUT, "sites/siteUS/headTags/t9"), 1);
        assert_eq!(api.count(Method::POST, "sites/siteUS/headTags/"), 0);
    }

    #[test]
    fn files_config_page_tag_configs_override_options() {
        let temp = tempdir().expect("tempdir");
        write_tag_file(&temp, "files/general/page-tags/head/gtm.js", "x");
        let settings = Settings {
            files_config: vec![FileRule {
                path: "files/general/page-tags/head/*.js".to_string(),
                transpile: false,
                library_target: None,
                page_tag_configs: Some(PageTagConfig {
                    area: Some("body-end".to_string()),
                    name: Some("tracking".to_string()),
                    order: Some("3".to_string()),
                    enabled: Some(false),
                    append_version: Some(false),
                    ..PageTagConfig::default()
                }),
            }],
            ..settings(&temp)
        };
        let api = MockApi::new().on(Method::POST, "sites/siteUS/bodyEndTags/", json!({ "id": "n1" }));
        let options = PageTagOptions {
            file: "files/general/page-tags/head/gtm.js".to_string(),
            script_type: ScriptType::Content,
            enabled: true,
            append_version: true,
            ..PageTagOptions::default()
        };
        create(&api, &settings, &["siteUS".to_string()], &options).expect("create");
        let body = &api.bodies(Method::POST, "sites/siteUS/bodyEndTags/")[0];
        assert_eq!(body["name"], "tracking-siteUS");
        assert_eq!(body["order"], "3");
        assert_eq!(body["enabled"], false);
        assert!(!body["content"].as_str().expect("content").contains("data-asset-version"));
        assert_eq!(api.count(Method::POST, "sites/siteUS/headTags/"), 0);
    }

    #[test]
    fn delete_requires_selector_and_removes_matches() {
        let api = MockApi::new()
            .on(Method::GET, "sites/siteUS/bodyEndTags/", json!({ "items": [{ "id": "a" }, { "id": "b" }] }))
            .on(Method::DELETE, "sites/siteUS/bodyEndTags/a", Value::Null)
            .on(Method::DELETE, "sites/siteUS/bodyEndTags/b", Value::Null);
        let sites = vec!["siteUS".to_string()];
        assert!(delete(&api, PageTagArea::BodyEnd, &sites, None, None).is_err());
        let deleted =
            delete(&api, PageTagArea::BodyEnd, &sites, None, Some("name co \"x\"")).expect("delete");
        assert_eq!(deleted, vec!["siteUS/a", "siteUS/b"]);
    }
}
