//! Deploy-manifest generation: classify changed paths, verify what is
//! installed on OCC, then emit the ordered operation list.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::request::{OccApi, RequestSpec};
use crate::runtime::write_json_file;
use crate::worksets::items;

const IGNORED_SEARCH_FOLDERS: [&str; 6] = [
    "workspaces",
    "attributesContexts",
    "configuration",
    "tools",
    "userSegments",
    "templates",
];
const EMAIL_SKIPPED_FOLDERS: [&str; 3] = ["samples", ".gitkeep", "templateManager"];
const ALLOWED_FILE_FOLDERS: [&str; 4] = ["general", "thirdparty", "products", "collections"];
const PAGE_TAG_AREAS: [&str; 3] = ["head", "body-start", "body-end"];
const ALWAYS_UPGRADED_WIDGETS: [&str; 1] = ["oeCheckoutAddressBook"];

/// Inputs the classifier needs from the project settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierRules {
    pub storefront_dir: String,
    /// Email sites; the first one receives `html_body.ftl` changes.
    pub email_sites: Vec<String>,
}

/// The single change-set bucket one changed path lands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bucket {
    WidgetUpload(String),
    WidgetUpgrade(String),
    Email { email: String, sites: Vec<String> },
    Sse(String),
    SseVariable,
    Stack(String),
    Search(String),
    Facets(String),
    AppLevel(String),
    Config(String),
    Gateway(String),
    Theme,
    File(String),
    ResponseFilter,
    Index,
    PageTag { area: String, file: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Change(Bucket),
    Skip,
}

use Classification::{Change, Skip};

pub fn classify(rules: &ClassifierRules, path: &str) -> Classification {
    let path = path.trim().replace('\\', "/");
    if path.is_empty() || path.contains(".test.") || path.contains(".spec.") {
        return Skip;
    }
    let segments = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    let Some(first) = segments.first() else {
        return Skip;
    };

    match *first {
        top if top == rules.storefront_dir => classify_storefront(rules, &segments[1..]),
        "search" => classify_search(&segments),
        "server-side-extensions" => match segments.get(1..) {
            Some(["variables.json"]) => Change(Bucket::SseVariable),
            Some([name, _, ..]) => Change(Bucket::Sse((*name).to_string())),
            _ => Skip,
        },
        "types" if segments.get(1) == Some(&"product") => Change(Bucket::Index),
        _ => Skip,
    }
}

fn classify_storefront(rules: &ClassifierRules, segments: &[&str]) -> Classification {
    match segments {
        ["app-level", name, _, ..] => Change(Bucket::AppLevel((*name).to_string())),
        ["emails", email, rest @ ..] if !rest.is_empty() => {
            if EMAIL_SKIPPED_FOLDERS.contains(email) {
                Skip
            } else {
                classify_email(rules, email, rest)
            }
        }
        ["less", ..] => Change(Bucket::Theme),
        ["settings", "config", name, _, ..] => Change(Bucket::Config((*name).to_string())),
        ["settings", "gateway", name, _, ..] => Change(Bucket::Gateway((*name).to_string())),
        ["stacks", name, _, ..] => Change(Bucket::Stack((*name).to_string())),
        ["widgets", "objectedge", name, rest @ ..] if !rest.is_empty() => {
            classify_custom_widget(name, rest)
        }
        ["widgets", "oracle", name, _, ..] => Change(Bucket::WidgetUpload((*name).to_string())),
        ["responseFilters.json"] => Change(Bucket::ResponseFilter),
        ["images", _, ..] => Change(Bucket::File(segments.join("/"))),
        ["files", folder, _, ..] if ALLOWED_FILE_FOLDERS.contains(folder) => {
            Change(Bucket::File(segments.join("/")))
        }
        ["page-tags", area, _, ..] if PAGE_TAG_AREAS.contains(area) => Change(Bucket::PageTag {
            area: (*area).to_string(),
            file: segments.join("/"),
        }),
        _ => Skip,
    }
}

fn classify_email(rules: &ClassifierRules, email: &str, rest: &[&str]) -> Classification {
    let Some(file_name) = rest.last() else {
        return Skip;
    };
    let sites = match *file_name {
        "subject.ftl" | "Strings.xlf" => rules.email_sites.clone(),
        "html_body.ftl" => rules.email_sites.iter().take(1).cloned().collect(),
        other => rules
            .email_sites
            .iter()
            .filter(|site| other.contains(&format!("_{site}")))
            .take(1)
            .cloned()
            .collect(),
    };
    if sites.is_empty() {
        return Skip;
    }
    Change(Bucket::Email {
        email: email.to_string(),
        sites,
    })
}

fn classify_custom_widget(name: &str, rest: &[&str]) -> Classification {
    let upgrade = Change(Bucket::WidgetUpgrade(name.to_string()));
    let upload = Change(Bucket::WidgetUpload(name.to_string()));
    if ALWAYS_UPGRADED_WIDGETS.contains(&name) {
        return upgrade;
    }
    match rest {
        ["widget.json" | "config" | "element" | "layouts" | "images", ..] => upgrade,
        ["js" | "js-src" | "less" | "locales", ..] => upload,
        ["templates", "display.template"] => upload,
        ["templates", ..] => upgrade,
        _ => Skip,
    }
}

fn classify_search(segments: &[&str]) -> Classification {
    if segments.len() <= 3
        || segments.contains(&"ATG")
        || IGNORED_SEARCH_FOLDERS.contains(&segments[2])
    {
        return Skip;
    }
    let folder = segments[1..segments.len() - 1].join("/");
    if segments.contains(&"facets") {
        Change(Bucket::Facets(folder))
    } else {
        Change(Bucket::Search(folder))
    }
}

/// Changes accumulated from a diff; every list keeps first-seen order without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub widget_upload: Vec<String>,
    pub widget_upgrade: Vec<String>,
    pub emails: Vec<(String, Vec<String>)>,
    pub sse: Vec<String>,
    pub stack: Vec<String>,
    pub search: Vec<String>,
    pub facets: Vec<String>,
    pub app_level_upload: Vec<String>,
    pub app_level_upgrade: Vec<String>,
    pub config: Vec<String>,
    pub gateway: Vec<String>,
    pub files: Vec<String>,
    pub page_tags: Vec<(String, String)>,
    pub theme: bool,
    pub response_filter: bool,
    pub sse_variable: bool,
    pub index: bool,
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, value: T) {
    if !list.contains(&value) {
        list.push(value);
    }
}

impl ChangeSet {
    pub fn new(rules: &ClassifierRules) -> Self {
        Self {
            emails: rules
                .email_sites
                .iter()
                .map(|site| (site.clone(), Vec::new()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn from_paths<S: AsRef<str>>(rules: &ClassifierRules, paths: &[S]) -> Self {
        let mut changes = Self::new(rules);
        for path in paths {
            let path = path.as_ref();
            match classify(rules, path) {
                Change(bucket) => changes.apply(bucket),
                Skip if !path.trim().is_empty() => info!("Skipping path {path}"),
                Skip => {}
            }
        }
        changes
    }

    pub fn apply(&mut self, bucket: Bucket) {
        match bucket {
            Bucket::WidgetUpload(name) => push_unique(&mut self.widget_upload, name),
            Bucket::WidgetUpgrade(name) => push_unique(&mut self.widget_upgrade, name),
            Bucket::Email { email, sites } => {
                for site in sites {
                    match self.emails.iter_mut().find(|(known, _)| *known == site) {
                        Some((_, emails)) => push_unique(emails, email.clone()),
                        None => self.emails.push((site, vec![email.clone()])),
                    }
                }
            }
            Bucket::Sse(name) => push_unique(&mut self.sse, name),
            Bucket::SseVariable => self.sse_variable = true,
            Bucket::Stack(name) => push_unique(&mut self.stack, name),
            Bucket::Search(folder) => push_unique(&mut self.search, folder),
            Bucket::Facets(folder) => push_unique(&mut self.facets, folder),
            Bucket::AppLevel(name) => push_unique(&mut self.app_level_upload, name),
            Bucket::Config(name) => push_unique(&mut self.config, name),
            Bucket::Gateway(name) => push_unique(&mut self.gateway, name),
            Bucket::Theme => self.theme = true,
            Bucket::File(file) => push_unique(&mut self.files, file),
            Bucket::ResponseFilter => self.response_filter = true,
            Bucket::Index => self.index = true,
            Bucket::PageTag { area, file } => push_unique(&mut self.page_tags, (area, file)),
        }
    }

    /// Widget uploads that have no installed instance become upgrades.
    pub fn promote_missing_widgets(&mut self, installed: &[String]) {
        let (present, missing): (Vec<_>, Vec<_>) = self
            .widget_upload
            .drain(..)
            .partition(|widget| installed.contains(widget));
        for widget in missing {
            info!("Widget {widget} is not installed, it'll be upgraded");
            push_unique(&mut self.widget_upgrade, widget);
        }
        self.widget_upload = present;
    }

    /// App-level uploads not present as `<name>.js` become upgrades.
    pub fn promote_missing_app_levels(&mut self, installed: &[String]) {
        let (present, missing): (Vec<_>, Vec<_>) = self
            .app_level_upload
            .drain(..)
            .partition(|name| installed.contains(&format!("{name}.js")));
        for name in missing {
            info!("AppLevel JS {name} is not installed, it'll be upgraded");
            push_unique(&mut self.app_level_upgrade, name);
        }
        self.app_level_upload = present;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationId {
    One(String),
    Many(Vec<String>),
}

/// One declarative deploy step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<OperationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl Operation {
    fn new(operation: &str, kind: &str) -> Self {
        Self {
            operation: operation.to_string(),
            kind: kind.to_string(),
            id: None,
            options: None,
        }
    }

    fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(OperationId::One(id.into()));
        self
    }

    fn ids(mut self, ids: &[String]) -> Self {
        self.id = Some(OperationId::Many(ids.to_vec()));
        self
    }

    fn options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }

    /// Ids as a list, whichever shape the manifest used.
    pub fn id_list(&self) -> Vec<String> {
        match &self.id {
            Some(OperationId::One(id)) => vec![id.clone()],
            Some(OperationId::Many(ids)) => ids.clone(),
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub operations: Vec<Operation>,
}

fn extension_upgrade(kind: &str, ids: &[String]) -> Operation {
    Operation::new("upgrade", "extension")
        .ids(ids)
        .options(json!({ "type": kind }))
}

pub fn build_operations(changes: &ChangeSet, trigger_publish: bool) -> Vec<Operation> {
    let mut operations = Vec::new();

    if !changes.widget_upgrade.is_empty() {
        operations.push(extension_upgrade("widget", &changes.widget_upgrade));
    }
    if !changes.widget_upload.is_empty() {
        operations.push(Operation::new("info", "widget"));
        operations.push(Operation::new("upload", "widget").ids(&changes.widget_upload));
    }
    for (site, emails) in &changes.emails {
        for email in emails {
            operations.push(
                Operation::new("upload", "email")
                    .id(email)
                    .options(json!({ "siteId": site })),
            );
        }
    }
    for name in &changes.sse {
        operations.push(Operation::new("upload", "sse").id(name));
    }
    for name in &changes.stack {
        operations.push(Operation::new("upload", "stack").id(name));
    }
    for folder in &changes.search {
        operations.push(Operation::new("upload", "search").id(folder));
    }
    if !changes.app_level_upgrade.is_empty() {
        operations.push(extension_upgrade("app-level", &changes.app_level_upgrade));
    }
    for name in &changes.app_level_upload {
        operations.push(Operation::new("upload", "app-level").id(name));
    }
    if !changes.config.is_empty() {
        operations.push(extension_upgrade("config", &changes.config));
    }
    if !changes.gateway.is_empty() {
        operations.push(extension_upgrade("gateway", &changes.gateway));
    }
    if changes.theme {
        operations.push(Operation::new("generate", "theme"));
    }
    for file in &changes.files {
        operations.push(Operation::new("upload", "file").id(file));
    }
    if changes.response_filter {
        operations.push(Operation::new("deploy", "responseFilter"));
    }
    if changes.sse_variable {
        operations.push(Operation::new("deploy", "sseVariable"));
    }
    if changes.index {
        operations.push(
            Operation::new("index", "index").options(json!({ "type": "baseline-full-export" })),
        );
    }
    for (area, file) in &changes.page_tags {
        operations.push(
            Operation::new("create", "pageTag")
                .id(file)
                .options(json!({ "area": area })),
        );
    }
    for folder in &changes.facets {
        operations.push(Operation::new("upload", "facets").id(folder));
    }
    if trigger_publish {
        operations.push(Operation::new("trigger", "publish"));
    }
    operations
}

/// Widget types with at least one instance on OCC.
pub fn installed_widget_types(api: &dyn OccApi) -> Result<Vec<String>> {
    let response = api.request(
        RequestSpec::get("widgetDescriptors/instances").query("source", "101"),
    )?;
    Ok(items(&response)
        .iter()
        .filter_map(|descriptor| descriptor.get("widgetType").and_then(Value::as_str))
        .map(ToString::to_string)
        .collect())
}

/// Application JavaScript file names (`<name>.js`) known to OCC.
pub fn installed_app_levels(api: &dyn OccApi) -> Result<Vec<String>> {
    let response = api
        .request(RequestSpec::get("applicationJavaScript"))
        .context("Error listing the app-levels from OCC")?;
    Ok(match response.get("items") {
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|item| item.get("name").and_then(Value::as_str))
            .map(ToString::to_string)
            .collect(),
        _ => Vec::new(),
    })
}

/// Seam over the version-control diff the manifest is built from.
pub trait ChangedFiles {
    fn changed_files(&self, revision: &str, head: &str) -> Result<Vec<String>>;
}

#[derive(Debug)]
struct ProcessOutput {
    code: i32,
    stdout: String,
    stderr: String,
}

/// Runs `git` inside the project base.
#[derive(Debug, Clone)]
pub struct GitChangedFiles {
    pub repo_root: PathBuf,
}

impl GitChangedFiles {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    fn git(&self, args: &[&str]) -> Result<ProcessOutput> {
        debug!("git {}", args.join(" "));
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .with_context(|| format!("failed to execute git in {}", self.repo_root.display()))?;
        Ok(ProcessOutput {
            code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn git_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args)?;
        if output.code != 0 {
            bail!("git {} failed: {}", args.join(" "), output.stderr.trim());
        }
        Ok(output.stdout)
    }
}

impl ChangedFiles for GitChangedFiles {
    fn changed_files(&self, revision: &str, head: &str) -> Result<Vec<String>> {
        if head.trim().is_empty() {
            bail!("there is no current version specified");
        }
        let head_hash = self
            .git_ok(&["rev-parse", head])?
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        let is_ancestor = self
            .git(&["merge-base", "--is-ancestor", revision, &head_hash])?
            .code
            == 0;
        let range = if is_ancestor {
            format!("{revision}...{head_hash}")
        } else {
            format!("{head_hash}...{revision}")
        };
        Ok(self
            .git_ok(&["diff", "--name-only", &range])?
            .lines()
            .map(ToString::to_string)
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub revision: String,
    pub head: String,
    pub output: PathBuf,
    pub trigger_publish: bool,
}

/// List changes, verify install state on OCC and write the manifest to `options.output`.
pub fn generate(
    api: &dyn OccApi,
    changed: &dyn ChangedFiles,
    rules: &ClassifierRules,
    options: &GenerateOptions,
) -> Result<Manifest> {
    info!("Listing changed files");
    let paths = changed.changed_files(&options.revision, &options.head)?;
    let mut changes = ChangeSet::from_paths(rules, &paths);

    if !changes.widget_upload.is_empty() {
        info!("Verifying not installed widgets...");
        let installed = installed_widget_types(api)?;
        changes.promote_missing_widgets(&installed);
    }
    if !changes.app_level_upload.is_empty() {
        info!("Verifying not installed AppLevel JS...");
        let installed = installed_app_levels(api)?;
        changes.promote_missing_app_levels(&installed);
    }

    info!("Building deploy script...");
    let manifest = Manifest {
        operations: build_operations(&changes, options.trigger_publish),
    };
    store(&options.output, &manifest)?;
    Ok(manifest)
}

pub fn store(path: &Path, manifest: &Manifest) -> Result<()> {
    info!("Storing deploy script on {}...", path.display());
    write_json_file(path, manifest)
}

pub fn load(path: &Path) -> Result<Manifest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read deploy manifest {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse deploy manifest {}", path.display()))
}
