use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::extension::{self, ExtensionContext, ExtensionKind};
use crate::manifest::{Manifest, Operation};
use crate::page_tags::{self, PageTagArea, PageTagOptions, ScriptType};
use crate::request::{JobPolling, OccApi};
use crate::sites::resolve_site_ids;
use crate::widget::{self, UploadOptions, VersionInfo};
use crate::{files, publish, theme};

/// Operations this runner executes; anything else fails the whole manifest.
pub const SUPPORTED_OPERATIONS: [(&str, &str); 10] = [
    ("upgrade", "extension"),
    ("info", "widget"),
    ("upload", "widget"),
    ("upload", "app-level"),
    ("upload", "file"),
    ("upload", "sse"),
    ("generate", "theme"),
    ("create", "pageTag"),
    ("update", "pageTag"),
    ("trigger", "publish"),
];

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub polling: JobPolling,
    pub auto_restore: bool,
    /// Comma-separated site ids for page tags; every site when unset.
    pub sites: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            polling: JobPolling::default(),
            auto_restore: true,
            sites: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub operation: String,
    pub kind: String,
    pub ids: Vec<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeployReport {
    pub steps: Vec<StepReport>,
}

fn is_supported(operation: &Operation) -> bool {
    SUPPORTED_OPERATIONS
        .iter()
        .any(|(name, kind)| operation.operation == *name && operation.kind == *kind)
}

/// Execute the manifest in order, stopping at the first failing operation.
/// A manifest with any operation outside `SUPPORTED_OPERATIONS` is rejected up front.
pub fn run(
    api: &dyn OccApi,
    ctx: &ExtensionContext<'_>,
    manifest: &Manifest,
    options: &RunOptions,
) -> Result<DeployReport> {
    let unsupported = manifest
        .operations
        .iter()
        .filter(|operation| !is_supported(operation))
        .map(|operation| format!("{} {}", operation.operation, operation.kind))
        .collect::<Vec<_>>();
    if !unsupported.is_empty() {
        bail!(
            "manifest contains operations this runner cannot execute: {}",
            unsupported.join(", ")
        );
    }

    let total = manifest.operations.len();
    let mut report = DeployReport::default();
    for (index, operation) in manifest.operations.iter().enumerate() {
        info!(
            "[{}/{total}] {} {}",
            index + 1,
            operation.operation,
            operation.kind
        );
        let detail = execute(api, ctx, operation, options).with_context(|| {
            format!(
                "deploy stopped at operation {} of {total} ({} {}) after {} completed step(s)",
                index + 1,
                operation.operation,
                operation.kind,
                report.steps.len()
            )
        })?;
        report.steps.push(StepReport {
            operation: operation.operation.clone(),
            kind: operation.kind.clone(),
            ids: operation.id_list(),
            detail,
        });
    }
    Ok(report)
}

fn option_str<'a>(operation: &'a Operation, key: &str) -> Option<&'a str> {
    operation
        .options
        .as_ref()
        .and_then(|options| options.get(key))
        .and_then(Value::as_str)
}

fn execute(
    api: &dyn OccApi,
    ctx: &ExtensionContext<'_>,
    operation: &Operation,
    options: &RunOptions,
) -> Result<Option<String>> {
    let ids = operation.id_list();
    match (operation.operation.as_str(), operation.kind.as_str()) {
        ("upgrade", "extension") => {
            let Some(kind) = option_str(operation, "type") else {
                bail!("upgrade extension needs an options.type");
            };
            let kind = ExtensionKind::parse(kind)?;
            let upgraded = extension::upgrade(api, ctx, kind, &ids, options.auto_restore)?;
            Ok(Some(format!("{} {} extension(s) upgraded", upgraded.len(), kind.as_str())))
        }
        ("upload", "file") => {
            let mut uploaded = 0;
            for pattern in &ids {
                uploaded += files::upload_files(api, ctx.settings, pattern, None)?.uploaded.len();
            }
            Ok(Some(format!("{uploaded} file(s) uploaded")))
        }
        ("upload", "sse") => {
            for name in &ids {
                extension::upload_sse(api, ctx, name)?;
            }
            Ok(None)
        }
        ("create" | "update", "pageTag") => {
            let area = option_str(operation, "area").map(PageTagArea::parse).transpose()?;
            let site_ids = resolve_site_ids(api, options.sites.as_deref())?;
            for file in &ids {
                let tag = PageTagOptions {
                    area,
                    file: file.clone(),
                    script_type: ScriptType::File,
                    enabled: true,
                    append_version: true,
                    ..PageTagOptions::default()
                };
                page_tags::upsert(api, ctx.settings, &site_ids, &tag)?;
            }
            Ok(Some(format!("{} site(s)", site_ids.len())))
        }
        ("trigger", "publish") => {
            let published = publish::trigger(api, &ctx.settings.credentials.username, options.polling)?;
            Ok(Some(format!("workset {}", published.workset_id)))
        }
        ("info", "widget") => {
            let widgets = widget::info(api, None)?;
            Ok(Some(format!("{} widget(s)", widgets.len())))
        }
        ("upload", "widget") => {
            let version = VersionInfo::from_git(&ctx.settings.project_base)?;
            let upload_options = UploadOptions {
                backup: options.auto_restore,
                auto_restore: options.auto_restore,
                ..UploadOptions::default()
            };
            for widget_type in &ids {
                widget::upload(api, ctx, widget_type, &upload_options, &version)?;
            }
            Ok(Some(format!("{} widget(s) uploaded", ids.len())))
        }
        ("upload", "app-level") => {
            for name in &ids {
                extension::upload(api, ctx, ExtensionKind::AppLevel, name)?;
            }
            Ok(Some(format!("{} app-level(s) uploaded", ids.len())))
        }
        ("generate", "theme") => {
            let generated = theme::generate(api, ctx.settings)?;
            Ok(Some(format!("theme {}", generated.theme_id)))
        }
        (name, kind) => bail!("operation \"{name} {kind}\" is not supported"),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use reqwest::Method;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::manifest::OperationId;
    use crate::test_support::{self, MockApi};

    fn operation(name: &str, kind: &str, id: Option<&str>, options: Option<Value>) -> Operation {
        Operation {
            operation: name.to_string(),
            kind: kind.to_string(),
            id: id.map(|id| OperationId::One(id.to_string())),
            options,
        }
    }

    fn run_options() -> RunOptions {
        RunOptions {
            polling: JobPolling {
                interval: Duration::ZERO,
                max_polls: 3,
            },
            auto_restore: false,
            sites: Some("siteUS".to_string()),
        }
    }

    #[test]
    fn run_executes_every_step_in_order() {
        let temp = tempdir().expect("tempdir");
        let settings = test_support::settings(temp.path());
        let file = settings.storefront_root.join("files/general/promo.js");
        fs::create_dir_all(file.parent().expect("parent")).expect("mkdir");
        fs::write(&file, "console.log(1);").expect("write");

        let api = MockApi::new()
            .on(Method::GET, "widgetDescriptors/instances", json!({ "items": [] }))
            .on(Method::PUT, "files", json!({ "token": "t-1" }))
            .on(Method::POST, "files/t-1", json!({ "success": true }))
            .on(Method::GET, "worksets", json!({ "items": [] }))
            .on(Method::POST, "publishingChangeLists/publish", json!({ "publishRunning": true }))
            .on(Method::GET, "publish", json!({ "publishRunning": false }));
        let ctx = ExtensionContext {
            settings: &settings,
            work_dir: temp.path().join("work"),
            backup_dir: temp.path().join("backups"),
        };
        let manifest = Manifest {
            operations: vec![
                operation("info", "widget", None, None),
                operation("upload", "file", Some("files/general/promo.js"), None),
                operation("trigger", "publish", None, None),
            ],
        };

        let report = run(&api, &ctx, &manifest, &run_options()).expect("run");
        assert_eq!(report.steps.len(), 3);
        assert_eq!(report.steps[0].detail.as_deref(), Some("0 widget(s)"));
        assert_eq!(report.steps[1].detail.as_deref(), Some("1 file(s) uploaded"));
        assert_eq!(report.steps[2].detail.as_deref(), Some("workset default"));
        assert_eq!(api.count(Method::POST, "files/t-1"), 1);
    }

    #[test]
    fn unsupported_operations_fail_before_any_call() {
        let temp = tempdir().expect("tempdir");
        let settings = test_support::settings(temp.path());
        let api = MockApi::new();
        let ctx = ExtensionContext {
            settings: &settings,
            work_dir: temp.path().join("work"),
            backup_dir: temp.path().join("backups"),
        };
        let manifest = Manifest {
            operations: vec![
                operation("upload", "file", Some("files/general/promo.js"), None),
                operation("upload", "email", Some("orderConfirmation"), Some(json!({ "siteId": "siteUS" }))),
                operation("deploy", "responseFilter", None, None),
                operation("trigger", "publish", None, None),
            ],
        };

        let error = run(&api, &ctx, &manifest, &run_options()).expect_err("must fail");
        assert_eq!(
            error.to_string(),
            "manifest contains operations this runner cannot execute: upload email, deploy responseFilter"
        );
        assert!(api.all_calls().is_empty());
    }

    #[test]
    fn run_stops_at_first_failure() {
        let temp = tempdir().expect("tempdir");
        let settings = test_support::settings(temp.path());
        let api = MockApi::new().on(Method::GET, "widgetDescriptors/instances", json!({ "items": [] }));
        let ctx = ExtensionContext {
            settings: &settings,
            work_dir: temp.path().join("work"),
            backup_dir: temp.path().join("backups"),
        };
        let manifest = Manifest {
            operations: vec![
                operation("info", "widget", None, None),
                operation("upgrade", "extension", Some("oeCart"), Some(json!({ "type": "theme" }))),
                operation("trigger", "publish", None, None),
            ],
        };

        let error = run(&api, &ctx, &manifest, &run_options()).expect_err("must fail");
        let message = format!("{error:#}");
        assert!(message.contains("operation 2 of 3 (upgrade extension) after 1 completed step(s)"));
        assert!(message.contains("unknown extension type \"theme\""));
        assert_eq!(api.count(Method::GET, "worksets"), 0);
    }

    #[test]
    fn generate_theme_and_upload_widget_steps_reach_the_api() {
        let temp = tempdir().expect("tempdir");
        let mut settings = test_support::settings(temp.path());
        settings.theme_name = Some("AcmeTheme".to_string());
        settings.theme_id = Some("100001".to_string());
        for (relative, content) in [
            ("less/base/reset.less", "* {}"),
            ("widgets/objectedge/oeCart/templates/display.template", "<div/>"),
            ("widgets/objectedge/oeCart/less/widget.less", ".cart {}"),
            ("widgets/objectedge/oeCart/locales/en/ns.oeCart.json", "{}"),
        ] {
            let path = settings.storefront_root.join(relative);
            fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            fs::write(path, content).expect("write");
        }

        let api = MockApi::new()
            .on(Method::PUT, "themes/100001/source", json!({}))
            .on(
                Method::GET,
                "widgetDescriptors/instances",
                json!({ "items": [{ "id": "d1", "widgetType": "oeCart", "instances": [] }] }),
            )
            .on(Method::GET, "widgetDescriptors/instances", json!({ "items": [] }))
            .on(Method::GET, "widgetDescriptors/d1/javascript", json!({ "jsFiles": [] }))
            .on(Method::PUT, "widgetDescriptors/d1/less", json!({}))
            .on(Method::PUT, "widgetDescriptors/d1/code", json!({}));
        let ctx = ExtensionContext {
            settings: &settings,
            work_dir: temp.path().join("work"),
            backup_dir: temp.path().join("backups"),
        };
        let manifest = Manifest {
            operations: vec![
                operation("generate", "theme", None, None),
                operation("upload", "widget", Some("oeCart"), None),
            ],
        };

        let report = run(&api, &ctx, &manifest, &run_options()).expect("run");
        assert_eq!(report.steps[0].detail.as_deref(), Some("theme 100001"));
        assert_eq!(report.steps[1].detail.as_deref(), Some("1 widget(s) uploaded"));
        assert_eq!(api.count(Method::PUT, "themes/100001/source"), 1);
        assert_eq!(api.count(Method::PUT, "widgetDescriptors/d1/code"), 1);
        assert_eq!(api.count(Method::PUT, "widgetDescriptors/d1/less"), 1);
    }

    #[test]
    fn page_tag_operations_upsert_on_each_site() {
        let temp = tempdir().expect("tempdir");
        let settings = test_support::settings(temp.path());
        let file = settings.storefront_root.join("page-tags/head/analytics.js");
        fs::create_dir_all(file.parent().expect("parent")).expect("mkdir");
        fs::write(&file, "track();").expect("write");

        let api = MockApi::new()
            .on(Method::PUT, "files", json!({ "token": "t-2" }))
            .on(Method::POST, "files/t-2", json!({ "success": true }))
            .on(Method::GET, "sites/siteUS/headTags/", json!({ "items": [] }))
            .on(Method::POST, "sites/siteUS/headTags/", json!({ "id": "tag-1" }));
        let ctx = ExtensionContext {
            settings: &settings,
            work_dir: temp.path().join("work"),
            backup_dir: temp.path().join("backups"),
        };
        let manifest = Manifest {
            operations: vec![operation(
                "create",
                "pageTag",
                Some("page-tags/head/analytics.js"),
                Some(json!({ "area": "head" })),
            )],
        };

        let report = run(&api, &ctx, &manifest, &run_options()).expect("run");
        assert_eq!(report.steps.len(), 1);
        let created = &api.bodies(Method::POST, "sites/siteUS/headTags/")[0];
        assert_eq!(created["name"], "analytics-siteUS");
        assert_eq!(created["enabled"], true);
    }
}
