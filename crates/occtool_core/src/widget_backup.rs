//! Snapshot of everything OCC holds for one widget type, taken before a
//! destructive upgrade so it can be replayed by `widget_restore`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::parallel::{MAX_PARALLEL_WIDGET_CALLS, run_bounded};
use crate::request::{OccApi, RequestSpec};
use crate::runtime::{read_json_file, unix_timestamp_ms, write_json_file};
use crate::worksets::items;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSnapshot {
    pub widget_type: String,
    /// Descriptor from `widgetDescriptors/instances`, including its instances.
    #[serde(default)]
    pub widget: Option<Value>,
    #[serde(default)]
    pub widget_ids: Vec<String>,
    /// Page layout structures keyed by layout id.
    #[serde(default)]
    pub structures: BTreeMap<String, Value>,
    /// Locale payloads per instance id, then per locale name.
    #[serde(default)]
    pub locales: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
    #[serde(default)]
    pub layouts: BTreeMap<String, ElementizedLayout>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementizedLayout {
    pub display_name: String,
    pub fragments: Vec<Value>,
    pub layout_descriptor_id: String,
    pub layout_source: String,
}

impl WidgetSnapshot {
    pub fn instances(&self) -> Vec<Value> {
        self.widget
            .as_ref()
            .and_then(|widget| widget.get("instances"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

pub fn backup(api: &dyn OccApi, widget_type: &str) -> Result<WidgetSnapshot> {
    let mut snapshot = WidgetSnapshot {
        widget_type: widget_type.to_string(),
        ..WidgetSnapshot::default()
    };

    info!("Getting {widget_type} widget instances");
    snapshot.widget = find_descriptor(api, widget_type)?;
    snapshot.widget_ids = snapshot
        .instances()
        .iter()
        .filter_map(|instance| {
            let id = instance.get("id").and_then(Value::as_str)?;
            info!(
                "Instance {{ \"id\": \"{id}\", \"name\": \"{}\" }}",
                instance.get("displayName").and_then(serde_json::Value::as_str).unwrap_or_default()
            );
            Some(id.to_string())
        })
        .collect();
    if snapshot.widget_ids.is_empty() {
        info!("No instances installed for this widget");
    }

    let layout_ids = page_layout_ids(api, &snapshot)?;
    snapshot.structures = layout_structures(api, &layout_ids)?;
    snapshot.locales = instance_locales(api, &snapshot.widget_ids)?;

    let metadata = instance_metadata(api, &snapshot.widget_ids)?;
    for (instance_id, payload) in &metadata {
        let settings = payload.get("settings").cloned().unwrap_or(Value::Null);
        info!("Storing configuration for instance {instance_id}: {settings}");
        snapshot.settings.insert(instance_id.clone(), settings);
    }
    snapshot.layouts = elementized_layouts(api, &metadata)?;
    Ok(snapshot)
}

/// Take a snapshot and write it to `<backup_dir>/widget-<type>-<ms>.json`.
pub fn backup_to_file(api: &dyn OccApi, widget_type: &str, backup_dir: &Path) -> Result<PathBuf> {
    let snapshot = backup(api, widget_type)?;
    let path = backup_dir.join(format!("widget-{widget_type}-{}.json", unix_timestamp_ms()?));
    info!("Storing backup on file {}", path.display());
    write_json_file(&path, &snapshot)?;
    Ok(path)
}

pub fn load(path: &Path) -> Result<WidgetSnapshot> {
    let value = read_json_file(path)?;
    serde_json::from_value(value)
        .with_context(|| format!("{} is not a widget backup", path.display()))
}

pub(crate) fn find_descriptor(api: &dyn OccApi, widget_type: &str) -> Result<Option<Value>> {
    let response = api.request(
        RequestSpec::get("widgetDescriptors/instances").query("source", "101"),
    )?;
    Ok(items(&response)
        .into_iter()
        .find(|descriptor| descriptor.get("widgetType").and_then(Value::as_str) == Some(widget_type)))
}

fn page_layout_ids(api: &dyn OccApi, snapshot: &WidgetSnapshot) -> Result<Vec<String>> {
    if snapshot.widget.is_none() {
        return Ok(Vec::new());
    }
    info!("Getting layout information for the widgets");
    let page_ids = snapshot
        .instances()
        .iter()
        .filter_map(|instance| instance.get("pageIds").and_then(Value::as_array))
        .flatten()
        .filter_map(Value::as_str)
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    let response = api.request(RequestSpec::get("layouts"))?;
    let mut layout_ids = Vec::new();
    for page_layout in items(&response)
        .iter()
        .filter_map(|item| item.get("pageLayouts").and_then(Value::as_array))
        .flatten()
    {
        let Some(page_id) = page_layout.get("repositoryId").and_then(Value::as_str) else {
            continue;
        };
        if !page_ids.iter().any(|id| id == page_id) {
            continue;
        }
        if let Some(layout_id) = page_layout
            .pointer("/layout/repositoryId")
            .and_then(Value::as_str)
        {
            info!(
                "Widget installed on layout {{ \"id\": \"{layout_id}\", \"name\": \"{}\" }}",
                page_layout.get("displayName").and_then(serde_json::Value::as_str).unwrap_or_default()
            );
            if !layout_ids.iter().any(|id| id == layout_id) {
                layout_ids.push(layout_id.to_string());
            }
        }
    }
    Ok(layout_ids)
}

fn layout_structures(api: &dyn OccApi, layout_ids: &[String]) -> Result<BTreeMap<String, Value>> {
    if layout_ids.is_empty() {
        return Ok(BTreeMap::new());
    }
    info!("Getting the layout structures");
    let mut structures = BTreeMap::new();
    for layout_id in layout_ids {
        let response = api.request(
            RequestSpec::get(format!("layouts/{layout_id}/structure"))
                .header("X-CCAsset-Language", "en"),
        )?;
        structures.insert(
            layout_id.clone(),
            response.get("layout").cloned().unwrap_or(Value::Null),
        );
    }
    Ok(structures)
}

fn instance_locales(
    api: &dyn OccApi,
    widget_ids: &[String],
) -> Result<BTreeMap<String, BTreeMap<String, Value>>> {
    info!("Requesting available locales to OCC");
    let response = api
        .request(RequestSpec::get("merchant/contentLocales").query("includeAllSites", "true"))
        .context("Error requesting available locales")?;
    let locale_names = items(&response)
        .iter()
        .filter_map(|locale| locale.get("name").and_then(Value::as_str))
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    debug!("available locales: {}", locale_names.join(", "));

    let per_instance = run_bounded(widget_ids, MAX_PARALLEL_WIDGET_CALLS, "locale backup", |widget_id| {
        let mut locales = BTreeMap::new();
        for locale in &locale_names {
            info!("Requesting \"{locale}\" locale information for widget instance {widget_id}");
            let data = match api.request(RequestSpec::get(format!("widgets/{widget_id}/locale/{locale}"))) {
                Ok(response) => response.get("localeData").cloned().unwrap_or(Value::Bool(false)),
                Err(error) => {
                    warn!("Unavailable \"{locale}\" locale information for widget instance {widget_id}: {error:#}");
                    Value::Bool(false)
                }
            };
            locales.insert(locale.clone(), data);
        }
        Ok((widget_id.clone(), locales))
    })?;
    Ok(per_instance.into_iter().collect())
}

fn instance_metadata(api: &dyn OccApi, widget_ids: &[String]) -> Result<Vec<(String, Value)>> {
    if widget_ids.is_empty() {
        return Ok(Vec::new());
    }
    info!("Getting the current widget configurations");
    run_bounded(widget_ids, MAX_PARALLEL_WIDGET_CALLS, "widget configuration backup", |widget_id| {
        let response = api.request(
            RequestSpec::get(format!("widgets/{widget_id}")).header("X-CCAsset-Language", "en"),
        )?;
        Ok((widget_id.clone(), response))
    })
}

fn layout_descriptor_id(metadata: &Value) -> Option<String> {
    let instance = metadata.get("instance")?;
    instance
        .pointer("/currentLayout/widgetLayoutDescriptor/repositoryId")
        .and_then(Value::as_str)
        .or_else(|| {
            instance
                .pointer("/widgetLayoutDescriptor/layouts")
                .and_then(Value::as_array)?
                .iter()
                .find_map(|layout| layout.get("repositoryId").and_then(Value::as_str))
        })
        .map(ToString::to_string)
}

fn elementized_layouts(
    api: &dyn OccApi,
    metadata: &[(String, Value)],
) -> Result<BTreeMap<String, ElementizedLayout>> {
    let mut layouts = BTreeMap::new();
    for (instance_id, payload) in metadata {
        let Some(layout_descriptor_id) = layout_descriptor_id(payload) else {
            continue;
        };
        info!("Widget instance {instance_id} is elementized. Storing template information");
        let fragments = payload
            .get("fragments")
            .and_then(Value::as_array)
            .map(|fragments| {
                fragments
                    .iter()
                    .filter(|fragment| fragment.get("type").and_then(Value::as_str) == Some("instance"))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let code = api
            .request(RequestSpec::get(format!("widgets/{instance_id}/code")))
            .with_context(|| format!("Error requesting default template for widget instance {instance_id}"))?;
        info!("Success requesting default template for widget instance {instance_id}");

        layouts.insert(
            instance_id.clone(),
            ElementizedLayout {
                display_name: payload
                    .pointer("/instance/displayName")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                fragments,
                layout_descriptor_id,
                layout_source: code
                    .get("source")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
        );
    }
    Ok(layouts)
}

#[cfg(test)]
mod tests {
    use reqwest::Method;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::test_support::MockApi;

    fn descriptors() -> Value {
        json!({ "items": [
            { "widgetType": "other", "instances": [] },
            { "widgetType": "oeCart", "id": "d1", "instances": [
                { "id": "w1", "displayName": "Cart", "pageIds": ["p1"] },
                { "id": "w2", "displayName": "Mini Cart", "pageIds": ["p2"] }
            ] }
        ] })
    }

    fn scripted() -> MockApi {
        MockApi::new()
            .on(Method::GET, "widgetDescriptors/instances", descriptors())
            .on(
                Method::GET,
                "layouts",
                json!({ "items": [{ "pageLayouts": [
                    { "repositoryId": "p1", "displayName": "Cart Page", "layout": { "repositoryId": "l1" } },
                    { "repositoryId": "p9", "displayName": "Home", "layout": { "repositoryId": "l9" } }
                ] }] }),
            )
            .on(Method::GET, "layouts/l1/structure", json!({ "layout": { "regions": [] } }))
            .on(Method::GET, "merchant/contentLocales", json!({ "items": [{ "name": "en" }, { "name": "fr" }] }))
            .on(Method::GET, "widgets/w1/locale/en", json!({ "localeData": { "custom": { "title": "Cart" } } }))
            .on_status(Method::GET, "widgets/w1/locale/fr", 404)
            .on(Method::GET, "widgets/w2/locale/en", json!({ "localeData": {} }))
            .on(Method::GET, "widgets/w2/locale/fr", json!({ "localeData": {} }))
            .on(
                Method::GET,
                "widgets/w1",
                json!({
                    "settings": { "showTotals": true },
                    "instance": {
                        "displayName": "Cart",
                        "currentLayout": { "widgetLayoutDescriptor": { "repositoryId": "wl1" } }
                    },
                    "fragments": [
                        { "type": "instance", "tag": "text@100" },
                        { "type": "static", "tag": "title@101" }
                    ]
                }),
            )
            .on(Method::GET, "widgets/w2", json!({ "settings": {}, "instance": { "displayName": "Mini Cart" } }))
            .on(Method::GET, "widgets/w1/code", json!({ "source": "<div></div>" }))
    }

    #[test]
    fn backup_walks_the_pipeline() {
        let api = scripted();
        let snapshot = backup(&api, "oeCart").expect("backup");

        assert_eq!(snapshot.widget_ids, vec!["w1", "w2"]);
        assert_eq!(snapshot.structures.keys().collect::<Vec<_>>(), vec!["l1"]);
        assert_eq!(snapshot.locales["w1"]["en"], json!({ "custom": { "title": "Cart" } }));
        assert_eq!(snapshot.locales["w1"]["fr"], json!(false));
        assert_eq!(snapshot.settings["w1"], json!({ "showTotals": true }));

        let layout = &snapshot.layouts["w1"];
        assert_eq!(layout.layout_descriptor_id, "wl1");
        assert_eq!(layout.fragments, vec![json!({ "type": "instance", "tag": "text@100" })]);
        assert_eq!(layout.layout_source, "<div></div>");
        assert!(!snapshot.layouts.contains_key("w2"));

        let structure = &api.calls(Method::GET, "layouts/l1/structure")[0];
        assert!(structure.headers.contains(&("X-CCAsset-Language".to_string(), "en".to_string())));
    }

    #[test]
    fn missing_widget_yields_empty_snapshot() {
        let api = MockApi::new()
            .on(Method::GET, "widgetDescriptors/instances", descriptors())
            .on(Method::GET, "merchant/contentLocales", json!({ "items": [{ "name": "en" }] }));
        let snapshot = backup(&api, "oeUnknown").expect("backup");
        assert!(snapshot.widget.is_none());
        assert!(snapshot.widget_ids.is_empty());
        assert!(snapshot.layouts.is_empty());
        assert_eq!(api.count(Method::GET, "layouts"), 0);
    }

    #[test]
    fn backup_file_round_trips() {
        let temp = tempdir().expect("tempdir");
        let api = scripted();
        let path = backup_to_file(&api, "oeCart", temp.path()).expect("backup");
        let name = path.file_name().expect("name").to_string_lossy().into_owned();
        assert!(name.starts_with("widget-oeCart-") && name.ends_with(".json"));
        let loaded = load(&path).expect("load");
        assert_eq!(loaded.widget_type, "oeCart");
        assert_eq!(loaded.widget_ids, vec!["w1", "w2"]);
    }

    #[test]
    fn layout_descriptor_falls_back_to_first_layout() {
        let metadata = json!({ "instance": { "widgetLayoutDescriptor": { "layouts": [{ "name": "x" }, { "repositoryId": "wl2" }] } } });
        assert_eq!(layout_descriptor_id(&metadata).as_deref(), Some("wl2"));
        assert_eq!(layout_descriptor_id(&json!({ "instance": {} })), None);
    }
}
