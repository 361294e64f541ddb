use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use regex::{NoExpand, Regex};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};

use crate::extension::{self, ExtensionContext, ExtensionKind};
use crate::parallel::{MAX_PARALLEL_WIDGET_CALLS, run_bounded};
use crate::request::{OccApi, RequestSpec};
use crate::widget_backup::{self, ElementizedLayout, WidgetSnapshot, find_descriptor};

const FRAGMENT_DROPPED_KEYS: [&str; 6] = [
    "repositoryId",
    "source",
    "inline",
    "children",
    "title",
    "previewText",
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub widget_type: String,
    /// Old instance id to the id now live on OCC.
    pub instances: BTreeMap<String, String>,
    pub placed_layouts: Vec<String>,
    pub restored_locales: usize,
    pub restored_settings: Vec<String>,
    pub restored_layouts: Vec<String>,
}

pub fn restore_from_file(
    api: &dyn OccApi,
    ctx: &ExtensionContext<'_>,
    widget_type: &str,
    path: &Path,
) -> Result<RestoreReport> {
    let snapshot = widget_backup::load(path)?;
    restore(api, ctx, widget_type, &snapshot)
}

pub fn restore(
    api: &dyn OccApi,
    ctx: &ExtensionContext<'_>,
    widget_type: &str,
    snapshot: &WidgetSnapshot,
) -> Result<RestoreReport> {
    let widget_dir = ExtensionKind::Widget.source_dir(ctx.settings, widget_type);
    let config = crate::runtime::read_json_file(&widget_dir.join("widget.json"))?;
    let global = config.get("global").and_then(Value::as_bool).unwrap_or(false);

    let mut report = RestoreReport {
        widget_type: widget_type.to_string(),
        ..RestoreReport::default()
    };

    let descriptor = installed_descriptor(api, ctx, widget_type)?;
    if global {
        report.instances = global_instance(api, widget_type, snapshot)?;
        restore_site_associations(api, snapshot)?;
    } else {
        report.instances = create_instances(api, widget_type, snapshot, &descriptor)?;
        report.placed_layouts = place_instances(api, snapshot, &report.instances)?;
    }

    report.restored_locales = restore_locales(api, snapshot, &report.instances)?;
    if !report.instances.is_empty() {
        let schema = configuration_schema(api, widget_type)?;
        report.restored_settings = restore_settings(api, snapshot, &report.instances, &schema)?;
    }
    if !snapshot.layouts.is_empty() {
        let template = default_layout_template(&widget_dir, snapshot)?;
        report.restored_layouts = restore_elementized_layouts(api, snapshot, &report.instances, &template);
    }
    info!("Widget {widget_type} restored");
    Ok(report)
}

/// Final error for a failed widget change, replaying the backup first when `auto_restore` is set.
pub(crate) fn recover(
    api: &dyn OccApi,
    ctx: &ExtensionContext<'_>,
    widget_type: &str,
    backup: &Path,
    auto_restore: bool,
    failure: anyhow::Error,
) -> anyhow::Error {
    if !auto_restore {
        return failure.context(format!(
            "backup of {widget_type} stored at {}",
            backup.display()
        ));
    }
    error!("The following error happened: {failure:#}");
    warn!("The auto-restore is enabled, hence, restoring the widget...");
    if let Err(restore_error) = restore_from_file(api, ctx, widget_type, backup) {
        return restore_error.context(format!(
            "auto-restore of {widget_type} from {} failed after: {failure:#}",
            backup.display()
        ));
    }
    failure.context(format!("{widget_type} was restored from {}", backup.display()))
}

/// Descriptor for the widget, uploading the extension back when it is gone.
fn installed_descriptor(
    api: &dyn OccApi,
    ctx: &ExtensionContext<'_>,
    widget_type: &str,
) -> Result<Value> {
    if let Some(descriptor) = find_descriptor(api, widget_type)? {
        return Ok(descriptor);
    }
    warn!("The Extension {widget_type} has been deleted, running upgrade to upload it back...");
    extension::upload(api, ctx, ExtensionKind::Widget, widget_type)?;
    match find_descriptor(api, widget_type)? {
        Some(descriptor) => Ok(descriptor),
        None => bail!("widget {widget_type} is still not installed after uploading it back"),
    }
}

fn instance_id(instance: &Value) -> Option<&str> {
    instance
        .get("repositoryId")
        .or_else(|| instance.get("id"))
        .and_then(Value::as_str)
}

fn display_name(instance: &Value) -> &str {
    instance.get("displayName").and_then(Value::as_str).unwrap_or_default()
}

fn create_instances(
    api: &dyn OccApi,
    widget_type: &str,
    snapshot: &WidgetSnapshot,
    descriptor: &Value,
) -> Result<BTreeMap<String, String>> {
    let backed_up = snapshot.instances();
    let mut mapping = BTreeMap::new();
    if backed_up.is_empty() {
        return Ok(mapping);
    }
    info!("Setting up instances for {widget_type}");
    let existing = descriptor
        .get("instances")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for instance in &backed_up {
        let Some(old_id) = instance.get("id").and_then(Value::as_str) else {
            continue;
        };
        let name = display_name(instance);
        if let Some(found) = existing
            .iter()
            .find(|candidate| display_name(candidate) == name)
            .and_then(instance_id)
        {
            info!("Found instance for \"{name}\" in layout");
            mapping.insert(old_id.to_string(), found.to_string());
            continue;
        }

        let created = api.request(
            RequestSpec::post("widgets")
                .header("X-CCAsset-Language", "en")
                .json(json!({ "widgetDescriptorId": widget_type, "displayName": name })),
        )?;
        let Some(new_id) = instance_id(&created) else {
            bail!("OCC did not return an id for the new \"{name}\" instance");
        };
        info!("New instance created {new_id} for deleted instance {old_id}");
        mapping.insert(old_id.to_string(), new_id.to_string());
    }
    Ok(mapping)
}

/// Swap backed-up instance ids for new ones across nested layout regions.
fn remap_instances(node: &mut Value, mapping: &BTreeMap<String, String>) {
    let Some(regions) = node.get_mut("regions").and_then(Value::as_array_mut) else {
        return;
    };
    for region in regions {
        remap_instances(region, mapping);
        let Some(widgets) = region.get_mut("widgets").and_then(Value::as_array_mut) else {
            continue;
        };
        for widget in widgets {
            let replacement = widget
                .get("repositoryId")
                .and_then(Value::as_str)
                .and_then(|old| mapping.get(old))
                .cloned();
            if let (Some(new_id), Some(object)) = (replacement, widget.as_object_mut()) {
                object.insert("repositoryId".to_string(), Value::String(new_id));
            }
        }
    }
}

fn place_instances(
    api: &dyn OccApi,
    snapshot: &WidgetSnapshot,
    mapping: &BTreeMap<String, String>,
) -> Result<Vec<String>> {
    let mut placed = Vec::new();
    if mapping.is_empty() || snapshot.structures.is_empty() {
        return Ok(placed);
    }
    info!("Restoring widget positions on pages");
    for (layout_id, structure) in &snapshot.structures {
        let mut structure = structure.clone();
        remap_instances(&mut structure, mapping);
        match api.request(
            RequestSpec::put(format!("layouts/{layout_id}/structure"))
                .header("X-CCAsset-Language", "en")
                .json(json!({ "layout": structure })),
        ) {
            Ok(_) => {
                info!("Widgets were placed on {layout_id} layout");
                placed.push(layout_id.clone());
            }
            Err(failure) => error!("Could not place widgets on {layout_id} layout: {failure:#}"),
        }
    }
    Ok(placed)
}

fn global_instance(
    api: &dyn OccApi,
    widget_type: &str,
    snapshot: &WidgetSnapshot,
) -> Result<BTreeMap<String, String>> {
    let mut mapping = BTreeMap::new();
    let Some(old_id) = snapshot.widget_ids.first() else {
        return Ok(mapping);
    };
    info!("Getting widget new global instance");
    let descriptor = find_descriptor(api, widget_type)?;
    let Some(new_id) = descriptor
        .as_ref()
        .and_then(|descriptor| descriptor.pointer("/instances/0"))
        .and_then(|instance| instance.get("id").or_else(|| instance.get("repositoryId")))
        .and_then(Value::as_str)
    else {
        bail!("No instances installed for this widget");
    };
    mapping.insert(old_id.clone(), new_id.to_string());
    Ok(mapping)
}

fn restore_site_associations(api: &dyn OccApi, snapshot: &WidgetSnapshot) -> Result<()> {
    let Some(widget) = &snapshot.widget else {
        return Ok(());
    };
    let sites = widget
        .get("sites")
        .and_then(Value::as_array)
        .map(|sites| {
            sites
                .iter()
                .filter_map(|site| site.get("repositoryId").and_then(Value::as_str))
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if sites.is_empty() {
        return Ok(());
    }
    let descriptor = find_descriptor(api, &snapshot.widget_type)?;
    let Some(descriptor_id) = descriptor
        .as_ref()
        .and_then(|descriptor| descriptor.get("id"))
        .and_then(Value::as_str)
    else {
        bail!("No descriptor found for global widget {}", snapshot.widget_type);
    };
    info!("Restoring the previous global widget site associations");
    api.request(
        RequestSpec::post(format!("widgetDescriptors/{descriptor_id}/updateSiteAssociations"))
            .json(json!({ "sites": sites })),
    )?;
    Ok(())
}

fn custom_locale_payload(resource: &Value) -> Option<Value> {
    let custom = resource.get("custom")?;
    let empty = match custom {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(list) => list.is_empty(),
        Value::String(text) => text.is_empty(),
        _ => false,
    };
    (!empty).then(|| json!({ "custom": custom }))
}

fn restore_locales(
    api: &dyn OccApi,
    snapshot: &WidgetSnapshot,
    mapping: &BTreeMap<String, String>,
) -> Result<usize> {
    let targets = snapshot
        .widget_ids
        .iter()
        .filter_map(|old_id| Some((mapping.get(old_id)?.clone(), snapshot.locales.get(old_id)?)))
        .collect::<Vec<_>>();

    let restored = run_bounded(&targets, MAX_PARALLEL_WIDGET_CALLS, "locale restore", |(instance_id, locales)| {
        let mut count = 0;
        for (locale, resource) in *locales {
            let Some(payload) = custom_locale_payload(resource) else {
                info!("Skipping \"{locale}\" locale information for widget {instance_id}");
                continue;
            };
            info!("Restoring \"{locale}\" locale information for widget {instance_id}...");
            match api.request(
                RequestSpec::put(format!("widgets/{instance_id}/locale/{locale}"))
                    .header("X-CCAsset-Language", locale.as_str())
                    .json(payload),
            ) {
                Ok(_) => count += 1,
                Err(failure) => warn!(
                    "Unable to restore \"{locale}\" locale information for widget {instance_id}: {failure:#}"
                ),
            }
        }
        Ok(count)
    })?;
    Ok(restored.into_iter().sum())
}

fn configuration_schema(api: &dyn OccApi, widget_type: &str) -> Result<Vec<Value>> {
    info!("Retrieving new widget configurations");
    let Some(descriptor_id) = find_descriptor(api, widget_type)?
        .and_then(|descriptor| descriptor.get("id").and_then(Value::as_str).map(ToString::to_string))
    else {
        bail!("Widget configurations not found");
    };
    let response = api.request(RequestSpec::get(format!("widgetDescriptors/{descriptor_id}/config")))?;
    Ok(response
        .get("values")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

/// Backed-up settings plus defaults for required keys the new schema introduced.
fn settings_with_defaults(settings: &Map<String, Value>, schema: &[Value]) -> Map<String, Value> {
    let mut merged = settings.clone();
    for entry in schema {
        let required = entry.get("required").and_then(Value::as_bool).unwrap_or(false);
        let Some(name) = entry.get("name").and_then(Value::as_str) else {
            continue;
        };
        if required && !merged.contains_key(name) {
            merged.insert(
                name.to_string(),
                entry.get("defaultValue").cloned().unwrap_or(Value::Null),
            );
        }
    }
    merged
}

fn restore_settings(
    api: &dyn OccApi,
    snapshot: &WidgetSnapshot,
    mapping: &BTreeMap<String, String>,
    schema: &[Value],
) -> Result<Vec<String>> {
    info!("Restoring widgets previous configurations");
    let instances = snapshot.instances();
    let restored = run_bounded(&snapshot.widget_ids, MAX_PARALLEL_WIDGET_CALLS, "settings restore", |old_id| {
        let settings = snapshot
            .settings
            .get(old_id)
            .and_then(Value::as_object)
            .filter(|settings| !settings.is_empty());
        let (Some(settings), Some(new_id)) = (settings, mapping.get(old_id)) else {
            warn!("No settings to be updated for widget {old_id}");
            return Ok(None);
        };
        let name = instances
            .iter()
            .find(|instance| instance.get("id").and_then(Value::as_str) == Some(old_id))
            .map(display_name)
            .unwrap_or_default();
        let merged = settings_with_defaults(settings, schema);

        match api.request(
            RequestSpec::put(format!("widgets/{new_id}"))
                .header("X-CCAsset-Language", "en")
                .json(json!({ "widgetConfig": { "name": name, "notes": "", "settings": merged } })),
        ) {
            Ok(_) => {
                info!("Widget {old_id} successfully restored");
                Ok(Some(new_id.clone()))
            }
            Err(failure) => {
                warn!("Could not restore the settings for widget {old_id}: {failure:#}");
                Ok(None)
            }
        }
    })?;
    Ok(restored.into_iter().flatten().collect())
}

fn default_layout_template(widget_dir: &Path, snapshot: &WidgetSnapshot) -> Result<String> {
    let Some(layout_name) = snapshot
        .widget
        .as_ref()
        .and_then(|widget| widget.pointer("/defaultLayout/name"))
        .and_then(Value::as_str)
    else {
        bail!("backup of {} has no default layout name", snapshot.widget_type);
    };
    let path = widget_dir.join("layouts").join(layout_name).join("widget.template");
    fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
}

fn context_variable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<!-- ko setContextVariable: [\s\S]*? /ko -->").expect("valid regex")
    })
}

fn layout_section_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<!--\soc\slayout:\s.+?-->((?s:.+)<!--\s/oc\s-->)").expect("valid regex")
    })
}

fn sanitize_layout_source(source: &str) -> String {
    context_variable_regex().replace_all(source, "").into_owned()
}

fn fragment_parts(tag: &str) -> (&str, Option<&str>) {
    let mut parts = tag.split('@');
    let name = parts.next().unwrap_or_default();
    (name, parts.next().filter(|id| !id.is_empty()))
}

/// Fragment payload OCC accepts back: ids and render-only keys dropped, config flattened.
fn sanitize_fragment(fragment: &Value) -> Value {
    let mut element = fragment.as_object().cloned().unwrap_or_default();
    for key in FRAGMENT_DROPPED_KEYS {
        element.remove(key);
    }
    if let Some(Value::Object(config)) = element.remove("config") {
        for (name, entry) in config {
            element.insert(name, entry.get("values").cloned().unwrap_or(Value::Null));
        }
    }
    if let Some(Value::Object(image)) = element.get_mut("imageConfig") {
        image.remove("titleTextId");
        image.remove("altTextId");
    }
    if let Some(Value::Object(rich_text)) = element.get_mut("richTextConfig") {
        rich_text.remove("sourceMedia");
    }
    Value::Object(element)
}

struct RestoredFragment {
    old_id: String,
    new_id: String,
    payload: Value,
}

fn recreate_fragments(
    api: &dyn OccApi,
    instance_id: &str,
    layout: &ElementizedLayout,
    source: &str,
) -> Vec<RestoredFragment> {
    let mut restored = Vec::new();
    for fragment in &layout.fragments {
        let tag = fragment.get("tag").and_then(Value::as_str).unwrap_or_default();
        let (element_name, element_id) = fragment_parts(tag);
        let Some(element_id) = element_id.filter(|id| source.contains(id)) else {
            warn!(
                "Disabling element instance \"{}\" since it is not in widget layout",
                fragment.get("text").and_then(serde_json::Value::as_str).unwrap_or(tag)
            );
            continue;
        };

        let created = api.request(
            RequestSpec::post(format!("widgets/{instance_id}/element/{element_name}"))
                .header("X-CCAsset-Language", "en"),
        );
        let created = match created {
            Ok(created) => created,
            Err(failure) => {
                error!(
                    "Error restoring element instance \"{tag}\" for widget \"{}\" ({instance_id}): {failure:#}",
                    layout.display_name
                );
                continue;
            }
        };
        let new_id = created
            .get("repositoryId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut payload = sanitize_fragment(fragment);
        if let Some(object) = payload.as_object_mut() {
            object.insert("oldTag".to_string(), Value::String(tag.to_string()));
            object.insert("tag".to_string(), created.get("tag").cloned().unwrap_or(Value::Null));
            object.insert("repositoryId".to_string(), Value::String(new_id.clone()));
        }
        info!("New element instance generated with id {new_id}");
        restored.push(RestoredFragment {
            old_id: element_id.to_string(),
            new_id,
            payload,
        });
    }
    restored
}

/// Layout source with element ids swapped and the local `oc layout` section spliced in.
fn rebuild_layout_source(source: &str, fragments: &[RestoredFragment], template: &str) -> String {
    let replaced = fragments.iter().fold(source.to_string(), |result, fragment| {
        result.replacen(
            &format!("id: '{}'", fragment.old_id),
            &format!("id: '{}'", fragment.new_id),
            1,
        )
    });
    match layout_section_regex().find(&replaced) {
        Some(section) => layout_section_regex()
            .replace_all(template, NoExpand(section.as_str()))
            .into_owned(),
        None => replaced,
    }
}

fn restore_elementized_layouts(
    api: &dyn OccApi,
    snapshot: &WidgetSnapshot,
    mapping: &BTreeMap<String, String>,
    template: &str,
) -> Vec<String> {
    info!("Restoring elementized widgets for \"{}\" widget", snapshot.widget_type);
    let mut restored = Vec::new();
    for (old_id, layout) in &snapshot.layouts {
        let Some(instance_id) = mapping.get(old_id) else {
            warn!("No live instance for backed-up widget {old_id}. Skipping...");
            continue;
        };
        if layout.fragments.is_empty() {
            info!(
                "Widget instance \"{}\" ({instance_id}) has no elements in layout. Skipping...",
                layout.display_name
            );
            continue;
        }

        let source = sanitize_layout_source(&layout.layout_source);
        let fragments = recreate_fragments(api, instance_id, layout, &source);
        let payload = json!({
            "widgetConfig": { "name": layout.display_name, "notes": "" },
            "layoutConfig": [{
                "fragments": fragments.iter().map(|fragment| fragment.payload.clone()).collect::<Vec<_>>()
            }],
            "layoutSource": rebuild_layout_source(&source, &fragments, template),
            "layoutDescriptorId": layout.layout_descriptor_id,
        });

        info!(
            "Restoring elementized widget layout for instance \"{}\" ({instance_id})",
            layout.display_name
        );
        match api.request(
            RequestSpec::put(format!("widgets/{instance_id}"))
                .header("X-CCAsset-Language", "en")
                .json(payload),
        ) {
            Ok(_) => {
                info!(
                    "Widget instance \"{}\" ({instance_id}) layout successfully restored. Restored {} element instances",
                    layout.display_name,
                    fragments.len()
                );
                restored.push(instance_id.clone());
            }
            Err(failure) => error!(
                "Error restoring elementized widget layout for instance \"{}\" ({instance_id}): {failure:#}",
                layout.display_name
            ),
        }
    }
    restored
}
