//! Per-site values of config and gateway extensions. OCC drops them when
//! the extension is removed, so upgrades snapshot them first.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::request::{OccApi, RequestSpec, error_status};
use crate::runtime::{read_json_file, unix_timestamp_ms, write_json_file};
use crate::sites::resolve_site_ids;

pub const SITE_HEADER: &str = "x-ccsite";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteSettingsSnapshot {
    pub name: String,
    /// `data` of `sitesettings/{name}` keyed by site id; sites without it are absent.
    #[serde(default)]
    pub sites: BTreeMap<String, Value>,
}

/// Settings `data` for one site, or `None` when the extension is not installed there.
pub fn get(api: &dyn OccApi, name: &str, site_id: &str) -> Result<Option<Value>> {
    let response = match api.request(
        RequestSpec::get(format!("sitesettings/{name}")).header(SITE_HEADER, site_id),
    ) {
        Ok(response) => response,
        Err(error) if error_status(&error) == Some(404) => return Ok(None),
        Err(error) => {
            return Err(error.context(format!("failed to read site settings {name} on {site_id}")));
        }
    };
    Ok(response.get("data").filter(|data| !data.is_null()).cloned())
}

pub fn backup(api: &dyn OccApi, name: &str) -> Result<SiteSettingsSnapshot> {
    let mut snapshot = SiteSettingsSnapshot {
        name: name.to_string(),
        ..SiteSettingsSnapshot::default()
    };
    for site_id in resolve_site_ids(api, None)? {
        match get(api, name, &site_id)? {
            Some(data) => {
                info!("Storing {name} settings for site {site_id}");
                snapshot.sites.insert(site_id, data);
            }
            None => info!("This extension is not installed on site {site_id}"),
        }
    }
    Ok(snapshot)
}

/// Snapshot to `<backup_dir>/<kind>-<name>-<ms>.json`.
pub fn backup_to_file(
    api: &dyn OccApi,
    kind: &str,
    name: &str,
    backup_dir: &Path,
) -> Result<(PathBuf, SiteSettingsSnapshot)> {
    let snapshot = backup(api, name)?;
    let path = backup_dir.join(format!("{kind}-{name}-{}.json", unix_timestamp_ms()?));
    info!("Storing backup on file {}", path.display());
    write_json_file(&path, &snapshot)?;
    Ok((path, snapshot))
}

pub fn load(path: &Path) -> Result<SiteSettingsSnapshot> {
    let value = read_json_file(path)?;
    serde_json::from_value(value)
        .with_context(|| format!("{} is not a site settings backup", path.display()))
}

/// Write every stored site's values back; returns the number of sites restored.
pub fn restore(api: &dyn OccApi, snapshot: &SiteSettingsSnapshot) -> Result<usize> {
    for (site_id, data) in &snapshot.sites {
        info!("Restoring {} settings for site {site_id}", snapshot.name);
        api.request(
            RequestSpec::put(format!("sitesettings/{}", snapshot.name))
                .header(SITE_HEADER, site_id.clone())
                .json(data.clone()),
        )
        .with_context(|| format!("failed to restore {} settings on {site_id}", snapshot.name))?;
    }
    Ok(snapshot.sites.len())
}
