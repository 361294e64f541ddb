use anyhow::{Result, bail};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::{WORKSET_NAME_LIMIT, workset_name_for};
use crate::request::{OccApi, RequestSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorksetLookupKind {
    Id,
    Name,
}

impl WorksetLookupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Name => "name",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "id" => Ok(Self::Id),
            "name" => Ok(Self::Name),
            other => bail!("unknown workset lookup type \"{other}\" (expected id or name)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorksetLookup {
    pub kind: WorksetLookupKind,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateReport {
    pub already_created: bool,
    pub worksets: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeReport {
    pub affected: Vec<String>,
}

pub fn find_all(api: &dyn OccApi, query: Option<&str>) -> Result<Vec<Value>> {
    let mut spec = RequestSpec::get("worksets");
    if let Some(query) = query {
        spec = spec.query("q", query);
    }
    let response = api.request(spec)?;
    Ok(items(&response))
}

/// Lookup failures map to `None`.
pub fn find_by_id(api: &dyn OccApi, id: &str) -> Option<Value> {
    api.request(RequestSpec::get(format!("worksets/{id}"))).ok()
}

pub fn find_by_name(api: &dyn OccApi, name: &str) -> Result<Vec<Value>> {
    find_all(api, Some(&format!("name co \"{name}\"")))
}

pub fn find_by_lookup(api: &dyn OccApi, lookup: &WorksetLookup) -> Result<Vec<Value>> {
    let found = match lookup.kind {
        WorksetLookupKind::Id => find_by_id(api, &lookup.value).into_iter().collect(),
        WorksetLookupKind::Name => find_by_name(api, &lookup.value)?,
    };
    if found.is_empty() {
        bail!(
            "Workset {} \"{}\" has not been found.",
            lookup.kind.as_str(),
            lookup.value
        );
    }
    Ok(found)
}

/// Find-or-create by name; the name is truncated to the platform limit first.
pub fn create(api: &dyn OccApi, name: &str) -> Result<CreateReport> {
    let name = name.chars().take(WORKSET_NAME_LIMIT).collect::<String>();
    let existing = find_by_name(api, &name)?;
    if !existing.is_empty() {
        return Ok(CreateReport {
            already_created: true,
            worksets: existing,
        });
    }

    let created = api.request(RequestSpec::post("worksets").json(json!({ "name": name })))?;
    Ok(CreateReport {
        already_created: false,
        worksets: vec![created],
    })
}

pub fn delete(api: &dyn OccApi, lookup: &WorksetLookup) -> Result<ChangeReport> {
    let mut affected = Vec::new();
    for workset in find_by_lookup(api, lookup)? {
        let id = repository_id(&workset)?;
        api.request(RequestSpec::delete(format!("worksets/{id}")))?;
        affected.push(id);
    }
    Ok(ChangeReport { affected })
}

pub fn rename(api: &dyn OccApi, lookup: &WorksetLookup, new_name: &str) -> Result<ChangeReport> {
    let mut affected = Vec::new();
    for workset in find_by_lookup(api, lookup)? {
        let id = repository_id(&workset)?;
        api.request(RequestSpec::put(format!("worksets/{id}")).json(json!({ "name": new_name })))?;
        affected.push(id);
    }
    Ok(ChangeReport { affected })
}

/// List worksets, optionally embedding each workset's detail payload.
pub fn list(api: &dyn OccApi, query: Option<&str>, include_details: bool) -> Result<Vec<Value>> {
    let mut results = find_all(api, query)?;
    if include_details {
        for item in &mut results {
            let Some(id) = item.get("repositoryId").and_then(Value::as_str) else {
                continue;
            };
            let details = find_by_id(api, id).unwrap_or(Value::Null);
            if let Value::Object(map) = item {
                map.insert("details".to_string(), details);
            }
        }
    }
    Ok(results)
}

pub fn find_current_user_workset(api: &dyn OccApi, username: &str) -> Result<Option<Value>> {
    let name = workset_name_for(username);
    let found = find_by_name(api, &name)?;
    match found.into_iter().next() {
        Some(workset) => {
            info!("Using workset \"{name}\"");
            Ok(Some(workset))
        }
        None => {
            warn!("No specific workset found for the current user \"{name}\"");
            Ok(None)
        }
    }
}

pub(crate) fn items(response: &Value) -> Vec<Value> {
    response
        .get("items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn repository_id(workset: &Value) -> Result<String> {
    match workset.get("repositoryId").and_then(Value::as_str) {
        Some(id) => Ok(id.to_string()),
        None => bail!("workset payload is missing repositoryId: {workset}"),
    }
}
