use anyhow::Result;
use serde_json::Value;

use crate::request::{OccApi, RequestSpec};
use crate::worksets::items;

/// Explicit comma-separated ids win; otherwise every site registered on the platform.
pub fn resolve_site_ids(api: &dyn OccApi, explicit: Option<&str>) -> Result<Vec<String>> {
    if let Some(explicit) = explicit {
        let ids = explicit
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if !ids.is_empty() {
            return Ok(ids);
        }
    }

    let response = api.request(RequestSpec::get("sites"))?;
    Ok(items(&response)
        .iter()
        .filter_map(|site| site.get("repositoryId").and_then(Value::as_str))
        .map(ToString::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use reqwest::Method;
    use serde_json::json;

    use super::resolve_site_ids;
    use crate::test_support::MockApi;

    #[test]
    fn explicit_ids_skip_the_api() {
        let api = MockApi::new();
        let ids = resolve_site_ids(&api, Some("siteUS, siteCA")).expect("ids");
        assert_eq!(ids, vec!["siteUS", "siteCA"]);
        assert!(api.all_calls().is_empty());
    }

    #[test]
    fn missing_ids_list_all_sites() {
        let api = MockApi::new().on(
            Method::GET,
            "sites",
            json!({ "items": [{ "repositoryId": "siteUS" }, { "repositoryId": "siteCA" }] }),
        );
        let ids = resolve_site_ids(&api, None).expect("ids");
        assert_eq!(ids, vec!["siteUS", "siteCA"]);
    }
}
