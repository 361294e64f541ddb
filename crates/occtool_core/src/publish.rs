use std::thread::sleep;

use anyhow::{Result, bail};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::request::{JobPolling, OccApi, RequestSpec};
use crate::worksets::find_current_user_workset;

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub workset_id: String,
    pub completed_phases: Vec<String>,
    pub polls: usize,
}

/// Publish the current user's workset (or `default`) and follow it to completion.
pub fn trigger(api: &dyn OccApi, username: &str, polling: JobPolling) -> Result<PublishReport> {
    info!("Triggering publish");
    let workset_id = match find_current_user_workset(api, username)? {
        Some(workset) => {
            let id = workset
                .get("repositoryId")
                .and_then(Value::as_str)
                .unwrap_or("default")
                .to_string();
            info!(
                "Publishing changes of workset \"{}\"...",
                workset.get("name").and_then(serde_json::Value::as_str).unwrap_or(&id)
            );
            id
        }
        None => {
            warn!("No specific workset found for the current user... publishing the default one.");
            "default".to_string()
        }
    };

    let response = api.request(RequestSpec::post("publishingChangeLists/publish").json(json!({
        "eventName": username,
        "operationType": "selective_publish",
        "worksetId": workset_id,
    })))?;
    if !flag(&response, "publishRunning") {
        bail!(
            "Error while triggering the publish: {}",
            response.get("message").and_then(Value::as_str).unwrap_or("publish did not start")
        );
    }
    if let Some(message) = response.get("statusMessage").and_then(Value::as_str) {
        info!("{message}");
    }

    let (completed_phases, polls) = follow(api, polling)?;
    Ok(PublishReport {
        workset_id,
        completed_phases,
        polls,
    })
}

fn follow(api: &dyn OccApi, polling: JobPolling) -> Result<(Vec<String>, usize)> {
    let mut completed_phases: Vec<String> = Vec::new();
    let mut announced = false;

    for poll in 1..=polling.max_polls.max(1) {
        let status = api.request(RequestSpec::get("publish").query("lastPublished", "true"))?;

        if !announced && let Some(datasource) = status.get("storeInitialDatasource") {
            info!(
                "Publishing {} changes",
                status.get("numberOfChanges").and_then(serde_json::Value::as_u64).unwrap_or(0)
            );
            info!("Initial store catalog {}", text(datasource));
            announced = true;
        }

        if !flag(&status, "publishRunning") {
            info!("Publishing completed!");
            return Ok((completed_phases, poll));
        }

        if let Some(current) = status.get("currentPhase").map(text)
            && !completed_phases.contains(&current)
        {
            info!(
                "Completed phase {}, now running phase {current}",
                status.get("lastCompletedPhase").map(text).unwrap_or_default()
            );
            completed_phases.push(current);
        }
        if poll < polling.max_polls {
            sleep(polling.interval);
        }
    }
    bail!("publish still running after {} polls", polling.max_polls)
}

fn flag(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::Method;
    use serde_json::json;

    use super::*;
    use crate::test_support::MockApi;

    fn polling(max_polls: usize) -> JobPolling {
        JobPolling {
            interval: Duration::ZERO,
            max_polls,
        }
    }

    #[test]
    fn trigger_publishes_user_workset_and_tracks_phases() {
        let api = MockApi::new()
            .on(Method::GET, "worksets", json!({ "items": [{ "repositoryId": "ws-7", "name": "jane" }] }))
            .on(Method::POST, "publishingChangeLists/publish", json!({ "publishRunning": true, "statusMessage": "started" }))
            .on(
                Method::GET,
                "publish",
                json!({ "publishRunning": true, "storeInitialDatasource": "A", "numberOfChanges": 3, "currentPhase": "index", "lastCompletedPhase": "copy" }),
            )
            .on(Method::GET, "publish", json!({ "publishRunning": true, "currentPhase": "index" }))
            .on(Method::GET, "publish", json!({ "publishRunning": false }));

        let report = trigger(&api, "jane@acme.test", polling(10)).expect("trigger");
        assert_eq!(report.workset_id, "ws-7");
        assert_eq!(report.completed_phases, vec!["index"]);
        assert_eq!(report.polls, 3);

        let body = &api.bodies(Method::POST, "publishingChangeLists/publish")[0];
        assert_eq!(body["operationType"], "selective_publish");
        assert_eq!(body["eventName"], "jane@acme.test");
    }

    #[test]
    fn trigger_falls_back_to_default_workset() {
        let api = MockApi::new()
            .on(Method::GET, "worksets", json!({ "items": [] }))
            .on(Method::POST, "publishingChangeLists/publish", json!({ "publishRunning": true }))
            .on(Method::GET, "publish", json!({ "publishRunning": false }));
        let report = trigger(&api, "jane@acme.test", polling(2)).expect("trigger");
        assert_eq!(report.workset_id, "default");
    }

    #[test]
    fn trigger_fails_when_publish_does_not_start() {
        let api = MockApi::new()
            .on(Method::GET, "worksets", json!({ "items": [] }))
            .on(Method::POST, "publishingChangeLists/publish", json!({ "publishRunning": false, "message": "nothing to publish" }));
        let error = trigger(&api, "jane@acme.test", polling(2)).expect_err("must fail");
        assert!(error.to_string().contains("nothing to publish"));
        assert_eq!(api.count(Method::GET, "publish"), 0);
    }

    #[test]
    fn follow_gives_up_at_ceiling() {
        let api = MockApi::new().on(Method::GET, "publish", json!({ "publishRunning": true }));
        let error = follow(&api, polling(2)).expect_err("must fail");
        assert!(error.to_string().contains("after 2 polls"));
    }
}
