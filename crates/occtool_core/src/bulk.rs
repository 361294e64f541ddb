use std::path::{Path, PathBuf};
use std::thread::sleep;

use anyhow::{Result, bail};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info};

use crate::request::{JobPolling, OccApi, RequestSpec};
use crate::runtime::write_json_file;
use crate::transport::FormPart;
use crate::worksets::items;

#[derive(Debug, Clone)]
pub struct BulkImportOptions {
    pub import_id: String,
    pub file: PathBuf,
    pub format: String,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkImportReport {
    pub process_id: String,
    pub progress: String,
    pub items: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub duration: String,
    pub failures: Vec<String>,
    pub report_path: Option<PathBuf>,
}

/// Whether the platform accepts `import_id` in `format`.
pub fn is_process_allowed(api: &dyn OccApi, import_id: &str, format: &str) -> Result<bool> {
    let operations = api.request(RequestSpec::get("importOperations"))?;
    Ok(items(&operations).iter().any(|operation| {
        operation.get("typeId").and_then(Value::as_str) == Some(import_id)
            && operation
                .get("formats")
                .and_then(Value::as_array)
                .is_some_and(|formats| formats.iter().any(|value| value.as_str() == Some(format)))
    }))
}

pub fn import(
    api: &dyn OccApi,
    options: &BulkImportOptions,
    polling: JobPolling,
    report_dir: &Path,
) -> Result<BulkImportReport> {
    if !is_process_allowed(api, &options.import_id, &options.format)? {
        bail!("Import operation not supported");
    }
    if !options.file.is_file() {
        bail!("bulk import file not found: {}", options.file.display());
    }
    let file_name = options
        .file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    info!(
        "Started {} import process for file {}...",
        options.import_id,
        options.file.display()
    );
    let uploaded = api.request(RequestSpec::post("files").multipart(vec![
        FormPart::Text {
            name: "filename".to_string(),
            value: file_name.clone(),
        },
        FormPart::Text {
            name: "uploadType".to_string(),
            value: "bulkImport".to_string(),
        },
        FormPart::File {
            name: "fileUpload".to_string(),
            path: options.file.clone(),
        },
    ]))?;
    ensure_upload_succeeded(&uploaded)?;
    info!("File {} uploaded to OCC, starting import process...", options.file.display());

    let process = api.request(RequestSpec::post("importProcess").json(json!({
        "id": options.import_id,
        "format": options.format,
        "fileName": file_name,
        "mode": options.mode,
    })))?;
    let Some(process_id) = process.get("processId").and_then(Value::as_str) else {
        bail!(
            "Unable to start the bulk import process [status={}]",
            process.get("status").and_then(Value::as_str).unwrap_or("unknown")
        );
    };
    info!(
        "Import process {process_id} started with status {}...",
        process.get("status").and_then(serde_json::Value::as_str).unwrap_or("unknown")
    );

    let status = wait_for_completion(api, process_id, polling)?;
    let progress = status
        .get("progress")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    info!("Import process finished with status {progress}");

    info!("Downloading import report");
    let Some(report_url) = status
        .get("links")
        .and_then(Value::as_array)
        .and_then(|links| {
            links
                .iter()
                .find(|link| link.get("rel").and_then(Value::as_str) == Some("meta"))
        })
        .and_then(|link| link.get("href").and_then(Value::as_str))
    else {
        bail!("import process {process_id} did not link a report");
    };
    let report = api.request(RequestSpec::url(reqwest::Method::GET, report_url))?;

    let success_count = report.get("successCount").and_then(Value::as_u64).unwrap_or(0);
    let failure_count = report.get("failureCount").and_then(Value::as_u64).unwrap_or(0);
    let duration = match (
        report.get("startTime").and_then(Value::as_i64),
        report.get("endTime").and_then(Value::as_i64),
    ) {
        (Some(start), Some(end)) => format_duration(end - start),
        _ => "unknown".to_string(),
    };
    let failures = report
        .get("failureExceptions")
        .and_then(Value::as_array)
        .map(|exceptions| {
            exceptions
                .iter()
                .filter_map(|exception| exception.get("message").and_then(Value::as_str))
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let mut report_path = None;
    if !failures.is_empty() {
        for failure in &failures {
            error!("{failure}");
        }
        let path = report_dir.join(format!("bulk-import-{process_id}.json"));
        write_json_file(&path, &report)?;
        info!("Full report stored at {}", path.display());
        report_path = Some(path);
    }

    Ok(BulkImportReport {
        process_id: process_id.to_string(),
        progress,
        items: success_count + failure_count,
        success_count,
        failure_count,
        duration,
        failures,
        report_path,
    })
}

fn ensure_upload_succeeded(uploaded: &Value) -> Result<()> {
    let success = uploaded.get("success").and_then(Value::as_bool).unwrap_or(false);
    let result = uploaded.get("result");
    let had_success = result
        .and_then(|result| result.get("hadSuccess"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let any_failed = result
        .and_then(|result| result.get("fileResults"))
        .and_then(Value::as_array)
        .is_some_and(|files| {
            files
                .iter()
                .any(|file| !file.get("success").and_then(Value::as_bool).unwrap_or(false))
        });
    if !success || !had_success || any_failed {
        bail!("Error upload the file to OCC");
    }
    Ok(())
}

fn wait_for_completion(api: &dyn OccApi, process_id: &str, polling: JobPolling) -> Result<Value> {
    let url = format!("importProcess/{process_id}");
    for attempt in 1..=polling.max_polls.max(1) {
        let status = api.request(RequestSpec::get(&url))?;
        if status.get("completed").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(status);
        }
        if attempt < polling.max_polls {
            sleep(polling.interval);
        }
    }
    bail!(
        "import process {process_id} did not complete after {} polls",
        polling.max_polls
    )
}

/// Human elapsed time: milliseconds under a second, seconds under a minute,
/// otherwise days, hours and minutes with zero units left out.
pub fn format_duration(elapsed_ms: i64) -> String {
    if elapsed_ms < 1_000 {
        return format!("{elapsed_ms} milliseconds");
    }
    let total_seconds = elapsed_ms / 1_000;
    if elapsed_ms < 60_000 {
        return unit(total_seconds, "second");
    }

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    [(days, "day"), (hours, "hour"), (minutes, "minute")]
        .into_iter()
        .filter(|(amount, _)| *amount > 0)
        .map(|(amount, name)| unit(amount, name))
        .collect::<Vec<_>>()
        .join(" ")
}

fn unit(amount: i64, name: &str) -> String {
    if amount == 1 {
        format!("1 {name}")
    } else {
        format!("{amount} {name}s")
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
    use crate::test_support::MockApi;
    use crate::transport::RequestBody;

    fn polling() -> JobPolling {
        JobPolling {
            interval: Duration::ZERO,
            max_polls: 3,
        }
    }

    fn operations() -> Value {
        json!({ "items": [{ "typeId": "Products", "formats": ["csv", "json"] }] })
    }

    fn uploaded_ok() -> Value {
        json!({ "success": true, "result": { "hadSuccess": true, "fileResults": [{ "success": true }] } })
    }

    #[test]
    fn format_duration_picks_units() {
        assert_eq!(format_duration(450), "450 milliseconds");
        assert_eq!(format_duration(1_000), "1 second");
        assert_eq!(format_duration(42_300), "42 seconds");
        assert_eq!(format_duration(3_720_000), "1 hour 2 minutes");
        assert_eq!(format_duration(2 * 86_400_000 + 60_000), "2 days 1 minute");
    }

    #[test]
    fn unsupported_format_is_rejected_before_upload() {
        let temp = tempdir().expect("tempdir");
        let api = MockApi::new().on(Method::GET, "importOperations", operations());
        let options = BulkImportOptions {
            import_id: "Products".to_string(),
            file: temp.path().join("p.xlsx"),
            format: "xlsx".to_string(),
            mode: "standalone".to_string(),
        };
        let error = import(&api, &options, polling(), temp.path()).expect_err("must fail");
        assert_eq!(error.to_string(), "Import operation not supported");
        assert_eq!(api.all_calls().len(), 1);
    }

    #[test]
    fn import_uploads_polls_and_stores_failures() {
        let temp = tempdir().expect("tempdir");
        let file = temp.path().join("products.csv");
        fs::write(&file, "id,name\n1,a\n").expect("write");
        let report_url = "https://ccadmin.test/ccadmin/v1/importProcess/p-1/report";
        let api = MockApi::new()
            .on(Method::GET, "importOperations", operations())
            .on(Method::POST, "files", uploaded_ok())
            .on(Method::POST, "importProcess", json!({ "processId": "p-1", "status": "submitted" }))
            .on(Method::GET, "importProcess/p-1", json!({ "completed": false }))
            .on(
                Method::GET,
                "importProcess/p-1",
                json!({ "completed": true, "progress": "completed", "links": [{ "rel": "meta", "href": report_url }] }),
            )
            .on(
                Method::GET,
                report_url,
                json!({
                    "successCount": 4,
                    "failureCount": 1,
                    "startTime": 0,
                    "endTime": 2_500,
                    "failureExceptions": [{ "message": "row 3 invalid" }]
                }),
            );
        let options = BulkImportOptions {
            import_id: "Products".to_string(),
            file,
            format: "csv".to_string(),
            mode: "standalone".to_string(),
        };

        let report = import(&api, &options, polling(), temp.path()).expect("import");
        assert_eq!(report.items, 5);
        assert_eq!(report.duration, "2 seconds");
        assert_eq!(report.failures, vec!["row 3 invalid"]);
        assert_eq!(api.count(Method::GET, "importProcess/p-1"), 2);
        let stored = report.report_path.expect("report path");
        assert!(stored.ends_with("bulk-import-p-1.json"));
        assert!(stored.is_file());

        let upload = &api.calls(Method::POST, "files")[0];
        let RequestBody::Multipart(parts) = &upload.body else {
            panic!("expected multipart upload");
        };
        assert!(parts.contains(&FormPart::Text {
            name: "uploadType".to_string(),
            value: "bulkImport".to_string(),
        }));
    }

    #[test]
    fn failed_file_result_aborts_import() {
        assert!(ensure_upload_succeeded(&uploaded_ok()).is_ok());
        let partial = json!({ "success": true, "result": { "hadSuccess": true, "fileResults": [{ "success": false }] } });
        assert!(ensure_upload_succeeded(&partial).is_err());
        assert!(ensure_upload_succeeded(&json!({ "success": false })).is_err());
    }

    #[test]
    fn polling_stops_at_ceiling() {
        let api = MockApi::new().on(Method::GET, "importProcess/p-9", json!({ "completed": false }));
        let error = wait_for_completion(&api, "p-9", polling()).expect_err("must fail");
        assert!(error.to_string().contains("after 3 polls"));
        assert_eq!(api.count(Method::GET, "importProcess/p-9"), 3);
    }
}
