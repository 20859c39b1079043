//! Test case engine
//!
//! Executes a single case: seed the datastore, build and send the
//! request, snapshot the response, compare against the expectation,
//! and poll until success, break, or timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use apiprobe_common::template::Loader;
use apiprobe_common::{compare, lenient, Datastore, Error, PathSpec, ReportElement, Result};

use crate::request::{RequestSpec, StandardHeaders};
use crate::response::{self, FormatSpec};
use crate::{truncate_for_log, RunConfig};

/// Poll cap when `timeout_ms` is 0
const DEFAULT_TIMEOUT_MS: i64 = 10;
/// Sleep between poll iterations when `delay_ms` is absent
const DEFAULT_DELAY_MS: u64 = 10;

/// One test leaf as declared in a manifest
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Case {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub request: Option<RequestSpec>,
    /// Expected response; absent means "status 200, any body"
    #[serde(default)]
    pub response: Option<Value>,
    /// Seeded into the datastore before the request runs
    #[serde(default)]
    pub store: Map<String, Value>,
    /// Datastore key → JSON query applied to each response snapshot
    #[serde(default)]
    pub store_response_qjson: HashMap<String, String>,
    /// Responses that abort the poll loop with failure
    #[serde(default)]
    pub break_response: Vec<Value>,
    /// Responses that must each be observed at least once; a string is
    /// a PathSpec reference, an object is a single entry
    #[serde(default)]
    pub collect_response: Option<Value>,
    /// Poll budget in ms; 0 = default, -1 = no polling
    #[serde(default)]
    pub timeout_ms: i64,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub wait_before_ms: Option<u64>,
    #[serde(default)]
    pub wait_after_ms: Option<u64>,
    /// Keep running sibling cases after this one fails
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub log_network: Option<bool>,
    #[serde(default)]
    pub log_verbose: Option<bool>,
}

impl Case {
    pub fn label(&self, index: usize) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("case #{}", index + 1),
        }
    }
}

/// Outcome of one executed case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseOutcome {
    pub success: bool,
    pub continue_on_failure: bool,
}

/// Executes cases against a shared datastore and report element
#[derive(Clone)]
pub struct CaseRunner {
    pub loader: Loader,
    pub datastore: Arc<Datastore>,
    pub client: reqwest::Client,
    pub client_no_redirect: reqwest::Client,
    pub server_url: Option<String>,
    pub standard_headers: StandardHeaders,
    pub config: RunConfig,
}

impl CaseRunner {
    /// Run one case, recording into `report`. The report element is
    /// left (with elapsed time) before returning.
    pub async fn run(&self, case: &Case, report: &Arc<ReportElement>) -> CaseOutcome {
        let success = match self.run_inner(case, report).await {
            Ok(success) => success,
            Err(e) => {
                report.save_to_report_log(&e.to_string());
                false
            }
        };
        report.leave(success);
        if let Some(ms) = case.wait_after_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        CaseOutcome {
            success,
            continue_on_failure: case.continue_on_failure,
        }
    }

    async fn run_inner(&self, case: &Case, report: &Arc<ReportElement>) -> Result<bool> {
        self.datastore.set_map(case.store.clone())?;

        if let Some(ms) = case.wait_before_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        let Some(request) = &case.request else {
            return Ok(true);
        };

        let mut collect = self.parse_collect(case)?;
        let collect_present = !collect.is_empty();

        let (expected, format) = self.parse_expected(case)?;

        let timeout = match case.timeout_ms {
            0 => DEFAULT_TIMEOUT_MS,
            other => other,
        };
        let delay = Duration::from_millis(case.delay_ms.unwrap_or(DEFAULT_DELAY_MS));
        let start = Instant::now();
        let log_network = case.log_network.unwrap_or(self.config.log_network);

        let mut first = true;
        loop {
            let built = request.build(
                &self.loader,
                &self.datastore,
                self.server_url.as_deref(),
                &self.standard_headers,
            )?;
            if self.config.curl_bash {
                report.save_to_report_log(&built.to_curl());
            }
            if log_network {
                report.save_to_report_log(&truncate_for_log(
                    &built.describe(),
                    self.config.limit_request,
                ));
            }

            let client = if built.no_redirect {
                &self.client_no_redirect
            } else {
                &self.client
            };
            let response = built.send(client).await?;
            let snapshot = response::snapshot(response, &format).await?;

            if log_network {
                let rendered = serde_json::to_string(&snapshot)?;
                report.save_to_report_log(&truncate_for_log(
                    &rendered,
                    self.config.limit_response,
                ));
            }

            if first {
                self.datastore.append_response(snapshot.clone());
                first = false;
            } else {
                self.datastore.update_last_response(snapshot.clone());
            }
            self.datastore
                .set_with_query(&snapshot, &case.store_response_qjson)?;
            if self.config.log_datastore {
                report.save_to_report_log(&format!(
                    "datastore: {}",
                    serde_json::to_string(&self.datastore.get("-")?)?
                ));
            }

            let result = compare(&expected, &snapshot);

            if result.equal && !collect_present {
                return Ok(true);
            }

            for breaker in &case.break_response {
                if compare(breaker, &snapshot).equal {
                    report.save_to_report_log("Break response matched");
                    report.save_to_report_log(&serde_json::to_string(breaker)?);
                    return Ok(false);
                }
            }

            if collect_present {
                collect.retain(|entry| !compare(entry, &snapshot).equal);
                if collect.is_empty() {
                    return Ok(true);
                }
            }

            if case.timeout_ms == -1 || start.elapsed().as_millis() as i64 > timeout {
                if case.timeout_ms != -1 {
                    report.save_to_report_log(&format!("Pull Timeout '{}ms' exceeded", timeout));
                }
                for entry in &collect {
                    report
                        .save_to_report_log(&format!("Collect response not found: {}", entry));
                }
                if !collect_present {
                    for failure in &result.failures {
                        report.save_to_report_log(&failure.to_string());
                    }
                }
                return Ok(false);
            }

            debug!(elapsed_ms = start.elapsed().as_millis() as u64, "polling");
            tokio::time::sleep(delay).await;
        }
    }

    /// Expand `collect_response` into a list of expectation snapshots.
    fn parse_collect(&self, case: &Case) -> Result<Vec<Value>> {
        let entries = match &case.collect_response {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::String(path)) => {
                let spec = PathSpec::parse(path).ok_or_else(|| {
                    Error::PathSpec(format!("collect_response '{}' is not a reference", path))
                })?;
                if spec.parallel_runs > 1 {
                    return Err(Error::PathSpec(format!(
                        "collect_response '{}' must not request parallel runs",
                        path
                    )));
                }
                let (bytes, _) = self.loader.load_relative(&spec.path)?;
                let source = String::from_utf8_lossy(&bytes).into_owned();
                let rendered = self.loader.render(&source)?;
                let value = lenient::parse_value(&rendered)
                    .map_err(|e| Error::ManifestLoad(format!("collect_response '{}': {}", path, e)))?;
                match value {
                    Value::Array(items) => items,
                    other => vec![other],
                }
            }
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
        };
        Ok(entries)
    }

    /// The expected response with its format block split off; defaults
    /// to status 200.
    fn parse_expected(&self, case: &Case) -> Result<(Value, FormatSpec)> {
        let mut expected = match &case.response {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(Error::ManifestLoad(format!(
                    "expected response must be an object, got {}",
                    other
                )))
            }
            None => Map::new(),
        };
        let format = match expected.remove("format") {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| Error::ManifestLoad(format!("response format block: {}", e)))?,
            None => FormatSpec::default(),
        };
        if !expected.contains_key("statuscode") {
            expected.insert("statuscode".to_string(), json!(200));
        }
        Ok((Value::Object(expected), format))
    }
}
