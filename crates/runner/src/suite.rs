//! Suite composer
//!
//! Loads a suite manifest, starts its fixture servers, expands nested
//! test references (including parallel fan-out) and drives the case
//! engine over every leaf.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use apiprobe_common::filesystem::FsHandle;
use apiprobe_common::template::Loader;
use apiprobe_common::{lenient, Datastore, Error, PathSpec, ReportElement, Result};
use apiprobe_fixture::{FixtureConfig, FixtureServer};

use crate::case::{Case, CaseRunner};
use crate::request::{http_client, StandardHeaders};
use crate::RunConfig;

/// Shallow manifest fields, read after template rendering
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SuiteManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub http_server: Option<HttpServerSpec>,
    #[serde(default)]
    pub smtp_server: Option<SmtpServerSpec>,
    #[serde(default)]
    pub store: Map<String, Value>,
    #[serde(default)]
    pub standard_header: HashMap<String, String>,
    #[serde(default)]
    pub standard_header_from_store: HashMap<String, String>,
    #[serde(default)]
    pub tests: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerSpec {
    pub addr: String,
    /// Static directory, relative to the manifest
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpServerSpec {
    pub addr: String,
}

/// Result of one suite run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuiteOutcome {
    pub success: bool,
}

/// Outcome of one expanded test entry
struct EntryOutcome {
    success: bool,
    /// A case failed with `continue_on_failure = false`
    stop: bool,
}

/// Load and execute one suite manifest. The suite's report element is
/// created under `report_root` and always left, fixture servers are
/// always shut down.
pub async fn run_suite(
    manifest_path: &Path,
    fs: FsHandle,
    config: &RunConfig,
    report_root: &Arc<ReportElement>,
) -> Result<SuiteOutcome> {
    let suite_elem = report_root.new_child(&manifest_path.display().to_string());
    let result = run_suite_inner(manifest_path, fs, config, &suite_elem).await;
    match &result {
        Ok(outcome) => suite_elem.leave(outcome.success),
        Err(e) => {
            suite_elem.save_to_report_log(&e.to_string());
            suite_elem.leave(false);
        }
    }
    result
}

async fn run_suite_inner(
    manifest_path: &Path,
    fs: FsHandle,
    config: &RunConfig,
    suite_elem: &Arc<ReportElement>,
) -> Result<SuiteOutcome> {
    let base_dir = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let source_bytes = fs.read(manifest_path)?;
    let source = String::from_utf8_lossy(&source_bytes).into_owned();

    let datastore = Arc::new(Datastore::new());

    // Pass 1: minimal loader, just enough to discover the fixture
    // server address.
    let mut loader = Loader::new(Arc::clone(&datastore), Arc::clone(&fs));
    loader.base_dir = base_dir.clone();
    loader.oauth_clients = config.oauth_clients.clone();
    loader.server_url = config.server_url.clone();
    let rendered = loader
        .render(&source)
        .map_err(|e| Error::ManifestLoad(format!("{}: {}", manifest_path.display(), e)))?;
    let shallow: SuiteManifest = lenient::parse(&rendered)
        .map_err(|e| Error::ManifestLoad(format!("{}: {}", manifest_path.display(), e)))?;

    let mut fixture = match &shallow.http_server {
        Some(spec) => {
            let static_dir = spec.dir.as_ref().map(|d| base_dir.join(d));
            let server = FixtureServer::start(FixtureConfig {
                addr: spec.addr.clone(),
                static_dir,
                smtp_addr: shallow.smtp_server.as_ref().map(|s| s.addr.clone()),
            })
            .await
            .map_err(|e| Error::ManifestLoad(format!("starting fixture server: {}", e)))?;
            Some(server)
        }
        None => match &shallow.smtp_server {
            Some(smtp) => {
                let server = FixtureServer::start(FixtureConfig {
                    addr: String::new(),
                    static_dir: None,
                    smtp_addr: Some(smtp.addr.clone()),
                })
                .await
                .map_err(|e| Error::ManifestLoad(format!("starting smtp server: {}", e)))?;
                Some(server)
            }
            None => None,
        },
    };

    let server_url = config
        .server_url
        .clone()
        .or_else(|| fixture.as_ref().map(|f| f.base_url()));

    // Pass 2: full loader, bound to the discovered server address.
    loader.server_url = server_url.clone();
    loader.replace_host = config.replace_host.clone();
    let outcome =
        run_rendered_suite(manifest_path, &source, loader, server_url, config, suite_elem).await;

    if let Some(server) = fixture.as_mut() {
        server.shutdown().await;
    }
    outcome
}

async fn run_rendered_suite(
    manifest_path: &Path,
    source: &str,
    loader: Loader,
    server_url: Option<String>,
    config: &RunConfig,
    suite_elem: &Arc<ReportElement>,
) -> Result<SuiteOutcome> {
    let rendered = loader
        .render(source)
        .map_err(|e| Error::ManifestLoad(format!("{}: {}", manifest_path.display(), e)))?;
    let manifest: SuiteManifest = lenient::parse(&rendered)
        .map_err(|e| Error::ManifestLoad(format!("{}: {}", manifest_path.display(), e)))?;

    if let Some(name) = &manifest.name {
        info!(suite = %name, path = %manifest_path.display(), "running suite");
    }

    loader.datastore.set_map(manifest.store.clone())?;

    let datastore = Arc::clone(&loader.datastore);
    let runner = CaseRunner {
        loader,
        datastore,
        client: http_client(true)?,
        client_no_redirect: http_client(false)?,
        server_url,
        standard_headers: StandardHeaders {
            headers: manifest.standard_header.clone(),
            from_store: manifest.standard_header_from_store.clone(),
        },
        config: config.clone(),
    };

    let mut success = true;
    for (index, entry) in manifest.tests.iter().enumerate() {
        let outcome = run_entry(&runner, entry.clone(), index, suite_elem, false).await?;
        success &= outcome.success;
        if outcome.stop {
            debug!("stopping suite after failed case without continue_on_failure");
            break;
        }
    }
    Ok(SuiteOutcome { success })
}

/// Expand and run one test entry: an inline case, a list, or a
/// PathSpec string referencing another fragment.
fn run_entry<'a>(
    runner: &'a CaseRunner,
    entry: Value,
    index: usize,
    parent: &'a Arc<ReportElement>,
    under_parallel: bool,
) -> Pin<Box<dyn Future<Output = Result<EntryOutcome>> + Send + 'a>> {
    Box::pin(async move {
        match entry {
            Value::Object(map) => {
                // An entry of the form {"N@path": ""} is a reference,
                // not a case.
                if map.len() == 1 {
                    if let Some((key, _)) = map.iter().next() {
                        if key.contains('@') && PathSpec::parse(key).is_some() {
                            let key = key.clone();
                            return run_reference(runner, &key, parent, under_parallel).await;
                        }
                    }
                }
                let case: Case = serde_json::from_value(Value::Object(map))
                    .map_err(|e| Error::ManifestLoad(format!("test entry {}: {}", index + 1, e)))?;
                let elem = parent.new_child(&case.label(index));
                let outcome = runner.run(&case, &elem).await;
                Ok(EntryOutcome {
                    success: outcome.success,
                    stop: !outcome.success && !outcome.continue_on_failure,
                })
            }
            Value::Array(items) => {
                let mut success = true;
                for (i, item) in items.into_iter().enumerate() {
                    let outcome = run_entry(runner, item, i, parent, under_parallel).await?;
                    success &= outcome.success;
                    if outcome.stop {
                        return Ok(EntryOutcome { success, stop: true });
                    }
                }
                Ok(EntryOutcome {
                    success,
                    stop: false,
                })
            }
            Value::String(path) => run_reference(runner, &path, parent, under_parallel).await,
            other => Err(Error::ManifestLoad(format!(
                "test entry {} must be an object, list or path reference, got {}",
                index + 1,
                other
            ))),
        }
    })
}

async fn run_reference(
    runner: &CaseRunner,
    reference: &str,
    parent: &Arc<ReportElement>,
    under_parallel: bool,
) -> Result<EntryOutcome> {
    let spec = PathSpec::parse(reference)
        .ok_or_else(|| Error::PathSpec(format!("invalid path reference '{}'", reference)))?;

    if spec.parallel_runs > 1 && under_parallel {
        return Err(Error::ManifestLoad(format!(
            "'{}': parallel_runs > 1 is not allowed beneath a parallel run",
            reference
        )));
    }

    let (bytes, dir) = spec
        .load_contents(&runner.loader.base_dir, &runner.loader.fs)
        .map_err(|e| Error::ManifestLoad(format!("'{}': {}", reference, e)))?;
    let source = String::from_utf8_lossy(&bytes).into_owned();

    if spec.parallel_runs == 1 {
        let mut loader = runner.loader.clone();
        loader.base_dir = dir;
        let nested = CaseRunner {
            loader,
            ..runner.clone()
        };
        let value = render_fragment(&nested.loader, &source, reference)?;
        return run_entry(&nested, value, 0, parent, under_parallel).await;
    }

    // Parallel fan-out: one worker per run, each with its own loader
    // index, sharing the datastore.
    let mut join_set = tokio::task::JoinSet::new();
    for run_idx in 0..spec.parallel_runs {
        let mut loader = runner.loader.clone();
        loader.base_dir = dir.clone();
        loader.parallel_run_idx = Some(run_idx);
        let worker = CaseRunner {
            loader,
            ..runner.clone()
        };
        let source = source.clone();
        let reference = reference.to_string();
        let elem = parent.new_child(&format!("{} (run {})", spec.path, run_idx));
        join_set.spawn(async move {
            let result = async {
                let value = render_fragment(&worker.loader, &source, &reference)?;
                run_entry(&worker, value, 0, &elem, true).await
            }
            .await;
            match result {
                Ok(outcome) => {
                    elem.leave(outcome.success);
                    Ok(outcome.success)
                }
                Err(e) => {
                    elem.save_to_report_log(&e.to_string());
                    elem.leave(false);
                    Err(e)
                }
            }
        });
    }

    let mut success = true;
    let mut first_error = None;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(worker_success)) => success &= worker_success,
            Ok(Err(e)) => {
                success = false;
                first_error.get_or_insert(e);
            }
            Err(join_error) => {
                success = false;
                first_error.get_or_insert(Error::ManifestLoad(format!(
                    "parallel worker panicked: {}",
                    join_error
                )));
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    Ok(EntryOutcome {
        success,
        stop: false,
    })
}

/// Render a referenced fragment and parse it leniently; a fragment is
/// a list of cases, a single case, or a further reference.
fn render_fragment(loader: &Loader, source: &str, reference: &str) -> Result<Value> {
    let rendered = loader
        .render(source)
        .map_err(|e| Error::ManifestLoad(format!("'{}': {}", reference, e)))?;
    lenient::parse_value(&rendered)
        .map_err(|e| Error::ManifestLoad(format!("'{}': malformed JSON: {}", reference, e)))
}
