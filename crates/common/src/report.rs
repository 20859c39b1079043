//! Hierarchical result report
//!
//! A mutable tree of report elements filled in while suites execute.
//! Every element owns its own mutex; the root additionally owns a
//! tree-global lock under which new children are linked, so parallel
//! workers can create children concurrently. Elements are never
//! removed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;

/// One node of the report tree
pub struct ReportElement {
    state: Mutex<ElementState>,
    /// Tree-global lock shared by all elements, guards child linking
    link: Arc<Mutex<()>>,
    no_log_time: bool,
}

struct ElementState {
    name: String,
    start: Instant,
    elapsed: Duration,
    failures: u64,
    children: Vec<Arc<ReportElement>>,
    logs: Vec<String>,
}

impl ReportElement {
    fn new(name: &str, link: Arc<Mutex<()>>, no_log_time: bool) -> Arc<Self> {
        Arc::new(ReportElement {
            state: Mutex::new(ElementState {
                name: name.to_string(),
                start: Instant::now(),
                elapsed: Duration::ZERO,
                failures: 0,
                children: Vec::new(),
                logs: Vec::new(),
            }),
            link,
            no_log_time,
        })
    }

    /// Create and link a child element. Safe to call from concurrent
    /// workers.
    pub fn new_child(self: &Arc<Self>, name: &str) -> Arc<ReportElement> {
        let child = ReportElement::new(name, self.link.clone(), self.no_log_time);
        let _guard = self.link.lock();
        self.state.lock().children.push(child.clone());
        child
    }

    /// Record the element's elapsed time. A failed leaf element counts
    /// one failure.
    pub fn leave(&self, success: bool) {
        let mut state = self.state.lock();
        state.elapsed = state.start.elapsed();
        if !success && state.children.is_empty() {
            state.failures += 1;
        }
    }

    /// Append a line to this element's log, timestamped unless the
    /// report was created with `no_log_time`.
    pub fn save_to_report_log(&self, line: &str) {
        let entry = if self.no_log_time {
            line.to_string()
        } else {
            format!("[{}] {}", chrono::Utc::now().format("%H:%M:%S%.3f"), line)
        };
        self.state.lock().logs.push(entry);
    }

    fn collect(&self) -> ReportResult {
        let state = self.state.lock();
        let sub_tests: Vec<ReportResult> = state.children.iter().map(|c| c.collect()).collect();
        let (mut failures, mut test_count) = if sub_tests.is_empty() {
            (state.failures, 1)
        } else {
            (0, 0)
        };
        for sub in &sub_tests {
            failures += sub.failures;
            test_count += sub.test_count;
        }
        ReportResult {
            failures,
            test_count,
            execution_time_ns: state.elapsed.as_nanos(),
            name: state.name.clone(),
            log: state.logs.clone(),
            sub_tests,
            failure: None,
        }
    }
}

/// Aggregated, immutable view of an executed report tree
#[derive(Debug, Clone, Serialize)]
pub struct ReportResult {
    pub failures: u64,
    pub test_count: u64,
    pub execution_time_ns: u128,
    pub name: String,
    pub log: Vec<String>,
    pub sub_tests: Vec<ReportResult>,
    /// Set on the root when a suite could not be loaded at all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Formats an aggregated report into an output document
pub trait Emitter {
    fn format(&self, root: &ReportResult) -> Result<String>;
}

/// The report root owned by a runner invocation
pub struct Report {
    root: Arc<ReportElement>,
    root_failure: Mutex<Option<String>>,
}

impl Report {
    pub fn new(no_log_time: bool) -> Self {
        let link = Arc::new(Mutex::new(()));
        Report {
            root: ReportElement::new("", link, no_log_time),
            root_failure: Mutex::new(None),
        }
    }

    pub fn root(&self) -> Arc<ReportElement> {
        self.root.clone()
    }

    /// Record a run-aborting failure on the root (e.g. a manifest that
    /// never loaded).
    pub fn set_failure(&self, msg: &str) {
        *self.root_failure.lock() = Some(msg.to_string());
    }

    /// Aggregate the tree bottom-up and run the emitter over the root.
    pub fn get_test_result(&self, emitter: &dyn Emitter) -> Result<String> {
        emitter.format(&self.aggregate())
    }

    /// Aggregate the tree into its immutable result form.
    pub fn aggregate(&self) -> ReportResult {
        let mut result = self.root.collect();
        result.failure = self.root_failure.lock().clone();
        result
    }

    /// Whether any failure propagated to the root.
    pub fn did_fail(&self) -> bool {
        let result = self.aggregate();
        result.failures > 0 || result.failure.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_failure_counts() {
        let report = Report::new(true);
        let suite = report.root().new_child("suite");
        let a = suite.new_child("a");
        a.leave(true);
        let b = suite.new_child("b");
        b.leave(false);
        suite.leave(true);

        let result = report.aggregate();
        assert_eq!(result.failures, 1);
        assert_eq!(result.test_count, 2);
        assert!(report.did_fail());
    }

    #[test]
    fn test_success_does_not_fail() {
        let report = Report::new(true);
        let child = report.root().new_child("only");
        child.leave(true);
        assert!(!report.did_fail());
    }

    #[test]
    fn test_root_failure_marks_report() {
        let report = Report::new(true);
        report.set_failure("manifest broke");
        assert!(report.did_fail());
        assert_eq!(report.aggregate().failure.as_deref(), Some("manifest broke"));
    }

    #[test]
    fn test_log_without_timestamp() {
        let report = Report::new(true);
        let child = report.root().new_child("c");
        child.save_to_report_log("hello");
        let result = report.aggregate();
        assert_eq!(result.sub_tests[0].log, vec!["hello".to_string()]);
    }

    #[test]
    fn test_concurrent_children() {
        let report = Report::new(true);
        let root = report.root();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let c = root.new_child(&format!("worker-{}", i));
                    c.leave(true);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(report.aggregate().test_count, 8);
    }
}
