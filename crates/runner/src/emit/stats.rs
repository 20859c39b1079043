//! JSON stats output
//!
//! Flattens suite runtimes and buckets them into N groups of roughly
//! equal total load, for splitting a large manifest set across CI
//! shards.

use serde::Serialize;
use serde_json::json;

use apiprobe_common::report::{Emitter, ReportResult};
use apiprobe_common::Result;

pub struct StatsEmitter {
    /// Number of shard groups to bucket suites into
    pub groups: usize,
}

impl Default for StatsEmitter {
    fn default() -> Self {
        StatsEmitter { groups: 1 }
    }
}

#[derive(Debug, Clone, Serialize)]
struct SuiteTime {
    path: String,
    runtime_seconds: f64,
}

impl Emitter for StatsEmitter {
    fn format(&self, root: &ReportResult) -> Result<String> {
        let mut times: Vec<SuiteTime> = root
            .sub_tests
            .iter()
            .map(|suite| SuiteTime {
                path: suite.name.clone(),
                runtime_seconds: suite.execution_time_ns as f64 / 1e9,
            })
            .collect();
        // Longest first so the greedy packing stays balanced.
        times.sort_by(|a, b| {
            b.runtime_seconds
                .partial_cmp(&a.runtime_seconds)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let buckets = bucket(times, self.groups.max(1));
        let groups: Vec<serde_json::Value> = buckets
            .into_iter()
            .map(|b| {
                json!({
                    "runtime_seconds": b.total,
                    "suites": b.suites,
                })
            })
            .collect();
        Ok(serde_json::to_string_pretty(&json!({ "groups": groups }))?)
    }
}

struct Bucket {
    total: f64,
    suites: Vec<SuiteTime>,
}

/// Greedy least-loaded-bucket packing.
fn bucket(times: Vec<SuiteTime>, groups: usize) -> Vec<Bucket> {
    let mut buckets: Vec<Bucket> = (0..groups)
        .map(|_| Bucket {
            total: 0.0,
            suites: Vec::new(),
        })
        .collect();
    for time in times {
        let target = buckets
            .iter_mut()
            .min_by(|a, b| a.total.partial_cmp(&b.total).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(target) = target {
            target.total += time.runtime_seconds;
            target.suites.push(time);
        }
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suite(name: &str, ns: u128) -> ReportResult {
        ReportResult {
            failures: 0,
            test_count: 1,
            execution_time_ns: ns,
            name: name.to_string(),
            log: vec![],
            sub_tests: vec![],
            failure: None,
        }
    }

    #[test]
    fn test_buckets_balance_load() {
        let root = ReportResult {
            failures: 0,
            test_count: 4,
            execution_time_ns: 0,
            name: "".to_string(),
            log: vec![],
            sub_tests: vec![
                suite("a", 4_000_000_000),
                suite("b", 3_000_000_000),
                suite("c", 2_000_000_000),
                suite("d", 1_000_000_000),
            ],
            failure: None,
        };
        let out = StatsEmitter { groups: 2 }.format(&root).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        let groups = parsed["groups"].as_array().unwrap();
        assert_eq!(groups.len(), 2);
        // 4+1 vs 3+2
        assert_eq!(groups[0]["runtime_seconds"], 5.0);
        assert_eq!(groups[1]["runtime_seconds"], 5.0);
    }
}
