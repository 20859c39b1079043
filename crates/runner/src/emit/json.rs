//! JSON report output

use apiprobe_common::report::{Emitter, ReportResult};
use apiprobe_common::Result;

/// Serializes the aggregated report tree verbatim.
pub struct JsonEmitter;

impl Emitter for JsonEmitter {
    fn format(&self, root: &ReportResult) -> Result<String> {
        Ok(serde_json::to_string_pretty(root)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips_tree() {
        let root = ReportResult {
            failures: 1,
            test_count: 2,
            execution_time_ns: 42,
            name: "".to_string(),
            log: vec![],
            sub_tests: vec![ReportResult {
                failures: 1,
                test_count: 2,
                execution_time_ns: 40,
                name: "suite".to_string(),
                log: vec!["oops".to_string()],
                sub_tests: vec![],
                failure: None,
            }],
            failure: Some("broken".to_string()),
        };
        let out = JsonEmitter.format(&root).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["failures"], 1);
        assert_eq!(parsed["sub_tests"][0]["name"], "suite");
        assert_eq!(parsed["failure"], "broken");
    }
}
