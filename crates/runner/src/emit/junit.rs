//! JUnit XML report output
//!
//! One `<testsuite>` per top-level suite, with every leaf below it
//! flattened into a `<testcase>`. Failed leaves carry a `<failure>`
//! element collating their log lines.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use apiprobe_common::report::{Emitter, ReportResult};
use apiprobe_common::{Error, Result};

pub struct JunitEmitter;

impl Emitter for JunitEmitter {
    fn format(&self, root: &ReportResult) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        write_report(&mut writer, root).map_err(|e| {
            Error::ManifestLoad(format!("writing junit report: {}", e))
        })?;
        String::from_utf8(writer.into_inner())
            .map_err(|e| Error::ManifestLoad(format!("junit report not UTF-8: {}", e)))
    }
}

fn write_report(
    writer: &mut Writer<Vec<u8>>,
    root: &ReportResult,
) -> std::io::Result<()> {
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut suites = BytesStart::new("testsuites");
    suites.push_attribute(("tests", root.test_count.to_string().as_str()));
    suites.push_attribute(("failures", root.failures.to_string().as_str()));
    suites.push_attribute(("time", seconds(root.execution_time_ns).as_str()));
    writer.write_event(Event::Start(suites))?;

    for (id, suite) in root.sub_tests.iter().enumerate() {
        let mut elem = BytesStart::new("testsuite");
        elem.push_attribute(("id", id.to_string().as_str()));
        elem.push_attribute(("name", suite.name.as_str()));
        elem.push_attribute(("tests", suite.test_count.to_string().as_str()));
        elem.push_attribute(("failures", suite.failures.to_string().as_str()));
        elem.push_attribute(("time", seconds(suite.execution_time_ns).as_str()));
        writer.write_event(Event::Start(elem))?;

        let mut leaves = Vec::new();
        collect_leaves(suite, &mut leaves);
        for leaf in leaves {
            write_testcase(writer, suite, leaf)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;
    Ok(())
}

/// Depth-first flattening of a suite's leaves.
fn collect_leaves<'a>(node: &'a ReportResult, out: &mut Vec<&'a ReportResult>) {
    if node.sub_tests.is_empty() {
        out.push(node);
        return;
    }
    for sub in &node.sub_tests {
        collect_leaves(sub, out);
    }
}

fn write_testcase(
    writer: &mut Writer<Vec<u8>>,
    suite: &ReportResult,
    leaf: &ReportResult,
) -> std::io::Result<()> {
    let mut elem = BytesStart::new("testcase");
    elem.push_attribute(("classname", suite.name.as_str()));
    elem.push_attribute(("name", leaf.name.as_str()));
    elem.push_attribute(("time", seconds(leaf.execution_time_ns).as_str()));

    if leaf.failures == 0 {
        writer.write_event(Event::Empty(elem))?;
        return Ok(());
    }

    writer.write_event(Event::Start(elem))?;
    let mut failure = BytesStart::new("failure");
    failure.push_attribute(("message", format!("{} failed", leaf.name).as_str()));
    writer.write_event(Event::Start(failure))?;
    let text = leaf.log.join("\n");
    writer.write_event(Event::Text(BytesText::new(&text)))?;
    writer.write_event(Event::End(BytesEnd::new("failure")))?;
    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

fn seconds(ns: u128) -> String {
    format!("{:.6}", ns as f64 / 1e9)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, failures: u64, log: &[&str]) -> ReportResult {
        ReportResult {
            failures,
            test_count: 1,
            execution_time_ns: 1_500_000,
            name: name.to_string(),
            log: log.iter().map(|s| s.to_string()).collect(),
            sub_tests: vec![],
            failure: None,
        }
    }

    #[test]
    fn test_flattens_nested_leaves() {
        let root = ReportResult {
            failures: 1,
            test_count: 3,
            execution_time_ns: 10_000_000,
            name: "".to_string(),
            log: vec![],
            sub_tests: vec![ReportResult {
                failures: 1,
                test_count: 3,
                execution_time_ns: 9_000_000,
                name: "suite/manifest.json".to_string(),
                log: vec![],
                sub_tests: vec![
                    leaf("ok case", 0, &[]),
                    ReportResult {
                        failures: 1,
                        test_count: 2,
                        execution_time_ns: 2_000_000,
                        name: "child.json (run 0)".to_string(),
                        log: vec![],
                        sub_tests: vec![
                            leaf("nested ok", 0, &[]),
                            leaf("nested fail", 1, &["Pull Timeout '30ms' exceeded"]),
                        ],
                        failure: None,
                    },
                ],
                failure: None,
            }],
            failure: None,
        };

        let xml = JunitEmitter.format(&root).unwrap();
        assert!(xml.contains("<testsuite id=\"0\" name=\"suite/manifest.json\""));
        assert_eq!(xml.matches("<testcase").count(), 3);
        assert!(xml.contains("Pull Timeout &apos;30ms&apos; exceeded")
            || xml.contains("Pull Timeout '30ms' exceeded"));
        assert!(xml.contains("<failure"));
    }
}
