//! Report emitters

mod json;
mod junit;
mod stats;

pub use json::JsonEmitter;
pub use junit::JunitEmitter;
pub use stats::StatsEmitter;

use apiprobe_common::report::Emitter;
use apiprobe_common::{Error, Result};

/// Look up an emitter by its `--report-format` name.
pub fn for_format(format: &str) -> Result<Box<dyn Emitter>> {
    match format {
        "json" => Ok(Box::new(JsonEmitter)),
        "junit" => Ok(Box::new(JunitEmitter)),
        "json-stats" => Ok(Box::new(StatsEmitter::default())),
        other => Err(Error::ManifestLoad(format!(
            "unknown report format '{}'",
            other
        ))),
    }
}
