//! Apiprobe test engine
//!
//! Discovers suite manifests, renders them through the template layer,
//! executes each case's request/compare/poll loop, and aggregates the
//! outcome into a report tree.

pub mod case;
pub mod discovery;
pub mod emit;
pub mod request;
pub mod response;
pub mod suite;

use std::collections::HashMap;

use apiprobe_common::template::OAuthClient;

pub use case::{Case, CaseOutcome, CaseRunner};
pub use discovery::discover_manifests;
pub use suite::{run_suite, SuiteOutcome};

/// Settings shared by every suite of a runner invocation, assembled
/// from CLI flags and the optional config file.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Overrides any `http_server` address declared in manifests
    pub server_url: Option<String>,
    /// Host override for the `replace_host` template function
    pub replace_host: Option<String>,
    pub oauth_clients: HashMap<String, OAuthClient>,
    pub log_network: bool,
    pub log_verbose: bool,
    pub log_datastore: bool,
    /// Truncate logged request bodies to this many bytes (0 = full)
    pub limit_request: usize,
    /// Truncate logged response bodies to this many bytes (0 = full)
    pub limit_response: usize,
    /// Log each request as a runnable curl command
    pub curl_bash: bool,
}

pub(crate) fn truncate_for_log(text: &str, limit: usize) -> String {
    if limit == 0 || text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... [truncated, {} bytes total]", &text[..cut], text.len())
}
