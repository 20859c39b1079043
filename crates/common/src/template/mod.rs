//! Manifest template renderer
//!
//! Manifests are text templates over JSON. Lines whose first
//! non-whitespace character is `#` are stripped before evaluation,
//! custom delimiters come from a leading `// template-delims: OPEN
//! CLOSE` comment, and `// template-remove-tokens: "t1" "t2"` removes
//! literal tokens from the final output. Everything inside the
//! delimiters is a pipeline over the function library in [`funcs`].

mod csvload;
mod eval;
mod funcs;
mod lexer;
mod parser;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::datastore::Datastore;
use crate::error::{Error, Result};
use crate::filesystem::FsHandle;
use crate::pathspec::PathSpec;

const MAX_INCLUDE_DEPTH: usize = 64;

/// OAuth2 client configuration, referenced by the
/// `oauth2_password_token` / `oauth2_client_token` template functions.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthClient {
    /// Token endpoint URL
    pub endpoint: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

/// Template loader: the rendering context a manifest or fragment is
/// evaluated in. Parallel workers get their own clone with
/// `parallel_run_idx` set.
#[derive(Clone)]
pub struct Loader {
    pub datastore: Arc<Datastore>,
    pub fs: FsHandle,
    /// Directory relative references resolve against
    pub base_dir: PathBuf,
    pub server_url: Option<String>,
    /// Host override applied by the `replace_host` function
    pub replace_host: Option<String>,
    pub parallel_run_idx: Option<usize>,
    pub oauth_clients: HashMap<String, OAuthClient>,
    include_stack: Vec<PathBuf>,
}

impl Loader {
    pub fn new(datastore: Arc<Datastore>, fs: FsHandle) -> Self {
        Loader {
            datastore,
            fs,
            base_dir: PathBuf::from("."),
            server_url: None,
            replace_host: None,
            parallel_run_idx: None,
            oauth_clients: HashMap::new(),
            include_stack: Vec::new(),
        }
    }

    /// Render template source to text.
    pub fn render(&self, source: &str) -> Result<String> {
        self.render_with_dot(source, self.root_dot())
    }

    fn root_dot(&self) -> Value {
        let mut dot = Map::new();
        dot.insert(
            "ParallelRunIdx".to_string(),
            self.parallel_run_idx.map(Value::from).unwrap_or(Value::Null),
        );
        Value::Object(dot)
    }

    fn render_with_dot(&self, source: &str, dot: Value) -> Result<String> {
        let prepared = preprocess(source);
        let nodes = parser::parse(&prepared.body, &prepared.open, &prepared.close)?;
        let mut ctx = eval::Context {
            loader: self,
            dot,
            vars: HashMap::new(),
        };
        let mut out = eval::eval_nodes(&nodes, &mut ctx)?;
        for token in &prepared.remove_tokens {
            out = out.replace(token.as_str(), "");
        }
        Ok(out)
    }

    /// Load a path relative to this loader's base directory.
    pub fn load_relative(&self, path: &str) -> Result<(Vec<u8>, PathBuf)> {
        let spec = PathSpec {
            parallel_runs: 1,
            path: path.to_string(),
        };
        spec.load_contents(&self.base_dir, &self.fs)
    }

    /// Render an included file with up to four positional params bound
    /// to `.Param1` … `.Param4`. Nested includes resolve against the
    /// included file's directory.
    pub(crate) fn render_include(&self, path: &str, params: &[Value]) -> Result<String> {
        if self.include_stack.len() >= MAX_INCLUDE_DEPTH {
            return Err(Error::template(format!(
                "include depth exceeds {}",
                MAX_INCLUDE_DEPTH
            )));
        }
        let (bytes, dir) = self.load_relative(path)?;
        let full = Path::new(path).is_absolute().then(|| PathBuf::from(path));
        let marker = full.unwrap_or_else(|| self.base_dir.join(path));
        if self.include_stack.contains(&marker) {
            return Err(Error::template(format!(
                "cyclic include of '{}'",
                marker.display()
            )));
        }

        let source = String::from_utf8(bytes)
            .map_err(|_| Error::template(format!("'{}' is not valid UTF-8", path)))?;

        let mut nested = self.clone();
        nested.base_dir = dir;
        nested.include_stack.push(marker);

        let mut dot = match nested.root_dot() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for i in 0..4 {
            dot.insert(
                format!("Param{}", i + 1),
                params.get(i).cloned().unwrap_or(Value::Null),
            );
        }
        nested.render_with_dot(&source, Value::Object(dot))
    }
}

struct Prepared {
    body: String,
    open: String,
    close: String,
    remove_tokens: Vec<String>,
}

/// Apply the leading directives and strip `#` comment lines.
fn preprocess(source: &str) -> Prepared {
    let mut open = "{{".to_string();
    let mut close = "}}".to_string();
    let mut remove_tokens = Vec::new();

    let mut lines = source.lines().peekable();
    while let Some(line) = lines.peek() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with("//") {
            break;
        }
        let comment = trimmed.trim_start_matches('/').trim();
        if let Some(rest) = comment.strip_prefix("template-delims:") {
            let mut parts = rest.split_whitespace();
            if let (Some(o), Some(c)) = (parts.next(), parts.next()) {
                open = o.to_string();
                close = c.to_string();
            }
        } else if let Some(rest) = comment.strip_prefix("template-remove-tokens:") {
            remove_tokens.extend(parse_quoted_tokens(rest));
        }
        lines.next();
    }

    let body: Vec<&str> = lines
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect();
    Prepared {
        body: body.join("\n"),
        open,
        close,
        remove_tokens,
    }
}

fn parse_quoted_tokens(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('"') {
            match stripped.find('"') {
                Some(end) => {
                    tokens.push(stripped[..end].to_string());
                    rest = stripped[end + 1..].trim_start();
                }
                None => break,
            }
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            tokens.push(rest[..end].to_string());
            rest = rest[end..].trim_start();
        }
    }
    tokens
}
