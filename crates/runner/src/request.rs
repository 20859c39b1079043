//! HTTP request construction
//!
//! Turns a rendered request spec into a concrete HTTP request. Store
//! lookups (`*_from_store`) are resolved at build time, so a polling
//! case picks up datastore changes between iterations.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use apiprobe_common::template::Loader;
use apiprobe_common::{Datastore, Error, Result};

/// Filename-override key recognized in multipart bodies
const MULTIPART_FILENAME_KEY: &str = "file:filename";

/// A request as declared in a manifest, after template rendering
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RequestSpec {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Overrides the suite server URL for this request
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub query_params: Map<String, Value>,
    /// Query param name → datastore key; `?` prefix skips on missing
    #[serde(default)]
    pub query_params_from_store: HashMap<String, String>,
    /// Header name → value; an empty value deletes an inherited header
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Header name → datastore key; list values emit repeated headers
    #[serde(default)]
    pub header_from_store: HashMap<String, String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    /// Cookie name → datastore key
    #[serde(default)]
    pub cookies_from_store: HashMap<String, String>,
    /// `regular` (default), `urlencoded`, `multipart` or `file`
    #[serde(default)]
    pub body_type: Option<String>,
    #[serde(default)]
    pub body: Value,
    /// Don't follow redirects for this request
    #[serde(default)]
    pub no_redirect: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Body payload of a built request
#[derive(Debug, Clone)]
pub enum BuiltBody {
    Empty,
    /// JSON text, sent as `application/json`
    Json(String),
    /// Form-encoded text, sent as `application/x-www-form-urlencoded`
    Form(String),
    /// Raw bytes loaded from a file
    Raw(Vec<u8>),
    Multipart(Vec<MultipartPart>),
}

#[derive(Debug, Clone)]
pub struct MultipartPart {
    pub field: String,
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A fully resolved request, ready to send or render as curl
#[derive(Debug, Clone)]
pub struct BuiltRequest {
    pub method: String,
    /// Full URL including the encoded query string
    pub url: String,
    /// Ordered headers; repeats allowed
    pub headers: Vec<(String, String)>,
    pub body: BuiltBody,
    pub no_redirect: bool,
}

/// Suite-level header defaults merged beneath each request's own
#[derive(Debug, Clone, Default)]
pub struct StandardHeaders {
    pub headers: HashMap<String, String>,
    pub from_store: HashMap<String, String>,
}

impl RequestSpec {
    /// Resolve all store references and assemble the request.
    pub fn build(
        &self,
        loader: &Loader,
        datastore: &Datastore,
        server_url: Option<&str>,
        standard: &StandardHeaders,
    ) -> Result<BuiltRequest> {
        let url = self.resolve_url(datastore, server_url)?;

        let mut headers: Vec<(String, String)> = Vec::new();

        // Lowest precedence: suite standard headers.
        for (name, value) in &standard.headers {
            apply_header(&mut headers, name, value);
        }
        for (name, key) in &standard.from_store {
            apply_store_header(&mut headers, name, key, datastore)?;
        }

        // Policy headers for the body type.
        let body = self.build_body(loader)?;
        match &body {
            BuiltBody::Json(_) => apply_header(&mut headers, "Content-Type", "application/json"),
            BuiltBody::Form(_) => apply_header(
                &mut headers,
                "Content-Type",
                "application/x-www-form-urlencoded",
            ),
            BuiltBody::Empty | BuiltBody::Raw(_) | BuiltBody::Multipart(_) => {}
        }

        for (name, key) in &self.header_from_store {
            apply_store_header(&mut headers, name, key, datastore)?;
        }
        for (name, value) in &self.headers {
            apply_header(&mut headers, name, value);
        }

        let cookie = self.resolve_cookies(datastore)?;
        if !cookie.is_empty() {
            headers.push(("Cookie".to_string(), cookie));
        }

        Ok(BuiltRequest {
            method: self.method.to_uppercase(),
            url,
            headers,
            body,
            no_redirect: self.no_redirect,
        })
    }

    fn resolve_url(&self, datastore: &Datastore, server_url: Option<&str>) -> Result<String> {
        let base = self
            .server_url
            .as_deref()
            .or(server_url)
            .unwrap_or("")
            .trim_end_matches('/');
        let mut url = if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")
        {
            self.endpoint.clone()
        } else if self.endpoint.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, self.endpoint.trim_start_matches('/'))
        };
        if url.is_empty() {
            return Err(Error::RequestBuild("request has no endpoint".to_string()));
        }

        let mut pairs: Vec<(String, String)> = Vec::new();
        for (name, value) in &self.query_params {
            pairs.push((name.clone(), value_as_param(value)));
        }
        for (name, key) in &self.query_params_from_store {
            let (key, optional) = parse_store_key(key);
            match store_lookup(datastore, key, optional)? {
                Some(value) => pairs.push((name.clone(), value_as_param(&value))),
                None => continue,
            }
        }
        if !pairs.is_empty() {
            let query: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect();
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str(&query.join("&"));
        }
        Ok(url)
    }

    fn resolve_cookies(&self, datastore: &Datastore) -> Result<String> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        for (name, key) in &self.cookies_from_store {
            let (key, optional) = parse_store_key(key);
            if let Some(value) = store_lookup(datastore, key, optional)? {
                pairs.push((name.clone(), value_as_param(&value)));
            }
        }
        for (name, value) in &self.cookies {
            pairs.retain(|(n, _)| n != name);
            pairs.push((name.clone(), value.clone()));
        }
        Ok(pairs
            .iter()
            .map(|(n, v)| format!("{}={}", n, v))
            .collect::<Vec<_>>()
            .join("; "))
    }

    fn build_body(&self, loader: &Loader) -> Result<BuiltBody> {
        match self.body_type.as_deref().unwrap_or("regular") {
            "regular" | "" => {
                if self.body.is_null() {
                    Ok(BuiltBody::Empty)
                } else {
                    Ok(BuiltBody::Json(serde_json::to_string(&self.body)?))
                }
            }
            "urlencoded" => {
                let Value::Object(map) = &self.body else {
                    return Err(Error::RequestBuild(
                        "urlencoded body must be an object".to_string(),
                    ));
                };
                let encoded: Vec<String> = map
                    .iter()
                    .map(|(k, v)| {
                        format!(
                            "{}={}",
                            urlencoding::encode(k),
                            urlencoding::encode(&value_as_param(v))
                        )
                    })
                    .collect();
                Ok(BuiltBody::Form(encoded.join("&")))
            }
            "multipart" => self.build_multipart(loader),
            "file" => {
                let Value::String(path) = &self.body else {
                    return Err(Error::RequestBuild(
                        "file body must be a path string".to_string(),
                    ));
                };
                let (bytes, _) = loader
                    .load_relative(path)
                    .map_err(|e| Error::RequestBuild(format!("body file '{}': {}", path, e)))?;
                Ok(BuiltBody::Raw(bytes))
            }
            other => Err(Error::RequestBuild(format!(
                "unknown body_type '{}'",
                other
            ))),
        }
    }

    fn build_multipart(&self, loader: &Loader) -> Result<BuiltBody> {
        let Value::Object(map) = &self.body else {
            return Err(Error::RequestBuild(
                "multipart body must be an object".to_string(),
            ));
        };
        let filename_override = map
            .get(MULTIPART_FILENAME_KEY)
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut parts = Vec::new();
        for (field, value) in map {
            if field == MULTIPART_FILENAME_KEY {
                continue;
            }
            let Value::String(path) = value else {
                return Err(Error::RequestBuild(format!(
                    "multipart field '{}' must be a file path",
                    field
                )));
            };
            let (data, _) = loader
                .load_relative(path)
                .map_err(|e| Error::RequestBuild(format!("multipart file '{}': {}", path, e)))?;
            let filename = filename_override.clone().unwrap_or_else(|| {
                std::path::Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.clone())
            });
            let content_type = mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string();
            parts.push(MultipartPart {
                field: field.clone(),
                filename,
                content_type,
                data,
            });
        }
        Ok(BuiltBody::Multipart(parts))
    }
}

/// Strip the optional `?` skip-on-missing marker.
fn parse_store_key(key: &str) -> (&str, bool) {
    match key.strip_prefix('?') {
        Some(rest) => (rest, true),
        None => (key, false),
    }
}

/// Fetch a store value; `None` means skip this entry.
fn store_lookup(datastore: &Datastore, key: &str, optional: bool) -> Result<Option<Value>> {
    match datastore.get(key) {
        Ok(Value::String(s)) if s.is_empty() => {
            if optional {
                Ok(None)
            } else {
                Ok(Some(Value::String(s)))
            }
        }
        Ok(value) => Ok(Some(value)),
        Err(_) if optional => Ok(None),
        Err(e) => Err(e),
    }
}

fn apply_store_header(
    headers: &mut Vec<(String, String)>,
    name: &str,
    key: &str,
    datastore: &Datastore,
) -> Result<()> {
    let (key, optional) = parse_store_key(key);
    let Some(value) = store_lookup(datastore, key, optional)? else {
        return Ok(());
    };
    match value {
        Value::Array(items) => {
            remove_header(headers, name);
            for item in items {
                headers.push((name.to_string(), value_as_param(&item)));
            }
        }
        other => apply_header(headers, name, &value_as_param(&other)),
    }
    Ok(())
}

/// Set a header, replacing prior values; an empty value only removes.
fn apply_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    remove_header(headers, name);
    if !value.is_empty() {
        headers.push((name.to_string(), value.to_string()));
    }
}

fn remove_header(headers: &mut Vec<(String, String)>, name: &str) {
    headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
}

/// Render a JSON value as a query/form/header parameter.
fn value_as_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl BuiltRequest {
    /// Send over the shared client. Transport failures carry the
    /// request line for the log.
    pub async fn send(&self, client: &reqwest::Client) -> Result<reqwest::Response> {
        let method: reqwest::Method = self
            .method
            .parse()
            .map_err(|_| Error::RequestBuild(format!("invalid method '{}'", self.method)))?;
        let mut builder = client.request(method, &self.url);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder = match &self.body {
            BuiltBody::Empty => builder,
            BuiltBody::Json(text) => builder.body(text.clone()),
            BuiltBody::Form(text) => builder.body(text.clone()),
            BuiltBody::Raw(bytes) => builder.body(bytes.clone()),
            BuiltBody::Multipart(parts) => {
                let mut form = reqwest::multipart::Form::new();
                for part in parts {
                    let p = reqwest::multipart::Part::bytes(part.data.clone())
                        .file_name(part.filename.clone())
                        .mime_str(&part.content_type)
                        .map_err(|e| {
                            Error::RequestBuild(format!(
                                "invalid mime type '{}': {}",
                                part.content_type, e
                            ))
                        })?;
                    form = form.part(part.field.clone(), p);
                }
                builder.multipart(form)
            }
        };
        builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{} {}: {}", self.method, self.url, e)))
    }

    /// Render as a runnable `curl` command line.
    pub fn to_curl(&self) -> String {
        let mut cmd = format!("curl -k -X {} {}", self.method, shell_quote(&self.url));
        for (name, value) in &self.headers {
            cmd.push_str(&format!(" -H {}", shell_quote(&format!("{}: {}", name, value))));
        }
        match &self.body {
            BuiltBody::Empty => {}
            BuiltBody::Json(text) | BuiltBody::Form(text) => {
                cmd.push_str(&format!(" --data {}", shell_quote(text)));
            }
            BuiltBody::Raw(bytes) => {
                cmd.push_str(&format!(" --data-binary {}", shell_quote(&String::from_utf8_lossy(bytes))));
            }
            BuiltBody::Multipart(parts) => {
                for part in parts {
                    cmd.push_str(&format!(
                        " -F {}",
                        shell_quote(&format!("{}=@{}", part.field, part.filename))
                    ));
                }
            }
        }
        cmd
    }

    /// Human-readable form for the report log.
    pub fn describe(&self) -> String {
        let mut out = format!("{} {}", self.method, self.url);
        for (name, value) in &self.headers {
            out.push_str(&format!("\n> {}: {}", name, value));
        }
        match &self.body {
            BuiltBody::Json(text) | BuiltBody::Form(text) => {
                out.push('\n');
                out.push_str(text);
            }
            BuiltBody::Raw(bytes) => {
                out.push_str(&format!("\n<{} raw bytes>", bytes.len()));
            }
            BuiltBody::Multipart(parts) => {
                for part in parts {
                    out.push_str(&format!(
                        "\n<multipart '{}' = {} ({} bytes)>",
                        part.field,
                        part.filename,
                        part.data.len()
                    ));
                }
            }
            BuiltBody::Empty => {}
        }
        out
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// The shared HTTP client: TLS verification off, 5-minute timeout.
pub fn http_client(follow_redirects: bool) -> Result<reqwest::Client> {
    let redirect = if follow_redirects {
        reqwest::redirect::Policy::limited(10)
    } else {
        reqwest::redirect::Policy::none()
    };
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(300))
        .cookie_store(true)
        .redirect(redirect)
        .build()
        .map_err(|e| Error::Transport(format!("building http client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiprobe_common::MemFs;
    use std::sync::Arc;

    fn loader() -> Loader {
        Loader::new(Arc::new(Datastore::new()), Arc::new(MemFs::new()))
    }

    fn spec(json: serde_json::Value) -> RequestSpec {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_url_joins_server_and_endpoint() {
        let spec = spec(serde_json::json!({"endpoint": "/api/things", "method": "get"}));
        let ds = Datastore::new();
        let built = spec
            .build(&loader(), &ds, Some("http://srv:1234/"), &StandardHeaders::default())
            .unwrap();
        assert_eq!(built.method, "GET");
        assert_eq!(built.url, "http://srv:1234/api/things");
    }

    #[test]
    fn test_query_params_from_store_optional_skip() {
        let ds = Datastore::new();
        ds.set("token", serde_json::json!("abc")).unwrap();
        let spec = spec(serde_json::json!({
            "endpoint": "x",
            "query_params": {"fixed": 7},
            "query_params_from_store": {"tok": "token", "missing": "?absent"}
        }));
        let built = spec
            .build(&loader(), &ds, Some("http://s"), &StandardHeaders::default())
            .unwrap();
        assert!(built.url.contains("fixed=7"));
        assert!(built.url.contains("tok=abc"));
        assert!(!built.url.contains("missing"));
    }

    #[test]
    fn test_header_precedence_and_removal() {
        let ds = Datastore::new();
        ds.set("auth", serde_json::json!("Bearer t1")).unwrap();
        let standard = StandardHeaders {
            headers: [
                ("Accept".to_string(), "application/json".to_string()),
                ("X-Drop".to_string(), "present".to_string()),
            ]
            .into(),
            from_store: HashMap::new(),
        };
        let spec = spec(serde_json::json!({
            "endpoint": "x",
            "header_from_store": {"Authorization": "auth"},
            "headers": {"X-Drop": "", "Accept": "text/csv"}
        }));
        let built = spec
            .build(&loader(), &ds, Some("http://s"), &standard)
            .unwrap();
        let get = |name: &str| -> Vec<&str> {
            built
                .headers
                .iter()
                .filter(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
                .collect()
        };
        assert_eq!(get("Accept"), vec!["text/csv"]);
        assert_eq!(get("Authorization"), vec!["Bearer t1"]);
        assert!(get("X-Drop").is_empty());
    }

    #[test]
    fn test_store_header_list_emits_repeats() {
        let ds = Datastore::new();
        ds.set("vals", serde_json::json!(["a", "b"])).unwrap();
        let spec = spec(serde_json::json!({
            "endpoint": "x",
            "header_from_store": {"X-Multi": "vals"}
        }));
        let built = spec
            .build(&loader(), &ds, Some("http://s"), &StandardHeaders::default())
            .unwrap();
        let values: Vec<&str> = built
            .headers
            .iter()
            .filter(|(n, _)| n == "X-Multi")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(values, vec!["a", "b"]);
    }

    #[test]
    fn test_json_body_sets_content_type() {
        let ds = Datastore::new();
        let spec = spec(serde_json::json!({
            "endpoint": "x",
            "method": "POST",
            "body": {"k": 1}
        }));
        let built = spec
            .build(&loader(), &ds, Some("http://s"), &StandardHeaders::default())
            .unwrap();
        assert!(built
            .headers
            .iter()
            .any(|(n, v)| n == "Content-Type" && v == "application/json"));
        match &built.body {
            BuiltBody::Json(text) => assert_eq!(text, "{\"k\":1}"),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_urlencoded_body() {
        let ds = Datastore::new();
        let spec = spec(serde_json::json!({
            "endpoint": "x",
            "method": "POST",
            "body_type": "urlencoded",
            "body": {"a": "1 2", "b": 3}
        }));
        let built = spec
            .build(&loader(), &ds, Some("http://s"), &StandardHeaders::default())
            .unwrap();
        match &built.body {
            BuiltBody::Form(text) => assert_eq!(text, "a=1%202&b=3"),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_multipart_filename_override() {
        let fs = Arc::new(MemFs::new());
        fs.insert("./upload.bin", b"data".to_vec());
        let mut loader = Loader::new(Arc::new(Datastore::new()), fs);
        loader.base_dir = std::path::PathBuf::from(".");
        let ds = Datastore::new();
        let spec = spec(serde_json::json!({
            "endpoint": "x",
            "method": "POST",
            "body_type": "multipart",
            "body": {"part1": "./upload.bin", "file:filename": "renamed.bin"}
        }));
        let built = spec
            .build(&loader, &ds, Some("http://s"), &StandardHeaders::default())
            .unwrap();
        match &built.body {
            BuiltBody::Multipart(parts) => {
                assert_eq!(parts.len(), 1);
                assert_eq!(parts[0].filename, "renamed.bin");
                assert_eq!(parts[0].data, b"data");
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_curl_rendering() {
        let built = BuiltRequest {
            method: "POST".to_string(),
            url: "http://s/x".to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: BuiltBody::Json("{\"a\":1}".to_string()),
            no_redirect: false,
        };
        assert_eq!(
            built.to_curl(),
            "curl -k -X POST 'http://s/x' -H 'Content-Type: application/json' --data '{\"a\":1}'"
        );
    }
}
