//! Fixture HTTP server
//!
//! Serves static files, echo ("bounce") endpoints, a recording proxy
//! and the SMTP inspection API. Started per suite and shut down when
//! the suite finishes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path as AxumPath, Query, RawQuery, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::proxy::{ProxyStore, StoredRequest};
use crate::smtp::{self, SmtpServer, SmtpStore};

/// Configuration for the fixture server
#[derive(Debug, Clone, Default)]
pub struct FixtureConfig {
    /// Listen address, e.g. `:8788` or `127.0.0.1:8788`. Empty port
    /// picks a free one.
    pub addr: String,
    /// Directory served at `/`
    pub static_dir: Option<PathBuf>,
    /// Listen address for the SMTP capture server, if any
    pub smtp_addr: Option<String>,
}

#[derive(Clone)]
pub(crate) struct FixtureState {
    static_dir: Option<PathBuf>,
    proxy: Arc<ProxyStore>,
}

/// A running fixture server
pub struct FixtureServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    smtp: Option<SmtpServer>,
    pub proxy: Arc<ProxyStore>,
    pub smtp_store: Arc<SmtpStore>,
}

impl FixtureServer {
    /// Bind and start serving. Returns once the listener is ready.
    pub async fn start(config: FixtureConfig) -> anyhow::Result<Self> {
        let addr = normalize_addr(&config.addr);
        let listener = TcpListener::bind(&addr).await?;
        let addr = listener.local_addr()?;

        let proxy = Arc::new(ProxyStore::new());
        let smtp_store = Arc::new(SmtpStore::new());

        let state = FixtureState {
            static_dir: config.static_dir.clone(),
            proxy: Arc::clone(&proxy),
        };

        let app = Router::new()
            .route("/bounce-json", get(bounce_json).post(bounce_json).put(bounce_json).delete(bounce_json))
            .route("/bounce", get(bounce).post(bounce).put(bounce).delete(bounce))
            .route("/proxy/proxywrite/:name", get(proxy_write).post(proxy_write).put(proxy_write).delete(proxy_write))
            .route("/proxy/proxyread/:name", get(proxy_read))
            .nest("/smtp", smtp::inspect::router(Arc::clone(&smtp_store)))
            .fallback(static_files)
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = serve.await {
                warn!("fixture server error: {}", e);
            }
        });

        let smtp = match &config.smtp_addr {
            Some(smtp_addr) => {
                let server =
                    SmtpServer::start(&normalize_addr(smtp_addr), Arc::clone(&smtp_store)).await?;
                Some(server)
            }
            None => None,
        };

        info!("fixture server listening on http://{}", addr);

        Ok(Self {
            addr,
            shutdown: Some(tx),
            task: Some(task),
            smtp,
            proxy,
            smtp_store,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop the HTTP and SMTP listeners and wait for their tasks.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(mut smtp) = self.smtp.take() {
            smtp.shutdown().await;
        }
    }
}

impl Drop for FixtureServer {
    fn drop(&mut self) {
        // Abort outstanding tasks if shutdown() was never awaited.
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Accept `:8788` shorthand for all-local binding.
fn normalize_addr(addr: &str) -> String {
    if addr.is_empty() {
        "127.0.0.1:0".to_string()
    } else if let Some(port) = addr.strip_prefix(':') {
        format!("127.0.0.1:{}", port)
    } else {
        addr.to_string()
    }
}

fn multi_map(pairs: impl Iterator<Item = (String, String)>) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (k, v) in pairs {
        map.entry(k).or_default().push(v);
    }
    map
}

fn parse_query(raw: Option<&str>) -> BTreeMap<String, Vec<String>> {
    let raw = raw.unwrap_or("");
    multi_map(raw.split('&').filter(|s| !s.is_empty()).map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (
            urlencoding::decode(k).map(|c| c.into_owned()).unwrap_or_else(|_| k.to_string()),
            urlencoding::decode(v).map(|c| c.into_owned()).unwrap_or_else(|_| v.to_string()),
        )
    }))
}

fn header_multi_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    multi_map(headers.iter().map(|(name, value)| {
        (
            name.as_str().to_string(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
    }))
}

/// `GET|POST /bounce-json`: echo query, headers and JSON body.
async fn bounce_json(headers: HeaderMap, RawQuery(raw): RawQuery, body: Bytes) -> Json<Value> {
    let parsed_body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    Json(json!({
        "query": parse_query(raw.as_deref()),
        "header": header_multi_map(&headers),
        "body": parsed_body,
    }))
}

/// `GET|POST /bounce`: echo the raw body, mirroring query and
/// headers into `X-Req-Query-*` / `X-Req-Header-*`.
async fn bounce(headers: HeaderMap, RawQuery(raw): RawQuery, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    let out = response.headers_mut();

    for (key, values) in parse_query(raw.as_deref()) {
        mirror_header(out, &format!("X-Req-Query-{}", key), &values.join(","));
    }
    for (name, value) in headers.iter() {
        mirror_header(
            out,
            &format!("X-Req-Header-{}", name.as_str()),
            &String::from_utf8_lossy(value.as_bytes()),
        );
    }
    response
}

fn mirror_header(out: &mut HeaderMap, name: &str, value: &str) {
    let name = match HeaderName::try_from(name) {
        Ok(n) => n,
        Err(_) => return,
    };
    if let Ok(value) = HeaderValue::try_from(value) {
        out.append(name, value);
    }
}

/// `ANY /proxy/proxywrite/<name>`: record the request, reply with its
/// offset within the bucket.
async fn proxy_write(
    State(state): State<FixtureState>,
    AxumPath(name): AxumPath<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let stored = StoredRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().unwrap_or("").to_string(),
        headers: headers
            .iter()
            .map(|(n, v)| {
                (
                    n.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body: body.to_vec(),
    };
    let offset = state.proxy.write(&name, stored);
    debug!("proxy store '{}' now holds {} requests", name, offset + 1);
    Json(json!({ "offset": offset }))
}

#[derive(serde::Deserialize)]
struct ProxyReadParams {
    #[serde(default)]
    offset: usize,
}

/// `GET /proxy/proxyread/<name>?offset=K`: return stored request #K.
async fn proxy_read(
    State(state): State<FixtureState>,
    AxumPath(name): AxumPath<String>,
    Query(params): Query<ProxyReadParams>,
) -> Response {
    let Some((stored, count)) = state.proxy.read(&name, params.offset) else {
        return (
            StatusCode::NOT_FOUND,
            format!("no stored request '{}' at offset {}", name, params.offset),
        )
            .into_response();
    };

    let mut response = Response::new(Body::from(stored.body));
    let out = response.headers_mut();
    mirror_header(out, "X-Apitest-Proxy-Request-Method", &stored.method);
    mirror_header(out, "X-Apitest-Proxy-Request-Path", &stored.path);
    mirror_header(out, "X-Apitest-Proxy-Request-Query", &stored.query);
    mirror_header(out, "X-Apitest-Proxy-Store-Count", &count.to_string());
    for (name, value) in &stored.headers {
        mirror_header(out, &format!("X-Apitest-Proxy-Header-{}", name), value);
    }
    response
}

/// Static file fallback under the configured directory.
///
/// `?no-content-length=1` streams the body so no `Content-Length`
/// header is emitted.
async fn static_files(
    State(state): State<FixtureState>,
    uri: Uri,
    RawQuery(raw): RawQuery,
) -> Response {
    let Some(dir) = &state.static_dir else {
        return (StatusCode::NOT_FOUND, "no static directory configured").into_response();
    };

    let rel = uri.path().trim_start_matches('/');
    if rel.split('/').any(|seg| seg == "..") {
        return (StatusCode::BAD_REQUEST, "invalid path").into_response();
    }
    let mut path = dir.join(rel);
    if path.is_dir() {
        path = path.join("index.html");
    }

    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(_) => return (StatusCode::NOT_FOUND, "file not found").into_response(),
    };

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let suppress_length = parse_query(raw.as_deref())
        .get("no-content-length")
        .map(|v| v.iter().any(|s| s == "1"))
        .unwrap_or(false);

    let body = if suppress_length {
        // Streamed bodies go out chunked, without Content-Length.
        Body::from_stream(futures::stream::once(async move {
            Ok::<_, std::io::Error>(Bytes::from(data))
        }))
    } else {
        Body::from(data)
    };

    let mut response = Response::new(body);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.as_ref())
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr(":8788"), "127.0.0.1:8788");
        assert_eq!(normalize_addr("0.0.0.0:80"), "0.0.0.0:80");
        assert_eq!(normalize_addr(""), "127.0.0.1:0");
    }

    #[test]
    fn test_parse_query_multi() {
        let map = parse_query(Some("a=1&a=2&b=x%20y&flag"));
        assert_eq!(map["a"], vec!["1", "2"]);
        assert_eq!(map["b"], vec!["x y"]);
        assert_eq!(map["flag"], vec![""]);
    }

    #[tokio::test]
    async fn test_bounce_json_echoes() {
        let mut headers = HeaderMap::new();
        headers.insert("x-custom", HeaderValue::from_static("v1"));
        let Json(value) = bounce_json(
            headers,
            RawQuery(Some("q=1".to_string())),
            Bytes::from_static(b"{\"k\": 7}"),
        )
        .await;
        assert_eq!(value["query"]["q"][0], "1");
        assert_eq!(value["header"]["x-custom"][0], "v1");
        assert_eq!(value["body"]["k"], 7);
    }

    #[tokio::test]
    async fn test_bounce_mirrors_query() {
        let response = bounce(
            HeaderMap::new(),
            RawQuery(Some("debug=yes".to_string())),
            Bytes::from_static(b"raw"),
        )
        .await;
        assert_eq!(
            response.headers().get("X-Req-Query-debug").unwrap(),
            "yes"
        );
    }

    #[tokio::test]
    async fn test_fixture_server_lifecycle() {
        let mut server = FixtureServer::start(FixtureConfig {
            addr: String::new(),
            static_dir: None,
            smtp_addr: None,
        })
        .await
        .unwrap();
        assert!(server.base_url().starts_with("http://127.0.0.1:"));
        server.shutdown().await;
    }
}
