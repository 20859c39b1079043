//! HTTP inspection API for captured SMTP messages
//!
//! Mounted under `/smtp` on the fixture server. Messages and MIME
//! parts are addressed by zero-based index.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use axum::body::Body;
use mailparse::{MailHeaderMap, ParsedMail};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{CapturedMessage, SmtpStore};

pub(crate) fn router(store: Arc<SmtpStore>) -> Router<crate::server::FixtureState> {
    Router::new()
        .route("/", get(list_messages))
        .route("/:i", get(message_meta))
        .route("/:i/body", get(message_body))
        .route("/:i/raw", get(message_raw))
        .route("/:i/multipart", get(list_parts))
        .route("/:i/multipart/:j", get(part_meta))
        .route("/:i/multipart/:j/body", get(part_body))
        .with_state(store)
}

#[derive(Deserialize)]
struct HeaderFilter {
    header: Option<String>,
}

fn not_found(what: &str) -> Response {
    (StatusCode::NOT_FOUND, format!("{} not found", what)).into_response()
}

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, msg).into_response()
}

fn headers_json(mail: &ParsedMail<'_>) -> Value {
    let mut map = serde_json::Map::new();
    for h in &mail.headers {
        let entry = map
            .entry(h.get_key())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = entry {
            values.push(Value::String(h.get_value()));
        }
    }
    Value::Object(map)
}

/// True if any header line matches the regex.
fn headers_match(mail: &ParsedMail<'_>, re: &regex::Regex) -> bool {
    mail.headers
        .iter()
        .any(|h| re.is_match(&format!("{}: {}", h.get_key(), h.get_value())))
}

fn message_summary(index: usize, msg: &CapturedMessage, mail: &ParsedMail<'_>) -> Value {
    json!({
        "index": index,
        "from": msg.from,
        "rcpt": msg.rcpt,
        "received_at": msg.received_at.to_rfc3339(),
        "subject": mail.headers.get_first_value("Subject"),
        "content_type": mail.ctype.mimetype,
        "multipart_count": mail.subparts.len(),
        "headers": headers_json(mail),
    })
}

/// `GET /smtp/`: list captured messages, optionally filtered by a
/// header regex.
async fn list_messages(
    State(store): State<Arc<SmtpStore>>,
    Query(filter): Query<HeaderFilter>,
) -> Response {
    let re = match filter.header.as_deref().map(regex::Regex::new) {
        Some(Ok(re)) => Some(re),
        Some(Err(e)) => return bad_request(format!("invalid header regex: {}", e)),
        None => None,
    };

    let mut messages = Vec::new();
    for (index, msg) in store.all().iter().enumerate() {
        let mail = match mailparse::parse_mail(&msg.raw) {
            Ok(mail) => mail,
            Err(e) => return bad_request(format!("stored message {} unparsable: {}", index, e)),
        };
        if let Some(re) = &re {
            if !headers_match(&mail, re) {
                continue;
            }
        }
        messages.push(message_summary(index, msg, &mail));
    }

    Json(json!({ "count": messages.len(), "messages": messages })).into_response()
}

async fn message_meta(
    State(store): State<Arc<SmtpStore>>,
    Path(i): Path<usize>,
) -> Response {
    let Some(msg) = store.get(i) else {
        return not_found("message");
    };
    match mailparse::parse_mail(&msg.raw) {
        Ok(mail) => Json(message_summary(i, &msg, &mail)).into_response(),
        Err(e) => bad_request(format!("stored message unparsable: {}", e)),
    }
}

/// `GET /smtp/{i}/body`: decoded body with its Content-Type.
async fn message_body(State(store): State<Arc<SmtpStore>>, Path(i): Path<usize>) -> Response {
    let Some(msg) = store.get(i) else {
        return not_found("message");
    };
    match mailparse::parse_mail(&msg.raw) {
        Ok(mail) => body_response(&mail),
        Err(e) => bad_request(format!("stored message unparsable: {}", e)),
    }
}

/// `GET /smtp/{i}/raw`: raw RFC-822 data.
async fn message_raw(State(store): State<Arc<SmtpStore>>, Path(i): Path<usize>) -> Response {
    let Some(msg) = store.get(i) else {
        return not_found("message");
    };
    let mut response = Response::new(Body::from(msg.raw));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("message/rfc822"),
    );
    response
}

async fn list_parts(
    State(store): State<Arc<SmtpStore>>,
    Path(i): Path<usize>,
    Query(filter): Query<HeaderFilter>,
) -> Response {
    let Some(msg) = store.get(i) else {
        return not_found("message");
    };
    let mail = match mailparse::parse_mail(&msg.raw) {
        Ok(mail) => mail,
        Err(e) => return bad_request(format!("stored message unparsable: {}", e)),
    };
    let re = match filter.header.as_deref().map(regex::Regex::new) {
        Some(Ok(re)) => Some(re),
        Some(Err(e)) => return bad_request(format!("invalid header regex: {}", e)),
        None => None,
    };

    let mut parts = Vec::new();
    for (j, part) in mail.subparts.iter().enumerate() {
        if let Some(re) = &re {
            if !headers_match(part, re) {
                continue;
            }
        }
        parts.push(part_summary(j, part));
    }
    Json(json!({ "count": parts.len(), "parts": parts })).into_response()
}

fn part_summary(index: usize, part: &ParsedMail<'_>) -> Value {
    json!({
        "index": index,
        "content_type": part.ctype.mimetype,
        "charset": part.ctype.charset,
        "headers": headers_json(part),
    })
}

async fn part_meta(
    State(store): State<Arc<SmtpStore>>,
    Path((i, j)): Path<(usize, usize)>,
) -> Response {
    let Some(msg) = store.get(i) else {
        return not_found("message");
    };
    let mail = match mailparse::parse_mail(&msg.raw) {
        Ok(mail) => mail,
        Err(e) => return bad_request(format!("stored message unparsable: {}", e)),
    };
    match mail.subparts.get(j) {
        Some(part) => Json(part_summary(j, part)).into_response(),
        None => not_found("multipart part"),
    }
}

async fn part_body(
    State(store): State<Arc<SmtpStore>>,
    Path((i, j)): Path<(usize, usize)>,
) -> Response {
    let Some(msg) = store.get(i) else {
        return not_found("message");
    };
    let mail = match mailparse::parse_mail(&msg.raw) {
        Ok(mail) => mail,
        Err(e) => return bad_request(format!("stored message unparsable: {}", e)),
    };
    match mail.subparts.get(j) {
        Some(part) => body_response(part),
        None => not_found("multipart part"),
    }
}

fn body_response(mail: &ParsedMail<'_>) -> Response {
    let bytes = match mail.get_body_raw() {
        Ok(bytes) => bytes,
        Err(e) => return bad_request(format!("body decode failed: {}", e)),
    };
    let mut response = Response::new(Body::from(bytes));
    if let Ok(value) = HeaderValue::from_str(&mail.ctype.mimetype) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn store_with(raw: &[u8]) -> Arc<SmtpStore> {
        let store = Arc::new(SmtpStore::new());
        store.push(CapturedMessage {
            from: "a@test".to_string(),
            rcpt: vec!["b@test".to_string()],
            received_at: Utc::now(),
            raw: raw.to_vec(),
        });
        store
    }

    const MULTIPART: &[u8] = b"From: a@test\r\n\
To: b@test\r\n\
Subject: greetings\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=XYZ\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain\r\n\
\r\n\
hello body\r\n\
--XYZ\r\n\
Content-Type: application/json\r\n\
\r\n\
{\"k\":1}\r\n\
--XYZ--\r\n";

    #[tokio::test]
    async fn test_list_and_meta() {
        let store = store_with(MULTIPART);
        let response = list_messages(
            State(Arc::clone(&store)),
            Query(HeaderFilter { header: None }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = message_meta(State(store), Path(0)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_header_filter_excludes() {
        let store = store_with(MULTIPART);
        let response = list_messages(
            State(store),
            Query(HeaderFilter {
                header: Some("Subject: nomatch".to_string()),
            }),
        )
        .await;
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["count"], 0);
    }

    #[tokio::test]
    async fn test_part_body_content_type() {
        let store = store_with(MULTIPART);
        let response = part_body(State(store), Path((0, 1))).await;
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"{\"k\":1}");
    }

    #[tokio::test]
    async fn test_missing_message_404() {
        let store = Arc::new(SmtpStore::new());
        let response = message_raw(State(store), Path(5)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
