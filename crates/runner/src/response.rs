//! Response normalization
//!
//! Drains an HTTP response into a JSON snapshot the comparator and the
//! datastore work on: `{statuscode, header, header_flat, cookie,
//! body}`. The `format` block of the expected response selects how the
//! raw body bytes become JSON.

use std::collections::BTreeMap;
use std::process::Stdio;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use apiprobe_common::{Error, Result};

/// `format` block of an expected response
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FormatSpec {
    /// Body dialect: empty = JSON, `xml`, `xml2`, `html`, `xhtml`,
    /// `csv`, `binary`
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub csv: CsvFormat,
    #[serde(default)]
    pub pre_process: Option<PreProcessSpec>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CsvFormat {
    /// Field delimiter, default `,`
    #[serde(default)]
    pub comma: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreProcessSpec {
    pub cmd: CmdSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CmdSpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// `stdout` (default), `stderr` or `exitcode`
    #[serde(default)]
    pub output: Option<String>,
}

/// Build the response snapshot from a drained response.
pub async fn snapshot(response: reqwest::Response, format: &FormatSpec) -> Result<Value> {
    let status = response.status().as_u16();

    let mut header: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut cookie = Map::new();
    for (name, value) in response.headers() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        if name == reqwest::header::SET_COOKIE {
            if let Some((cookie_name, cookie_value)) = parse_set_cookie(&value) {
                cookie.insert(cookie_name, json!({ "value": cookie_value }));
            }
        }
        header.entry(name.as_str().to_string()).or_default().push(value);
    }
    let header_flat: BTreeMap<String, String> = header
        .iter()
        .map(|(k, v)| (k.clone(), v.join(";")))
        .collect();

    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::Transport(format!("reading response body: {}", e)))?;

    let mut raw = bytes.to_vec();
    if let Some(pre) = &format.pre_process {
        raw = match pre_process(&pre.cmd, &raw).await? {
            PreProcessed::Bytes(b) => b,
            PreProcessed::Value(v) => {
                return Ok(assemble(status, header, header_flat, cookie, v));
            }
        };
    }

    let body = parse_body(&raw, format)?;
    Ok(assemble(status, header, header_flat, cookie, body))
}

fn assemble(
    status: u16,
    header: BTreeMap<String, Vec<String>>,
    header_flat: BTreeMap<String, String>,
    cookie: Map<String, Value>,
    body: Value,
) -> Value {
    json!({
        "statuscode": status,
        "header": header,
        "header_flat": header_flat,
        "cookie": cookie,
        "body": body,
    })
}

fn parse_set_cookie(value: &str) -> Option<(String, String)> {
    let first = value.split(';').next()?;
    let (name, val) = first.split_once('=')?;
    Some((name.trim().to_string(), val.trim().to_string()))
}

/// Parse raw body bytes according to the declared format.
pub fn parse_body(raw: &[u8], format: &FormatSpec) -> Result<Value> {
    match format.kind.as_deref().unwrap_or("") {
        "" => Ok(parse_json_body(raw)),
        "xml" => xml_to_json(raw, false),
        "xml2" => xml_to_json(raw, true),
        "html" | "xhtml" => html_to_json(raw),
        "csv" => csv_to_json(raw, format.csv.comma.as_deref().unwrap_or(",")),
        "binary" => Ok(json!({ "md5sum": format!("{:x}", md5::compute(raw)) })),
        other => Err(Error::ResponseParse(format!(
            "unknown response format '{}'",
            other
        ))),
    }
}

/// JSON bodies parse strictly; anything else is kept as a string so
/// string and regex controls still apply.
fn parse_json_body(raw: &[u8]) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(_) => Value::String(String::from_utf8_lossy(raw).into_owned()),
    }
}

/// CSV bodies become a list of row objects keyed by the first row.
fn csv_to_json(raw: &[u8], comma: &str) -> Result<Value> {
    let delimiter = comma.as_bytes().first().copied().unwrap_or(b',');
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(raw);

    let mut names: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| Error::ResponseParse(format!("csv body: {}", e)))?;
        if names.is_empty() {
            names = record.iter().map(str::to_string).collect();
            continue;
        }
        let mut row = Map::new();
        for (i, name) in names.iter().enumerate() {
            let cell = record.get(i).unwrap_or("");
            row.insert(name.clone(), Value::String(cell.to_string()));
        }
        rows.push(Value::Object(row));
    }
    Ok(Value::Array(rows))
}

/// Convert XML to JSON. The default dialect prefixes attributes with
/// `-` and stores element text as `#text`; the `xml2` dialect uses
/// `@attr` / `#content`. Repeated sibling elements collapse to arrays.
fn xml_to_json(raw: &[u8], alt_dialect: bool) -> Result<Value> {
    let mut reader = quick_xml::Reader::from_reader(raw);
    let config = reader.config_mut();
    config.trim_text_start = true;
    config.trim_text_end = true;
    read_xml(&mut reader, alt_dialect)
        .map_err(|e| Error::ResponseParse(format!("xml body: {}", e)))
}

fn html_to_json(raw: &[u8]) -> Result<Value> {
    let mut reader = quick_xml::Reader::from_reader(raw);
    let config = reader.config_mut();
    config.trim_text_start = true;
    config.trim_text_end = true;
    config.check_end_names = false;
    config.allow_unmatched_ends = true;
    read_xml(&mut reader, false)
        .map_err(|e| Error::ResponseParse(format!("html body: {}", e)))
}

fn read_xml(
    reader: &mut quick_xml::Reader<&[u8]>,
    alt: bool,
) -> std::result::Result<Value, quick_xml::Error> {
    let mut root = Map::new();
    read_children(reader, &mut root, None, alt)?;
    Ok(Value::Object(root))
}

/// Read events until `until` closes (or EOF at the top level),
/// inserting child elements into `parent`.
fn read_children(
    reader: &mut quick_xml::Reader<&[u8]>,
    parent: &mut Map<String, Value>,
    until: Option<&str>,
    alt: bool,
) -> std::result::Result<(), quick_xml::Error> {
    use quick_xml::events::Event;

    let text_key = if alt { "#content" } else { "#text" };
    let attr_prefix = if alt { "@" } else { "-" };

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let mut element = Map::new();
                for attr in start.attributes().flatten() {
                    element.insert(
                        format!("{}{}", attr_prefix, String::from_utf8_lossy(attr.key.as_ref())),
                        Value::String(String::from_utf8_lossy(&attr.value).into_owned()),
                    );
                }
                read_children(reader, &mut element, Some(&name), alt)?;
                insert_element(parent, &name, simplify(element, text_key));
            }
            Event::Empty(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let mut element = Map::new();
                for attr in start.attributes().flatten() {
                    element.insert(
                        format!("{}{}", attr_prefix, String::from_utf8_lossy(attr.key.as_ref())),
                        Value::String(String::from_utf8_lossy(&attr.value).into_owned()),
                    );
                }
                insert_element(parent, &name, simplify(element, text_key));
            }
            Event::Text(text) => {
                let value = text.unescape().unwrap_or_default().into_owned();
                if !value.is_empty() {
                    parent.insert(text_key.to_string(), Value::String(value));
                }
            }
            Event::CData(data) => {
                let value = String::from_utf8_lossy(&data).into_owned();
                parent.insert(text_key.to_string(), Value::String(value));
            }
            Event::End(end) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                if until.is_none() || until == Some(name.as_str()) {
                    return Ok(());
                }
                // Mismatched end tag in lenient mode, skip it.
            }
            Event::Eof => return Ok(()),
            _ => {}
        }
        buf.clear();
    }
}

/// A text-only element collapses to its string.
fn simplify(element: Map<String, Value>, text_key: &str) -> Value {
    if element.len() == 1 && element.contains_key(text_key) {
        element.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null)
    } else {
        Value::Object(element)
    }
}

/// Repeated siblings turn the slot into an array.
fn insert_element(parent: &mut Map<String, Value>, name: &str, value: Value) {
    match parent.get_mut(name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            parent.insert(name.to_string(), value);
        }
    }
}

enum PreProcessed {
    /// Replacement raw body, still subject to format parsing
    Bytes(Vec<u8>),
    /// A final body value (the structured error object)
    Value(Value),
}

/// Pipe the raw body through an external command.
async fn pre_process(cmd: &CmdSpec, raw: &[u8]) -> Result<PreProcessed> {
    use tokio::io::AsyncWriteExt;

    let mut child = tokio::process::Command::new(&cmd.name)
        .args(&cmd.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::PreProcess(format!("spawning '{}': {}", cmd.name, e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(raw)
            .await
            .map_err(|e| Error::PreProcess(format!("writing stdin of '{}': {}", cmd.name, e)))?;
    }
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::PreProcess(format!("waiting for '{}': {}", cmd.name, e)))?;

    let exit_code = output.status.code().unwrap_or(-1);
    match cmd.output.as_deref().unwrap_or("stdout") {
        "stdout" => {
            if exit_code != 0 {
                let command = format!("{} {}", cmd.name, cmd.args.join(" "));
                Ok(PreProcessed::Value(json!({
                    "command": command.trim(),
                    "error": "command failed",
                    "exit_code": exit_code,
                    "stderr": String::from_utf8_lossy(&output.stderr),
                })))
            } else {
                Ok(PreProcessed::Bytes(output.stdout))
            }
        }
        "stderr" => Ok(PreProcessed::Bytes(output.stderr)),
        "exitcode" => Ok(PreProcessed::Bytes(exit_code.to_string().into_bytes())),
        other => Err(Error::PreProcess(format!(
            "unknown pre_process output '{}'",
            other
        ))),
    }
}
