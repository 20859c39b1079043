//! The template function library

use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};
use crate::lenient;
use crate::query;

use super::eval::Context;

/// Dispatch a template function call.
pub(crate) fn call(name: &str, args: Vec<Value>, ctx: &Context) -> Result<Value> {
    match name {
        "file" => file(args, ctx),
        "file_csv" => file_csv(args, ctx),
        "parse_csv" => parse_csv(args, ctx),
        "qjson" => qjson(args),
        "datastore" => datastore(args, ctx),
        "unmarshal" => unmarshal(args),
        "marshal" => marshal(args),
        "rows_to_map" => rows_to_map(args),
        "group_map_rows" => group_map_rows(args),
        "group_rows" => group_rows(args),
        "match" => match_regex(args),
        "replace_host" => replace_host(args, ctx),
        "server_url" => server_url(args, ctx),
        "int_range" => int_range(args),
        "add" => arith(args, "add"),
        "subtract" => arith(args, "subtract"),
        "multiply" => arith(args, "multiply"),
        "divide" => arith(args, "divide"),
        "N" => n_sequence(args),
        "md5sum" => md5sum(args, ctx),
        "str_escape" => str_escape(args),
        "url_path_escape" => url_path_escape(args),
        "split" => split(args),
        "slice" => Ok(Value::Array(args)),
        "oauth2_password_token" => oauth2_password_token(args, ctx),
        "oauth2_client_token" => oauth2_client_token(args, ctx),
        other => Err(Error::template(format!(
            "unknown template function '{}'",
            other
        ))),
    }
}

fn want(args: &[Value], n: usize, name: &str) -> Result<()> {
    if args.len() != n {
        return Err(Error::template(format!(
            "{} takes {} argument(s), got {}",
            name,
            n,
            args.len()
        )));
    }
    Ok(())
}

fn as_str(v: &Value, name: &str) -> Result<String> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::template(format!(
            "{} expects a string, got '{}'",
            name, other
        ))),
    }
}

fn as_int(v: &Value, name: &str) -> Result<i64> {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 => Ok(f as i64),
                _ => Err(Error::template(format!(
                    "{} expects an integer, got '{}'",
                    name, n
                ))),
            }
        }
        Value::String(s) => s.parse().map_err(|_| {
            Error::template(format!("{} expects an integer, got '{}'", name, s))
        }),
        other => Err(Error::template(format!(
            "{} expects an integer, got '{}'",
            name, other
        ))),
    }
}

fn as_rows<'a>(v: &'a Value, name: &str) -> Result<&'a Vec<Value>> {
    v.as_array()
        .ok_or_else(|| Error::template(format!("{} expects a list of rows", name)))
}

fn file(args: Vec<Value>, ctx: &Context) -> Result<Value> {
    if args.is_empty() {
        return Err(Error::template("file takes a path argument"));
    }
    if args.len() > 5 {
        return Err(Error::template("file takes at most 4 params"));
    }
    let path = as_str(&args[0], "file")?;
    let rendered = ctx.loader.render_include(&path, &args[1..])?;
    Ok(Value::String(rendered))
}

fn load_csv(args: &[Value], ctx: &Context, name: &str) -> Result<(Vec<u8>, u8)> {
    want(args, 2, name)?;
    let path = as_str(&args[0], name)?;
    let delim = as_str(&args[1], name)?;
    let delim = *delim.as_bytes().first().ok_or_else(|| {
        Error::template(format!("{} delimiter must not be empty", name))
    })?;
    let (bytes, _) = ctx.loader.load_relative(&path)?;
    Ok((bytes, delim))
}

fn file_csv(args: Vec<Value>, ctx: &Context) -> Result<Value> {
    let (bytes, delim) = load_csv(&args, ctx, "file_csv")?;
    super::csvload::parse_typed(&bytes, delim)
}

fn parse_csv(args: Vec<Value>, ctx: &Context) -> Result<Value> {
    let (bytes, delim) = load_csv(&args, ctx, "parse_csv")?;
    super::csvload::parse_untyped(&bytes, delim)
}

fn qjson(args: Vec<Value>) -> Result<Value> {
    want(&args, 2, "qjson")?;
    let path = as_str(&args[0], "qjson")?;
    let doc = match &args[1] {
        Value::String(s) => lenient::parse_value(s)?,
        other => other.clone(),
    };
    let result = query::query(&doc, &path).ok_or_else(|| Error::QueryEmpty(path.clone()))?;
    // Raw sub-JSON, so the result can be spliced into a manifest
    Ok(Value::String(serde_json::to_string(&result)?))
}

fn datastore(args: Vec<Value>, ctx: &Context) -> Result<Value> {
    want(&args, 1, "datastore")?;
    let key = as_str(&args[0], "datastore")?;
    ctx.loader.datastore.get(&key)
}

fn unmarshal(args: Vec<Value>) -> Result<Value> {
    want(&args, 1, "unmarshal")?;
    let s = as_str(&args[0], "unmarshal")?;
    lenient::parse_value(&s)
}

fn marshal(args: Vec<Value>) -> Result<Value> {
    want(&args, 1, "marshal")?;
    Ok(Value::String(serde_json::to_string(&args[0])?))
}

fn rows_to_map(args: Vec<Value>) -> Result<Value> {
    want(&args, 3, "rows_to_map")?;
    let key_col = as_str(&args[0], "rows_to_map")?;
    let val_col = as_str(&args[1], "rows_to_map")?;
    let rows = as_rows(&args[2], "rows_to_map")?;

    let mut out = Map::new();
    for row in rows {
        let Some(obj) = row.as_object() else { continue };
        let Some(key) = obj.get(&key_col) else { continue };
        let key = match key {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let value = if val_col.is_empty() {
            row.clone()
        } else {
            obj.get(&val_col).cloned().unwrap_or(Value::Null)
        };
        out.insert(key, value);
    }
    Ok(Value::Object(out))
}

fn group_map_rows(args: Vec<Value>) -> Result<Value> {
    want(&args, 2, "group_map_rows")?;
    let col = as_str(&args[0], "group_map_rows")?;
    let rows = as_rows(&args[1], "group_map_rows")?;

    let mut out: Map<String, Value> = Map::new();
    for row in rows {
        let Some(key) = row.get(&col) else { continue };
        let key = match key {
            Value::String(s) => s.clone(),
            other => {
                return Err(Error::template(format!(
                    "group_map_rows column '{}' must be a string, got '{}'",
                    col, other
                )))
            }
        };
        out.entry(key)
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .unwrap()
            .push(row.clone());
    }
    Ok(Value::Object(out))
}

fn group_rows(args: Vec<Value>) -> Result<Value> {
    want(&args, 2, "group_rows")?;
    let col = as_str(&args[0], "group_rows")?;
    let rows = as_rows(&args[1], "group_rows")?;

    let mut buckets: Vec<Vec<Value>> = Vec::new();
    for row in rows {
        let Some(key) = row.get(&col) else { continue };
        let idx = as_int(key, "group_rows")?;
        if idx < 0 {
            return Err(Error::template(format!(
                "group_rows column '{}' must be a positive integer, got {}",
                col, idx
            )));
        }
        let idx = idx as usize;
        while buckets.len() <= idx {
            buckets.push(Vec::new());
        }
        buckets[idx].push(row.clone());
    }
    Ok(Value::Array(
        buckets.into_iter().map(Value::Array).collect(),
    ))
}

fn match_regex(args: Vec<Value>) -> Result<Value> {
    want(&args, 2, "match")?;
    let pattern = as_str(&args[0], "match")?;
    let text = as_str(&args[1], "match")?;
    let re = regex::Regex::new(&pattern)
        .map_err(|e| Error::template(format!("invalid regex '{}': {}", pattern, e)))?;
    Ok(Value::Bool(re.is_match(&text)))
}

fn replace_host(args: Vec<Value>, ctx: &Context) -> Result<Value> {
    want(&args, 1, "replace_host")?;
    let url = as_str(&args[0], "replace_host")?;
    let Some(host) = &ctx.loader.replace_host else {
        return Ok(Value::String(url));
    };
    let Some(scheme_end) = url.find("://") else {
        return Err(Error::template(format!("replace_host: '{}' is not a URL", url)));
    };
    let authority_start = scheme_end + 3;
    let rest = &url[authority_start..];
    let authority_end = rest
        .find(|c| c == '/' || c == '?' || c == '#')
        .unwrap_or(rest.len());
    Ok(Value::String(format!(
        "{}{}{}",
        &url[..authority_start],
        host,
        &rest[authority_end..]
    )))
}

fn server_url(args: Vec<Value>, ctx: &Context) -> Result<Value> {
    want(&args, 0, "server_url")?;
    ctx.loader
        .server_url
        .clone()
        .map(Value::String)
        .ok_or_else(|| Error::template("server_url: no server URL configured"))
}

fn int_range(args: Vec<Value>) -> Result<Value> {
    want(&args, 2, "int_range")?;
    let start = as_int(&args[0], "int_range")?;
    let end = as_int(&args[1], "int_range")?;
    Ok(Value::Array((start..end).map(Value::from).collect()))
}

enum Num {
    I(i64),
    F(f64),
}

fn as_num(v: &Value, name: &str) -> Result<Num> {
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Num::I(i))
            } else {
                n.as_f64()
                    .map(Num::F)
                    .ok_or_else(|| Error::template(format!("{}: bad number '{}'", name, n)))
            }
        }
        // String-to-number coercion, used for datastore reads
        Value::String(s) => s
            .parse::<i64>()
            .map(Num::I)
            .or_else(|_| s.parse::<f64>().map(Num::F))
            .map_err(|_| Error::template(format!("{}: '{}' is not a number", name, s))),
        other => Err(Error::template(format!(
            "{}: '{}' is not a number",
            name, other
        ))),
    }
}

fn arith(args: Vec<Value>, op: &str) -> Result<Value> {
    want(&args, 2, op)?;
    let a = as_num(&args[0], op)?;
    let b = as_num(&args[1], op)?;

    if let (Num::I(x), Num::I(y)) = (&a, &b) {
        let (x, y) = (*x, *y);
        let result = match op {
            "add" => x.checked_add(y),
            "subtract" => x.checked_sub(y),
            "multiply" => x.checked_mul(y),
            "divide" => {
                if y == 0 {
                    return Err(Error::template("divide: division by zero"));
                }
                x.checked_div(y)
            }
            _ => unreachable!(),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| Error::template(format!("{}: integer overflow", op)));
    }

    let x = match a {
        Num::I(i) => i as f64,
        Num::F(f) => f,
    };
    let y = match b {
        Num::I(i) => i as f64,
        Num::F(f) => f,
    };
    let result = match op {
        "add" => x + y,
        "subtract" => x - y,
        "multiply" => x * y,
        "divide" => {
            if y == 0.0 {
                return Err(Error::template("divide: division by zero"));
            }
            x / y
        }
        _ => unreachable!(),
    };
    // Whole-number float results render as integers
    if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
        return Ok(Value::from(result as i64));
    }
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| Error::template(format!("{}: result is not a number", op)))
}

fn n_sequence(args: Vec<Value>) -> Result<Value> {
    want(&args, 1, "N")?;
    let n = as_int(&args[0], "N")?;
    if n < 0 {
        return Err(Error::template(format!("N: count must not be negative, got {}", n)));
    }
    Ok(Value::Array(vec![Value::Null; n as usize]))
}

fn md5sum(args: Vec<Value>, ctx: &Context) -> Result<Value> {
    want(&args, 1, "md5sum")?;
    let path = as_str(&args[0], "md5sum")?;
    let (bytes, _) = ctx.loader.load_relative(&path)?;
    Ok(Value::String(format!("{:x}", md5::compute(&bytes))))
}

fn str_escape(args: Vec<Value>) -> Result<Value> {
    want(&args, 1, "str_escape")?;
    let s = as_str(&args[0], "str_escape")?;
    let quoted = serde_json::to_string(&s)?;
    // Trim the surrounding quotes, callers embed the result themselves
    Ok(Value::String(quoted[1..quoted.len() - 1].to_string()))
}

fn url_path_escape(args: Vec<Value>) -> Result<Value> {
    want(&args, 1, "url_path_escape")?;
    let s = as_str(&args[0], "url_path_escape")?;
    Ok(Value::String(urlencoding::encode(&s).into_owned()))
}

fn split(args: Vec<Value>) -> Result<Value> {
    want(&args, 2, "split")?;
    let s = as_str(&args[0], "split")?;
    let sep = as_str(&args[1], "split")?;
    Ok(Value::Array(
        s.split(sep.as_str())
            .map(|part| Value::String(part.to_string()))
            .collect(),
    ))
}

fn oauth2_password_token(args: Vec<Value>, ctx: &Context) -> Result<Value> {
    want(&args, 3, "oauth2_password_token")?;
    let client = as_str(&args[0], "oauth2_password_token")?;
    let user = as_str(&args[1], "oauth2_password_token")?;
    let password = as_str(&args[2], "oauth2_password_token")?;
    fetch_token(
        ctx,
        &client,
        vec![
            ("grant_type", "password".to_string()),
            ("username", user),
            ("password", password),
        ],
    )
}

fn oauth2_client_token(args: Vec<Value>, ctx: &Context) -> Result<Value> {
    want(&args, 1, "oauth2_client_token")?;
    let client = as_str(&args[0], "oauth2_client_token")?;
    fetch_token(
        ctx,
        &client,
        vec![("grant_type", "client_credentials".to_string())],
    )
}

fn fetch_token(ctx: &Context, client: &str, mut form: Vec<(&str, String)>) -> Result<Value> {
    let cfg = ctx.loader.oauth_clients.get(client).ok_or_else(|| {
        Error::OAuthToken {
            client: client.to_string(),
            reason: "client not configured".to_string(),
        }
    })?;

    form.push(("client_id", cfg.client_id.clone()));
    if let Some(secret) = &cfg.client_secret {
        form.push(("client_secret", secret.clone()));
    }
    let pairs: Vec<(&str, &str)> = form.iter().map(|(k, v)| (*k, v.as_str())).collect();

    let mut response = ureq::post(&cfg.endpoint)
        .send_form(pairs)
        .map_err(|e| Error::OAuthToken {
            client: client.to_string(),
            reason: e.to_string(),
        })?;
    let body: Value = response
        .body_mut()
        .read_json()
        .map_err(|e| Error::OAuthToken {
            client: client.to_string(),
            reason: format!("bad token response: {}", e),
        })?;
    body.get("access_token")
        .cloned()
        .ok_or_else(|| Error::OAuthToken {
            client: client.to_string(),
            reason: "no access_token in response".to_string(),
        })
}
