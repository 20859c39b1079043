//! Template evaluation

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Error, Result};

use super::funcs;
use super::parser::{Command, Node, Pipeline, Term};
use super::Loader;

/// Evaluation context: the loader, the dot value, and the declared
/// variables in scope.
pub(crate) struct Context<'a> {
    pub loader: &'a Loader,
    pub dot: Value,
    pub vars: HashMap<String, Value>,
}

pub(crate) fn eval_nodes(nodes: &[Node], ctx: &mut Context) -> Result<String> {
    let mut out = String::new();
    for node in nodes {
        eval_node(node, ctx, &mut out)?;
    }
    Ok(out)
}

fn eval_node(node: &Node, ctx: &mut Context, out: &mut String) -> Result<()> {
    match node {
        Node::Text(t) => out.push_str(t),
        Node::Action(pipe) => {
            let value = eval_pipeline(pipe, ctx)?;
            out.push_str(&value_to_text(&value));
        }
        Node::If {
            cond,
            then_body,
            else_body,
        } => {
            let value = eval_pipeline(cond, ctx)?;
            let body = if truthy(&value) { then_body } else { else_body };
            out.push_str(&eval_nodes(body, ctx)?);
        }
        Node::Range {
            decl,
            pipe,
            body,
            else_body,
        } => {
            let value = eval_pipeline(pipe, ctx)?;
            let entries: Vec<(Value, Value)> = match value {
                Value::Array(items) => items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| (Value::from(i), v))
                    .collect(),
                Value::Object(map) => map
                    .into_iter()
                    .map(|(k, v)| (Value::String(k), v))
                    .collect(),
                Value::Null => Vec::new(),
                other => {
                    return Err(Error::template(format!(
                        "cannot range over {}",
                        value_to_text(&other)
                    )))
                }
            };

            if entries.is_empty() {
                out.push_str(&eval_nodes(else_body, ctx)?);
                return Ok(());
            }

            let saved_dot = ctx.dot.clone();
            let saved_vars = ctx.vars.clone();
            for (key, elem) in entries {
                match decl.len() {
                    2 => {
                        ctx.vars.insert(decl[0].clone(), key);
                        ctx.vars.insert(decl[1].clone(), elem.clone());
                    }
                    1 => {
                        ctx.vars.insert(decl[0].clone(), elem.clone());
                    }
                    _ => {}
                }
                ctx.dot = elem;
                out.push_str(&eval_nodes(body, ctx)?);
            }
            ctx.dot = saved_dot;
            ctx.vars = saved_vars;
        }
    }
    Ok(())
}

pub(crate) fn eval_pipeline(pipe: &Pipeline, ctx: &mut Context) -> Result<Value> {
    let mut piped: Option<Value> = None;
    for cmd in &pipe.cmds {
        piped = Some(eval_command(cmd, piped, ctx)?);
    }
    piped.ok_or_else(|| Error::template("empty pipeline"))
}

fn eval_command(cmd: &Command, piped: Option<Value>, ctx: &mut Context) -> Result<Value> {
    match &cmd.args[0] {
        Term::Ident(name) => {
            let mut args = Vec::with_capacity(cmd.args.len());
            for term in &cmd.args[1..] {
                args.push(eval_term(term, ctx)?);
            }
            if let Some(v) = piped {
                args.push(v);
            }
            funcs::call(name, args, ctx)
        }
        term => {
            if cmd.args.len() > 1 {
                return Err(Error::template(format!(
                    "value command takes no arguments: {:?}",
                    cmd.args
                )));
            }
            if piped.is_some() {
                return Err(Error::template("cannot pipe into a plain value"));
            }
            eval_term(term, ctx)
        }
    }
}

fn eval_term(term: &Term, ctx: &mut Context) -> Result<Value> {
    Ok(match term {
        Term::Str(s) => Value::String(s.clone()),
        Term::Int(n) => Value::from(*n),
        Term::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Term::Bool(b) => Value::Bool(*b),
        Term::Var(name) => ctx
            .vars
            .get(name)
            .cloned()
            .ok_or_else(|| Error::template(format!("undefined variable ${}", name)))?,
        Term::Field(path) => {
            let mut current = &ctx.dot;
            for part in path {
                current = match current {
                    Value::Object(map) => map.get(part).unwrap_or(&Value::Null),
                    _ => &Value::Null,
                };
            }
            current.clone()
        }
        Term::Sub(pipe) => eval_pipeline(pipe, ctx)?,
        Term::Ident(name) => {
            // Zero-argument function in operand position
            return funcs::call(name, Vec::new(), ctx);
        }
    })
}

/// Whether a value counts as true for `if`.
pub(crate) fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Render a value into template output text: strings raw, numbers as
/// their literal, everything else as JSON.
pub(crate) fn value_to_text(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}
