//! Template parsing
//!
//! Builds the node tree out of lexed segments: literal text, pipeline
//! actions, and `if`/`range` blocks closed by `end`.

use crate::error::{Error, Result};

use super::lexer::{split_segments, tokenize, Segment, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    Action(Pipeline),
    If {
        cond: Pipeline,
        then_body: Vec<Node>,
        else_body: Vec<Node>,
    },
    Range {
        /// `$i, $v :=` declarations; first is the index/key variable
        decl: Vec<String>,
        pipe: Pipeline,
        body: Vec<Node>,
        else_body: Vec<Node>,
    },
}

/// A `cmd | cmd | cmd` chain; the previous command's result is passed
/// as the final argument of the next.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub cmds: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub args: Vec<Term>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// `.A.B` field access on the dot context
    Field(Vec<String>),
    Var(String),
    /// Function name in command position
    Ident(String),
    /// Parenthesized sub-pipeline
    Sub(Pipeline),
}

/// Parse a template into its node tree.
pub fn parse(input: &str, open: &str, close: &str) -> Result<Vec<Node>> {
    let segments = split_segments(input, open, close)?;
    let mut iter = segments.into_iter().peekable();
    let nodes = parse_nodes(&mut iter, false)?;
    if iter.next().is_some() {
        return Err(Error::template("unexpected 'else'/'end' without open block"));
    }
    Ok(nodes)
}

/// Parse nodes until an `else`/`end` terminator (left in the iterator
/// for the caller) or the end of input.
fn parse_nodes(
    iter: &mut std::iter::Peekable<std::vec::IntoIter<Segment>>,
    in_block: bool,
) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();

    while let Some(seg) = iter.peek() {
        match seg {
            Segment::Text(_) => {
                if let Some(Segment::Text(t)) = iter.next() {
                    nodes.push(Node::Text(t));
                }
            }
            Segment::Action(a) => {
                let keyword = a.split_whitespace().next().unwrap_or("");
                match keyword {
                    "end" | "else" => {
                        if !in_block {
                            return Err(Error::template(format!("unexpected '{}'", keyword)));
                        }
                        return Ok(nodes);
                    }
                    "if" => {
                        let action = must_action(iter);
                        let tokens = tokenize(action.strip_prefix("if").unwrap())?;
                        let cond = parse_pipeline(&tokens)?;
                        let (then_body, else_body) = parse_block(iter)?;
                        nodes.push(Node::If {
                            cond,
                            then_body,
                            else_body,
                        });
                    }
                    "range" => {
                        let action = must_action(iter);
                        let tokens = tokenize(action.strip_prefix("range").unwrap())?;
                        let (decl, rest) = split_decl(&tokens)?;
                        let pipe = parse_pipeline(&rest)?;
                        let (body, else_body) = parse_block(iter)?;
                        nodes.push(Node::Range {
                            decl,
                            pipe,
                            body,
                            else_body,
                        });
                    }
                    _ => {
                        let action = must_action(iter);
                        let tokens = tokenize(&action)?;
                        nodes.push(Node::Action(parse_pipeline(&tokens)?));
                    }
                }
            }
        }
    }

    if in_block {
        return Err(Error::template("missing 'end'"));
    }
    Ok(nodes)
}

fn must_action(iter: &mut std::iter::Peekable<std::vec::IntoIter<Segment>>) -> String {
    match iter.next() {
        Some(Segment::Action(a)) => a,
        _ => unreachable!("peeked action"),
    }
}

/// Parse a block body plus optional `else` branch, consuming the
/// terminating `end`.
fn parse_block(
    iter: &mut std::iter::Peekable<std::vec::IntoIter<Segment>>,
) -> Result<(Vec<Node>, Vec<Node>)> {
    let body = parse_nodes(iter, true)?;
    match iter.next() {
        Some(Segment::Action(a)) if a == "end" => Ok((body, Vec::new())),
        Some(Segment::Action(a)) if a == "else" => {
            let else_body = parse_nodes(iter, true)?;
            match iter.next() {
                Some(Segment::Action(a)) if a == "end" => Ok((body, else_body)),
                _ => Err(Error::template("missing 'end' after 'else'")),
            }
        }
        _ => Err(Error::template("missing 'end'")),
    }
}

/// Split optional leading `$a, $b :=` declarations off a range action.
fn split_decl(tokens: &[Token]) -> Result<(Vec<String>, Vec<Token>)> {
    let declare_pos = tokens.iter().position(|t| *t == Token::Declare);
    let Some(pos) = declare_pos else {
        return Ok((Vec::new(), tokens.to_vec()));
    };

    let mut decl = Vec::new();
    let mut expect_var = true;
    for tok in &tokens[..pos] {
        match tok {
            Token::Var(name) if expect_var => {
                decl.push(name.clone());
                expect_var = false;
            }
            Token::Comma if !expect_var => expect_var = true,
            other => {
                return Err(Error::template(format!(
                    "bad range declaration near {:?}",
                    other
                )))
            }
        }
    }
    if decl.is_empty() || decl.len() > 2 || expect_var {
        return Err(Error::template("range declares one or two variables"));
    }
    Ok((decl, tokens[pos + 1..].to_vec()))
}

/// Parse a token list into a pipeline.
pub fn parse_pipeline(tokens: &[Token]) -> Result<Pipeline> {
    let mut pos = 0;
    let pipe = parse_pipeline_at(tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(Error::template(format!(
            "trailing tokens in action: {:?}",
            &tokens[pos..]
        )));
    }
    Ok(pipe)
}

fn parse_pipeline_at(tokens: &[Token], pos: &mut usize) -> Result<Pipeline> {
    let mut cmds = Vec::new();
    loop {
        let cmd = parse_command(tokens, pos)?;
        cmds.push(cmd);
        match tokens.get(*pos) {
            Some(Token::Pipe) => *pos += 1,
            _ => break,
        }
    }
    Ok(Pipeline { cmds })
}

fn parse_command(tokens: &[Token], pos: &mut usize) -> Result<Command> {
    let mut args = Vec::new();
    loop {
        match tokens.get(*pos) {
            Some(Token::Pipe) | Some(Token::RParen) | None => break,
            Some(Token::LParen) => {
                *pos += 1;
                let sub = parse_pipeline_at(tokens, pos)?;
                match tokens.get(*pos) {
                    Some(Token::RParen) => *pos += 1,
                    _ => return Err(Error::template("missing ')'")),
                }
                args.push(Term::Sub(sub));
            }
            Some(tok) => {
                args.push(match tok {
                    Token::Ident(s) => Term::Ident(s.clone()),
                    Token::Field(p) => Term::Field(p.clone()),
                    Token::Var(v) => Term::Var(v.clone()),
                    Token::Str(s) => Term::Str(s.clone()),
                    Token::Int(n) => Term::Int(*n),
                    Token::Float(f) => Term::Float(*f),
                    Token::Bool(b) => Term::Bool(*b),
                    other => {
                        return Err(Error::template(format!("unexpected token {:?}", other)))
                    }
                });
                *pos += 1;
            }
        }
    }
    if args.is_empty() {
        return Err(Error::template("empty command in action"));
    }
    Ok(Command { args })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_default(input: &str) -> Vec<Node> {
        parse(input, "{{", "}}").unwrap()
    }

    #[test]
    fn test_text_and_action() {
        let nodes = parse_default(r#"x {{ datastore "k" }} y"#);
        assert_eq!(nodes.len(), 3);
        assert!(matches!(&nodes[0], Node::Text(t) if t == "x "));
        assert!(matches!(&nodes[1], Node::Action(_)));
    }

    #[test]
    fn test_pipeline_structure() {
        let nodes = parse_default(r#"{{ file "a" | qjson "b.c" }}"#);
        let Node::Action(pipe) = &nodes[0] else {
            panic!("expected action")
        };
        assert_eq!(pipe.cmds.len(), 2);
        assert_eq!(pipe.cmds[0].args[0], Term::Ident("file".into()));
        assert_eq!(pipe.cmds[1].args[1], Term::Str("b.c".into()));
    }

    #[test]
    fn test_range_block() {
        let nodes = parse_default(r#"{{ range $i, $v := N 3 }}x{{ end }}"#);
        let Node::Range { decl, body, .. } = &nodes[0] else {
            panic!("expected range")
        };
        assert_eq!(decl, &vec!["i".to_string(), "v".to_string()]);
        assert_eq!(body, &vec![Node::Text("x".into())]);
    }

    #[test]
    fn test_if_else() {
        let nodes = parse_default(r#"{{ if .Param1 }}a{{ else }}b{{ end }}"#);
        let Node::If {
            then_body,
            else_body,
            ..
        } = &nodes[0]
        else {
            panic!("expected if")
        };
        assert_eq!(then_body, &vec![Node::Text("a".into())]);
        assert_eq!(else_body, &vec![Node::Text("b".into())]);
    }

    #[test]
    fn test_unbalanced_end() {
        assert!(parse("{{ end }}", "{{", "}}").is_err());
        assert!(parse("{{ range N 2 }}x", "{{", "}}").is_err());
    }

    #[test]
    fn test_parenthesized_subpipeline() {
        let nodes = parse_default(r#"{{ add 1 (multiply 2 3) }}"#);
        let Node::Action(pipe) = &nodes[0] else {
            panic!("expected action")
        };
        assert!(matches!(pipe.cmds[0].args[2], Term::Sub(_)));
    }
}
