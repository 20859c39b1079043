//! Template lexing
//!
//! Stage one splits the input into literal text and `{{ … }}` action
//! segments (delimiters are configurable). Stage two tokenizes the
//! inside of an action.

use crate::error::{Error, Result};

/// A raw segment of the template source
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Action(String),
}

/// Split template source into text and action segments.
pub fn split_segments(input: &str, open: &str, close: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find(open) {
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_string()));
        }
        let after_open = &rest[start + open.len()..];
        let end = after_open.find(close).ok_or_else(|| {
            Error::template(format!("unterminated action, missing '{}'", close))
        })?;
        segments.push(Segment::Action(after_open[..end].trim().to_string()));
        rest = &after_open[end + close.len()..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    Ok(segments)
}

/// One token inside an action
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Function name or keyword
    Ident(String),
    /// `.Field.Sub` access path; the bare dot is an empty path
    Field(Vec<String>),
    /// `$name` variable
    Var(String),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Pipe,
    LParen,
    RParen,
    /// `:=`
    Declare,
    Comma,
}

/// Tokenize the inside of one action.
pub fn tokenize(action: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = action.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ':' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Declare);
                    i += 2;
                } else {
                    return Err(Error::template(format!("unexpected ':' in '{}'", action)));
                }
            }
            '"' => {
                let (s, next) = scan_string(&chars, i, action)?;
                tokens.push(Token::Str(s));
                i = next;
            }
            '`' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&c| c == '`')
                    .ok_or_else(|| Error::template(format!("unterminated raw string in '{}'", action)))?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '$' => {
                let (name, next) = scan_ident(&chars, i + 1);
                tokens.push(Token::Var(name));
                i = next;
            }
            '.' => {
                let mut path = Vec::new();
                let mut j = i;
                while chars.get(j) == Some(&'.') {
                    let (name, next) = scan_ident(&chars, j + 1);
                    if name.is_empty() {
                        break;
                    }
                    path.push(name);
                    j = next;
                }
                tokens.push(Token::Field(path));
                i = if i == j { i + 1 } else { j };
            }
            c if c == '-' || c.is_ascii_digit() => {
                let (tok, next) = scan_number(&chars, i, action)?;
                tokens.push(tok);
                i = next;
            }
            c if is_ident_char(c) => {
                let (name, next) = scan_ident(&chars, i);
                match name.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    _ => tokens.push(Token::Ident(name)),
                }
                i = next;
            }
            _ => {
                return Err(Error::template(format!(
                    "unexpected character '{}' in '{}'",
                    c, action
                )))
            }
        }
    }
    Ok(tokens)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn scan_ident(chars: &[char], mut i: usize) -> (String, usize) {
    let start = i;
    while i < chars.len() && is_ident_char(chars[i]) {
        i += 1;
    }
    (chars[start..i].iter().collect(), i)
}

fn scan_string(chars: &[char], start: usize, action: &str) -> Result<(String, usize)> {
    let mut s = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '"' => return Ok((s, i + 1)),
            '\\' => {
                let next = chars.get(i + 1).ok_or_else(|| {
                    Error::template(format!("unterminated escape in '{}'", action))
                })?;
                s.push(match next {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => *other,
                });
                i += 2;
            }
            c => {
                s.push(c);
                i += 1;
            }
        }
    }
    Err(Error::template(format!("unterminated string in '{}'", action)))
}

fn scan_number(chars: &[char], start: usize, action: &str) -> Result<(Token, usize)> {
    let mut i = start;
    if chars[i] == '-' {
        i += 1;
    }
    let mut is_float = false;
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == 'e' || chars[i] == 'E' || chars[i] == '+' || (chars[i] == '-' && matches!(chars[i - 1], 'e' | 'E'))) {
        if chars[i] == '.' || chars[i] == 'e' || chars[i] == 'E' {
            is_float = true;
        }
        i += 1;
    }
    let text: String = chars[start..i].iter().collect();
    if is_float {
        text.parse::<f64>()
            .map(|f| (Token::Float(f), i))
            .map_err(|_| Error::template(format!("bad number '{}' in '{}'", text, action)))
    } else {
        text.parse::<i64>()
            .map(|n| (Token::Int(n), i))
            .map_err(|_| Error::template(format!("bad number '{}' in '{}'", text, action)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_segments() {
        let segs = split_segments(r#"a {{ x }} b"#, "{{", "}}").unwrap();
        assert_eq!(
            segs,
            vec![
                Segment::Text("a ".into()),
                Segment::Action("x".into()),
                Segment::Text(" b".into()),
            ]
        );
    }

    #[test]
    fn test_custom_delims() {
        let segs = split_segments("[[ x ]]", "[[", "]]").unwrap();
        assert_eq!(segs, vec![Segment::Action("x".into())]);
    }

    #[test]
    fn test_unterminated_action() {
        assert!(split_segments("{{ x", "{{", "}}").is_err());
    }

    #[test]
    fn test_tokenize_pipeline() {
        let toks = tokenize(r#"file "external" | qjson "load.me""#).unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Ident("file".into()),
                Token::Str("external".into()),
                Token::Pipe,
                Token::Ident("qjson".into()),
                Token::Str("load.me".into()),
            ]
        );
    }

    #[test]
    fn test_tokenize_fields_vars_numbers() {
        let toks = tokenize(r#"add .Param1 -3 | multiply $x 1.5"#).unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Ident("add".into()),
                Token::Field(vec!["Param1".into()]),
                Token::Int(-3),
                Token::Pipe,
                Token::Ident("multiply".into()),
                Token::Var("x".into()),
                Token::Float(1.5),
            ]
        );
    }

    #[test]
    fn test_tokenize_declare() {
        let toks = tokenize("range $i, $v := N 3").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Ident("range".into()),
                Token::Var("i".into()),
                Token::Comma,
                Token::Var("v".into()),
                Token::Declare,
                Token::Ident("N".into()),
                Token::Int(3),
            ]
        );
    }

    #[test]
    fn test_raw_string_and_escapes() {
        let toks = tokenize(r#"match `^\d+$` "a\"b""#).unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Ident("match".into()),
                Token::Str(r"^\d+$".into()),
                Token::Str("a\"b".into()),
            ]
        );
    }
}
