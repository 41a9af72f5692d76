//! Template lexing and parsing.
//!
//! A template is literal text interleaved with `{{...}}` actions. An
//! action is a pipeline: an initial term (context path, literal, or
//! function call) followed by zero or more `| function` stages, each of
//! which receives the previous value as its final argument.

use crate::error::ParseError;

/// One parsed segment of a template.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
    /// Literal text copied through verbatim
    Text(String),
    /// A `{{...}}` action
    Action(Pipeline),
}

/// A pipeline of expressions: `expr | fn a b | fn2`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Pipeline {
    /// Initial expression
    pub head: Expr,
    /// Piped stages, applied left to right
    pub stages: Vec<Call>,
}

/// An expression inside an action.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    /// Context path such as `.Args.id`
    Path(Vec<String>),
    /// Literal string/number/bool
    Literal(serde_json::Value),
    /// Function call with arguments
    Call(Call),
}

/// A function application.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Call {
    /// Function name
    pub name: String,
    /// Positional arguments
    pub args: Vec<Expr>,
}

/// A parsed, render-ready template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub(crate) segments: Vec<Segment>,
    source: String,
}

impl Template {
    /// Parse template source.
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let mut segments = Vec::new();
        let bytes = source.as_bytes();
        let mut pos = 0;

        while pos < bytes.len() {
            match source[pos..].find("{{") {
                Some(rel) => {
                    if rel > 0 {
                        segments.push(Segment::Text(source[pos..pos + rel].to_string()));
                    }
                    let action_start = pos + rel + 2;
                    let Some(end_rel) = source[action_start..].find("}}") else {
                        return Err(ParseError::new(pos + rel, "unterminated action"));
                    };
                    let body = &source[action_start..action_start + end_rel];
                    let pipeline = parse_pipeline(body, action_start)?;
                    segments.push(Segment::Action(pipeline));
                    pos = action_start + end_rel + 2;
                }
                None => {
                    segments.push(Segment::Text(source[pos..].to_string()));
                    break;
                }
            }
        }

        Ok(Self {
            segments,
            source: source.to_string(),
        })
    }

    /// The original template source.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the template contains no actions at all.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Text(_)))
    }
}

fn parse_pipeline(body: &str, offset: usize) -> Result<Pipeline, ParseError> {
    let stages_src = split_pipeline(body);
    if stages_src.is_empty() || stages_src[0].trim().is_empty() {
        return Err(ParseError::new(offset, "empty action"));
    }

    let head = parse_expr_list(stages_src[0], offset)?;
    let mut stages = Vec::new();
    for stage_src in &stages_src[1..] {
        match parse_expr_list(stage_src, offset)? {
            Expr::Call(call) => stages.push(call),
            Expr::Path(_) | Expr::Literal(_) => {
                return Err(ParseError::new(
                    offset,
                    format!("pipeline stage '{}' must be a function", stage_src.trim()),
                ));
            }
        }
    }
    Ok(Pipeline { head, stages })
}

/// Split on `|` outside of string literals.
fn split_pipeline(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        match c {
            '\\' if in_string => escaped = !escaped,
            '"' if !escaped => in_string = !in_string,
            '|' if !in_string => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    parts.push(&body[start..]);
    parts
}

/// Parse a space-separated token list into a single expression. One token
/// is a path or literal; several tokens form a function call.
fn parse_expr_list(src: &str, offset: usize) -> Result<Expr, ParseError> {
    let tokens = tokenize(src, offset)?;
    match tokens.len() {
        0 => Err(ParseError::new(offset, "empty expression")),
        1 => parse_single(&tokens[0], offset),
        _ => {
            let Token::Ident(name) = &tokens[0] else {
                return Err(ParseError::new(
                    offset,
                    "function name expected before arguments",
                ));
            };
            let mut args = Vec::with_capacity(tokens.len() - 1);
            for token in &tokens[1..] {
                args.push(parse_single(token, offset)?);
            }
            Ok(Expr::Call(Call {
                name: name.clone(),
                args,
            }))
        }
    }
}

fn parse_single(token: &Token, offset: usize) -> Result<Expr, ParseError> {
    match token {
        Token::Path(segments) => Ok(Expr::Path(segments.clone())),
        Token::Str(s) => Ok(Expr::Literal(serde_json::Value::String(s.clone()))),
        Token::Number(n) => Ok(Expr::Literal(n.clone())),
        Token::Ident(word) => match word.as_str() {
            "true" => Ok(Expr::Literal(serde_json::Value::Bool(true))),
            "false" => Ok(Expr::Literal(serde_json::Value::Bool(false))),
            "nil" => Ok(Expr::Literal(serde_json::Value::Null)),
            // A lone identifier is a zero-argument function call.
            _ => Ok(Expr::Call(Call {
                name: word.clone(),
                args: Vec::new(),
            })),
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(Vec<String>),
    Ident(String),
    Str(String),
    Number(serde_json::Value),
}

fn tokenize(src: &str, offset: usize) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(i, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, 'n')) => s.push('\n'),
                            Some((_, 't')) => s.push('\t'),
                            Some((_, other)) => s.push(other),
                            None => break,
                        },
                        other => s.push(other),
                    }
                }
                if !closed {
                    return Err(ParseError::new(offset + i, "unterminated string literal"));
                }
                tokens.push(Token::Str(s));
            }
            '.' => {
                chars.next();
                let mut segments = Vec::new();
                let mut current = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c == '.' {
                        if current.is_empty() {
                            return Err(ParseError::new(offset + i, "empty path segment"));
                        }
                        segments.push(std::mem::take(&mut current));
                        chars.next();
                    } else if c.is_alphanumeric() || c == '_' || c == '-' {
                        current.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if !current.is_empty() {
                    segments.push(current);
                }
                if segments.is_empty() {
                    return Err(ParseError::new(offset + i, "bare '.' is not a valid path"));
                }
                tokens.push(Token::Path(segments));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut num = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' || c == '-' || c == 'e' || c == 'E' || c == '+'
                    {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value: serde_json::Value = serde_json::from_str(&num)
                    .map_err(|_| ParseError::new(offset + i, format!("bad number '{num}'")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut word = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(word));
            }
            other => {
                return Err(ParseError::new(
                    offset + i,
                    format!("unexpected character '{other}'"),
                ));
            }
        }
    }
    Ok(tokens)
}
