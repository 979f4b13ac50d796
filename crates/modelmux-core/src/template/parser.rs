//! Template lexer and parser.
//!
//! Source syntax:
//! - `{name}`, `{user.name}`, `{items.0}`: substitution
//! - `{name|fallback}`: substitution with a literal fallback
//! - `{{` / `}}`: literal braces
//! - `{%if [not] cond%}` … `{%elif [not] cond%}` … `{%else%}` … `{%endif%}`
//! - `{%for item in items%}` … `{%endfor%}`

use crate::error::TemplateError;

/// A dotted variable reference such as `user.name` or `items.0`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Path {
    pub segments: Vec<String>,
}

impl Path {
    pub fn root(&self) -> &str {
        self.segments.first().map(String::as_str).unwrap_or("")
    }

    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Condition {
    pub negated: bool,
    pub path: Path,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Node {
    Text(String),
    Var {
        path: Path,
        fallback: Option<String>,
    },
    If {
        branches: Vec<(Condition, Vec<Node>)>,
        otherwise: Option<Vec<Node>>,
    },
    For {
        binding: String,
        iterable: Path,
        body: Vec<Node>,
    },
}

// ─────────────────────────────────────────────
// Lexer
// ─────────────────────────────────────────────

#[derive(Debug)]
enum Tag {
    If(Condition),
    Elif(Condition),
    Else,
    EndIf,
    For { binding: String, iterable: Path },
    EndFor,
}

impl Tag {
    fn keyword(&self) -> &'static str {
        match self {
            Tag::If(_) => "if",
            Tag::Elif(_) => "elif",
            Tag::Else => "else",
            Tag::EndIf => "endif",
            Tag::For { .. } => "for",
            Tag::EndFor => "endfor",
        }
    }
}

#[derive(Debug)]
enum Token {
    Text(String),
    Var { path: Path, fallback: Option<String> },
    Tag(Tag),
}

/// Token plus the byte offset where it starts in the source.
type Spanned = (Token, usize);

/// Translate a byte offset into a 1-based (line, column) pair.
fn position(source: &str, offset: usize) -> (usize, usize) {
    let before = &source[..offset.min(source.len())];
    let line = before.matches('\n').count() + 1;
    let column = before
        .rsplit('\n')
        .next()
        .map(|l| l.chars().count())
        .unwrap_or(0)
        + 1;
    (line, column)
}

fn syntax(source: &str, offset: usize, message: impl Into<String>) -> TemplateError {
    let (line, column) = position(source, offset);
    TemplateError::Syntax {
        message: message.into(),
        line,
        column,
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_path(source: &str, offset: usize, raw: &str) -> Result<Path, TemplateError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(syntax(source, offset, "empty variable name"));
    }
    let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
    let valid = is_identifier(&segments[0])
        && segments[1..]
            .iter()
            .all(|s| is_identifier(s) || (!s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())));
    if !valid {
        return Err(syntax(source, offset, format!("invalid variable name '{raw}'")));
    }
    Ok(Path { segments })
}

fn parse_condition(source: &str, offset: usize, raw: &str) -> Result<Condition, TemplateError> {
    let raw = raw.trim();
    let (negated, rest) = match raw.strip_prefix("not ") {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    if rest.trim().is_empty() {
        return Err(syntax(source, offset, "missing condition"));
    }
    Ok(Condition {
        negated,
        path: parse_path(source, offset, rest)?,
    })
}

fn parse_tag(source: &str, offset: usize, body: &str) -> Result<Tag, TemplateError> {
    let body = body.trim();
    let (keyword, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));

    let expect_bare = |tag: Tag| {
        if rest.trim().is_empty() {
            Ok(tag)
        } else {
            Err(syntax(
                source,
                offset,
                format!("unexpected text after '{{%{keyword}%}}'"),
            ))
        }
    };

    match keyword {
        "if" => Ok(Tag::If(parse_condition(source, offset, rest)?)),
        "elif" => Ok(Tag::Elif(parse_condition(source, offset, rest)?)),
        "else" => expect_bare(Tag::Else),
        "endif" => expect_bare(Tag::EndIf),
        "endfor" => expect_bare(Tag::EndFor),
        "for" => {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            match parts.as_slice() {
                [binding, "in", iterable] if is_identifier(binding) => Ok(Tag::For {
                    binding: binding.to_string(),
                    iterable: parse_path(source, offset, iterable)?,
                }),
                _ => Err(syntax(
                    source,
                    offset,
                    "malformed loop, expected '{%for item in items%}'",
                )),
            }
        }
        "" => Err(syntax(source, offset, "empty tag")),
        other => Err(syntax(source, offset, format!("unknown tag '{other}'"))),
    }
}

fn tokenize(source: &str) -> Result<Vec<Spanned>, TemplateError> {
    let bytes = source.as_bytes();
    let mut tokens: Vec<Spanned> = Vec::new();
    let mut text = String::new();
    let mut text_start = 0;
    let mut i = 0;

    let flush = |text: &mut String, start: usize, tokens: &mut Vec<Spanned>| {
        if !text.is_empty() {
            tokens.push((Token::Text(std::mem::take(text)), start));
        }
    };

    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                if text.is_empty() {
                    text_start = i;
                }
                text.push('{');
                i += 2;
            }
            b'{' if bytes.get(i + 1) == Some(&b'%') => {
                let close = source[i + 2..]
                    .find("%}")
                    .map(|p| i + 2 + p)
                    .ok_or_else(|| syntax(source, i, "unterminated tag, missing '%}'"))?;
                let tag = parse_tag(source, i, &source[i + 2..close])?;
                flush(&mut text, text_start, &mut tokens);
                tokens.push((Token::Tag(tag), i));
                i = close + 2;
            }
            b'{' => {
                let close = source[i + 1..]
                    .find(['{', '}', '\n'])
                    .map(|p| i + 1 + p)
                    .filter(|&p| bytes[p] == b'}')
                    .ok_or_else(|| syntax(source, i, "unmatched '{'"))?;
                let inner = &source[i + 1..close];
                let (name, fallback) = match inner.split_once('|') {
                    Some((name, fallback)) => (name, Some(fallback.to_string())),
                    None => (inner, None),
                };
                let path = parse_path(source, i, name)?;
                flush(&mut text, text_start, &mut tokens);
                tokens.push((Token::Var { path, fallback }, i));
                i = close + 1;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                if text.is_empty() {
                    text_start = i;
                }
                text.push('}');
                i += 2;
            }
            b'}' => return Err(syntax(source, i, "unmatched '}'")),
            _ => {
                let next = source[i..].find(['{', '}']).map(|p| i + p).unwrap_or(source.len());
                if text.is_empty() {
                    text_start = i;
                }
                text.push_str(&source[i..next]);
                i = next;
            }
        }
    }
    flush(&mut text, text_start, &mut tokens);
    Ok(tokens)
}

// ─────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────

struct Parser<'s> {
    source: &'s str,
    tokens: std::vec::IntoIter<Spanned>,
}

impl<'s> Parser<'s> {
    /// Parse nodes until EOF or one of the `stop` keywords.
    fn parse_nodes(&mut self, stop: &[&str]) -> Result<(Vec<Node>, Option<(Tag, usize)>), TemplateError> {
        let mut nodes = Vec::new();
        while let Some((token, offset)) = self.tokens.next() {
            match token {
                Token::Text(text) => nodes.push(Node::Text(text)),
                Token::Var { path, fallback } => nodes.push(Node::Var { path, fallback }),
                Token::Tag(Tag::If(condition)) => nodes.push(self.parse_if(condition, offset)?),
                Token::Tag(Tag::For { binding, iterable }) => {
                    let (body, end) = self.parse_nodes(&["endfor"])?;
                    if end.is_none() {
                        return Err(syntax(self.source, offset, "unclosed '{%for%}'"));
                    }
                    nodes.push(Node::For {
                        binding,
                        iterable,
                        body,
                    });
                }
                Token::Tag(tag) => {
                    if stop.contains(&tag.keyword()) {
                        return Ok((nodes, Some((tag, offset))));
                    }
                    return Err(syntax(
                        self.source,
                        offset,
                        format!("unexpected '{{%{}%}}'", tag.keyword()),
                    ));
                }
            }
        }
        Ok((nodes, None))
    }

    fn parse_if(&mut self, first: Condition, open: usize) -> Result<Node, TemplateError> {
        let mut branches = Vec::new();
        let mut condition = first;
        loop {
            let (body, end) = self.parse_nodes(&["elif", "else", "endif"])?;
            branches.push((condition, body));
            match end {
                Some((Tag::Elif(next), _)) => condition = next,
                Some((Tag::Else, _)) => {
                    let (otherwise, end) = self.parse_nodes(&["endif"])?;
                    if end.is_none() {
                        return Err(syntax(self.source, open, "unclosed '{%if%}'"));
                    }
                    return Ok(Node::If {
                        branches,
                        otherwise: Some(otherwise),
                    });
                }
                Some(_) => {
                    return Ok(Node::If {
                        branches,
                        otherwise: None,
                    })
                }
                None => return Err(syntax(self.source, open, "unclosed '{%if%}'")),
            }
        }
    }
}

/// Compile template source into an AST. Fails on the first syntax error.
pub(crate) fn parse(source: &str) -> Result<Vec<Node>, TemplateError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens: tokens.into_iter(),
    };
    let (nodes, _) = parser.parse_nodes(&[])?;
    Ok(nodes)
}
