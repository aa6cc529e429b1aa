//! Template source → node tree.
//!
//! Supported markup:
//! - `{{ expr }}` output, `{# ... #}` comments
//! - `{% if %}` / `{% elif %}` / `{% else %}` / `{% endif %}`
//! - `{% for name in expr %}` / `{% endfor %}`
//! - `{% include "path" %}`
//! - `{% raw %}` / `{% endraw %}` (body emitted verbatim)
//! - a `-` just inside any delimiter trims whitespace on that side

use serde_json::Value;

use super::TemplateError;

/// Filters understood by the renderer, checked at parse time.
pub(crate) const FILTERS: &[&str] = &[
    "default", "length", "lower", "replace", "split", "tojson", "trim", "upper",
];

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Text(String),
    Output(Expr),
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        otherwise: Vec<Node>,
    },
    For {
        var: String,
        iter: Expr,
        body: Vec<Node>,
    },
    Include(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Path(Vec<Segment>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Defined(Box<Expr>),
    Filter {
        expr: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Key(String),
    Index(usize),
}

/// Lexed template piece before tree building.
#[derive(Debug)]
enum Chunk {
    Text(String),
    Output { src: String, line: usize },
    Tag { src: String, line: usize },
}

pub(crate) fn parse(name: &str, source: &str) -> Result<Vec<Node>, TemplateError> {
    let chunks = lex(name, source)?;
    let mut parser = Parser {
        name,
        chunks: chunks.into_iter().peekable(),
    };
    let (nodes, stop) = parser.block(&[])?;
    if let Some((tag, line)) = stop {
        return Err(syntax(name, line, format!("unexpected '{{% {tag} %}}'")));
    }
    Ok(nodes)
}

fn syntax(name: &str, line: usize, message: impl Into<String>) -> TemplateError {
    TemplateError::Syntax {
        name: name.to_string(),
        line,
        message: message.into(),
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Lexing
// ─────────────────────────────────────────────────────────────────────────

fn lex(name: &str, source: &str) -> Result<Vec<Chunk>, TemplateError> {
    let mut chunks = Vec::new();
    let mut rest = source;
    let mut line = 1usize;
    let mut trim_next = false;

    loop {
        let Some(open) = find_open(rest) else {
            push_text(&mut chunks, rest, trim_next);
            break;
        };
        let (before, tail) = rest.split_at(open);
        let kind = &tail[..2];
        let close = match kind {
            "{{" => "}}",
            "{%" => "%}",
            _ => "#}",
        };
        let tag_line = line + before.matches('\n').count();
        let body_start = 2;
        let Some(end) = tail[body_start..].find(close) else {
            return Err(syntax(name, tag_line, format!("unclosed '{kind}'")));
        };
        let mut inner = &tail[body_start..body_start + end];
        let after = &tail[body_start + end + 2..];

        let trim_before = inner.starts_with('-');
        if trim_before {
            inner = &inner[1..];
        }
        let trim_after = inner.ends_with('-');
        if trim_after {
            inner = &inner[..inner.len() - 1];
        }

        let text = if trim_before { before.trim_end() } else { before };
        push_text(&mut chunks, text, trim_next);
        trim_next = trim_after;
        line = tag_line + tail[..body_start + end + 2].matches('\n').count();

        match kind {
            "{{" => chunks.push(Chunk::Output {
                src: inner.trim().to_string(),
                line: tag_line,
            }),
            "{%" if inner.trim() == "raw" => {
                let (raw, consumed, closing_trim) = take_raw(after)
                    .ok_or_else(|| syntax(name, tag_line, "missing '{% endraw %}'"))?;
                let raw = if trim_after { raw.trim_start() } else { raw };
                chunks.push(Chunk::Text(raw.to_string()));
                trim_next = closing_trim;
                line += after[..consumed].matches('\n').count();
                rest = &after[consumed..];
                continue;
            }
            "{%" => chunks.push(Chunk::Tag {
                src: inner.trim().to_string(),
                line: tag_line,
            }),
            _ => {}
        }
        rest = after;
    }

    Ok(chunks)
}

fn find_open(s: &str) -> Option<usize> {
    ["{{", "{%", "{#"]
        .iter()
        .filter_map(|pat| s.find(pat))
        .min()
}

fn push_text(chunks: &mut Vec<Chunk>, text: &str, trim_start: bool) {
    let text = if trim_start { text.trim_start() } else { text };
    if !text.is_empty() {
        chunks.push(Chunk::Text(text.to_string()));
    }
}

/// Find the matching `{% endraw %}`; returns (body, bytes consumed, trim-after flag).
fn take_raw(s: &str) -> Option<(&str, usize, bool)> {
    let mut offset = 0;
    while let Some(pos) = s[offset..].find("{%") {
        let start = offset + pos;
        let end = start + 2 + s[start + 2..].find("%}")?;
        let inner = &s[start + 2..end];
        let trim_before = inner.starts_with('-');
        let trim_after = inner.ends_with('-');
        if inner.trim_matches('-').trim() == "endraw" {
            let body = &s[..start];
            let body = if trim_before { body.trim_end() } else { body };
            return Some((body, end + 2, trim_after));
        }
        offset = end + 2;
    }
    None
}

// ─────────────────────────────────────────────────────────────────────────
// Tree building
// ─────────────────────────────────────────────────────────────────────────

struct Parser<'a> {
    name: &'a str,
    chunks: std::iter::Peekable<std::vec::IntoIter<Chunk>>,
}

type Stop = Option<(String, usize)>;

impl Parser<'_> {
    /// Parse nodes until one of `stops` (matched on the tag keyword) or EOF.
    fn block(&mut self, stops: &[&str]) -> Result<(Vec<Node>, Stop), TemplateError> {
        let mut nodes = Vec::new();

        while let Some(chunk) = self.chunks.next() {
            match chunk {
                Chunk::Text(text) => nodes.push(Node::Text(text)),
                Chunk::Output { src, line } => {
                    nodes.push(Node::Output(parse_expr(self.name, line, &src)?))
                }
                Chunk::Tag { src, line } => {
                    let keyword = src.split_whitespace().next().unwrap_or("");
                    if stops.contains(&keyword) {
                        return Ok((nodes, Some((src, line))));
                    }
                    let rest = src[keyword.len()..].trim();
                    match keyword {
                        "if" => nodes.push(self.if_block(rest, line)?),
                        "for" => nodes.push(self.for_block(rest, line)?),
                        "include" => match parse_expr(self.name, line, rest)? {
                            Expr::Literal(Value::String(path)) => nodes.push(Node::Include(path)),
                            _ => {
                                return Err(syntax(
                                    self.name,
                                    line,
                                    "include expects a quoted path",
                                ))
                            }
                        },
                        "elif" | "else" | "endif" | "endfor" | "endraw" => {
                            return Err(syntax(
                                self.name,
                                line,
                                format!("unexpected '{{% {keyword} %}}'"),
                            ))
                        }
                        other => {
                            return Err(syntax(self.name, line, format!("unknown tag '{other}'")))
                        }
                    }
                }
            }
        }

        Ok((nodes, None))
    }

    fn if_block(&mut self, cond: &str, line: usize) -> Result<Node, TemplateError> {
        let mut branches = Vec::new();
        let mut cond = parse_expr(self.name, line, cond)?;
        loop {
            let (body, stop) = self.block(&["elif", "else", "endif"])?;
            let Some((tag, tag_line)) = stop else {
                return Err(syntax(self.name, line, "missing '{% endif %}'"));
            };
            branches.push((cond, body));
            match tag.split_whitespace().next() {
                Some("elif") => {
                    cond = parse_expr(self.name, tag_line, tag["elif".len()..].trim())?;
                }
                Some("else") => {
                    let (otherwise, stop) = self.block(&["endif"])?;
                    if stop.is_none() {
                        return Err(syntax(self.name, line, "missing '{% endif %}'"));
                    }
                    return Ok(Node::If {
                        branches,
                        otherwise,
                    });
                }
                _ => {
                    return Ok(Node::If {
                        branches,
                        otherwise: Vec::new(),
                    })
                }
            }
        }
    }

    fn for_block(&mut self, header: &str, line: usize) -> Result<Node, TemplateError> {
        let mut parts = header.splitn(3, char::is_whitespace);
        let var = parts.next().unwrap_or("");
        let in_kw = parts.next().unwrap_or("");
        let iter_src = parts.next().unwrap_or("").trim();
        if !is_ident(var) || in_kw != "in" || iter_src.is_empty() {
            return Err(syntax(
                self.name,
                line,
                "expected '{% for <name> in <expr> %}'",
            ));
        }
        let iter = parse_expr(self.name, line, iter_src)?;
        let (body, stop) = self.block(&["endfor"])?;
        if stop.is_none() {
            return Err(syntax(self.name, line, "missing '{% endfor %}'"));
        }
        Ok(Node::For {
            var: var.to_string(),
            iter,
            body,
        })
    }
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ─────────────────────────────────────────────────────────────────────────
// Expressions
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(Value),
    Dot,
    Pipe,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    EqEq,
    NotEq,
}

fn tokenize(src: &str) -> Result<Vec<Tok>, String> {
    let mut toks = Vec::new();
    let mut chars = src.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '.' => {
                chars.next();
                toks.push(Tok::Dot);
            }
            '|' => {
                chars.next();
                toks.push(Tok::Pipe);
            }
            ',' => {
                chars.next();
                toks.push(Tok::Comma);
            }
            '(' => {
                chars.next();
                toks.push(Tok::LParen);
            }
            ')' => {
                chars.next();
                toks.push(Tok::RParen);
            }
            '[' => {
                chars.next();
                toks.push(Tok::LBracket);
            }
            ']' => {
                chars.next();
                toks.push(Tok::RBracket);
            }
            '=' | '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(format!("expected '{c}='"));
                }
                toks.push(if c == '=' { Tok::EqEq } else { Tok::NotEq });
            }
            '"' | '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => return Err("unterminated string".into()),
                        },
                        Some(q) if q == c => break,
                        Some(other) => s.push(other),
                        None => return Err("unterminated string".into()),
                    }
                }
                toks.push(Tok::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: u64 = s.parse().map_err(|_| format!("bad number '{s}'"))?;
                toks.push(Tok::Num(Value::from(n)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                toks.push(Tok::Ident(s));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(toks)
}

pub(crate) fn parse_expr(name: &str, line: usize, src: &str) -> Result<Expr, TemplateError> {
    let toks = tokenize(src).map_err(|msg| syntax(name, line, msg))?;
    let mut p = ExprParser { toks, pos: 0 };
    let expr = p.or().map_err(|msg| syntax(name, line, msg))?;
    if p.pos != p.toks.len() {
        return Err(syntax(
            name,
            line,
            format!("unexpected trailing input in '{src}'"),
        ));
    }
    Ok(expr)
}

struct ExprParser {
    toks: Vec<Tok>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Ident(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok) -> Result<(), String> {
        match self.bump() {
            Some(t) if t == tok => Ok(()),
            other => Err(format!("expected {tok:?}, found {other:?}")),
        }
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and()?;
        while self.eat_ident("or") {
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.not()?;
        while self.eat_ident("and") {
            lhs = Expr::And(Box::new(lhs), Box::new(self.not()?));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr, String> {
        if self.eat_ident("not") {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, String> {
        let lhs = self.filtered()?;
        match self.peek() {
            Some(Tok::EqEq) => {
                self.pos += 1;
                Ok(Expr::Eq(Box::new(lhs), Box::new(self.filtered()?)))
            }
            Some(Tok::NotEq) => {
                self.pos += 1;
                Ok(Expr::Ne(Box::new(lhs), Box::new(self.filtered()?)))
            }
            Some(Tok::Ident(w)) if w == "is" => {
                self.pos += 1;
                let negate = self.eat_ident("not");
                if !self.eat_ident("defined") {
                    return Err("only 'is defined' tests are supported".into());
                }
                let test = Expr::Defined(Box::new(lhs));
                Ok(if negate {
                    Expr::Not(Box::new(test))
                } else {
                    test
                })
            }
            _ => Ok(lhs),
        }
    }

    fn filtered(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        while self.peek() == Some(&Tok::Pipe) {
            self.pos += 1;
            let name = match self.bump() {
                Some(Tok::Ident(name)) => name,
                other => return Err(format!("expected filter name, found {other:?}")),
            };
            if !FILTERS.contains(&name.as_str()) {
                return Err(format!("unknown filter '{name}'"));
            }
            let mut args = Vec::new();
            if self.peek() == Some(&Tok::LParen) {
                self.pos += 1;
                if self.peek() != Some(&Tok::RParen) {
                    loop {
                        args.push(self.or()?);
                        if self.peek() == Some(&Tok::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Tok::RParen)?;
            }
            expr = Expr::Filter {
                expr: Box::new(expr),
                name,
                args,
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.bump() {
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Tok::Num(n)) => Ok(Expr::Literal(n)),
            Some(Tok::LParen) => {
                let inner = self.or()?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            Some(Tok::Ident(word)) => match word.as_str() {
                "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
                "none" | "None" | "null" => Ok(Expr::Literal(Value::Null)),
                _ => self.path(word),
            },
            other => Err(format!("expected a value, found {other:?}")),
        }
    }

    fn path(&mut self, first: String) -> Result<Expr, String> {
        let mut segments = vec![Segment::Key(first)];
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.pos += 1;
                    match self.bump() {
                        Some(Tok::Ident(key)) => segments.push(Segment::Key(key)),
                        Some(Tok::Num(Value::Number(n))) => {
                            segments.push(Segment::Index(n.as_u64().unwrap_or(0) as usize))
                        }
                        other => return Err(format!("expected attribute, found {other:?}")),
                    }
                }
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    match self.bump() {
                        Some(Tok::Str(key)) => segments.push(Segment::Key(key)),
                        Some(Tok::Num(Value::Number(n))) => {
                            segments.push(Segment::Index(n.as_u64().unwrap_or(0) as usize))
                        }
                        other => return Err(format!("expected subscript, found {other:?}")),
                    }
                    self.expect(Tok::RBracket)?;
                }
                _ => break,
            }
        }
        Ok(Expr::Path(segments))
    }
}
