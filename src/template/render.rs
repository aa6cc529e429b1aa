//! Node tree evaluation against a config map.
//!
//! Values are `serde_json::Value`; a missing variable is "undefined", which
//! renders as nothing and is falsy.

use serde_json::{Map, Value};

use super::syntax::{Expr, Node, Segment};
use super::{Template, TemplateError};

const MAX_INCLUDE_DEPTH: usize = 16;

/// Resolves `{% include %}` targets.
pub(crate) trait Loader {
    fn load(&self, name: &str) -> Result<Template, TemplateError>;
}

pub(crate) struct Renderer<'a> {
    name: &'a str,
    globals: &'a Map<String, Value>,
    locals: Vec<(String, Value)>,
    loader: &'a dyn Loader,
    depth: usize,
}

impl<'a> Renderer<'a> {
    pub(crate) fn new(name: &'a str, globals: &'a Map<String, Value>, loader: &'a dyn Loader) -> Self {
        Self {
            name,
            globals,
            locals: Vec::new(),
            loader,
            depth: 0,
        }
    }

    pub(crate) fn render(&mut self, nodes: &[Node], out: &mut String) -> Result<(), TemplateError> {
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Output(expr) => {
                    let value = self.eval(expr)?;
                    out.push_str(&display(value.as_ref()));
                }
                Node::If {
                    branches,
                    otherwise,
                } => {
                    let mut taken = false;
                    for (cond, body) in branches {
                        if truthy(self.eval(cond)?.as_ref()) {
                            self.render(body, out)?;
                            taken = true;
                            break;
                        }
                    }
                    if !taken {
                        self.render(otherwise, out)?;
                    }
                }
                Node::For { var, iter, body } => {
                    let items = match self.eval(iter)? {
                        None | Some(Value::Null) => Vec::new(),
                        Some(Value::Array(items)) => items,
                        Some(Value::Object(map)) => map.keys().cloned().map(Value::String).collect(),
                        Some(other) => {
                            return Err(self.error(format!("cannot iterate over {other}")));
                        }
                    };
                    let len = items.len();
                    for (i, item) in items.into_iter().enumerate() {
                        let mut loop_info = Map::new();
                        loop_info.insert("index".into(), Value::from(i + 1));
                        loop_info.insert("index0".into(), Value::from(i));
                        loop_info.insert("first".into(), Value::Bool(i == 0));
                        loop_info.insert("last".into(), Value::Bool(i + 1 == len));
                        self.locals.push(("loop".into(), Value::Object(loop_info)));
                        self.locals.push((var.clone(), item));
                        let result = self.render(body, out);
                        self.locals.truncate(self.locals.len() - 2);
                        result?;
                    }
                }
                Node::Include(path) => {
                    if self.depth >= MAX_INCLUDE_DEPTH {
                        return Err(self.error(format!("include depth exceeded at '{path}'")));
                    }
                    let included = self.loader.load(path)?;
                    let mut nested = Renderer {
                        name: included.name(),
                        globals: self.globals,
                        locals: self.locals.clone(),
                        loader: self.loader,
                        depth: self.depth + 1,
                    };
                    nested.render(included.nodes(), out)?;
                }
            }
        }
        Ok(())
    }

    fn error(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::Render {
            name: self.name.to_string(),
            message: message.into(),
        }
    }

    fn lookup(&self, segments: &[Segment]) -> Option<Value> {
        let (first, rest) = segments.split_first()?;
        let Segment::Key(root) = first else {
            return None;
        };
        let mut current = self
            .locals
            .iter()
            .rev()
            .find(|(name, _)| name == root)
            .map(|(_, v)| v)
            .or_else(|| self.globals.get(root))?;

        for segment in rest {
            current = match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get(key)?,
                (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
                (Segment::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }

    fn eval(&self, expr: &Expr) -> Result<Option<Value>, TemplateError> {
        Ok(match expr {
            Expr::Literal(value) => Some(value.clone()),
            Expr::Path(segments) => self.lookup(segments),
            Expr::Not(inner) => Some(Value::Bool(!truthy(self.eval(inner)?.as_ref()))),
            Expr::And(lhs, rhs) => {
                let ok = truthy(self.eval(lhs)?.as_ref()) && truthy(self.eval(rhs)?.as_ref());
                Some(Value::Bool(ok))
            }
            Expr::Or(lhs, rhs) => {
                let ok = truthy(self.eval(lhs)?.as_ref()) || truthy(self.eval(rhs)?.as_ref());
                Some(Value::Bool(ok))
            }
            Expr::Eq(lhs, rhs) => Some(Value::Bool(self.eval(lhs)? == self.eval(rhs)?)),
            Expr::Ne(lhs, rhs) => Some(Value::Bool(self.eval(lhs)? != self.eval(rhs)?)),
            Expr::Defined(inner) => Some(Value::Bool(self.eval(inner)?.is_some())),
            Expr::Filter { expr, name, args } => {
                let value = self.eval(expr)?;
                let args = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.apply_filter(name, value, &args)?
            }
        })
    }

    fn apply_filter(
        &self,
        name: &str,
        value: Option<Value>,
        args: &[Option<Value>],
    ) -> Result<Option<Value>, TemplateError> {
        let arg_str = |i: usize| -> Result<String, TemplateError> {
            match args.get(i) {
                Some(v) => Ok(display(v.as_ref())),
                None => Err(self.error(format!("filter '{name}' expects argument {}", i + 1))),
            }
        };

        Ok(match name {
            "default" => match value {
                None | Some(Value::Null) => args.first().cloned().flatten(),
                some => some,
            },
            "lower" => value.map(|v| Value::String(display(Some(&v)).to_lowercase())),
            "upper" => value.map(|v| Value::String(display(Some(&v)).to_uppercase())),
            "trim" => value.map(|v| Value::String(display(Some(&v)).trim().to_string())),
            "replace" => {
                let from = arg_str(0)?;
                let to = arg_str(1)?;
                value.map(|v| Value::String(display(Some(&v)).replace(&from, &to)))
            }
            "split" => value.map(|v| {
                let text = display(Some(&v));
                let parts: Vec<Value> = match args.first() {
                    Some(sep) => {
                        let sep = display(sep.as_ref());
                        text.split(sep.as_str()).map(|s| Value::String(s.into())).collect()
                    }
                    None => text.split_whitespace().map(|s| Value::String(s.into())).collect(),
                };
                Value::Array(parts)
            }),
            "length" => Some(Value::from(match &value {
                Some(Value::Array(items)) => items.len(),
                Some(Value::Object(map)) => map.len(),
                Some(Value::String(s)) => s.chars().count(),
                _ => 0,
            })),
            "tojson" => {
                let v = value.unwrap_or(Value::Null);
                let text = serde_json::to_string(&v)
                    .map_err(|e| self.error(format!("tojson: {e}")))?;
                Some(Value::String(text))
            }
            other => return Err(self.error(format!("unknown filter '{other}'"))),
        })
    }
}

pub(crate) fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

pub(crate) fn display(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}
