//! Pure evaluator over the compiled template AST.

use serde_json::Value;

use super::parser::{Condition, Node, Path};
use crate::error::TemplateError;

/// Variable scope: the caller's root object plus loop bindings.
pub(crate) struct Scope<'a, 'v> {
    root: &'v Value,
    locals: Vec<(&'a str, &'v Value)>,
}

impl<'a, 'v> Scope<'a, 'v> {
    pub fn new(root: &'v Value) -> Self {
        Self {
            root,
            locals: Vec::new(),
        }
    }

    fn lookup(&self, path: &Path) -> Option<&'v Value> {
        let root = path.root();
        let mut current = match self.locals.iter().rev().find(|(name, _)| *name == root) {
            Some((_, value)) => *value,
            None => self.root.get(root)?,
        };
        for segment in &path.segments[1..] {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn is_true(&self, condition: &Condition) -> bool {
        let truthy = self.lookup(&condition.path).is_some_and(truthy);
        truthy != condition.negated
    }
}

/// Falsy: absent, null, false, 0, "", [] and {}.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
    }
}

pub(crate) fn render_nodes<'a, 'v>(
    nodes: &'a [Node],
    scope: &mut Scope<'a, 'v>,
    out: &mut String,
) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var { path, fallback } => match (scope.lookup(path), fallback) {
                (Some(value), _) => write_value(value, out),
                (None, Some(fallback)) => out.push_str(fallback),
                (None, None) => {
                    return Err(TemplateError::MissingVariable { name: path.dotted() });
                }
            },
            Node::If {
                branches,
                otherwise,
            } => {
                let chosen = branches
                    .iter()
                    .find(|(condition, _)| scope.is_true(condition))
                    .map(|(_, body)| body.as_slice())
                    .or(otherwise.as_deref());
                if let Some(body) = chosen {
                    render_nodes(body, scope, out)?;
                }
            }
            Node::For {
                binding,
                iterable,
                body,
            } => {
                let items = match scope.lookup(iterable) {
                    None | Some(Value::Null) => continue,
                    Some(Value::Array(items)) => items,
                    Some(_) => {
                        return Err(TemplateError::NotIterable {
                            name: iterable.dotted(),
                        })
                    }
                };
                for item in items {
                    scope.locals.push((binding.as_str(), item));
                    let result = render_nodes(body, scope, out);
                    scope.locals.pop();
                    result?;
                }
            }
        }
    }
    Ok(())
}
