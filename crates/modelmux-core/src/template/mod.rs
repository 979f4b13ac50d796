//! Prompt templates: compile once, render many times.
//!
//! ```text
//! You are {persona|a helpful assistant}.
//! {%if history%}Recent conversation:
//! {%for turn in history%}- {turn.role}: {turn.content}
//! {%endfor%}{%endif%}
//! ```
//!
//! Compilation either yields a complete template or a [`TemplateError::Syntax`]
//! with a line and column. Rendering is a pure walk of the compiled tree.

mod parser;
mod render;

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::debug;

use crate::error::TemplateError;
use parser::Node;
use render::{render_nodes, Scope};

/// A compiled prompt template.
#[derive(Clone, Debug)]
pub struct PromptTemplate {
    source: String,
    nodes: Vec<Node>,
}

impl PromptTemplate {
    /// Compile template source.
    pub fn compile(source: impl Into<String>) -> Result<Self, TemplateError> {
        let source = source.into();
        let nodes = parser::parse(&source)?;
        Ok(Self { source, nodes })
    }

    /// The original template text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render with `vars`, which should be a JSON object.
    pub fn render(&self, vars: &Value) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        render_nodes(&self.nodes, &mut Scope::new(vars), &mut out)?;
        Ok(out)
    }

    /// Top-level variable names the template reads (loop bindings excluded).
    pub fn variables(&self) -> BTreeSet<String> {
        fn note(root: &str, bound: &[String], found: &mut BTreeSet<String>) {
            if !bound.iter().any(|b| b == root) {
                found.insert(root.to_string());
            }
        }

        fn walk(nodes: &[Node], bound: &mut Vec<String>, found: &mut BTreeSet<String>) {
            for node in nodes {
                match node {
                    Node::Text(_) => {}
                    Node::Var { path, .. } => note(path.root(), bound, found),
                    Node::If {
                        branches,
                        otherwise,
                    } => {
                        for (condition, body) in branches {
                            note(condition.path.root(), bound, found);
                            walk(body, bound, found);
                        }
                        if let Some(body) = otherwise {
                            walk(body, bound, found);
                        }
                    }
                    Node::For {
                        binding,
                        iterable,
                        body,
                    } => {
                        note(iterable.root(), bound, found);
                        bound.push(binding.clone());
                        walk(body, bound, found);
                        bound.pop();
                    }
                }
            }
        }

        let mut found = BTreeSet::new();
        walk(&self.nodes, &mut Vec::new(), &mut found);
        found
    }
}

impl std::str::FromStr for PromptTemplate {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::compile(s)
    }
}

/// Named collection of compiled templates.
#[derive(Clone, Debug, Default)]
pub struct PromptLibrary {
    templates: BTreeMap<String, PromptTemplate>,
}

impl PromptLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `source` and store it under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, source: &str) -> Result<(), TemplateError> {
        let name = name.into();
        let template = PromptTemplate::compile(source)?;
        debug!(template = %name, variables = template.variables().len(), "registered prompt template");
        self.templates.insert(name, template);
        Ok(())
    }

    /// Store an already compiled template.
    pub fn insert(&mut self, name: impl Into<String>, template: PromptTemplate) {
        self.templates.insert(name.into(), template);
    }

    pub fn get(&self, name: &str) -> Option<&PromptTemplate> {
        self.templates.get(name)
    }

    /// Render the template stored under `name`.
    pub fn render(&self, name: &str, vars: &Value) -> Result<String, TemplateError> {
        self.templates
            .get(name)
            .ok_or_else(|| TemplateError::UnknownTemplate {
                name: name.to_string(),
            })?
            .render(vars)
    }

    /// Template names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(source: &str, vars: Value) -> String {
        PromptTemplate::compile(source).unwrap().render(&vars).unwrap()
    }

    #[test]
    fn test_substitution() {
        assert_eq!(
            render("Hello {name}, you are {age}.", json!({"name": "Ada", "age": 36})),
            "Hello Ada, you are 36."
        );
    }

    #[test]
    fn test_missing_variable_fails() {
        let template = PromptTemplate::compile("Hello {name}").unwrap();
        assert_eq!(
            template.render(&json!({})).unwrap_err(),
            TemplateError::MissingVariable { name: "name".into() }
        );
    }

    #[test]
    fn test_fallback_used_only_when_absent() {
        let template = PromptTemplate::compile("{persona|assistant}").unwrap();
        assert_eq!(template.render(&json!({})).unwrap(), "assistant");
        assert_eq!(template.render(&json!({"persona": "pirate"})).unwrap(), "pirate");
    }

    #[test]
    fn test_dotted_lookup() {
        assert_eq!(
            render("{user.name} / {tags.1}", json!({"user": {"name": "kim"}, "tags": ["a", "b"]})),
            "kim / b"
        );
    }

    #[test]
    fn test_falsy_condition_skips_block_without_error() {
        let source = "start{%if flag%}[{missing}]{%endif%}end";
        assert_eq!(render(source, json!({})), "startend");
        assert_eq!(render(source, json!({"flag": false})), "startend");
        assert_eq!(render(source, json!({"flag": ""})), "startend");
    }

    #[test]
    fn test_nested_conditions_three_levels() {
        let source = "{%if a%}A{%if b%}B{%if c%}C{%endif%}b{%endif%}a{%endif%}.";
        let cases = [
            (json!({}), "."),
            (json!({"a": true}), "Aa."),
            (json!({"a": true, "b": 1}), "ABba."),
            (json!({"a": true, "b": 1, "c": "yes"}), "ABCba."),
            (json!({"b": true, "c": true}), "."),
            (json!({"a": true, "c": true}), "Aa."),
        ];
        for (vars, expected) in cases {
            assert_eq!(render(source, vars.clone()), expected, "vars: {vars}");
        }
    }

    #[test]
    fn test_elif_else_chain() {
        let source = "{%if premium%}gold{%elif not trial%}silver{%else%}bronze{%endif%}";
        assert_eq!(render(source, json!({"premium": true})), "gold");
        assert_eq!(render(source, json!({})), "silver");
        assert_eq!(render(source, json!({"trial": true})), "bronze");
    }

    #[test]
    fn test_for_loop_with_nested_condition() {
        let source = "{%for m in memories%}{%if m.important%}!{%endif%}{m.text};{%endfor%}";
        let vars = json!({"memories": [
            {"text": "likes tea", "important": true},
            {"text": "from Oslo"}
        ]});
        assert_eq!(render(source, vars), "!likes tea;from Oslo;");
    }

    #[test]
    fn test_absent_loop_collection_renders_nothing() {
        assert_eq!(render("[{%for x in xs%}{x}{%endfor%}]", json!({})), "[]");
    }

    #[test]
    fn test_non_array_loop_is_error() {
        let template = PromptTemplate::compile("{%for x in xs%}{x}{%endfor%}").unwrap();
        assert_eq!(
            template.render(&json!({"xs": "abc"})).unwrap_err(),
            TemplateError::NotIterable { name: "xs".into() }
        );
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let template = PromptTemplate::compile(
            "{%if user%}{user.name}{%endif%}:{%for t in tags%}{t},{%endfor%}{n|0}",
        )
        .unwrap();
        let vars = json!({"user": {"name": "x"}, "tags": ["a", "b", "c"]});
        let first = template.render(&vars).unwrap();
        for _ in 0..20 {
            assert_eq!(template.render(&vars).unwrap(), first);
        }
    }

    #[test]
    fn test_non_string_values_render_as_json() {
        assert_eq!(
            render("{flag} {n} {list} {none}|", json!({"flag": true, "n": 1.5, "list": [1, 2], "none": null})),
            "true 1.5 [1,2] |"
        );
    }

    #[test]
    fn test_escaped_braces_render_literally() {
        assert_eq!(
            render("Reply as {{\"answer\": \"{answer}\"}}", json!({"answer": "42"})),
            "Reply as {\"answer\": \"42\"}"
        );
    }

    #[test]
    fn test_variables_excludes_loop_bindings() {
        let template = PromptTemplate::compile(
            "{greeting} {%if vip%}{%for item in cart%}{item.name}{discount}{%endfor%}{%endif%}",
        )
        .unwrap();
        let names: Vec<String> = template.variables().into_iter().collect();
        assert_eq!(names, ["cart", "discount", "greeting", "vip"]);
    }

    #[test]
    fn test_library_register_and_render() {
        let mut library = PromptLibrary::new();
        library.register("greet", "Hi {name}").unwrap();
        library.register("bye", "Bye {name}").unwrap();
        assert_eq!(library.names(), ["bye", "greet"]);
        assert_eq!(library.render("greet", &json!({"name": "Lu"})).unwrap(), "Hi Lu");
        assert_eq!(
            library.render("nope", &json!({})).unwrap_err(),
            TemplateError::UnknownTemplate { name: "nope".into() }
        );
    }

    #[test]
    fn test_library_rejects_bad_template() {
        let mut library = PromptLibrary::new();
        assert!(matches!(
            library.register("bad", "{%if x%}open"),
            Err(TemplateError::Syntax { .. })
        ));
        assert!(library.is_empty());
    }
}
