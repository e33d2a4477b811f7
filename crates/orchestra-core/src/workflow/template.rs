//! Stage input templates.
//!
//! A stage's `input` is any JSON value whose string leaves may reference
//! earlier results with `${path.to.field}` or `{{ path.to.field }}`. The raw
//! value is parsed once into a [`Template`] tree; resolving walks that tree
//! against a [`PathLookup`] and produces the materialized input.
//!
//! Resolution never fails. A reference whose path does not resolve, an
//! empty or malformed reference, and an unterminated delimiter are all kept
//! verbatim in the output.

use serde_json::Value;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Parsed form of a JSON input template.
#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    /// Non-string scalar, passed through unchanged.
    Value(Value),
    /// String leaf split into literal and reference segments.
    Text(Vec<Segment>),
    Array(Vec<Template>),
    /// Keys are never templated.
    Object(Vec<(String, Template)>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Reference(Reference),
}

/// A `${...}` or `{{...}}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Original text including delimiters, emitted when unresolved.
    pub raw: String,
    /// Dot-separated path segments.
    pub path: Vec<String>,
}

/// Source of values for reference resolution.
pub trait PathLookup {
    fn lookup(&self, path: &[String]) -> Option<&Value>;
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

impl Template {
    /// Parse a raw JSON input into a template tree.
    pub fn parse(value: &Value) -> Self {
        match value {
            Value::String(s) => Template::Text(parse_text(s)),
            Value::Array(items) => Template::Array(items.iter().map(Template::parse).collect()),
            Value::Object(map) => Template::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Template::parse(v)))
                    .collect(),
            ),
            other => Template::Value(other.clone()),
        }
    }

    /// Every reference in the tree, in document order.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Template::Value(_) => {}
            Template::Text(segments) => {
                for seg in segments {
                    if let Segment::Reference(r) = seg {
                        out.push(r);
                    }
                }
            }
            Template::Array(items) => items.iter().for_each(|t| t.collect_references(out)),
            Template::Object(fields) => fields.iter().for_each(|(_, t)| t.collect_references(out)),
        }
    }

    /// Materialize the template against `ctx`.
    pub fn resolve(&self, ctx: &impl PathLookup) -> Value {
        match self {
            Template::Value(v) => v.clone(),
            Template::Text(segments) => Value::String(resolve_text(segments, ctx)),
            Template::Array(items) => Value::Array(items.iter().map(|t| t.resolve(ctx)).collect()),
            Template::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, t)| (k.clone(), t.resolve(ctx)))
                    .collect(),
            ),
        }
    }
}

/// Parse and resolve in one step.
pub fn resolve_input(input: &Value, ctx: &impl PathLookup) -> Value {
    Template::parse(input).resolve(ctx)
}

/// Recursive-descent scan of one string leaf.
///
/// ```text
/// text      := (literal | reference)*
/// reference := "${" path "}" | "{{" ws? path ws? "}}"
/// path      := segment ("." segment)*
/// ```
fn parse_text(src: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = src;

    while !rest.is_empty() {
        let next = match (rest.find("${"), rest.find("{{")) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let Some(start) = next else {
            literal.push_str(rest);
            break;
        };

        literal.push_str(&rest[..start]);
        let close = if rest[start..].starts_with("${") { "}" } else { "}}" };
        let body_start = start + 2;
        let Some(close_at) = rest[body_start..].find(close) else {
            // Unterminated: everything left is literal.
            literal.push_str(&rest[start..]);
            break;
        };
        let body_end = body_start + close_at;
        let end = body_end + close.len();
        let raw = &rest[start..end];

        match parse_path(&rest[body_start..body_end]) {
            Some(path) => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Reference(Reference {
                    raw: raw.to_string(),
                    path,
                }));
            }
            None => literal.push_str(raw),
        }
        rest = &rest[end..];
    }

    if !literal.is_empty() || segments.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

fn parse_path(body: &str) -> Option<Vec<String>> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    let mut path = Vec::new();
    for part in body.split('.') {
        if part.is_empty() || part.chars().any(|c| c.is_whitespace() || c == '{' || c == '}') {
            return None;
        }
        path.push(part.to_string());
    }
    Some(path)
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

fn resolve_text(segments: &[Segment], ctx: &impl PathLookup) -> String {
    let mut out = String::new();
    for seg in segments {
        match seg {
            Segment::Literal(s) => out.push_str(s),
            Segment::Reference(r) => match ctx.lookup(&r.path) {
                Some(value) => out.push_str(&value_to_string(value)),
                None => {
                    tracing::debug!(reference = r.raw.as_str(), "unresolved template reference kept verbatim");
                    out.push_str(&r.raw);
                }
            },
        }
    }
    out
}

/// String form used for substitution: strings raw, everything else as JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Walk `path` into `root`. Numeric segments index arrays.
pub fn traverse<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |current, seg| match current {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Root(Value);

    impl PathLookup for Root {
        fn lookup(&self, path: &[String]) -> Option<&Value> {
            traverse(&self.0, path)
        }
    }

    fn ctx() -> Root {
        Root(json!({
            "workflow": {"input": {"topic": "rust", "limit": 3}},
            "s1": {"output": {"summary": "ok", "tags": ["a", "b"], "meta": {"n": 1}}}
        }))
    }

    #[test]
    fn dollar_reference_substitutes_string() {
        let out = resolve_input(&json!({"text": "${s1.output.summary}"}), &ctx());
        assert_eq!(out, json!({"text": "ok"}));
    }

    #[test]
    fn mustache_reference_with_whitespace() {
        let out = resolve_input(&json!("about {{ workflow.input.topic }}!"), &ctx());
        assert_eq!(out, json!("about rust!"));
    }

    #[test]
    fn non_string_values_render_as_json_text() {
        let out = resolve_input(
            &json!({"n": "${workflow.input.limit}", "m": "${s1.output.meta}", "t": "${s1.output.tags.1}"}),
            &ctx(),
        );
        assert_eq!(out, json!({"n": "3", "m": "{\"n\":1}", "t": "b"}));
    }

    #[test]
    fn unresolved_reference_is_left_verbatim() {
        let out = resolve_input(&json!("x=${s9.output.summary} y={{ s1.output.nope }}"), &ctx());
        assert_eq!(out, json!("x=${s9.output.summary} y={{ s1.output.nope }}"));
    }

    #[test]
    fn unterminated_and_empty_references_are_literal() {
        assert_eq!(resolve_input(&json!("${s1.output.summary"), &ctx()), json!("${s1.output.summary"));
        assert_eq!(resolve_input(&json!("{{ }} and ${}"), &ctx()), json!("{{ }} and ${}"));
        assert_eq!(resolve_input(&json!("${a..b}"), &ctx()), json!("${a..b}"));
    }

    #[test]
    fn structure_and_scalars_pass_through() {
        let input = json!({"list": [1, true, null, "${s1.output.summary}"], "nested": {"k": 2.5}});
        let out = resolve_input(&input, &ctx());
        assert_eq!(out, json!({"list": [1, true, null, "ok"], "nested": {"k": 2.5}}));
    }

    #[test]
    fn parse_exposes_references_in_order() {
        let t = Template::parse(&json!({"a": "${x.output.y} {{ workflow.input.z }}"}));
        let refs: Vec<&str> = t.references().iter().map(|r| r.raw.as_str()).collect();
        assert_eq!(refs, vec!["${x.output.y}", "{{ workflow.input.z }}"]);
        assert_eq!(t.references()[1].path, vec!["workflow", "input", "z"]);
    }

    #[test]
    fn plain_string_is_single_literal() {
        assert_eq!(
            Template::parse(&json!("hello")),
            Template::Text(vec![Segment::Literal("hello".to_string())])
        );
        assert_eq!(
            Template::parse(&json!("")),
            Template::Text(vec![Segment::Literal(String::new())])
        );
    }

    #[test]
    fn traverse_indexes_arrays_and_rejects_scalars() {
        let root = json!({"a": [{"b": 1}]});
        let path = |p: &[&str]| p.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(traverse(&root, &path(&["a", "0", "b"])), Some(&json!(1)));
        assert_eq!(traverse(&root, &path(&["a", "x"])), None);
        assert_eq!(traverse(&root, &path(&["a", "0", "b", "c"])), None);
    }
}
