//! Call-time rendering of prompt templates.
//!
//! Two syntaxes are supported:
//! - placeholder templates: `{name}` is replaced by the argument value, `{{` and `}}` are
//!   literal braces;
//! - control templates: a small subset of Jinja (`{{ path }}`, `{% for %}`, `{% if %}`,
//!   `{# comment #}`), used when an instruction already contains control syntax.

use serde_json::{Map, Value};

use crate::core::error::TaskError;

/// Named argument values for one invocation.
pub type Args = Map<String, Value>;

/// Text used for an argument value inside a rendered prompt.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Placeholder templates
// ============================================================================

/// Substitute `{name}` placeholders. `{{`/`}}` collapse to literal braces; a brace that does
/// not open a well-formed placeholder is kept as-is.
pub fn render_placeholders(template: &str, args: &Args) -> Result<String, TaskError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
        } else {
            match placeholder_name(&tail[1..]) {
                Some(name) => {
                    let value = args
                        .get(name)
                        .ok_or_else(|| TaskError::MissingArgument(name.to_string()))?;
                    out.push_str(&value_text(value));
                    rest = &tail[name.len() + 2..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// `ident}` at the start of `s`; returns `ident`.
fn placeholder_name(s: &str) -> Option<&str> {
    let end = s.find('}')?;
    let name = &s[..end];
    is_identifier(name).then_some(name)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

// ============================================================================
// Control templates
// ============================================================================

/// True when `text` uses control-template syntax that parses.
pub fn has_control_syntax(text: &str) -> bool {
    let marked = text.contains("{%") || text.contains("{#") || has_expression(text);
    marked && Template::parse(text).is_ok()
}

/// `{{ path }}`, padded or not. Escaped JSON like `{{ "a": 1 }}` holds no bare path.
fn has_expression(text: &str) -> bool {
    let mut rest = text;
    while let Some(pos) = rest.find("{{") {
        let tail = &rest[pos + 2..];
        if let Some(end) = tail.find("}}") {
            let inner = &tail[..end];
            if parse_path(inner.trim()).is_some() {
                return true;
            }
        }
        rest = tail;
    }
    false
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Text(String),
    Expr(String),
    Tag(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Condition {
    negated: bool,
    path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Expr(Vec<String>),
    For {
        var: String,
        iterable: Vec<String>,
        body: Vec<Node>,
    },
    If {
        branches: Vec<(Condition, Vec<Node>)>,
        otherwise: Vec<Node>,
    },
}

/// A parsed control template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TaskError> {
        let tokens = tokenize(source)?;
        let mut pos = 0;
        let (nodes, end) = parse_nodes(&tokens, &mut pos, &[])?;
        if let Some(tag) = end {
            return Err(TaskError::Template(format!("Unexpected '{{% {} %}}'", tag)));
        }
        Ok(Self { nodes })
    }

    pub fn render(&self, args: &Args) -> Result<String, TaskError> {
        let mut scopes: Vec<Args> = vec![args.clone()];
        let mut out = String::new();
        render_nodes(&self.nodes, &mut scopes, &mut out)?;
        Ok(out)
    }
}

/// Parse and render a control template in one go.
pub fn render_control(source: &str, args: &Args) -> Result<String, TaskError> {
    Template::parse(source)?.render(args)
}

fn tokenize(source: &str) -> Result<Vec<Token>, TaskError> {
    let mut tokens = Vec::new();
    let mut rest = source;

    loop {
        let next = ["{{", "{%", "{#"]
            .iter()
            .filter_map(|open| rest.find(open).map(|pos| (pos, *open)))
            .min_by_key(|(pos, _)| *pos);

        let Some((pos, open)) = next else {
            if !rest.is_empty() {
                tokens.push(Token::Text(rest.to_string()));
            }
            return Ok(tokens);
        };

        if pos > 0 {
            tokens.push(Token::Text(rest[..pos].to_string()));
        }
        let close = match open {
            "{{" => "}}",
            "{%" => "%}",
            _ => "#}",
        };
        let body_start = pos + 2;
        let body_len = rest[body_start..]
            .find(close)
            .ok_or_else(|| TaskError::Template(format!("Unclosed '{}'", open)))?;
        let body = rest[body_start..body_start + body_len]
            .trim_matches('-')
            .trim()
            .to_string();

        match open {
            "{{" => tokens.push(Token::Expr(body)),
            "{%" => tokens.push(Token::Tag(body)),
            _ => {}
        }
        rest = &rest[body_start + body_len + 2..];
    }
}

/// Parse nodes until one of `terminators` (a tag keyword) is reached. Returns the nodes and the
/// full terminating tag, if any.
fn parse_nodes(
    tokens: &[Token],
    pos: &mut usize,
    terminators: &[&str],
) -> Result<(Vec<Node>, Option<String>), TaskError> {
    let mut nodes = Vec::new();

    while let Some(token) = tokens.get(*pos) {
        *pos += 1;
        match token {
            Token::Text(text) => nodes.push(Node::Text(text.clone())),
            Token::Expr(expr) => {
                let path = parse_path(expr)
                    .ok_or_else(|| TaskError::Template(format!("Invalid expression '{}'", expr)))?;
                nodes.push(Node::Expr(path));
            }
            Token::Tag(tag) => {
                let keyword = tag.split_whitespace().next().unwrap_or_default();
                if terminators.contains(&keyword) {
                    return Ok((nodes, Some(tag.clone())));
                }
                match keyword {
                    "for" => nodes.push(parse_for(tag, tokens, pos)?),
                    "if" => nodes.push(parse_if(tag, tokens, pos)?),
                    _ => {
                        return Err(TaskError::Template(format!("Unexpected '{{% {} %}}'", tag)));
                    }
                }
            }
        }
    }

    if terminators.is_empty() {
        Ok((nodes, None))
    } else {
        Err(TaskError::Template(format!(
            "Missing '{{% {} %}}'",
            terminators.last().copied().unwrap_or_default()
        )))
    }
}

fn parse_for(tag: &str, tokens: &[Token], pos: &mut usize) -> Result<Node, TaskError> {
    let words: Vec<&str> = tag.split_whitespace().collect();
    let (var, iterable) = match words.as_slice() {
        ["for", var, "in", iterable] if is_identifier(var) => (var.to_string(), *iterable),
        _ => return Err(TaskError::Template(format!("Invalid loop '{{% {} %}}'", tag))),
    };
    let iterable = parse_path(iterable)
        .ok_or_else(|| TaskError::Template(format!("Invalid loop target '{}'", iterable)))?;
    let (body, _) = parse_nodes(tokens, pos, &["endfor"])?;
    Ok(Node::For {
        var,
        iterable,
        body,
    })
}

fn parse_if(tag: &str, tokens: &[Token], pos: &mut usize) -> Result<Node, TaskError> {
    let mut branches = Vec::new();
    let mut otherwise = Vec::new();
    let mut condition = parse_condition(&tag[2..])?;

    loop {
        let (body, end) = parse_nodes(tokens, pos, &["elif", "else", "endif"])?;
        branches.push((condition, body));
        let end = end.unwrap_or_default();
        match end.split_whitespace().next() {
            Some("elif") => condition = parse_condition(&end[4..])?,
            Some("else") => {
                let (body, _) = parse_nodes(tokens, pos, &["endif"])?;
                otherwise = body;
                break;
            }
            _ => break,
        }
    }
    Ok(Node::If {
        branches,
        otherwise,
    })
}

fn parse_condition(source: &str) -> Result<Condition, TaskError> {
    let source = source.trim();
    let (negated, target) = match source.strip_prefix("not ") {
        Some(target) => (true, target.trim()),
        None => (false, source),
    };
    let path = parse_path(target)
        .ok_or_else(|| TaskError::Template(format!("Invalid condition '{}'", source)))?;
    Ok(Condition { negated, path })
}

fn parse_path(expr: &str) -> Option<Vec<String>> {
    let segments: Vec<String> = expr.trim().split('.').map(str::to_string).collect();
    let valid = is_identifier(&segments[0])
        && segments[1..]
            .iter()
            .all(|s| is_identifier(s) || (!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())));
    valid.then_some(segments)
}

fn lookup<'a>(scopes: &'a [Args], path: &[String]) -> Option<&'a Value> {
    let (head, tail) = path.split_first()?;
    let mut current = scopes.iter().rev().find_map(|scope| scope.get(head))?;
    for segment in tail {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

fn render_nodes(nodes: &[Node], scopes: &mut Vec<Args>, out: &mut String) -> Result<(), TaskError> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Expr(path) => {
                let value = lookup(scopes, path)
                    .ok_or_else(|| TaskError::MissingArgument(path.join(".")))?;
                out.push_str(&value_text(value));
            }
            Node::For {
                var,
                iterable,
                body,
            } => {
                let items: Vec<Value> = match lookup(scopes, iterable) {
                    Some(Value::Array(items)) => items.clone(),
                    Some(Value::Object(map)) => map.keys().cloned().map(Value::String).collect(),
                    Some(Value::Null) => Vec::new(),
                    Some(other) => {
                        return Err(TaskError::Template(format!(
                            "Cannot iterate over '{}' ({})",
                            iterable.join("."),
                            other
                        )));
                    }
                    None => return Err(TaskError::MissingArgument(iterable.join("."))),
                };
                let len = items.len();
                for (i, item) in items.into_iter().enumerate() {
                    let mut frame = Args::new();
                    frame.insert(var.clone(), item);
                    frame.insert(
                        "loop".to_string(),
                        serde_json::json!({ "index": i + 1, "index0": i, "first": i == 0, "last": i + 1 == len }),
                    );
                    scopes.push(frame);
                    let rendered = render_nodes(body, scopes, out);
                    scopes.pop();
                    rendered?;
                }
            }
            Node::If {
                branches,
                otherwise,
            } => {
                let chosen = branches
                    .iter()
                    .find(|(cond, _)| truthy(lookup(scopes, &cond.path)) != cond.negated)
                    .map(|(_, body)| body)
                    .unwrap_or(otherwise);
                render_nodes(chosen, scopes, out)?;
            }
        }
    }
    Ok(())
}
