use serde_json::{Map, Number, Value};

use crate::core::error::{ParseFailure, ParseFailureKind};
use crate::core::prompt::ReturnSchema;
use crate::core::types::{Primitive, RecordField, TypeDescriptor};

/// How many object fragments a response is expected to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultMode {
    /// One answer; the last decodable fragment wins.
    #[default]
    Single,
    /// Several answers (chained steps); all fragments are merged, later keys win.
    Multi,
}

/// Reads a backend's raw text back into the value a [`ReturnSchema`] describes.
#[derive(Debug, Clone, Copy)]
pub struct ResponseParser<'a> {
    schema: &'a ReturnSchema,
    mode: ResultMode,
}

impl<'a> ResponseParser<'a> {
    pub fn new(schema: &'a ReturnSchema) -> Self {
        Self {
            schema,
            mode: ResultMode::Single,
        }
    }

    pub fn mode(mut self, mode: ResultMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn parse(&self, raw: &str) -> Result<Value, ParseFailure> {
        if !self.schema.structured {
            return self.parse_unstructured(raw);
        }

        let object = self.extract(raw)?;
        let target = self.schema.target.clone().unwrap_or_else(TypeDescriptor::any);

        match object.get(&self.schema.name) {
            Some(value) => coerce(value, &target)
                .map_err(|detail| self.failure(ParseFailureKind::TypeCoercion, detail, raw)),
            None => {
                log::debug!(
                    "Result key '{}' not found, coercing the whole object",
                    self.schema.name
                );
                coerce(&Value::Object(object), &target).map_err(|detail| {
                    self.failure(
                        ParseFailureKind::KeyMissing,
                        format!("no '{}' key in the answer ({})", self.schema.name, detail),
                        raw,
                    )
                })
            }
        }
    }

    /// The decoded object carried by `raw`: the last fragment in single mode, all fragments
    /// merged in multi mode.
    pub fn extract(&self, raw: &str) -> Result<Map<String, Value>, ParseFailure> {
        let mut fragments = object_fragments(raw);
        if fragments.is_empty() {
            return Err(self.failure(
                ParseFailureKind::JsonExtraction,
                "no JSON object found in the answer",
                raw,
            ));
        }

        match self.mode {
            ResultMode::Single => Ok(fragments.pop().unwrap_or_default()),
            ResultMode::Multi => {
                let mut merged = Map::new();
                for fragment in fragments {
                    for (key, value) in fragment {
                        if merged.insert(key.clone(), value).is_some() {
                            log::warn!("Result key '{}' appears more than once, keeping the last value", key);
                        }
                    }
                }
                Ok(merged)
            }
        }
    }

    fn parse_unstructured(&self, raw: &str) -> Result<Value, ParseFailure> {
        let target = match &self.schema.target {
            Some(target) if !target.is_text() => target,
            _ => return Ok(Value::String(raw.to_string())),
        };

        let text = strip_fences(raw);
        let text = text.trim();
        let decoded = serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|decoded| coerce(&decoded, target).ok());
        if let Some(value) = decoded {
            return Ok(value);
        }
        coerce(&Value::String(text.to_string()), target)
            .map_err(|detail| self.failure(ParseFailureKind::TypeCoercion, detail, raw))
    }

    fn failure(&self, kind: ParseFailureKind, detail: impl Into<String>, raw: &str) -> ParseFailure {
        ParseFailure::new(kind, detail, raw, self.schema.plain_output_schema())
    }
}

// ============================================================================
// Fragment extraction
// ============================================================================

fn strip_fences(raw: &str) -> String {
    raw.replace("```json", "").replace("```", "")
}

/// Every balanced `{...}` span that decodes to a JSON object, in order of appearance.
///
/// A span that fails to decode is skipped one character at a time so objects nested inside it
/// can still be found.
fn object_fragments(raw: &str) -> Vec<Map<String, Value>> {
    let text = strip_fences(raw);
    let bytes = text.as_bytes();
    let mut fragments = Vec::new();
    let mut start = 0;

    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        let Some(close) = balanced_end(bytes, open) else {
            start = open + 1;
            continue;
        };
        match serde_json::from_str::<Value>(&text[open..=close]) {
            Ok(Value::Object(map)) => {
                fragments.push(map);
                start = close + 1;
            }
            _ => {
                log::warn!("Skipping undecodable JSON fragment at offset {}", open);
                start = open + 1;
            }
        }
    }
    fragments
}

/// Index of the `}` closing the `{` at `open`, ignoring braces inside string literals.
fn balanced_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

// ============================================================================
// Coercion
// ============================================================================

/// Coerce a decoded value into `ty`.
///
/// Exact matches are preferred; otherwise common model slips are accepted (numbers as
/// strings, `"true"`/`"false"`, integral floats). Record fields not in the type are dropped,
/// missing fields are accepted only when nullable. Union variants are tried in order.
pub fn coerce(value: &Value, ty: &TypeDescriptor) -> Result<Value, String> {
    coerce_at(value, ty, "$", false).or_else(|_| coerce_at(value, ty, "$", true))
}

fn coerce_at(value: &Value, ty: &TypeDescriptor, path: &str, lax: bool) -> Result<Value, String> {
    match ty {
        TypeDescriptor::Primitive(p) => coerce_primitive(value, *p, lax)
            .ok_or_else(|| format!("at {}: expected {}, got {}", path, p.token(), value)),
        TypeDescriptor::List(inner) => match value {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| coerce_at(item, inner, &format!("{}[{}]", path, i), lax))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Err(format!("at {}: expected a list, got {}", path, other)),
        },
        TypeDescriptor::Mapping(key, inner) => match value {
            Value::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    let item_path = format!("{}.{}", path, k);
                    coerce_at(&Value::String(k.clone()), key, &item_path, true)?;
                    out.insert(k.clone(), coerce_at(v, inner, &item_path, lax)?);
                }
                Ok(Value::Object(out))
            }
            other => Err(format!("at {}: expected a mapping, got {}", path, other)),
        },
        TypeDescriptor::Record(fields) => match value {
            Value::Object(map) => coerce_record(map, fields, path, lax),
            other => Err(format!("at {}: expected an object, got {}", path, other)),
        },
        TypeDescriptor::Union(variants) => {
            let strict = variants.iter().find_map(|v| coerce_at(value, v, path, false).ok());
            match strict {
                Some(found) => Ok(found),
                None if lax => variants
                    .iter()
                    .find_map(|v| coerce_at(value, v, path, true).ok())
                    .ok_or_else(|| format!("at {}: {} matches no variant of {}", path, value, ty)),
                None => Err(format!("at {}: {} matches no variant of {}", path, value, ty)),
            }
        }
        TypeDescriptor::Unknown(_) => Ok(value.clone()),
    }
}

fn coerce_record(
    map: &Map<String, Value>,
    fields: &[RecordField],
    path: &str,
    lax: bool,
) -> Result<Value, String> {
    let mut out = Map::new();
    for field in fields {
        let field_path = format!("{}.{}", path, field.name);
        match map.get(&field.name) {
            Some(v) => {
                out.insert(field.name.clone(), coerce_at(v, &field.ty, &field_path, lax)?);
            }
            None if field.ty.is_nullable() => {
                out.insert(field.name.clone(), Value::Null);
            }
            None => return Err(format!("at {}: missing field", field_path)),
        }
    }
    Ok(Value::Object(out))
}

fn coerce_primitive(value: &Value, primitive: Primitive, lax: bool) -> Option<Value> {
    match (primitive, value) {
        (Primitive::String, Value::String(_)) => Some(value.clone()),
        (Primitive::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Some(value.clone()),
        (Primitive::Number, Value::Number(_)) => Some(value.clone()),
        (Primitive::Boolean, Value::Bool(_)) => Some(value.clone()),
        (Primitive::Null, Value::Null) => Some(Value::Null),
        _ if !lax => None,

        (Primitive::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (Primitive::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
        (Primitive::Integer, Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| Value::from(f as i64)),
        (Primitive::Integer, Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>().ok().map(Value::from).or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| Value::from(f as i64))
            })
        }
        (Primitive::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        (Primitive::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        (Primitive::Boolean, Value::Number(n)) => match n.as_i64() {
            Some(0) => Some(Value::Bool(false)),
            Some(1) => Some(Value::Bool(true)),
            _ => None,
        },
        (Primitive::Null, Value::String(s)) if s.trim().eq_ignore_ascii_case("null") => {
            Some(Value::Null)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_is_verbatim() {
        let schema = ReturnSchema::text();
        let parsed = ResponseParser::new(&schema).parse("hello").unwrap();
        assert_eq!(parsed, json!("hello"));

        let odd = "  {not json}\n```";
        assert_eq!(ResponseParser::new(&schema).parse(odd).unwrap(), json!(odd));
    }

    #[test]
    fn test_structured_list() {
        let schema = ReturnSchema::structured("x", TypeDescriptor::list(TypeDescriptor::string()));
        let parsed = ResponseParser::new(&schema).parse(r#"{"x": ["a","b"]}"#).unwrap();
        assert_eq!(parsed, json!(["a", "b"]));
    }

    #[test]
    fn test_multi_result_merge() {
        let schema = ReturnSchema::structured("merged", TypeDescriptor::any());
        let parser = ResponseParser::new(&schema).mode(ResultMode::Multi);
        assert_eq!(parser.parse("{\"a\":1}\n{\"b\":2}").unwrap(), json!({"a": 1, "b": 2}));

        let merged = parser.extract("{\"a\":1}\n{\"a\":3, \"c\": {\"d\": 4}}").unwrap();
        assert_eq!(Value::Object(merged), json!({"a": 3, "c": {"d": 4}}));
    }

    #[test]
    fn test_single_mode_uses_last_fragment() {
        let schema = ReturnSchema::structured("n", TypeDescriptor::integer());
        let raw = "Thinking: {\"n\": 1}\nFinal answer:\n```json\n{\"n\": 2}\n```";
        assert_eq!(ResponseParser::new(&schema).parse(raw).unwrap(), json!(2));
    }

    #[test]
    fn test_braces_inside_strings() {
        let schema = ReturnSchema::structured("s", TypeDescriptor::string());
        let raw = r#"{"s": "a } tricky { \" string"}"#;
        assert_eq!(
            ResponseParser::new(&schema).parse(raw).unwrap(),
            json!("a } tricky { \" string")
        );
    }

    #[test]
    fn test_missing_key_falls_back_to_whole_object() {
        let person = TypeDescriptor::record()
            .field("name", TypeDescriptor::string())
            .field("age", TypeDescriptor::integer())
            .build();
        let schema = ReturnSchema::structured("person", person);
        let parser = ResponseParser::new(&schema);

        assert_eq!(
            parser.parse(r#"{"name": "Ada", "age": "36"}"#).unwrap(),
            json!({"name": "Ada", "age": 36})
        );

        let failure = parser.parse(r#"{"other": 1}"#).unwrap_err();
        assert_eq!(failure.kind, ParseFailureKind::KeyMissing);
    }

    #[test]
    fn test_failures_carry_context() {
        let schema = ReturnSchema::structured("x", TypeDescriptor::list(TypeDescriptor::integer()));
        let parser = ResponseParser::new(&schema);

        let failure = parser.parse("I don't know").unwrap_err();
        assert_eq!(failure.kind, ParseFailureKind::JsonExtraction);
        assert_eq!(failure.raw_text, "I don't know");

        let failure = parser.parse(r#"{"x": ["one"]}"#).unwrap_err();
        assert_eq!(failure.kind, ParseFailureKind::TypeCoercion);
        assert_eq!(failure.schema, "\"x\": List[integer]");
        assert!(failure.detail.contains("$[0]"));
    }

    #[test]
    fn test_unstructured_typed() {
        let schema = ReturnSchema::unstructured(TypeDescriptor::integer());
        let parser = ResponseParser::new(&schema);
        assert_eq!(parser.parse(" 42\n").unwrap(), json!(42));

        let schema = ReturnSchema::unstructured(TypeDescriptor::boolean());
        assert_eq!(ResponseParser::new(&schema).parse("True").unwrap(), json!(true));

        let schema = ReturnSchema::unstructured(TypeDescriptor::number());
        let failure = ResponseParser::new(&schema).parse("about ten").unwrap_err();
        assert_eq!(failure.kind, ParseFailureKind::TypeCoercion);
    }

    #[test]
    fn test_coerce_rules() {
        let optional_record = TypeDescriptor::record()
            .field("id", TypeDescriptor::integer())
            .field("note", TypeDescriptor::optional(TypeDescriptor::string()))
            .build();
        assert_eq!(
            coerce(&json!({"id": 2.0, "extra": true}), &optional_record).unwrap(),
            json!({"id": 2, "note": null})
        );
        assert!(coerce(&json!({"note": "x"}), &optional_record).is_err());

        let union = TypeDescriptor::Union(vec![TypeDescriptor::string(), TypeDescriptor::integer()]);
        assert_eq!(coerce(&json!(5), &union).unwrap(), json!(5));
        assert_eq!(coerce(&json!("5"), &union).unwrap(), json!("5"));

        let mapping = TypeDescriptor::mapping(TypeDescriptor::string(), TypeDescriptor::number());
        assert_eq!(coerce(&json!({"a": "1.5"}), &mapping).unwrap(), json!({"a": 1.5}));
        assert_eq!(coerce(&json!([1, "x"]), &TypeDescriptor::any()).unwrap(), json!([1, "x"]));
    }
}
