use crate::core::types::{RecordField, TypeDescriptor};

const INDENT: &str = "    ";

/// Renders [`TypeDescriptor`]s into the textual schema embedded in prompts.
pub struct TypeSchemaResolver;

impl TypeSchemaResolver {
    /// Schema text ready to be embedded into a placeholder template: every brace is doubled so
    /// a later substitution pass turns it back into a single literal brace.
    pub fn resolve(ty: &TypeDescriptor) -> String {
        escape_braces(&Self::render_plain(ty))
    }

    /// Schema text exactly as the backend should read it.
    pub fn render_plain(ty: &TypeDescriptor) -> String {
        let mut out = String::new();
        render(ty, 0, &mut out);
        out
    }
}

fn render(ty: &TypeDescriptor, depth: usize, out: &mut String) {
    match ty {
        TypeDescriptor::Primitive(p) => out.push_str(p.token()),
        TypeDescriptor::List(inner) => {
            out.push_str("List[");
            render(inner, depth, out);
            out.push(']');
        }
        TypeDescriptor::Mapping(key, value) => {
            out.push_str("Mapping[");
            render(key, depth, out);
            out.push_str(", ");
            render(value, depth, out);
            out.push(']');
        }
        TypeDescriptor::Union(variants) => {
            out.push_str("Union[");
            for (i, variant) in variants.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render(variant, depth, out);
            }
            out.push(']');
        }
        TypeDescriptor::Record(fields) => render_record(fields, depth, out),
        TypeDescriptor::Unknown(name) => out.push_str(name),
    }
}

fn render_record(fields: &[RecordField], depth: usize, out: &mut String) {
    if fields.is_empty() {
        out.push_str("{}");
        return;
    }

    out.push_str("{\n");
    for (i, field) in fields.iter().enumerate() {
        out.push_str(&INDENT.repeat(depth + 1));
        out.push('"');
        out.push_str(&field.name);
        out.push_str("\": ");
        render(&field.ty, depth + 1, out);
        if i + 1 < fields.len() {
            out.push(',');
        }
        if let Some(doc) = field.doc.as_deref().filter(|d| !d.trim().is_empty()) {
            out.push_str("  # ");
            out.push_str(doc.trim());
        }
        out.push('\n');
    }
    out.push_str(&INDENT.repeat(depth));
    out.push('}');
}

/// Double every brace so the text survives placeholder substitution unchanged.
pub fn escape_braces(text: &str) -> String {
    text.replace('{', "{{").replace('}', "}}")
}

/// Inverse of [`escape_braces`].
pub fn unescape_braces(text: &str) -> String {
    text.replace("{{", "{").replace("}}", "}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Primitive;

    fn address() -> TypeDescriptor {
        TypeDescriptor::record()
            .field("city", TypeDescriptor::string())
            .documented_field("zip", TypeDescriptor::integer(), "postal code")
            .build()
    }

    #[test]
    fn test_primitive_tokens() {
        let cases = [
            (Primitive::String, "string"),
            (Primitive::Integer, "integer"),
            (Primitive::Number, "number"),
            (Primitive::Boolean, "boolean"),
            (Primitive::Null, "null"),
        ];
        for (primitive, token) in cases {
            assert_eq!(TypeSchemaResolver::resolve(&TypeDescriptor::Primitive(primitive)), token);
        }
    }

    #[test]
    fn test_containers() {
        let ty = TypeDescriptor::mapping(
            TypeDescriptor::string(),
            TypeDescriptor::list(TypeDescriptor::optional(TypeDescriptor::number())),
        );
        assert_eq!(
            TypeSchemaResolver::resolve(&ty),
            "Mapping[string, List[Union[number, null]]]"
        );
        assert_eq!(
            TypeSchemaResolver::resolve(&TypeDescriptor::Unknown("Decimal".into())),
            "Decimal"
        );
    }

    #[test]
    fn test_nested_record_plain() {
        let person = TypeDescriptor::record()
            .documented_field("name", TypeDescriptor::string(), "full name")
            .field("addresses", TypeDescriptor::list(address()))
            .build();

        let expected = "{\n    \"name\": string,  # full name\n    \"addresses\": List[{\n        \"city\": string,\n        \"zip\": integer  # postal code\n    }]\n}";
        assert_eq!(TypeSchemaResolver::render_plain(&person), expected);
    }

    #[test]
    fn test_record_braces_are_escaped() {
        let escaped = TypeSchemaResolver::resolve(&address());
        assert!(escaped.starts_with("{{\n"));
        assert!(escaped.ends_with("}}"));
        assert_eq!(unescape_braces(&escaped), TypeSchemaResolver::render_plain(&address()));
    }

    #[test]
    fn test_empty_record() {
        assert_eq!(TypeSchemaResolver::render_plain(&TypeDescriptor::record().build()), "{}");
    }
}
