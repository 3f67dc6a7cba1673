//! Type descriptors: an immutable description of a declared parameter or return type.
//!
//! A [`TypeDescriptor`] is built once, when a task is defined, either from a Rust type via
//! [`Describe`] or from a type expression such as `List[Mapping[string, integer]]`. It is never
//! re-derived at call time.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::core::schema::TypeSchemaResolver;

/// Leaf types, each rendered as a single canonical token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    String,
    Integer,
    Number,
    Boolean,
    Null,
}

impl Primitive {
    /// The canonical schema token for this primitive.
    pub fn token(&self) -> &'static str {
        match self {
            Primitive::String => "string",
            Primitive::Integer => "integer",
            Primitive::Number => "number",
            Primitive::Boolean => "boolean",
            Primitive::Null => "null",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "string" | "str" | "String" => Some(Primitive::String),
            "integer" | "int" => Some(Primitive::Integer),
            "number" | "float" => Some(Primitive::Number),
            "boolean" | "bool" => Some(Primitive::Boolean),
            "null" | "None" => Some(Primitive::Null),
            _ => None,
        }
    }
}

/// A named field of a record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordField {
    pub name: String,
    pub ty: TypeDescriptor,
    pub doc: Option<String>,
}

/// A declared type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Primitive(Primitive),
    List(Box<TypeDescriptor>),
    Mapping(Box<TypeDescriptor>, Box<TypeDescriptor>),
    Record(Vec<RecordField>),
    Union(Vec<TypeDescriptor>),
    /// A type the resolver has no structure for; rendered as its raw name.
    Unknown(String),
}

impl TypeDescriptor {
    pub fn string() -> Self {
        TypeDescriptor::Primitive(Primitive::String)
    }

    pub fn integer() -> Self {
        TypeDescriptor::Primitive(Primitive::Integer)
    }

    pub fn number() -> Self {
        TypeDescriptor::Primitive(Primitive::Number)
    }

    pub fn boolean() -> Self {
        TypeDescriptor::Primitive(Primitive::Boolean)
    }

    pub fn null() -> Self {
        TypeDescriptor::Primitive(Primitive::Null)
    }

    pub fn list(inner: TypeDescriptor) -> Self {
        TypeDescriptor::List(Box::new(inner))
    }

    pub fn mapping(key: TypeDescriptor, value: TypeDescriptor) -> Self {
        TypeDescriptor::Mapping(Box::new(key), Box::new(value))
    }

    pub fn optional(inner: TypeDescriptor) -> Self {
        TypeDescriptor::Union(vec![inner, TypeDescriptor::null()])
    }

    pub fn any() -> Self {
        TypeDescriptor::Unknown("Any".to_string())
    }

    /// Start building a record type.
    pub fn record() -> RecordBuilder {
        RecordBuilder::default()
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, TypeDescriptor::Primitive(_))
    }

    pub fn is_text(&self) -> bool {
        matches!(self, TypeDescriptor::Primitive(Primitive::String))
    }

    /// True when `null` is an accepted value.
    pub fn is_nullable(&self) -> bool {
        match self {
            TypeDescriptor::Primitive(Primitive::Null) => true,
            TypeDescriptor::Union(variants) => variants.iter().any(|v| v.is_nullable()),
            TypeDescriptor::Unknown(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&TypeSchemaResolver::render_plain(self))
    }
}

/// Builder for [`TypeDescriptor::Record`].
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    fields: Vec<RecordField>,
}

impl RecordBuilder {
    pub fn field(mut self, name: impl Into<String>, ty: TypeDescriptor) -> Self {
        self.fields.push(RecordField {
            name: name.into(),
            ty,
            doc: None,
        });
        self
    }

    pub fn documented_field(
        mut self,
        name: impl Into<String>,
        ty: TypeDescriptor,
        doc: impl Into<String>,
    ) -> Self {
        self.fields.push(RecordField {
            name: name.into(),
            ty,
            doc: Some(doc.into()),
        });
        self
    }

    pub fn build(self) -> TypeDescriptor {
        TypeDescriptor::Record(self.fields)
    }
}

// ============================================================================
// Type expressions
// ============================================================================

impl FromStr for TypeDescriptor {
    type Err = String;

    /// Parses type expressions: `string`, `List[T]`, `Mapping[K, V]`, `Union[A, B]`,
    /// `Optional[T]`. Unrecognised names become [`TypeDescriptor::Unknown`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty type expression".to_string());
        }

        let Some(open) = s.find('[') else {
            return Ok(match Primitive::from_name(s) {
                Some(p) => TypeDescriptor::Primitive(p),
                None => TypeDescriptor::Unknown(s.to_string()),
            });
        };

        if !s.ends_with(']') {
            return Err(format!("Unbalanced brackets in type expression '{}'", s));
        }
        let head = s[..open].trim();
        let args = split_top_level(&s[open + 1..s.len() - 1])?
            .into_iter()
            .map(|arg| arg.parse::<TypeDescriptor>())
            .collect::<Result<Vec<_>, _>>()?;

        match (head, args.as_slice()) {
            ("List" | "list" | "Vec", [inner]) => Ok(TypeDescriptor::list(inner.clone())),
            ("Mapping" | "Dict" | "dict" | "Map", [k, v]) => {
                Ok(TypeDescriptor::mapping(k.clone(), v.clone()))
            }
            ("Optional" | "Option", [inner]) => Ok(TypeDescriptor::optional(inner.clone())),
            ("Union", variants) if !variants.is_empty() => Ok(TypeDescriptor::Union(variants.to_vec())),
            _ => Ok(TypeDescriptor::Unknown(s.to_string())),
        }
    }
}

/// Split on commas that are not nested inside brackets.
pub(crate) fn split_top_level(s: &str) -> Result<Vec<&str>, String> {
    let mut parts = Vec::new();
    let mut depth: i32 = 0;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth < 0 {
                    return Err(format!("Unbalanced brackets in '{}'", s));
                }
            }
            ',' if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(format!("Unbalanced brackets in '{}'", s));
    }
    let last = s[start..].trim();
    if !last.is_empty() || !parts.is_empty() {
        parts.push(last);
    }
    Ok(parts)
}

// ============================================================================
// Describe
// ============================================================================

/// Rust types that know their own [`TypeDescriptor`].
///
/// Record types implement this by hand with [`TypeDescriptor::record`]. A self-referential
/// record must stop the recursion with [`TypeDescriptor::Unknown`]; descriptors are trees and
/// cannot express cycles.
pub trait Describe {
    fn describe() -> TypeDescriptor;
}

macro_rules! describe_primitive {
    ($kind:expr => $($t:ty),+) => {
        $(impl Describe for $t {
            fn describe() -> TypeDescriptor {
                TypeDescriptor::Primitive($kind)
            }
        })+
    };
}

describe_primitive!(Primitive::String => String, str, char);
describe_primitive!(Primitive::Integer => i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);
describe_primitive!(Primitive::Number => f32, f64);
describe_primitive!(Primitive::Boolean => bool);
describe_primitive!(Primitive::Null => ());

impl<T: Describe + ?Sized> Describe for &T {
    fn describe() -> TypeDescriptor {
        T::describe()
    }
}

impl<T: Describe> Describe for Vec<T> {
    fn describe() -> TypeDescriptor {
        TypeDescriptor::list(T::describe())
    }
}

impl<T: Describe> Describe for [T] {
    fn describe() -> TypeDescriptor {
        TypeDescriptor::list(T::describe())
    }
}

impl<T: Describe> Describe for Option<T> {
    fn describe() -> TypeDescriptor {
        TypeDescriptor::optional(T::describe())
    }
}

impl<K: Describe, V: Describe, S> Describe for HashMap<K, V, S> {
    fn describe() -> TypeDescriptor {
        TypeDescriptor::mapping(K::describe(), V::describe())
    }
}

impl<K: Describe, V: Describe> Describe for BTreeMap<K, V> {
    fn describe() -> TypeDescriptor {
        TypeDescriptor::mapping(K::describe(), V::describe())
    }
}

impl Describe for serde_json::Value {
    fn describe() -> TypeDescriptor {
        TypeDescriptor::any()
    }
}
