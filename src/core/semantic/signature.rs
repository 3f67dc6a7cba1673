use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::core::types::{split_top_level, Describe, TypeDescriptor};

/// A single declared parameter of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub ty: TypeDescriptor,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// The typed contract of a task: ordered parameters and an optional return type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureModel {
    pub params: Vec<Param>,
    pub returns: Option<TypeDescriptor>,
}

impl SignatureModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter with an explicit descriptor.
    pub fn param(mut self, name: impl Into<String>, ty: TypeDescriptor) -> Self {
        self.params.push(Param::new(name, ty));
        self
    }

    /// Add a parameter described by a Rust type.
    pub fn param_of<T: Describe + ?Sized>(self, name: impl Into<String>) -> Self {
        self.param(name, T::describe())
    }

    /// Set the return type.
    pub fn returns(mut self, ty: TypeDescriptor) -> Self {
        self.returns = Some(ty);
        self
    }

    /// Set the return type from a Rust type.
    pub fn returns_of<T: Describe + ?Sized>(self) -> Self {
        self.returns(T::describe())
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    /// Returns a stable, structural hash of the signature.
    /// Parameter order is part of the identity.
    pub fn structural_hash(&self) -> String {
        let mut hasher = DefaultHasher::new();
        for param in &self.params {
            param.name.hash(&mut hasher);
            param.ty.hash(&mut hasher);
        }
        "return_separator".hash(&mut hasher);
        self.returns.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

impl FromStr for SignatureModel {
    type Err = String;

    /// Parses shorthand syntax: "text: string, limit: integer -> List[string]"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split("->").collect();
        if parts.len() != 2 {
            return Err("Signature must contain exactly one '->'".to_string());
        }

        let mut signature = SignatureModel::new();
        for entry in split_top_level(parts[0])?.into_iter().filter(|e| !e.is_empty()) {
            let param = match entry.split_once(':') {
                Some((name, ty)) => Param::new(name.trim(), ty.parse()?),
                None => Param::new(entry, TypeDescriptor::any()),
            };
            if param.name.is_empty() {
                return Err(format!("Parameter without a name in '{}'", entry));
            }
            signature.params.push(param);
        }

        let returns = parts[1].trim();
        if !returns.is_empty() {
            signature.returns = Some(returns.parse()?);
        }
        Ok(signature)
    }
}

/// Macro for rapid signature creation: signature!("text: string -> List[string]")
#[macro_export]
macro_rules! signature {
    ($s:expr) => {
        $s.parse::<$crate::SignatureModel>()
            .expect("Invalid signature shorthand")
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_parsing() {
        let sig: SignatureModel = "context: string, scores: Mapping[string, int] -> List[string]"
            .parse()
            .unwrap();
        assert_eq!(sig.params.len(), 2);
        assert_eq!(sig.params[0].name, "context");
        assert_eq!(sig.params[0].ty, TypeDescriptor::string());
        assert_eq!(
            sig.params[1].ty,
            TypeDescriptor::mapping(TypeDescriptor::string(), TypeDescriptor::integer())
        );
        assert_eq!(sig.returns, Some(TypeDescriptor::list(TypeDescriptor::string())));
    }

    #[test]
    fn test_untyped_params_and_no_return() {
        let sig: SignatureModel = "a, b ->".parse().unwrap();
        assert_eq!(sig.params[1].ty, TypeDescriptor::any());
        assert!(sig.returns.is_none());
        assert!("a, b".parse::<SignatureModel>().is_err());
    }

    #[test]
    fn test_signature_hash() {
        let sig1: SignatureModel = "a: int, b: str -> str".parse().unwrap();
        let sig2 = SignatureModel::new()
            .param_of::<i64>("a")
            .param_of::<String>("b")
            .returns_of::<String>();
        let sig3: SignatureModel = "b: str, a: int -> str".parse().unwrap();

        assert_eq!(sig1.structural_hash(), sig2.structural_hash());
        // Order matters for structural identity
        assert_ne!(sig1.structural_hash(), sig3.structural_hash());
    }

    #[test]
    fn test_signature_macro() {
        let sig = crate::signature!("text: string -> List[string]");
        assert!(sig.has_param("text"));
        assert_eq!(sig.param_names().collect::<Vec<_>>(), vec!["text"]);
    }
}
