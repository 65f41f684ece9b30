use std::fmt;
use std::str::FromStr;

use crate::error::UnsError;

/// Prefix marking a primitive type reference (`opc:Int32`).
const PRIMITIVE_PREFIX: &str = "opc:";

/// Optional prefix of a reference into the dictionary itself (`tns:PumpState`).
const TARGET_PREFIX: &str = "tns:";

/// Reference from a field to its type.
///
/// Serialized as a prefixed string: `"opc:Int32"` for a primitive,
/// `"tns:PumpState"` or plain `"PumpState"` for a dictionary type.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TypeRef {
    Primitive(String),
    Defined(String),
}

impl TypeRef {
    pub fn name(&self) -> &str {
        match self {
            TypeRef::Primitive(name) | TypeRef::Defined(name) => name,
        }
    }
}

impl FromStr for TypeRef {
    type Err = UnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (primitive, name) = match s.strip_prefix(PRIMITIVE_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix(TARGET_PREFIX).unwrap_or(s)),
        };
        if name.is_empty() {
            return Err(UnsError::schema(format!("empty type reference '{s}'")));
        }
        Ok(if primitive {
            TypeRef::Primitive(name.to_string())
        } else {
            TypeRef::Defined(name.to_string())
        })
    }
}

impl TryFrom<String> for TypeRef {
    type Error = UnsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TypeRef> for String {
    fn from(value: TypeRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Primitive(name) => write!(f, "{PRIMITIVE_PREFIX}{name}"),
            TypeRef::Defined(name) => write!(f, "{TARGET_PREFIX}{name}"),
        }
    }
}

/// A single field of a structured type. Declaration order is wire order.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub type_name: TypeRef,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StructuredType {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EnumeratedValue {
    pub name: String,
    pub value: i32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EnumeratedType {
    pub name: String,
    #[serde(default)]
    pub values: Vec<EnumeratedValue>,
}

impl EnumeratedType {
    /// Symbolic name for `value`, by linear scan over the declared values.
    pub fn symbol(&self, value: i32) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.value == value)
            .map(|v| v.name.as_str())
    }
}

/// A type declared in a dictionary.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeDefinition {
    Structured(StructuredType),
    Enumerated(EnumeratedType),
}

impl TypeDefinition {
    pub fn name(&self) -> &str {
        match self {
            TypeDefinition::Structured(t) => &t.name,
            TypeDefinition::Enumerated(t) => &t.name,
        }
    }
}

/// Set of structured and enumerated type definitions, loaded once per
/// decode target.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SchemaDictionary {
    #[serde(default)]
    pub target_namespace: String,
    #[serde(default)]
    pub types: Vec<TypeDefinition>,
}

impl SchemaDictionary {
    pub fn find(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.iter().find(|t| t.name() == name)
    }

    pub fn structured(&self, name: &str) -> Option<&StructuredType> {
        match self.find(name) {
            Some(TypeDefinition::Structured(t)) => Some(t),
            _ => None,
        }
    }
}
