//! Decoder for binary-encoded structured values.
//!
//! A structured value arrives as an opaque byte body. Its layout is described
//! by a [`SchemaDictionary`]: an ordered list of fields per structured type,
//! each field either a primitive of the binary-schema namespace, a nested
//! structured type, or an enumerated type. Decoding walks the fields in
//! declaration order over a single forward-only cursor, so declaration order
//! must equal wire order.

pub mod error;
pub mod reader;

use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Number, Value};

use uns_api::schema::{SchemaDictionary, StructuredType, TypeDefinition, TypeRef};

pub use error::DecodeError;
pub use reader::BinaryReader;

/// Nesting limit for structured types that reference each other.
const MAX_DEPTH: usize = 32;

/// 100-ns ticks between 1601-01-01 and 1970-01-01.
const UNIX_EPOCH_TICKS: i64 = 116_444_736_000_000_000;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Primitives of the binary-schema namespace this decoder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Boolean,
    SByte,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    String,
    DateTime,
}

impl Primitive {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Boolean" => Primitive::Boolean,
            "SByte" => Primitive::SByte,
            "Byte" => Primitive::Byte,
            "Int16" => Primitive::Int16,
            "UInt16" => Primitive::UInt16,
            "Int32" => Primitive::Int32,
            "UInt32" => Primitive::UInt32,
            "Int64" => Primitive::Int64,
            "UInt64" => Primitive::UInt64,
            "Float" => Primitive::Float,
            "Double" => Primitive::Double,
            "String" | "CharArray" => Primitive::String,
            "DateTime" => Primitive::DateTime,
            _ => return None,
        })
    }

    fn read(self, reader: &mut BinaryReader<'_>, field: &str) -> Result<Value, DecodeError> {
        Ok(match self {
            Primitive::Boolean => Value::Bool(reader.read_u8()? != 0),
            Primitive::SByte => Value::from(reader.read_i8()?),
            Primitive::Byte => Value::from(reader.read_u8()?),
            Primitive::Int16 => Value::from(reader.read_i16()?),
            Primitive::UInt16 => Value::from(reader.read_u16()?),
            Primitive::Int32 => Value::from(reader.read_i32()?),
            Primitive::UInt32 => Value::from(reader.read_u32()?),
            Primitive::Int64 => Value::from(reader.read_i64()?),
            Primitive::UInt64 => Value::from(reader.read_u64()?),
            Primitive::Float => float_value(f64::from(reader.read_f32()?)),
            Primitive::Double => float_value(reader.read_f64()?),
            Primitive::String => read_string(reader, field)?,
            Primitive::DateTime => datetime_value(reader.read_i64()?),
        })
    }
}

/// Decode `bytes` as an instance of structured type `root` of `schema`.
///
/// Produces a JSON object keyed by field name; nested structures become
/// nested objects and enumerations their symbolic name (`null` when the
/// integer has no declared symbol).
pub fn decode(schema: &SchemaDictionary, root: &str, bytes: &[u8]) -> Result<Value, DecodeError> {
    let root_type = match schema.find(root) {
        Some(TypeDefinition::Structured(t)) => t,
        Some(TypeDefinition::Enumerated(_)) => return Err(DecodeError::NotStructured(root.to_string())),
        None => {
            return Err(DecodeError::UnknownType {
                name: root.to_string(),
                namespace: schema.target_namespace.clone(),
            });
        }
    };

    let mut reader = BinaryReader::new(bytes);
    let record = decode_structure(schema, &mut reader, root_type, 0)?;
    Ok(Value::Object(record))
}

fn decode_structure(
    schema: &SchemaDictionary,
    reader: &mut BinaryReader<'_>,
    ty: &StructuredType,
    depth: usize,
) -> Result<Map<String, Value>, DecodeError> {
    if depth >= MAX_DEPTH {
        return Err(DecodeError::TooDeep(MAX_DEPTH));
    }

    let mut record = Map::with_capacity(ty.fields.len());
    for field in &ty.fields {
        let value = match &field.type_name {
            TypeRef::Primitive(name) => {
                let primitive = Primitive::from_name(name).ok_or_else(|| DecodeError::UnsupportedPrimitive {
                    field: field.name.clone(),
                    name: name.clone(),
                })?;
                primitive.read(reader, &field.name)?
            }
            TypeRef::Defined(name) => match schema.find(name) {
                Some(TypeDefinition::Structured(nested)) => {
                    Value::Object(decode_structure(schema, reader, nested, depth + 1)?)
                }
                Some(TypeDefinition::Enumerated(enumeration)) => {
                    let raw = reader.read_i32()?;
                    enumeration
                        .symbol(raw)
                        .map(|s| Value::String(s.to_string()))
                        .unwrap_or(Value::Null)
                }
                None => {
                    return Err(DecodeError::UnknownFieldType {
                        field: field.name.clone(),
                        type_name: name.clone(),
                        namespace: schema.target_namespace.clone(),
                    });
                }
            },
        };
        record.insert(field.name.clone(), value);
    }
    Ok(record)
}

fn float_value(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

/// Int32 length prefix, then UTF-8 bytes. A negative length is a null string.
fn read_string(reader: &mut BinaryReader<'_>, field: &str) -> Result<Value, DecodeError> {
    let len = reader.read_i32()?;
    if len < 0 {
        return Ok(Value::Null);
    }
    let bytes = reader.take(len as usize)?;
    String::from_utf8(bytes.to_vec())
        .map(Value::String)
        .map_err(|source| DecodeError::InvalidString {
            field: field.to_string(),
            source,
        })
}

/// Int64 count of 100-ns ticks since 1601-01-01 UTC. Zero is the null date.
fn datetime_value(ticks: i64) -> Value {
    if ticks == 0 {
        return Value::Null;
    }
    let since_unix = ticks.saturating_sub(UNIX_EPOCH_TICKS);
    let secs = since_unix.div_euclid(TICKS_PER_SECOND);
    let nanos = (since_unix.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
        .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
        .unwrap_or(Value::Null)
}
