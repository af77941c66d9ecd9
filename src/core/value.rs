//! Dynamically typed D-Bus values and variants.

use crate::core::signature::{SignatureTree, SignatureType};
use crate::error::{DbusError, Result};
use std::fmt;

/// A value of any D-Bus type.
///
/// `ay` may be carried either as [`Value::Bytes`] (what the decoder produces)
/// or as an [`Value::Array`] of [`Value::Byte`]. Dicts keep insertion order.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Variant(Box<Variant>),
    /// Index into the message's unix fd list
    UnixFd(u32),
    Array(Vec<Value>),
    Bytes(Vec<u8>),
    Dict(Vec<(Value, Value)>),
    Struct(Vec<Value>),
}

impl Value {
    /// Short description used in mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Byte(_) => "byte",
            Value::Bool(_) => "boolean",
            Value::Int16(_) => "int16",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::ObjectPath(_) => "object path",
            Value::Signature(_) => "signature",
            Value::Variant(_) => "variant",
            Value::UnixFd(_) => "unix fd",
            Value::Array(_) => "array",
            Value::Bytes(_) => "byte array",
            Value::Dict(_) => "dict",
            Value::Struct(_) => "struct",
        }
    }

    pub(crate) fn is_integer(&self) -> bool {
        self.as_i128().is_some()
    }

    pub(crate) fn as_i128(&self) -> Option<i128> {
        Some(match *self {
            Value::Byte(v) => v.into(),
            Value::Int16(v) => v.into(),
            Value::UInt16(v) => v.into(),
            Value::Int32(v) => v.into(),
            Value::UInt32(v) => v.into(),
            Value::Int64(v) => v.into(),
            Value::UInt64(v) => v.into(),
            _ => return None,
        })
    }

    /// Infer a type for this value. Empty arrays and dicts cannot be inferred.
    pub fn infer_type(&self) -> Option<SignatureType> {
        Some(match self {
            Value::Byte(_) => SignatureType::Byte,
            Value::Bool(_) => SignatureType::Boolean,
            Value::Int16(_) => SignatureType::Int16,
            Value::UInt16(_) => SignatureType::UInt16,
            Value::Int32(_) => SignatureType::Int32,
            Value::UInt32(_) => SignatureType::UInt32,
            Value::Int64(_) => SignatureType::Int64,
            Value::UInt64(_) => SignatureType::UInt64,
            Value::Double(_) => SignatureType::Double,
            Value::Str(_) => SignatureType::String,
            Value::ObjectPath(_) => SignatureType::ObjectPath,
            Value::Signature(_) => SignatureType::Signature,
            Value::Variant(_) => SignatureType::Variant,
            Value::UnixFd(_) => SignatureType::UnixFd,
            Value::Bytes(_) => SignatureType::Array(Box::new(SignatureType::Byte)),
            Value::Array(items) => SignatureType::Array(Box::new(items.first()?.infer_type()?)),
            Value::Dict(entries) => {
                let (key, value) = entries.first()?;
                SignatureType::Array(Box::new(SignatureType::DictEntry(
                    Box::new(key.infer_type()?),
                    Box::new(value.infer_type()?),
                )))
            }
            Value::Struct(members) => SignatureType::Struct(
                members
                    .iter()
                    .map(Value::infer_type)
                    .collect::<Option<Vec<_>>>()?,
            ),
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Value::UInt32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&Variant> {
        match self {
            Value::Variant(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) | Value::Struct(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Dict(entries) => Some(entries),
            Value::Array(items) if items.is_empty() => Some(&[]),
            _ => None,
        }
    }

    /// Look up a string key in a dict value.
    pub fn dict_get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// Build an `a{sv}` dict from string keys and variants.
    pub fn variant_dict<I, K>(entries: I) -> Value
    where
        I: IntoIterator<Item = (K, Variant)>,
        K: Into<String>,
    {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Str(k.into()), Value::Variant(Box::new(v))))
                .collect(),
        )
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    u8 => Byte,
    bool => Bool,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => Str,
    Vec<u8> => Bytes,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<Variant> for Value {
    fn from(v: Variant) -> Self {
        Value::Variant(Box::new(v))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v:?}"),
            Value::ObjectPath(v) | Value::Signature(v) => write!(f, "{v}"),
            Value::Variant(v) => write!(f, "<{}: {}>", v.signature(), v.value()),
            Value::UnixFd(v) => write!(f, "fd#{v}"),
            Value::Bytes(v) => write!(f, "{v:?}"),
            Value::Array(items) | Value::Struct(items) => {
                let open = if matches!(self, Value::Array(_)) { '[' } else { '(' };
                let close = if open == '[' { ']' } else { ')' };
                write!(f, "{open}")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "{close}")
            }
            Value::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// A self-describing value: one complete type plus a value of that type.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    signature: SignatureType,
    value: Value,
}

impl Variant {
    /// Build a variant, verifying `value` against `signature`.
    pub fn new(signature: &str, value: Value) -> Result<Self> {
        Self::from_type(SignatureType::parse_single(signature)?, value)
    }

    /// Build a variant from a parsed type, verifying the value.
    pub fn from_type(signature: SignatureType, value: Value) -> Result<Self> {
        signature.verify(&value)?;
        Ok(Self { signature, value })
    }

    /// Build a variant whose type is inferred from the value.
    pub fn infer(value: Value) -> Result<Self> {
        let signature = value.infer_type().ok_or_else(|| {
            DbusError::SignatureBodyMismatch(format!(
                "cannot infer the type of an empty {}",
                value.type_name()
            ))
        })?;
        Self::from_type(signature, value)
    }

    /// Trusted construction for values produced by the decoder.
    pub(crate) fn new_unchecked(signature: SignatureType, value: Value) -> Self {
        Self { signature, value }
    }

    pub fn signature(&self) -> String {
        self.signature.signature()
    }

    pub fn signature_type(&self) -> &SignatureType {
        &self.signature
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// True if the variant carries exactly the given signature.
    pub fn has_signature(&self, signature: &SignatureTree) -> bool {
        signature.types().len() == 1 && signature.types()[0] == self.signature
    }
}

macro_rules! variant_from {
    ($($ty:ty => $sig:ident),* $(,)?) => {
        $(
            impl From<$ty> for Variant {
                fn from(v: $ty) -> Self {
                    Variant::new_unchecked(SignatureType::$sig, Value::from(v))
                }
            }
        )*
    };
}

variant_from! {
    u8 => Byte,
    bool => Boolean,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => String,
    &str => String,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn infers_nested_types() {
        let value = Value::Struct(vec![
            Value::from("a"),
            Value::Array(vec![Value::UInt32(1)]),
            Value::variant_dict([("k", Variant::from(1u8))]),
        ]);
        assert_eq!(value.infer_type().unwrap().signature(), "(saua{sv})");
        assert!(Value::Array(vec![]).infer_type().is_none());
    }

    #[test]
    fn dict_lookup_by_string_key() {
        let dict = Value::variant_dict([("count", Variant::from(5u32))]);
        let count = dict.dict_get("count").and_then(Value::as_variant).unwrap();
        assert_eq!(count.value(), &Value::UInt32(5));
        assert!(dict.dict_get("missing").is_none());
    }
}
