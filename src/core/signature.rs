//! # Type Signatures
//!
//! Parsing and validation of D-Bus type signatures.
//!
//! A signature string such as `a{sv}` or `(ii)s` is parsed by recursive descent
//! into a [`SignatureTree`]: an ordered list of complete [`SignatureType`]s.
//! Trees are immutable and cheap to share, so [`signature_tree`] memoizes them
//! by string; the same handful of signatures recurs on nearly every message.
//!
//! ## Grammar
//! ```text
//! type      := basic | 'v' | 'a' type | 'a' '{' basic type '}' | '(' type+ ')'
//! basic     := 'y' | 'b' | 'n' | 'q' | 'i' | 'u' | 'x' | 't' | 'd' | 's' | 'o' | 'g' | 'h'
//! ```
//!
//! ## Limits
//! - At most 255 characters per signature
//! - At most 32 nested arrays and 32 nested structs

use crate::core::value::Value;
use crate::error::{DbusError, Result};
use crate::protocol::validators::assert_object_path_valid;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::{Arc, OnceLock, RwLock};

/// Maximum length of a signature string
pub const MAX_SIGNATURE_LEN: usize = 255;

const MAX_ARRAY_DEPTH: usize = 32;
const MAX_STRUCT_DEPTH: usize = 32;
const TREE_CACHE_LIMIT: usize = 512;

/// One complete type in a signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SignatureType {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    Variant,
    UnixFd,
    Array(Box<SignatureType>),
    Struct(Vec<SignatureType>),
    DictEntry(Box<SignatureType>, Box<SignatureType>),
}

impl SignatureType {
    /// The single-character token that introduces this type.
    pub fn token(&self) -> char {
        match self {
            SignatureType::Byte => 'y',
            SignatureType::Boolean => 'b',
            SignatureType::Int16 => 'n',
            SignatureType::UInt16 => 'q',
            SignatureType::Int32 => 'i',
            SignatureType::UInt32 => 'u',
            SignatureType::Int64 => 'x',
            SignatureType::UInt64 => 't',
            SignatureType::Double => 'd',
            SignatureType::String => 's',
            SignatureType::ObjectPath => 'o',
            SignatureType::Signature => 'g',
            SignatureType::Variant => 'v',
            SignatureType::UnixFd => 'h',
            SignatureType::Array(_) => 'a',
            SignatureType::Struct(_) => '(',
            SignatureType::DictEntry(..) => '{',
        }
    }

    /// Child types, in order. Empty for basic types and variants.
    pub fn children(&self) -> Vec<&SignatureType> {
        match self {
            SignatureType::Array(elem) => vec![elem.as_ref()],
            SignatureType::Struct(fields) => fields.iter().collect(),
            SignatureType::DictEntry(key, value) => vec![key.as_ref(), value.as_ref()],
            _ => Vec::new(),
        }
    }

    /// Basic types are the ones allowed as dict keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            SignatureType::Array(_)
                | SignatureType::Struct(_)
                | SignatureType::DictEntry(..)
                | SignatureType::Variant
        )
    }

    fn is_integer(&self) -> bool {
        matches!(
            self,
            SignatureType::Byte
                | SignatureType::Int16
                | SignatureType::UInt16
                | SignatureType::Int32
                | SignatureType::UInt32
                | SignatureType::Int64
                | SignatureType::UInt64
        )
    }

    /// Wire alignment in bytes.
    pub fn alignment(&self) -> usize {
        match self {
            SignatureType::Byte | SignatureType::Signature | SignatureType::Variant => 1,
            SignatureType::Int16 | SignatureType::UInt16 => 2,
            SignatureType::Boolean
            | SignatureType::Int32
            | SignatureType::UInt32
            | SignatureType::String
            | SignatureType::ObjectPath
            | SignatureType::Array(_)
            | SignatureType::UnixFd => 4,
            SignatureType::Int64
            | SignatureType::UInt64
            | SignatureType::Double
            | SignatureType::Struct(_)
            | SignatureType::DictEntry(..) => 8,
        }
    }

    /// True if this type or any descendant has the given token.
    pub fn contains(&self, token: char) -> bool {
        self.token() == token || self.children().iter().any(|c| c.contains(token))
    }

    /// Canonical signature string of this single type.
    pub fn signature(&self) -> String {
        let mut out = String::new();
        self.write_signature(&mut out);
        out
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            SignatureType::Array(elem) => {
                out.push('a');
                elem.write_signature(out);
            }
            SignatureType::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_signature(out);
                }
                out.push(')');
            }
            SignatureType::DictEntry(key, value) => {
                out.push('{');
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
            basic => out.push(basic.token()),
        }
    }

    /// Parse a signature that must contain exactly one complete type.
    pub fn parse_single(signature: &str) -> Result<SignatureType> {
        let tree = signature_tree(signature)?;
        match tree.types() {
            [single] => Ok(single.clone()),
            types => Err(DbusError::InvalidSignature(format!(
                "'{signature}' must be a single complete type (has {} types)",
                types.len()
            ))),
        }
    }

    /// Check a value against this type.
    pub fn verify(&self, value: &Value) -> Result<()> {
        let matched = match (self, value) {
            (SignatureType::Byte, Value::Byte(_))
            | (SignatureType::Boolean, Value::Bool(_))
            | (SignatureType::Int16, Value::Int16(_))
            | (SignatureType::UInt16, Value::UInt16(_))
            | (SignatureType::Int32, Value::Int32(_))
            | (SignatureType::UInt32, Value::UInt32(_))
            | (SignatureType::Int64, Value::Int64(_))
            | (SignatureType::UInt64, Value::UInt64(_))
            | (SignatureType::Double, Value::Double(_))
            | (SignatureType::String, Value::Str(_))
            | (SignatureType::UnixFd, Value::UnixFd(_)) => true,
            (SignatureType::ObjectPath, Value::ObjectPath(path)) => {
                assert_object_path_valid(path)?;
                true
            }
            (SignatureType::Signature, Value::Signature(sig)) => {
                signature_tree(sig)?;
                true
            }
            (SignatureType::Variant, Value::Variant(inner)) => {
                inner.signature_type().verify(inner.value())?;
                true
            }
            (SignatureType::Array(elem), Value::Bytes(_)) => **elem == SignatureType::Byte,
            (SignatureType::Array(elem), Value::Array(items)) => {
                if matches!(elem.as_ref(), SignatureType::DictEntry(..)) && !items.is_empty() {
                    false
                } else {
                    for item in items {
                        elem.verify(item)?;
                    }
                    true
                }
            }
            (SignatureType::Array(elem), Value::Dict(entries)) => match elem.as_ref() {
                SignatureType::DictEntry(key_type, value_type) => {
                    for (key, value) in entries {
                        key_type.verify(key)?;
                        value_type.verify(value)?;
                    }
                    true
                }
                _ => false,
            },
            (SignatureType::Struct(fields), Value::Struct(members)) => {
                if fields.len() != members.len() {
                    return Err(DbusError::SignatureBodyMismatch(format!(
                        "struct '{}' expects {} members, got {}",
                        self.signature(),
                        fields.len(),
                        members.len()
                    )));
                }
                for (field, member) in fields.iter().zip(members) {
                    field.verify(member)?;
                }
                true
            }
            _ => false,
        };

        if matched {
            Ok(())
        } else {
            Err(DbusError::SignatureBodyMismatch(format!(
                "expected a value of type '{}', got {}",
                self.signature(),
                value.type_name()
            )))
        }
    }

    /// Convert a loosely typed value to this type, then verify it.
    ///
    /// Integers of any width are narrowed with a range check, strings are
    /// retagged as object paths or signatures where the type asks for one.
    pub fn coerce(&self, value: Value) -> Result<Value> {
        let coerced = match (self, value) {
            (ty, value) if ty.is_integer() && value.is_integer() => {
                let wide = value.as_i128().unwrap_or_default();
                ty.narrow(wide)?
            }
            (SignatureType::Double, value) if value.is_integer() => {
                Value::Double(value.as_i128().unwrap_or_default() as f64)
            }
            (SignatureType::ObjectPath, Value::Str(s)) => Value::ObjectPath(s),
            (SignatureType::Signature, Value::Str(s)) => Value::Signature(s),
            (SignatureType::Array(elem), Value::Array(items)) => {
                if **elem == SignatureType::Byte && items.iter().all(|v| v.is_integer()) {
                    let bytes = items
                        .into_iter()
                        .map(|v| match SignatureType::Byte.narrow(v.as_i128().unwrap_or_default())? {
                            Value::Byte(b) => Ok(b),
                            _ => Err(DbusError::Internal("byte narrowing".into())),
                        })
                        .collect::<Result<Vec<u8>>>()?;
                    Value::Bytes(bytes)
                } else {
                    Value::Array(
                        items
                            .into_iter()
                            .map(|v| elem.coerce(v))
                            .collect::<Result<Vec<_>>>()?,
                    )
                }
            }
            (SignatureType::Array(elem), Value::Dict(entries)) => match elem.as_ref() {
                SignatureType::DictEntry(key_type, value_type) => Value::Dict(
                    entries
                        .into_iter()
                        .map(|(k, v)| Ok((key_type.coerce(k)?, value_type.coerce(v)?)))
                        .collect::<Result<Vec<_>>>()?,
                ),
                _ => Value::Dict(entries),
            },
            (SignatureType::Struct(fields), Value::Struct(members))
                if fields.len() == members.len() =>
            {
                Value::Struct(
                    fields
                        .iter()
                        .zip(members)
                        .map(|(f, m)| f.coerce(m))
                        .collect::<Result<Vec<_>>>()?,
                )
            }
            (_, value) => value,
        };
        self.verify(&coerced)?;
        Ok(coerced)
    }

    fn narrow(&self, n: i128) -> Result<Value> {
        let overflow = || {
            DbusError::SignatureBodyMismatch(format!(
                "value {n} is out of range for type '{}'",
                self.signature()
            ))
        };
        Ok(match self {
            SignatureType::Byte => Value::Byte(u8::try_from(n).map_err(|_| overflow())?),
            SignatureType::Int16 => Value::Int16(i16::try_from(n).map_err(|_| overflow())?),
            SignatureType::UInt16 => Value::UInt16(u16::try_from(n).map_err(|_| overflow())?),
            SignatureType::Int32 => Value::Int32(i32::try_from(n).map_err(|_| overflow())?),
            SignatureType::UInt32 => Value::UInt32(u32::try_from(n).map_err(|_| overflow())?),
            SignatureType::Int64 => Value::Int64(i64::try_from(n).map_err(|_| overflow())?),
            SignatureType::UInt64 => Value::UInt64(u64::try_from(n).map_err(|_| overflow())?),
            _ => return Err(overflow()),
        })
    }
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

// Recursive-descent parser over the raw signature bytes
struct Parser<'a> {
    signature: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(signature: &'a str) -> Self {
        Self {
            signature,
            bytes: signature.as_bytes(),
            pos: 0,
        }
    }

    fn done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn error(&self, reason: &str) -> DbusError {
        DbusError::InvalidSignature(format!("'{}': {reason}", self.signature))
    }

    fn parse_type(&mut self, arrays: usize, structs: usize) -> Result<SignatureType> {
        let token = self
            .peek()
            .ok_or_else(|| self.error("unexpected end of signature"))?;
        self.pos += 1;

        let ty = match token {
            b'y' => SignatureType::Byte,
            b'b' => SignatureType::Boolean,
            b'n' => SignatureType::Int16,
            b'q' => SignatureType::UInt16,
            b'i' => SignatureType::Int32,
            b'u' => SignatureType::UInt32,
            b'x' => SignatureType::Int64,
            b't' => SignatureType::UInt64,
            b'd' => SignatureType::Double,
            b's' => SignatureType::String,
            b'o' => SignatureType::ObjectPath,
            b'g' => SignatureType::Signature,
            b'v' => SignatureType::Variant,
            b'h' => SignatureType::UnixFd,
            b'a' => {
                if arrays >= MAX_ARRAY_DEPTH {
                    return Err(self.error("arrays nested too deeply"));
                }
                if self.peek() == Some(b'{') {
                    self.pos += 1;
                    self.parse_dict_entry(arrays + 1, structs)?
                } else {
                    SignatureType::Array(Box::new(self.parse_type(arrays + 1, structs)?))
                }
            }
            b'(' => {
                if structs >= MAX_STRUCT_DEPTH {
                    return Err(self.error("structs nested too deeply"));
                }
                let mut fields = Vec::new();
                loop {
                    match self.peek() {
                        None => return Err(self.error("unterminated struct")),
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => fields.push(self.parse_type(arrays, structs + 1)?),
                    }
                }
                if fields.is_empty() {
                    return Err(self.error("struct must have at least one member"));
                }
                SignatureType::Struct(fields)
            }
            b'{' => return Err(self.error("dict entry must be an array element")),
            b')' | b'}' => return Err(self.error("unexpected closing token")),
            other => {
                return Err(self.error(&format!("unknown type token '{}'", other as char)));
            }
        };
        Ok(ty)
    }

    fn parse_dict_entry(&mut self, arrays: usize, structs: usize) -> Result<SignatureType> {
        if self.peek().is_none() {
            return Err(self.error("unterminated dict entry"));
        }
        let key = self.parse_type(arrays, structs + 1)?;
        if !key.is_basic() {
            return Err(self.error("dict entry key must be a basic type"));
        }
        if self.peek().is_none() {
            return Err(self.error("unterminated dict entry"));
        }
        let value = self.parse_type(arrays, structs + 1)?;
        match self.peek() {
            Some(b'}') => {
                self.pos += 1;
                Ok(SignatureType::Array(Box::new(SignatureType::DictEntry(
                    Box::new(key),
                    Box::new(value),
                ))))
            }
            None => Err(self.error("unterminated dict entry")),
            Some(_) => Err(self.error("dict entry must have exactly two types")),
        }
    }
}

/// A parsed signature: an ordered list of complete types.
#[derive(Debug, Clone, Default)]
pub struct SignatureTree {
    signature: String,
    types: Vec<SignatureType>,
}

impl SignatureTree {
    /// Parse a signature string without consulting the cache.
    pub fn parse(signature: &str) -> Result<Self> {
        if signature.len() > MAX_SIGNATURE_LEN {
            return Err(DbusError::InvalidSignature(format!(
                "signature is {} characters (maximum {MAX_SIGNATURE_LEN})",
                signature.len()
            )));
        }

        let mut parser = Parser::new(signature);
        let mut types = Vec::new();
        while !parser.done() {
            types.push(parser.parse_type(0, 0)?);
        }

        Ok(Self {
            signature: signature.to_owned(),
            types,
        })
    }

    /// Build a tree from already parsed types.
    pub fn from_types(types: Vec<SignatureType>) -> Self {
        let signature = types.iter().map(SignatureType::signature).collect();
        Self { signature, types }
    }

    pub fn as_str(&self) -> &str {
        &self.signature
    }

    pub fn types(&self) -> &[SignatureType] {
        &self.types
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Check a message body against this signature.
    pub fn verify(&self, body: &[Value]) -> Result<()> {
        if body.len() != self.types.len() {
            return Err(DbusError::SignatureBodyMismatch(format!(
                "signature '{}' expects {} values, body has {}",
                self.signature,
                self.types.len(),
                body.len()
            )));
        }
        for (ty, value) in self.types.iter().zip(body) {
            ty.verify(value)?;
        }
        Ok(())
    }

    /// Coerce every member of a body to this signature.
    pub fn coerce(&self, body: Vec<Value>) -> Result<Vec<Value>> {
        if body.len() != self.types.len() {
            return Err(DbusError::SignatureBodyMismatch(format!(
                "signature '{}' expects {} values, got {}",
                self.signature,
                self.types.len(),
                body.len()
            )));
        }
        self.types
            .iter()
            .zip(body)
            .map(|(ty, value)| ty.coerce(value))
            .collect()
    }
}

impl PartialEq for SignatureTree {
    fn eq(&self, other: &Self) -> bool {
        self.signature == other.signature
    }
}

impl Eq for SignatureTree {}

impl Hash for SignatureTree {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.signature.hash(state);
    }
}

impl FromStr for SignatureTree {
    type Err = DbusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SignatureTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature)
    }
}

fn tree_cache() -> &'static RwLock<HashMap<String, Arc<SignatureTree>>> {
    static CACHE: OnceLock<RwLock<HashMap<String, Arc<SignatureTree>>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Parse a signature through the process-wide memo cache.
///
/// A poisoned cache lock only disables caching; parsing still succeeds.
pub fn signature_tree(signature: &str) -> Result<Arc<SignatureTree>> {
    if let Ok(cache) = tree_cache().read() {
        if let Some(tree) = cache.get(signature) {
            return Ok(Arc::clone(tree));
        }
    }

    let tree = Arc::new(SignatureTree::parse(signature)?);

    if let Ok(mut cache) = tree_cache().write() {
        if cache.len() >= TREE_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(signature.to_owned(), Arc::clone(&tree));
    }

    Ok(tree)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::core::value::Variant;

    #[test]
    fn parses_containers() {
        let tree = SignatureTree::parse("a{sv}(ii)as").unwrap();
        assert_eq!(tree.types().len(), 3);
        assert_eq!(tree.types()[0].signature(), "a{sv}");
        assert_eq!(tree.types()[1].children().len(), 2);
        assert_eq!(tree.to_string(), "a{sv}(ii)as");
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["(ii", "a{vs}", "a{s}", "a{sss}", "{sv}", "z", "a", "()", "a{sv"] {
            assert!(
                matches!(SignatureTree::parse(bad), Err(DbusError::InvalidSignature(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_oversized() {
        let long = "y".repeat(MAX_SIGNATURE_LEN + 1);
        assert!(SignatureTree::parse(&long).is_err());
        assert!(SignatureTree::parse(&"y".repeat(MAX_SIGNATURE_LEN)).is_ok());
    }

    #[test]
    fn rejects_deep_nesting() {
        let deep = format!("{}y", "a".repeat(33));
        assert!(SignatureTree::parse(&deep).is_err());
        let ok = format!("{}y", "a".repeat(32));
        assert!(SignatureTree::parse(&ok).is_ok());
    }

    #[test]
    fn cache_returns_shared_tree() {
        let a = signature_tree("a(sa{sv})").unwrap();
        let b = signature_tree("a(sa{sv})").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*a, SignatureTree::parse("a(sa{sv})").unwrap());
    }

    #[test]
    fn verify_checks_struct_arity() {
        let ty = SignatureType::parse_single("(is)").unwrap();
        assert!(ty
            .verify(&Value::Struct(vec![Value::Int32(1), Value::from("x")]))
            .is_ok());
        assert!(ty.verify(&Value::Struct(vec![Value::Int32(1)])).is_err());
    }

    #[test]
    fn verify_checks_variant_body() {
        let good = Variant::new("u", Value::UInt32(3)).unwrap();
        assert!(SignatureType::Variant.verify(&Value::Variant(Box::new(good))).is_ok());
        assert!(Variant::new("u", Value::from("three")).is_err());
    }

    #[test]
    fn coerce_applies_width_ranges() {
        assert_eq!(
            SignatureType::Int16.coerce(Value::Int64(-32768)).unwrap(),
            Value::Int16(-32768)
        );
        assert!(SignatureType::Int16.coerce(Value::Int64(32768)).is_err());
        assert!(SignatureType::UInt32.coerce(Value::Int32(-1)).is_err());
        assert_eq!(
            SignatureType::parse_single("ay")
                .unwrap()
                .coerce(Value::Array(vec![Value::Int32(1), Value::Int32(255)]))
                .unwrap(),
            Value::Bytes(vec![1, 255])
        );
    }

    #[test]
    fn dict_keys_must_be_basic() {
        assert!(SignatureType::parse_single("a{(i)s}").is_err());
        assert!(SignatureType::parse_single("a{oas}").is_ok());
    }
}
