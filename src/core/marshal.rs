//! # Marshaller
//!
//! Encodes values into the D-Bus wire layout.
//!
//! Every value is written at its natural alignment; the padding inserted before
//! position `pos` for alignment `a` is `(-pos) & (a - 1)`. Positions are relative
//! to the start of the buffer, which must itself sit at an 8-byte boundary of
//! the message (the header is padded so that the body does).
//!
//! ## Container framing
//! - Strings and object paths: `u32` length, bytes, NUL
//! - Signatures: `u8` length, bytes, NUL (no alignment)
//! - Arrays: `u32` payload length, padding to the element alignment, elements.
//!   The length counts the elements only, never that first padding.
//! - Structs and dict entries: padded to 8 before every instance
//! - Variants: signature of the contained type, then the value

use crate::core::signature::{SignatureTree, SignatureType};
use crate::core::value::Value;
use crate::error::{DbusError, Result};
use bytes::{BufMut, BytesMut};

/// Maximum encoded array payload (64 MiB)
pub const MAX_ARRAY_LEN: usize = 64 * 1024 * 1024;

/// Byte order of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    /// The header byte that declares this byte order.
    pub fn marker(self) -> u8 {
        match self {
            Endian::Little => b'l',
            Endian::Big => b'B',
        }
    }

    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            b'l' => Some(Endian::Little),
            b'B' => Some(Endian::Big),
            _ => None,
        }
    }
}

/// Padding needed to bring `pos` up to `align` (a power of two).
#[inline]
pub fn padding_for(pos: usize, align: usize) -> usize {
    pos.wrapping_neg() & (align - 1)
}

/// Serializes values into a growable buffer.
#[derive(Debug)]
pub struct Marshaller {
    buf: BytesMut,
    endian: Endian,
}

impl Marshaller {
    pub fn new(endian: Endian) -> Self {
        Self {
            buf: BytesMut::with_capacity(128),
            endian,
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    /// Write zero bytes up to the next multiple of `align`.
    pub fn align(&mut self, align: usize) {
        let pad = padding_for(self.buf.len(), align);
        self.buf.put_bytes(0, pad);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.align(2);
        match self.endian {
            Endian::Little => self.buf.put_u16_le(v),
            Endian::Big => self.buf.put_u16(v),
        }
    }

    pub fn write_u32(&mut self, v: u32) {
        self.align(4);
        match self.endian {
            Endian::Little => self.buf.put_u32_le(v),
            Endian::Big => self.buf.put_u32(v),
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.align(8);
        match self.endian {
            Endian::Little => self.buf.put_u64_le(v),
            Endian::Big => self.buf.put_u64(v),
        }
    }

    pub fn write_string(&mut self, s: &str) -> Result<()> {
        let len = u32::try_from(s.len())
            .map_err(|_| DbusError::SignatureBodyMismatch("string too long".into()))?;
        self.write_u32(len);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    pub fn write_signature(&mut self, s: &str) -> Result<()> {
        let len = u8::try_from(s.len()).map_err(|_| {
            DbusError::InvalidSignature(format!("signature of {} bytes is too long", s.len()))
        })?;
        self.buf.put_u8(len);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    // Patch a previously reserved u32 at `at`
    fn patch_u32(&mut self, at: usize, v: u32) {
        let bytes = match self.endian {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        self.buf[at..at + 4].copy_from_slice(&bytes);
    }

    /// Write a whole body in signature order.
    pub fn write_body(&mut self, signature: &SignatureTree, body: &[Value]) -> Result<()> {
        if signature.types().len() != body.len() {
            return Err(DbusError::SignatureBodyMismatch(format!(
                "signature '{}' expects {} values, body has {}",
                signature,
                signature.types().len(),
                body.len()
            )));
        }
        for (ty, value) in signature.types().iter().zip(body) {
            self.write_value(ty, value)?;
        }
        Ok(())
    }

    /// Write one value of the given type.
    pub fn write_value(&mut self, ty: &SignatureType, value: &Value) -> Result<()> {
        match (ty, value) {
            (SignatureType::Byte, Value::Byte(v)) => self.write_u8(*v),
            (SignatureType::Boolean, Value::Bool(v)) => self.write_u32(u32::from(*v)),
            (SignatureType::Int16, Value::Int16(v)) => self.write_u16(*v as u16),
            (SignatureType::UInt16, Value::UInt16(v)) => self.write_u16(*v),
            (SignatureType::Int32, Value::Int32(v)) => self.write_u32(*v as u32),
            (SignatureType::UInt32, Value::UInt32(v)) => self.write_u32(*v),
            (SignatureType::UnixFd, Value::UnixFd(v)) => self.write_u32(*v),
            (SignatureType::Int64, Value::Int64(v)) => self.write_u64(*v as u64),
            (SignatureType::UInt64, Value::UInt64(v)) => self.write_u64(*v),
            (SignatureType::Double, Value::Double(v)) => self.write_u64(v.to_bits()),
            (SignatureType::String, Value::Str(s))
            | (SignatureType::ObjectPath, Value::ObjectPath(s)) => self.write_string(s)?,
            (SignatureType::Signature, Value::Signature(s)) => self.write_signature(s)?,
            (SignatureType::Variant, Value::Variant(variant)) => {
                self.write_signature(&variant.signature())?;
                self.write_value(variant.signature_type(), variant.value())?;
            }
            (SignatureType::Array(elem), Value::Bytes(bytes))
                if **elem == SignatureType::Byte =>
            {
                self.write_array(elem, |m| {
                    m.buf.put_slice(bytes);
                    Ok(())
                })?;
            }
            (SignatureType::Array(elem), Value::Array(items)) => {
                self.write_array(elem, |m| {
                    for item in items {
                        m.write_value(elem, item)?;
                    }
                    Ok(())
                })?;
            }
            (SignatureType::Array(elem), Value::Dict(entries)) => {
                let (key_type, value_type) = match elem.as_ref() {
                    SignatureType::DictEntry(k, v) => (k.as_ref(), v.as_ref()),
                    _ => return Err(mismatch(ty, value)),
                };
                self.write_array(elem, |m| {
                    for (key, val) in entries {
                        m.align(8);
                        m.write_value(key_type, key)?;
                        m.write_value(value_type, val)?;
                    }
                    Ok(())
                })?;
            }
            (SignatureType::Struct(fields), Value::Struct(members)) => {
                if fields.len() != members.len() {
                    return Err(mismatch(ty, value));
                }
                self.align(8);
                for (field, member) in fields.iter().zip(members) {
                    self.write_value(field, member)?;
                }
            }
            _ => return Err(mismatch(ty, value)),
        }
        Ok(())
    }

    fn write_array<F>(&mut self, elem: &SignatureType, write_elements: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.align(4);
        let len_at = self.buf.len();
        self.buf.put_u32(0);
        self.align(elem.alignment());
        let start = self.buf.len();
        write_elements(self)?;
        let payload = self.buf.len() - start;
        if payload > MAX_ARRAY_LEN {
            return Err(DbusError::SignatureBodyMismatch(format!(
                "array payload of {payload} bytes exceeds {MAX_ARRAY_LEN}"
            )));
        }
        self.patch_u32(len_at, payload as u32);
        Ok(())
    }
}

fn mismatch(ty: &SignatureType, value: &Value) -> DbusError {
    DbusError::SignatureBodyMismatch(format!(
        "cannot encode {} as '{}'",
        value.type_name(),
        ty.signature()
    ))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::core::signature::signature_tree;

    fn encode(sig: &str, body: &[Value]) -> Vec<u8> {
        let mut m = Marshaller::new(Endian::Little);
        m.write_body(&signature_tree(sig).unwrap(), body).unwrap();
        m.into_inner().to_vec()
    }

    #[test]
    fn padding_formula() {
        assert_eq!(padding_for(0, 8), 0);
        assert_eq!(padding_for(1, 8), 7);
        assert_eq!(padding_for(5, 4), 3);
        assert_eq!(padding_for(6, 2), 0);
        assert_eq!(padding_for(9, 1), 0);
    }

    #[test]
    fn uint64_after_byte_is_padded_to_eight() {
        let bytes = encode("yt", &[Value::Byte(1), Value::UInt64(2)]);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[1..8], &[0u8; 7]);
        assert_eq!(&bytes[8..], &2u64.to_le_bytes());
    }

    #[test]
    fn string_layout() {
        let bytes = encode("s", &[Value::from("hi")]);
        assert_eq!(bytes, vec![2, 0, 0, 0, b'h', b'i', 0]);
    }

    #[test]
    fn array_length_excludes_first_padding() {
        // u32 length at 0..4, pad 4..8, one struct (i) of 4 bytes
        let bytes = encode("a(i)", &[Value::Array(vec![Value::Struct(vec![Value::Int32(7)])])]);
        assert_eq!(&bytes[0..4], &4u32.to_le_bytes());
        assert_eq!(bytes.len(), 12);
    }

    #[test]
    fn empty_array_of_structs_still_pads() {
        let bytes = encode("a(i)", &[Value::Array(vec![])]);
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn variant_writes_signature_then_value() {
        let v = crate::core::value::Variant::from(3u32);
        let bytes = encode("v", &[Value::from(v)]);
        assert_eq!(bytes, vec![1, b'u', 0, 0, 3, 0, 0, 0]);
    }

    #[test]
    fn big_endian_integers() {
        let mut m = Marshaller::new(Endian::Big);
        m.write_body(&signature_tree("u").unwrap(), &[Value::UInt32(1)])
            .unwrap();
        assert_eq!(m.into_inner().to_vec(), vec![0, 0, 0, 1]);
    }

    #[test]
    fn rejects_mismatched_value() {
        let mut m = Marshaller::new(Endian::Little);
        assert!(m
            .write_body(&signature_tree("u").unwrap(), &[Value::from("x")])
            .is_err());
    }
}
