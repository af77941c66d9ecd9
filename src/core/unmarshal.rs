//! Decodes values from the D-Bus wire layout.
//!
//! The unmarshaller only ever runs over a complete frame (the codec waits for
//! the declared length first), so running out of bytes here means the frame
//! is malformed and is reported as [`DbusError::InvalidMessage`].

use crate::core::marshal::{padding_for, Endian, MAX_ARRAY_LEN};
use crate::core::signature::{signature_tree, SignatureTree, SignatureType};
use crate::core::value::{Value, Variant};
use crate::error::{DbusError, Result};

const MAX_VARIANT_DEPTH: usize = 64;

#[derive(Debug)]
pub struct Unmarshaller<'a> {
    buf: &'a [u8],
    pos: usize,
    endian: Endian,
    variant_depth: usize,
}

fn invalid(reason: impl Into<String>) -> DbusError {
    DbusError::InvalidMessage(reason.into())
}

impl<'a> Unmarshaller<'a> {
    pub fn new(buf: &'a [u8], endian: Endian) -> Self {
        Self::with_position(buf, 0, endian)
    }

    /// Start reading at `pos`; alignment is computed from the buffer start.
    pub fn with_position(buf: &'a [u8], pos: usize, endian: Endian) -> Self {
        Self {
            buf,
            pos,
            endian,
            variant_depth: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| invalid("unexpected end of message"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn align(&mut self, align: usize) -> Result<()> {
        let pad = padding_for(self.pos, align);
        let padding = self.take(pad)?;
        if padding.iter().any(|b| *b != 0) {
            return Err(invalid("non-zero alignment padding"));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let b = self.take(2)?;
        let raw = [b[0], b[1]];
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        })
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let b = self.take(4)?;
        let raw = [b[0], b[1], b[2], b[3]];
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        })
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(raw),
            Endian::Big => u64::from_be_bytes(raw),
        })
    }

    fn read_terminated(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        if self.read_u8()? != 0 {
            return Err(invalid("string is not NUL terminated"));
        }
        let s = std::str::from_utf8(bytes).map_err(|_| invalid("string is not valid UTF-8"))?;
        if s.contains('\0') {
            return Err(invalid("string contains an interior NUL"));
        }
        Ok(s.to_owned())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        self.read_terminated(len)
    }

    pub fn read_signature(&mut self) -> Result<String> {
        let len = self.read_u8()? as usize;
        self.read_terminated(len)
    }

    /// Read a whole body in signature order.
    pub fn read_body(&mut self, signature: &SignatureTree) -> Result<Vec<Value>> {
        signature
            .types()
            .iter()
            .map(|ty| self.read_value(ty))
            .collect()
    }

    pub fn read_value(&mut self, ty: &SignatureType) -> Result<Value> {
        Ok(match ty {
            SignatureType::Byte => Value::Byte(self.read_u8()?),
            SignatureType::Boolean => match self.read_u32()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(invalid(format!("invalid boolean value {other}"))),
            },
            SignatureType::Int16 => Value::Int16(self.read_u16()? as i16),
            SignatureType::UInt16 => Value::UInt16(self.read_u16()?),
            SignatureType::Int32 => Value::Int32(self.read_u32()? as i32),
            SignatureType::UInt32 => Value::UInt32(self.read_u32()?),
            SignatureType::UnixFd => Value::UnixFd(self.read_u32()?),
            SignatureType::Int64 => Value::Int64(self.read_u64()? as i64),
            SignatureType::UInt64 => Value::UInt64(self.read_u64()?),
            SignatureType::Double => Value::Double(f64::from_bits(self.read_u64()?)),
            SignatureType::String => Value::Str(self.read_string()?),
            SignatureType::ObjectPath => Value::ObjectPath(self.read_string()?),
            SignatureType::Signature => Value::Signature(self.read_signature()?),
            SignatureType::Variant => self.read_variant()?,
            SignatureType::Array(elem) => self.read_array(elem)?,
            SignatureType::Struct(fields) => {
                self.align(8)?;
                Value::Struct(
                    fields
                        .iter()
                        .map(|field| self.read_value(field))
                        .collect::<Result<Vec<_>>>()?,
                )
            }
            SignatureType::DictEntry(..) => {
                return Err(invalid("dict entry outside of an array"));
            }
        })
    }

    fn read_variant(&mut self) -> Result<Value> {
        if self.variant_depth >= MAX_VARIANT_DEPTH {
            return Err(invalid("variants nested too deeply"));
        }
        let signature = self.read_signature()?;
        let tree = signature_tree(&signature).map_err(|e| invalid(e.to_string()))?;
        let ty = match tree.types() {
            [single] => single.clone(),
            _ => {
                return Err(invalid(format!(
                    "variant signature '{signature}' is not a single complete type"
                )));
            }
        };
        self.variant_depth += 1;
        let value = self.read_value(&ty);
        self.variant_depth -= 1;
        Ok(Value::Variant(Box::new(Variant::new_unchecked(ty, value?))))
    }

    fn read_array(&mut self, elem: &SignatureType) -> Result<Value> {
        let len = self.read_u32()? as usize;
        if len > MAX_ARRAY_LEN {
            return Err(invalid(format!("array length {len} exceeds {MAX_ARRAY_LEN}")));
        }
        self.align(elem.alignment())?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| invalid("array extends past the end of the message"))?;

        if *elem == SignatureType::Byte {
            return Ok(Value::Bytes(self.take(len)?.to_vec()));
        }

        if let SignatureType::DictEntry(key_type, value_type) = elem {
            let mut entries = Vec::new();
            while self.pos < end {
                self.align(8)?;
                let key = self.read_value(key_type)?;
                let value = self.read_value(value_type)?;
                entries.push((key, value));
            }
            self.expect_end(end)?;
            return Ok(Value::Dict(entries));
        }

        let mut items = Vec::new();
        while self.pos < end {
            items.push(self.read_value(elem)?);
        }
        self.expect_end(end)?;
        Ok(Value::Array(items))
    }

    fn expect_end(&self, end: usize) -> Result<()> {
        if self.pos != end {
            return Err(invalid("array contents do not match the declared length"));
        }
        Ok(())
    }
}
