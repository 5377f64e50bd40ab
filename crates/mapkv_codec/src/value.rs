//! Tagged value type.

use crate::error::{CodecError, CodecResult};

/// Type tag written in front of every encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// Boolean.
    Bool = 1,
    /// Signed 32-bit integer.
    I32 = 2,
    /// Unsigned 32-bit integer.
    U32 = 3,
    /// Signed 64-bit integer.
    I64 = 4,
    /// Unsigned 64-bit integer.
    U64 = 5,
    /// 32-bit float.
    F32 = 6,
    /// 64-bit float.
    F64 = 7,
    /// UTF-8 string.
    Str = 8,
    /// Raw byte buffer.
    Bytes = 9,
    /// List of UTF-8 strings.
    StrList = 10,
}

impl ValueType {
    /// Returns the tag byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parses a tag byte.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownTag`] for bytes outside the known range.
    pub fn from_byte(tag: u8) -> CodecResult<Self> {
        Ok(match tag {
            1 => Self::Bool,
            2 => Self::I32,
            3 => Self::U32,
            4 => Self::I64,
            5 => Self::U64,
            6 => Self::F32,
            7 => Self::F64,
            8 => Self::Str,
            9 => Self::Bytes,
            10 => Self::StrList,
            _ => return Err(CodecError::UnknownTag { tag }),
        })
    }

    /// Human readable name, used by tooling.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Str => "string",
            Self::Bytes => "bytes",
            Self::StrList => "string-list",
        }
    }
}

/// A value stored under a key.
///
/// Each variant maps to exactly one [`ValueType`]. Typed accessors return
/// `None` on a tag mismatch instead of converting between widths, so a
/// value written as `I32` is never read back as `I64`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean value.
    Bool(bool),
    /// Signed 32-bit integer.
    I32(i32),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Signed 64-bit integer.
    I64(i64),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// List of strings.
    StrList(Vec<String>),
}

impl Value {
    /// Returns the type tag of this value.
    #[must_use]
    pub const fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::I32(_) => ValueType::I32,
            Value::U32(_) => ValueType::U32,
            Value::I64(_) => ValueType::I64,
            Value::U64(_) => ValueType::U64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::Str(_) => ValueType::Str,
            Value::Bytes(_) => ValueType::Bytes,
            Value::StrList(_) => ValueType::StrList,
        }
    }

    /// Bitwise equality: like `==` but NaN payloads compare by their bits.
    #[must_use]
    pub fn bit_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an `i32`, if it is one.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a `u32`, if it is one.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as an `i64`, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a `u64`, if it is one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as an `f32`, if it is one.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as an `f64`, if it is one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as a byte slice, if it is one.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as a string list, if it is one.
    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            Value::StrList(list) => Some(list),
            _ => None,
        }
    }
}

/// Conversion out of a [`Value`] for typed reads.
///
/// Implementations return `None` when the stored tag does not match.
pub trait FromValue: Sized {
    /// Converts the value, or returns `None` on a type mismatch.
    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! impl_scalar {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }

        impl FromValue for $ty {
            fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_scalar!(bool, Bool);
impl_scalar!(i32, I32);
impl_scalar!(u32, U32);
impl_scalar!(i64, I64);
impl_scalar!(u64, U64);
impl_scalar!(f32, F32);
impl_scalar!(f64, F64);
impl_scalar!(String, Str);
impl_scalar!(Vec<u8>, Bytes);
impl_scalar!(Vec<String>, StrList);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<&[&str]> for Value {
    fn from(v: &[&str]) -> Self {
        Value::StrList(v.iter().map(|s| (*s).to_string()).collect())
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Option<Self> {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_bytes_roundtrip() {
        for tag in 1..=10u8 {
            let ty = ValueType::from_byte(tag).unwrap();
            assert_eq!(ty.as_byte(), tag);
        }
        assert_eq!(
            ValueType::from_byte(0),
            Err(CodecError::UnknownTag { tag: 0 })
        );
        assert!(ValueType::from_byte(11).is_err());
    }

    #[test]
    fn accessors_reject_other_tags() {
        let v = Value::I32(7);
        assert_eq!(v.as_i32(), Some(7));
        assert_eq!(v.as_i64(), None);
        assert_eq!(v.as_u32(), None);
        assert!(v.as_str().is_none());
    }

    #[test]
    fn from_value_matches_variant() {
        assert_eq!(i64::from_value(Value::I64(-3)), Some(-3));
        assert_eq!(i64::from_value(Value::I32(-3)), None);
        assert_eq!(
            String::from_value(Value::from("abc")),
            Some("abc".to_string())
        );
        assert_eq!(Vec::<u8>::from_value(Value::from("abc")), None);
    }

    #[test]
    fn bit_eq_handles_nan() {
        let a = Value::F64(f64::NAN);
        assert_ne!(a, a.clone());
        assert!(a.bit_eq(&a.clone()));
        assert!(!Value::F32(0.0).bit_eq(&Value::F32(-0.0)));
    }
}
