//! Represent process variable values, for interchange between backends and consumers.
//!
//! Every variable has a fixed element type and element count, chosen by the backend
//! when the variable is opened. The element types are a small closed set, enumerated
//! in [`ValueType`] and carried in [`PvValue`]:
//! - [`PvValue::Int8`] / [`PvValue::UInt8`] ([`Vec<i8>`] / [`Vec<u8>`])
//! - [`PvValue::Int16`] / [`PvValue::UInt16`] ([`Vec<i16>`] / [`Vec<u16>`])
//! - [`PvValue::Int32`] / [`PvValue::UInt32`] ([`Vec<i32>`] / [`Vec<u32>`])
//! - [`PvValue::Int64`] / [`PvValue::UInt64`] ([`Vec<i64>`] / [`Vec<u64>`])
//! - [`PvValue::Float32`] / [`PvValue::Float64`] ([`Vec<f32>`] / [`Vec<f64>`])
//! - [`PvValue::String`] ([`Vec<String>`])
//! - [`PvValue::Boolean`] ([`Vec<bool>`])
//! - [`PvValue::Void`] - carries no data at all, and is used for variables that only
//!   signal that "something happened" (e.g. a trigger).
//!
//! Values can be converted between the numeric types as long as every element is
//! representable in the target type (floats are truncated towards zero). Strings are
//! parsed when converted to a numeric type, and numbers are formatted when converted
//! to strings.

use num::NumCast;
use std::{
    fmt::{self, Display},
    str::FromStr,
};
use thiserror::Error;

use crate::error::PvError;

/// The element type of a process variable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
    Boolean,
    Void,
}

impl ValueType {
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ValueType::String | ValueType::Boolean | ValueType::Void)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Int8 => "int8",
            ValueType::UInt8 => "uint8",
            ValueType::Int16 => "int16",
            ValueType::UInt16 => "uint16",
            ValueType::Int32 => "int32",
            ValueType::UInt32 => "uint32",
            ValueType::Int64 => "int64",
            ValueType::UInt64 => "uint64",
            ValueType::Float32 => "float32",
            ValueType::Float64 => "float64",
            ValueType::String => "string",
            ValueType::Boolean => "boolean",
            ValueType::Void => "void",
        }
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
#[error("Unknown value type: {0}")]
pub struct UnknownValueType(pub String);

impl FromStr for ValueType {
    type Err = UnknownValueType;

    /// Parse a type name. Accepts the canonical names plus the usual EPICS and Rust
    /// spellings (`LONG`, `DOUBLE`, `i32`, `bool`...), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let name = lower.strip_prefix("dbr_").unwrap_or(&lower);
        Ok(match name {
            "int8" | "i8" | "char" => ValueType::Int8,
            "uint8" | "u8" | "uchar" => ValueType::UInt8,
            "int16" | "i16" | "short" | "int" => ValueType::Int16,
            "uint16" | "u16" | "ushort" => ValueType::UInt16,
            "int32" | "i32" | "long" => ValueType::Int32,
            "uint32" | "u32" | "ulong" => ValueType::UInt32,
            "int64" | "i64" => ValueType::Int64,
            "uint64" | "u64" => ValueType::UInt64,
            "float32" | "f32" | "float" => ValueType::Float32,
            "float64" | "f64" | "double" => ValueType::Float64,
            "string" | "str" => ValueType::String,
            "boolean" | "bool" => ValueType::Boolean,
            "void" | "none" => ValueType::Void,
            _ => return Err(UnknownValueType(s.to_string())),
        })
    }
}

/// Represent the data of a process variable
#[derive(Clone, Debug, PartialEq)]
pub enum PvValue {
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Int64(Vec<i64>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<String>),
    Boolean(Vec<bool>),
    Void,
}

fn no_convert(what: impl Display, to: ValueType) -> PvError {
    PvError::TypeMismatch(format!("Cannot represent {what} as {to}"))
}

/// Parse a numeric string, preferring an exact integer parse over a float one
fn parse_number<U: NumCast>(s: &str, to: ValueType) -> Result<U, PvError> {
    let s = s.trim();
    let parsed = if let Ok(i) = s.parse::<i128>() {
        NumCast::from(i)
    } else if let Ok(f) = s.parse::<f64>() {
        NumCast::from(f)
    } else {
        None
    };
    parsed.ok_or_else(|| no_convert(format!("'{s}'"), to))
}

fn parse_bool(s: &str) -> Result<bool, PvError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" | "" => Ok(false),
        other => parse_number::<f64>(other, ValueType::Boolean).map(|v| v != 0.0),
    }
}

impl PvValue {
    /// A value of the given type and length, filled with the type's default
    pub fn zeroed(value_type: ValueType, count: usize) -> PvValue {
        match value_type {
            ValueType::Int8 => PvValue::Int8(vec![0; count]),
            ValueType::UInt8 => PvValue::UInt8(vec![0; count]),
            ValueType::Int16 => PvValue::Int16(vec![0; count]),
            ValueType::UInt16 => PvValue::UInt16(vec![0; count]),
            ValueType::Int32 => PvValue::Int32(vec![0; count]),
            ValueType::UInt32 => PvValue::UInt32(vec![0; count]),
            ValueType::Int64 => PvValue::Int64(vec![0; count]),
            ValueType::UInt64 => PvValue::UInt64(vec![0; count]),
            ValueType::Float32 => PvValue::Float32(vec![0.0; count]),
            ValueType::Float64 => PvValue::Float64(vec![0.0; count]),
            ValueType::String => PvValue::String(vec![String::new(); count]),
            ValueType::Boolean => PvValue::Boolean(vec![false; count]),
            ValueType::Void => PvValue::Void,
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            PvValue::Int8(_) => ValueType::Int8,
            PvValue::UInt8(_) => ValueType::UInt8,
            PvValue::Int16(_) => ValueType::Int16,
            PvValue::UInt16(_) => ValueType::UInt16,
            PvValue::Int32(_) => ValueType::Int32,
            PvValue::UInt32(_) => ValueType::UInt32,
            PvValue::Int64(_) => ValueType::Int64,
            PvValue::UInt64(_) => ValueType::UInt64,
            PvValue::Float32(_) => ValueType::Float32,
            PvValue::Float64(_) => ValueType::Float64,
            PvValue::String(_) => ValueType::String,
            PvValue::Boolean(_) => ValueType::Boolean,
            PvValue::Void => ValueType::Void,
        }
    }

    /// Number of elements. A [`PvValue::Void`] has none.
    pub fn len(&self) -> usize {
        match self {
            PvValue::Int8(val) => val.len(),
            PvValue::UInt8(val) => val.len(),
            PvValue::Int16(val) => val.len(),
            PvValue::UInt16(val) => val.len(),
            PvValue::Int32(val) => val.len(),
            PvValue::UInt32(val) => val.len(),
            PvValue::Int64(val) => val.len(),
            PvValue::UInt64(val) => val.len(),
            PvValue::Float32(val) => val.len(),
            PvValue::Float64(val) => val.len(),
            PvValue::String(val) => val.len(),
            PvValue::Boolean(val) => val.len(),
            PvValue::Void => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert to another element type, keeping the element count.
    ///
    /// Fails with [`PvError::TypeMismatch`] if any element is not representable in
    /// the target type. Converting to the same type is a plain clone.
    pub fn convert_to(&self, value_type: ValueType) -> Result<PvValue, PvError> {
        if self.value_type() == value_type {
            return Ok(self.clone());
        }
        Ok(match value_type {
            ValueType::Int8 => PvValue::Int8(self.cast_elements(value_type)?),
            ValueType::UInt8 => PvValue::UInt8(self.cast_elements(value_type)?),
            ValueType::Int16 => PvValue::Int16(self.cast_elements(value_type)?),
            ValueType::UInt16 => PvValue::UInt16(self.cast_elements(value_type)?),
            ValueType::Int32 => PvValue::Int32(self.cast_elements(value_type)?),
            ValueType::UInt32 => PvValue::UInt32(self.cast_elements(value_type)?),
            ValueType::Int64 => PvValue::Int64(self.cast_elements(value_type)?),
            ValueType::UInt64 => PvValue::UInt64(self.cast_elements(value_type)?),
            ValueType::Float32 => PvValue::Float32(self.cast_elements(value_type)?),
            ValueType::Float64 => PvValue::Float64(self.cast_elements(value_type)?),
            ValueType::String => PvValue::String(self.to_strings()),
            ValueType::Boolean => PvValue::Boolean(self.to_booleans()?),
            ValueType::Void => PvValue::Void,
        })
    }

    fn cast_elements<U: NumCast>(&self, to: ValueType) -> Result<Vec<U>, PvError> {
        /// Utility function so that we don't have to repeat the map iter conversion
        fn _try_convert_vec<T, U>(from: &[T], to: ValueType) -> Result<Vec<U>, PvError>
        where
            T: Copy + NumCast + Display,
            U: NumCast,
        {
            from.iter()
                .map(|n| NumCast::from(*n).ok_or_else(|| no_convert(n, to)))
                .collect()
        }

        match self {
            PvValue::Int8(val) => _try_convert_vec(val, to),
            PvValue::UInt8(val) => _try_convert_vec(val, to),
            PvValue::Int16(val) => _try_convert_vec(val, to),
            PvValue::UInt16(val) => _try_convert_vec(val, to),
            PvValue::Int32(val) => _try_convert_vec(val, to),
            PvValue::UInt32(val) => _try_convert_vec(val, to),
            PvValue::Int64(val) => _try_convert_vec(val, to),
            PvValue::UInt64(val) => _try_convert_vec(val, to),
            PvValue::Float32(val) => _try_convert_vec(val, to),
            PvValue::Float64(val) => _try_convert_vec(val, to),
            PvValue::Boolean(val) => _try_convert_vec(
                &val.iter().map(|b| <u8 as From<bool>>::from(*b)).collect::<Vec<_>>(),
                to,
            ),
            PvValue::String(val) => val.iter().map(|s| parse_number(s, to)).collect(),
            PvValue::Void => Err(no_convert("void", to)),
        }
    }

    fn to_strings(&self) -> Vec<String> {
        fn _format<T: ToString>(from: &[T]) -> Vec<String> {
            from.iter().map(|v| v.to_string()).collect()
        }
        match self {
            PvValue::Int8(val) => _format(val),
            PvValue::UInt8(val) => _format(val),
            PvValue::Int16(val) => _format(val),
            PvValue::UInt16(val) => _format(val),
            PvValue::Int32(val) => _format(val),
            PvValue::UInt32(val) => _format(val),
            PvValue::Int64(val) => _format(val),
            PvValue::UInt64(val) => _format(val),
            PvValue::Float32(val) => _format(val),
            PvValue::Float64(val) => _format(val),
            PvValue::String(val) => val.clone(),
            PvValue::Boolean(val) => _format(val),
            PvValue::Void => Vec::new(),
        }
    }

    fn to_booleans(&self) -> Result<Vec<bool>, PvError> {
        match self {
            PvValue::Boolean(val) => Ok(val.clone()),
            PvValue::String(val) => val.iter().map(|s| parse_bool(s)).collect(),
            PvValue::Void => Err(no_convert("void", ValueType::Boolean)),
            _ => Ok(self
                .cast_elements::<f64>(ValueType::Boolean)?
                .into_iter()
                .map(|v| v != 0.0)
                .collect()),
        }
    }
}

impl Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Void => f.write_str("<void>"),
            _ => f.write_str(&self.to_strings().join(" ")),
        }
    }
}

/// Implement From/TryFrom between a PvValue kind and the native element type
macro_rules! impl_pvvalue_conversions_between {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for PvValue {
            fn from(value: Vec<$typ>) -> Self {
                PvValue::$variant(value)
            }
        }
        impl From<$typ> for PvValue {
            fn from(value: $typ) -> Self {
                PvValue::$variant(vec![value])
            }
        }
        impl TryFrom<PvValue> for Vec<$typ> {
            type Error = PvError;
            fn try_from(value: PvValue) -> Result<Self, Self::Error> {
                match value.convert_to(ValueType::$variant)? {
                    PvValue::$variant(val) => Ok(val),
                    other => Err(no_convert(other.value_type(), ValueType::$variant)),
                }
            }
        }
        impl TryFrom<PvValue> for $typ {
            type Error = PvError;
            /// Extract the first element
            fn try_from(value: PvValue) -> Result<Self, Self::Error> {
                Vec::<$typ>::try_from(value)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| no_convert("an empty value", ValueType::$variant))
            }
        }
    };
}

impl_pvvalue_conversions_between!(Int8, i8);
impl_pvvalue_conversions_between!(UInt8, u8);
impl_pvvalue_conversions_between!(Int16, i16);
impl_pvvalue_conversions_between!(UInt16, u16);
impl_pvvalue_conversions_between!(Int32, i32);
impl_pvvalue_conversions_between!(UInt32, u32);
impl_pvvalue_conversions_between!(Int64, i64);
impl_pvvalue_conversions_between!(UInt64, u64);
impl_pvvalue_conversions_between!(Float32, f32);
impl_pvvalue_conversions_between!(Float64, f64);
impl_pvvalue_conversions_between!(String, String);
impl_pvvalue_conversions_between!(Boolean, bool);

impl From<&str> for PvValue {
    fn from(value: &str) -> Self {
        PvValue::String(vec![value.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_conversions() {
        let v: PvValue = vec![500i32].into();
        assert!(v.convert_to(ValueType::Int16).is_ok());
        assert!(v.convert_to(ValueType::Int8).is_err());
        assert_eq!(
            v.convert_to(ValueType::Int16).unwrap(),
            PvValue::Int16(vec![500])
        );
        assert!(
            PvValue::Int32(vec![-1])
                .convert_to(ValueType::UInt32)
                .is_err()
        );

        let v: PvValue = vec![500.23f32, 12.7f32].into();
        assert_eq!(v.len(), 2);
        // Floats truncate towards zero
        assert_eq!(
            v.convert_to(ValueType::Int16).unwrap(),
            PvValue::Int16(vec![500, 12])
        );
        assert_eq!(
            PvValue::Float32(vec![455.9f32])
                .convert_to(ValueType::Int32)
                .unwrap(),
            PvValue::Int32(vec![455])
        );
        assert!(
            PvValue::Float64(vec![f64::NAN])
                .convert_to(ValueType::Int64)
                .is_err()
        );
    }

    #[test]
    fn string_conversions() {
        let s = PvValue::String(vec!["42".to_string(), " -7 ".to_string()]);
        assert_eq!(
            s.convert_to(ValueType::Int32).unwrap(),
            PvValue::Int32(vec![42, -7])
        );
        assert_eq!(
            PvValue::from("2.5").convert_to(ValueType::Float64).unwrap(),
            PvValue::Float64(vec![2.5])
        );
        assert!(PvValue::from("potato").convert_to(ValueType::Int8).is_err());
        assert_eq!(
            PvValue::UInt64(vec![u64::MAX])
                .convert_to(ValueType::String)
                .unwrap(),
            PvValue::String(vec![u64::MAX.to_string()])
        );
        // Large integers survive the string round trip exactly
        assert_eq!(
            PvValue::String(vec![u64::MAX.to_string()])
                .convert_to(ValueType::UInt64)
                .unwrap(),
            PvValue::UInt64(vec![u64::MAX])
        );
    }

    #[test]
    fn boolean_and_void() {
        assert_eq!(
            PvValue::Int16(vec![0, 3, -1])
                .convert_to(ValueType::Boolean)
                .unwrap(),
            PvValue::Boolean(vec![false, true, true])
        );
        assert_eq!(
            PvValue::Boolean(vec![true, false])
                .convert_to(ValueType::UInt8)
                .unwrap(),
            PvValue::UInt8(vec![1, 0])
        );
        assert_eq!(
            PvValue::Boolean(vec![false, true])
                .convert_to(ValueType::Float64)
                .unwrap(),
            PvValue::Float64(vec![0.0, 1.0])
        );
        assert_eq!(
            PvValue::from("off").convert_to(ValueType::Boolean).unwrap(),
            PvValue::Boolean(vec![false])
        );
        assert_eq!(
            PvValue::from(12i32).convert_to(ValueType::Void).unwrap(),
            PvValue::Void
        );
        assert!(PvValue::Void.convert_to(ValueType::Int32).is_err());
        assert!(PvValue::Void.is_empty());
        assert_eq!(PvValue::zeroed(ValueType::Void, 4), PvValue::Void);
    }

    #[test]
    fn native_type_extraction() {
        assert_eq!(i32::try_from(PvValue::from(vec![3i32, 4])).unwrap(), 3);
        assert_eq!(
            String::try_from(PvValue::from(17u16)).unwrap(),
            "17".to_string()
        );
        assert!(i8::try_from(PvValue::Int8(Vec::new())).is_err());
        assert_eq!(
            Vec::<f64>::try_from(PvValue::from(vec![1u8, 2])).unwrap(),
            vec![1.0, 2.0]
        );
    }

    #[test]
    fn test_value_type_names() {
        assert_eq!("LONG".parse::<ValueType>().unwrap(), ValueType::Int32);
        assert_eq!("DBR_DOUBLE".parse::<ValueType>().unwrap(), ValueType::Float64);
        assert_eq!("uint8".parse::<ValueType>().unwrap(), ValueType::UInt8);
        assert_eq!("SHORT".parse::<ValueType>().unwrap(), ValueType::Int16);
        assert_eq!("Bool".parse::<ValueType>().unwrap(), ValueType::Boolean);
        assert_eq!("void".parse::<ValueType>().unwrap(), ValueType::Void);
        assert!("DBR_CLASS_NAME".parse::<ValueType>().is_err());
        for t in [ValueType::Int64, ValueType::String, ValueType::Float32] {
            assert_eq!(t.name().parse::<ValueType>().unwrap(), t);
        }
    }
}
