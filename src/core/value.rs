//! # Wire Values
//!
//! The inert document tree carried inside an [`Envelope`]. Decoding bytes
//! into a [`Value`] never runs application code; typed reconstruction only
//! happens later through [`FieldValue`] once the type gate has approved the
//! type key.
//!
//! Numbers keep their sign class on the wire (`Int` / `UInt`). Narrowing into
//! a smaller field type is checked, and an overflow surfaces as
//! [`ProtocolError::FieldWidthMismatch`] rather than silently truncating.
//!
//! Decoding counts nesting as it goes and gives up past
//! [`MAX_VALUE_DEPTH`], so a hostile frame cannot exhaust the stack of the
//! worker decoding it, whatever the serializer.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use bytes::Bytes;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::envelope::Envelope;
use crate::core::wire::DecodeContext;
use crate::error::{ProtocolError, Result};

/// Field map of a record or user map.
pub type Fields = BTreeMap<String, Value>;

/// Deepest [`Value`] nesting accepted while decoding bytes.
///
/// A typed object costs two levels per nesting step (its record and the
/// `Object` around it), so this leaves room for
/// [`crate::core::wire::MAX_OBJECT_DEPTH`] objects plus their containers.
pub const MAX_VALUE_DEPTH: usize = 192;

/// A self-describing wire value.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(#[serde(serialize_with = "float_repr::serialize")] f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// User-level string-keyed map.
    Map(Fields),
    /// Fields of a struct, produced by [`crate::core::wire::Wire::to_record`].
    Record(Fields),
    /// A nested reference-typed object, gated on its own type key.
    Object(Box<Envelope>),
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Record(_) => "record",
            Value::Object(_) => "object",
        }
    }
}

thread_local! {
    static DECODE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// One level of `Value` decoding on this thread; released on drop.
struct DepthGuard;

impl DepthGuard {
    fn enter<E: de::Error>() -> std::result::Result<Self, E> {
        DECODE_DEPTH.with(|depth| {
            let next = depth.get() + 1;
            if next > MAX_VALUE_DEPTH {
                return Err(E::custom(format!(
                    "value nesting exceeds maximum depth of {MAX_VALUE_DEPTH}"
                )));
            }
            depth.set(next);
            Ok(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DECODE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Decoding shape of [`Value`]; nested values recurse through
/// `Value::deserialize` and so through the depth guard.
#[derive(Deserialize)]
#[serde(rename = "Value")]
enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(#[serde(deserialize_with = "float_repr::deserialize")] f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Fields),
    Record(Fields),
    Object(Box<Envelope>),
}

impl From<WireValue> for Value {
    fn from(wire: WireValue) -> Self {
        match wire {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(n) => Value::Int(n),
            WireValue::UInt(n) => Value::UInt(n),
            WireValue::Float(f) => Value::Float(f),
            WireValue::Text(s) => Value::Text(s),
            WireValue::Bytes(b) => Value::Bytes(b),
            WireValue::List(items) => Value::List(items),
            WireValue::Map(entries) => Value::Map(entries),
            WireValue::Record(fields) => Value::Record(fields),
            WireValue::Object(envelope) => Value::Object(envelope),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let _depth = DepthGuard::enter::<D::Error>()?;
        WireValue::deserialize(deserializer).map(Value::from)
    }
}

/// Floats in text formats. JSON has no literal for NaN or the infinities,
/// so those travel as the strings `"NaN"`, `"inf"` and `"-inf"`; binary
/// formats keep the raw `f64`.
mod float_repr {
    use super::*;

    const NAN: &str = "NaN";
    const INF: &str = "inf";
    const NEG_INF: &str = "-inf";

    pub(super) fn serialize<S: Serializer>(value: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if value.is_finite() || !serializer.is_human_readable() {
            return serializer.serialize_f64(*value);
        }
        let text = if value.is_nan() {
            NAN
        } else if value.is_sign_positive() {
            INF
        } else {
            NEG_INF
        };
        serializer.serialize_str(text)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_any(FloatVisitor)
        } else {
            f64::deserialize(deserializer)
        }
    }

    struct FloatVisitor;

    impl<'de> Visitor<'de> for FloatVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a number, \"NaN\", \"inf\" or \"-inf\"")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<f64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<f64, E> {
            match v {
                NAN => Ok(f64::NAN),
                INF => Ok(f64::INFINITY),
                NEG_INF => Ok(f64::NEG_INFINITY),
                other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
            }
        }
    }
}

pub(crate) fn type_mismatch(expected: &str, found: &Value) -> ProtocolError {
    ProtocolError::SerializationError(format!(
        "expected {expected}, found {}",
        found.kind()
    ))
}

/// Conversion between a field type and its wire [`Value`].
///
/// Implemented for primitives, `String`, [`Bytes`], `Option`, `Vec`, string
/// keyed maps, [`Value`] itself (raw passthrough) and every type declared
/// with [`crate::wire_struct!`].
pub trait FieldValue: Sized {
    fn to_value(&self) -> Value;

    fn from_value(value: Value, cx: &mut DecodeContext<'_>) -> Result<Self>;
}

macro_rules! unsigned_field {
    ($($ty:ty),*) => {$(
        impl FieldValue for $ty {
            fn to_value(&self) -> Value {
                Value::UInt(*self as u64)
            }

            fn from_value(value: Value, _cx: &mut DecodeContext<'_>) -> Result<Self> {
                match value {
                    Value::UInt(n) => <$ty>::try_from(n)
                        .map_err(|_| ProtocolError::width_mismatch(stringify!($ty), n)),
                    Value::Int(n) => <$ty>::try_from(n)
                        .map_err(|_| ProtocolError::width_mismatch(stringify!($ty), n)),
                    other => Err(type_mismatch(stringify!($ty), &other)),
                }
            }
        }
    )*};
}

macro_rules! signed_field {
    ($($ty:ty),*) => {$(
        impl FieldValue for $ty {
            fn to_value(&self) -> Value {
                Value::Int(*self as i64)
            }

            fn from_value(value: Value, _cx: &mut DecodeContext<'_>) -> Result<Self> {
                match value {
                    Value::Int(n) => <$ty>::try_from(n)
                        .map_err(|_| ProtocolError::width_mismatch(stringify!($ty), n)),
                    Value::UInt(n) => <$ty>::try_from(n)
                        .map_err(|_| ProtocolError::width_mismatch(stringify!($ty), n)),
                    other => Err(type_mismatch(stringify!($ty), &other)),
                }
            }
        }
    )*};
}

unsigned_field!(u8, u16, u32, u64, usize);
signed_field!(i8, i16, i32, i64);

impl FieldValue for f64 {
    fn to_value(&self) -> Value {
        Value::Float(*self)
    }

    fn from_value(value: Value, _cx: &mut DecodeContext<'_>) -> Result<Self> {
        match value {
            Value::Float(f) => Ok(f),
            Value::Int(n) => Ok(n as f64),
            Value::UInt(n) => Ok(n as f64),
            other => Err(type_mismatch("f64", &other)),
        }
    }
}

impl FieldValue for f32 {
    fn to_value(&self) -> Value {
        Value::Float(f64::from(*self))
    }

    fn from_value(value: Value, cx: &mut DecodeContext<'_>) -> Result<Self> {
        let wide = f64::from_value(value, cx)?;
        if wide.is_finite() && wide.abs() > f64::from(f32::MAX) {
            return Err(ProtocolError::width_mismatch("f32", wide));
        }
        Ok(wide as f32)
    }
}

impl FieldValue for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(value: Value, _cx: &mut DecodeContext<'_>) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(type_mismatch("bool", &other)),
        }
    }
}

impl FieldValue for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_value(value: Value, _cx: &mut DecodeContext<'_>) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s),
            other => Err(type_mismatch("text", &other)),
        }
    }
}

impl FieldValue for Bytes {
    fn to_value(&self) -> Value {
        Value::Bytes(self.to_vec())
    }

    fn from_value(value: Value, _cx: &mut DecodeContext<'_>) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(Bytes::from(b)),
            other => Err(type_mismatch("bytes", &other)),
        }
    }
}

impl FieldValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }

    fn from_value(value: Value, _cx: &mut DecodeContext<'_>) -> Result<Self> {
        Ok(value)
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    fn to_value(&self) -> Value {
        match self {
            Some(inner) => inner.to_value(),
            None => Value::Null,
        }
    }

    fn from_value(value: Value, cx: &mut DecodeContext<'_>) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other, cx).map(Some),
        }
    }
}

impl<T: FieldValue> FieldValue for Box<T> {
    fn to_value(&self) -> Value {
        (**self).to_value()
    }

    fn from_value(value: Value, cx: &mut DecodeContext<'_>) -> Result<Self> {
        T::from_value(value, cx).map(Box::new)
    }
}

impl<T: FieldValue> FieldValue for Vec<T> {
    fn to_value(&self) -> Value {
        Value::List(self.iter().map(FieldValue::to_value).collect())
    }

    fn from_value(value: Value, cx: &mut DecodeContext<'_>) -> Result<Self> {
        match value {
            Value::List(items) => items
                .into_iter()
                .map(|item| T::from_value(item, cx))
                .collect(),
            other => Err(type_mismatch("list", &other)),
        }
    }
}

impl<T: FieldValue> FieldValue for BTreeMap<String, T> {
    fn to_value(&self) -> Value {
        Value::Map(
            self.iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect(),
        )
    }

    fn from_value(value: Value, cx: &mut DecodeContext<'_>) -> Result<Self> {
        match value {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| T::from_value(v, cx).map(|v| (k, v)))
                .collect(),
            other => Err(type_mismatch("map", &other)),
        }
    }
}

impl<T: FieldValue> FieldValue for HashMap<String, T> {
    fn to_value(&self) -> Value {
        Value::Map(
            self.iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect(),
        )
    }

    fn from_value(value: Value, cx: &mut DecodeContext<'_>) -> Result<Self> {
        match value {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| T::from_value(v, cx).map(|v| (k, v)))
                .collect(),
            other => Err(type_mismatch("map", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gate::TypeGate;

    #[test]
    fn test_unsigned_narrowing_is_checked() {
        let gate = TypeGate::new();
        let mut cx = DecodeContext::new(&gate);
        assert_eq!(u8::from_value(Value::UInt(255), &mut cx).unwrap(), 255);
        assert!(matches!(
            u8::from_value(Value::UInt(256), &mut cx),
            Err(ProtocolError::FieldWidthMismatch { .. })
        ));
        assert!(matches!(
            u32::from_value(Value::Int(-1), &mut cx),
            Err(ProtocolError::FieldWidthMismatch { .. })
        ));
    }

    #[test]
    fn test_signed_accepts_small_unsigned() {
        let gate = TypeGate::new();
        let mut cx = DecodeContext::new(&gate);
        assert_eq!(i16::from_value(Value::UInt(12), &mut cx).unwrap(), 12);
        assert!(matches!(
            i64::from_value(Value::UInt(u64::MAX), &mut cx),
            Err(ProtocolError::FieldWidthMismatch { .. })
        ));
    }

    #[test]
    fn test_f32_overflow() {
        let gate = TypeGate::new();
        let mut cx = DecodeContext::new(&gate);
        assert!(matches!(
            f32::from_value(Value::Float(1e300), &mut cx),
            Err(ProtocolError::FieldWidthMismatch { .. })
        ));
        assert_eq!(f32::from_value(Value::Float(1.5), &mut cx).unwrap(), 1.5);
    }

    #[test]
    fn test_type_mismatch_is_serialization_error() {
        let gate = TypeGate::new();
        let mut cx = DecodeContext::new(&gate);
        assert!(matches!(
            String::from_value(Value::Bool(true), &mut cx),
            Err(ProtocolError::SerializationError(_))
        ));
    }

    #[test]
    fn test_option_and_collections() {
        let gate = TypeGate::new();
        let mut cx = DecodeContext::new(&gate);
        let none: Option<u8> = Option::from_value(Value::Null, &mut cx).unwrap();
        assert_eq!(none, None);

        let list = vec![1u16, 2, 3];
        let back: Vec<u16> = Vec::from_value(list.to_value(), &mut cx).unwrap();
        assert_eq!(back, list);

        let mut map = BTreeMap::new();
        map.insert("k".to_string(), "v".to_string());
        let back: BTreeMap<String, String> =
            BTreeMap::from_value(map.to_value(), &mut cx).unwrap();
        assert_eq!(back, map);
    }
}
