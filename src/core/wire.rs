//! # Typed Wire Objects
//!
//! Explicit per-type encode/decode registration. A type becomes sendable by
//! implementing [`Wire`]: a stable type key plus field-by-field conversion
//! to and from a [`Value::Record`]. The [`wire_struct!`](crate::wire_struct)
//! macro derives both at compile time.
//!
//! Decoding goes through a [`DecodeContext`], which carries the type gate so
//! that every nested object is checked against the allow/deny sets *before*
//! its record is turned into a typed value.
//!
//! ```rust
//! use peerwire::core::envelope::Envelope;
//! use peerwire::core::gate::TypeGate;
//! use peerwire::wire_struct;
//!
//! wire_struct! {
//!     #[derive(Debug, Clone, PartialEq, Default)]
//!     pub struct Ping = "demo.Ping" {
//!         pub seq: u32,
//!     }
//! }
//!
//! let gate = TypeGate::new().allow_type::<Ping>();
//! let envelope = Envelope::wrap(&Ping { seq: 7 });
//! let (ping, field_errors) = envelope.unwrap::<Ping>(&gate).unwrap();
//! assert_eq!(ping.seq, 7);
//! assert!(field_errors.is_empty());
//! ```

use crate::core::envelope::Envelope;
use crate::core::gate::TypeGate;
use crate::core::value::{type_mismatch, FieldValue, Fields, Value};
use crate::error::{constants, ProtocolError, Result};

/// Maximum nesting of [`Value::Object`] fields accepted while decoding.
pub const MAX_OBJECT_DEPTH: usize = 64;

/// A type with a stable wire identity.
pub trait Wire: FieldValue + Send + 'static {
    /// Stable string naming the concrete payload type.
    const TYPE_KEY: &'static str;

    /// Encode the fields of `self` as a [`Value::Record`].
    fn to_record(&self) -> Value;

    /// Rebuild `Self` from a record. Callers must have checked the gate.
    fn from_record(value: Value, cx: &mut DecodeContext<'_>) -> Result<Self>;
}

/// Decoding state: the gate, current nesting depth and recoverable field errors.
pub struct DecodeContext<'a> {
    gate: &'a TypeGate,
    depth: usize,
    field_errors: Vec<ProtocolError>,
}

impl<'a> DecodeContext<'a> {
    pub fn new(gate: &'a TypeGate) -> Self {
        Self {
            gate,
            depth: 0,
            field_errors: Vec::new(),
        }
    }

    pub fn gate(&self) -> &TypeGate {
        self.gate
    }

    /// Gate-check `envelope` and decode it as `T`.
    pub fn decode<T: Wire>(&mut self, envelope: Envelope) -> Result<T> {
        self.gate.check(&envelope.type_key)?;
        if envelope.type_key != T::TYPE_KEY {
            return Err(ProtocolError::SerializationError(format!(
                "type key '{}' does not match expected '{}'",
                envelope.type_key,
                T::TYPE_KEY
            )));
        }
        if self.depth >= MAX_OBJECT_DEPTH {
            return Err(ProtocolError::SerializationError(
                constants::ERR_NESTING_TOO_DEEP.to_string(),
            ));
        }

        self.depth += 1;
        let decoded = T::from_record(envelope.value, self);
        self.depth -= 1;
        decoded
    }

    /// Decode a nested [`Value::Object`] field.
    pub fn object<T: Wire>(&mut self, value: Value) -> Result<T> {
        match value {
            Value::Object(envelope) => self.decode(*envelope),
            other => Err(type_mismatch(T::TYPE_KEY, &other)),
        }
    }

    /// Unpack the field map of a record belonging to `type_key`.
    pub fn expect_record(&mut self, value: Value, type_key: &str) -> Result<Fields> {
        match value {
            Value::Record(fields) => Ok(fields),
            other => Err(ProtocolError::SerializationError(format!(
                "expected record for '{type_key}', found {}",
                other.kind()
            ))),
        }
    }

    /// Take one field out of a record.
    ///
    /// A numeric width mismatch is recorded and the field falls back to its
    /// default; every other error aborts the whole object.
    pub fn field<T: FieldValue + Default>(&mut self, fields: &mut Fields, name: &str) -> Result<T> {
        let value = fields.remove(name).unwrap_or(Value::Null);
        match T::from_value(value, self) {
            Ok(v) => Ok(v),
            Err(ProtocolError::FieldWidthMismatch { target, value, .. }) => {
                self.field_errors.push(ProtocolError::FieldWidthMismatch {
                    field: name.to_string(),
                    target,
                    value,
                });
                Ok(T::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Recoverable errors collected so far.
    pub fn into_field_errors(self) -> Vec<ProtocolError> {
        self.field_errors
    }
}

/// Encode a [`Wire`] value as a nested object field.
pub fn object_value<T: Wire>(value: &T) -> Value {
    Value::Object(Box::new(Envelope::wrap(value)))
}

/// Declare a struct together with its [`Wire`] and [`FieldValue`] impls.
///
/// Every field type must implement [`FieldValue`] and `Default` (the default
/// is used when a wire number does not fit the field).
#[macro_export]
macro_rules! wire_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident = $key:literal {
            $(
                $(#[$field_meta:meta])*
                $field_vis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$field_meta])*
                $field_vis $field: $ty,
            )*
        }

        impl $crate::core::wire::Wire for $name {
            const TYPE_KEY: &'static str = $key;

            #[allow(unused_mut)]
            fn to_record(&self) -> $crate::core::value::Value {
                let mut fields = $crate::core::value::Fields::new();
                $(
                    fields.insert(
                        ::std::string::String::from(stringify!($field)),
                        $crate::core::value::FieldValue::to_value(&self.$field),
                    );
                )*
                $crate::core::value::Value::Record(fields)
            }

            #[allow(unused_mut, unused_variables)]
            fn from_record(
                value: $crate::core::value::Value,
                cx: &mut $crate::core::wire::DecodeContext<'_>,
            ) -> $crate::error::Result<Self> {
                let mut fields = cx.expect_record(value, $key)?;
                Ok(Self {
                    $( $field: cx.field(&mut fields, stringify!($field))?, )*
                })
            }
        }

        impl $crate::core::value::FieldValue for $name {
            fn to_value(&self) -> $crate::core::value::Value {
                $crate::core::wire::object_value(self)
            }

            fn from_value(
                value: $crate::core::value::Value,
                cx: &mut $crate::core::wire::DecodeContext<'_>,
            ) -> $crate::error::Result<Self> {
                cx.object::<Self>(value)
            }
        }
    };
}
