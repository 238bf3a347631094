//! Record adapter turning caller values into string-keyed records.
//!
//! Structs are flattened field by field, honouring `#[serde(rename = "...")]`
//! over the Rust field name. Maps are accepted when their keys are strings.
//! Every other shape is rejected before anything is encoded.

use std::fmt;

use serde::ser::{self, Impossible, Serialize, Serializer};
use serde_json::{Map, Value};

/// Key/value mapping carried by one event, in insertion order.
pub type Record = Map<String, Value>;

/// Errors produced while adapting a value into a [`Record`].
#[derive(Debug)]
pub enum RecordError {
    /// The value is neither a struct nor a string-keyed map
    InvalidShape(String),

    /// A field value could not be converted
    Value {
        field: String,
        source: serde_json::Error,
    },

    /// Error raised by a `Serialize` implementation
    Custom(String),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::InvalidShape(msg) => write!(f, "Invalid record shape: {}", msg),
            RecordError::Value { field, source } => {
                write!(f, "Failed to convert field '{}': {}", field, source)
            }
            RecordError::Custom(msg) => write!(f, "Failed to serialize record: {}", msg),
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordError::Value { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl ser::Error for RecordError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        RecordError::Custom(msg.to_string())
    }
}

/// Convert a serializable value into a [`Record`].
///
/// # Errors
///
/// Returns `RecordError::InvalidShape` for anything other than a struct with
/// named fields or a map with string keys, and `RecordError::Value` when a
/// field value cannot be represented.
///
/// # Example
///
/// ```
/// use fluent_forwarder::record::to_record;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Access {
///     #[serde(rename = "status")]
///     code: u16,
///     path: &'static str,
/// }
///
/// let record = to_record(&Access { code: 200, path: "/" }).unwrap();
/// assert_eq!(record["status"], 200);
/// assert_eq!(record["path"], "/");
/// ```
pub fn to_record<T: Serialize + ?Sized>(value: &T) -> Result<Record, RecordError> {
    value.serialize(RecordSerializer)
}

fn not_a_record(found: &str) -> RecordError {
    RecordError::InvalidShape(format!(
        "expected a struct or a map with string keys, found {}",
        found
    ))
}

fn not_a_string_key(found: &str) -> RecordError {
    RecordError::InvalidShape(format!("map keys must be strings, found {}", found))
}

macro_rules! reject_primitives {
    ($ok:ty, $reject:ident; $($method:ident($ty:ty) => $name:literal),* $(,)?) => {
        $(
            fn $method(self, _value: $ty) -> Result<$ok, RecordError> {
                Err($reject($name))
            }
        )*
    };
}

/// Top-level serializer accepting only record-shaped values.
struct RecordSerializer;

impl Serializer for RecordSerializer {
    type Ok = Record;
    type Error = RecordError;
    type SerializeSeq = Impossible<Record, RecordError>;
    type SerializeTuple = Impossible<Record, RecordError>;
    type SerializeTupleStruct = Impossible<Record, RecordError>;
    type SerializeTupleVariant = Impossible<Record, RecordError>;
    type SerializeMap = RecordBuilder;
    type SerializeStruct = RecordBuilder;
    type SerializeStructVariant = Impossible<Record, RecordError>;

    reject_primitives! {
        Record, not_a_record;
        serialize_bool(bool) => "a boolean",
        serialize_i8(i8) => "an integer",
        serialize_i16(i16) => "an integer",
        serialize_i32(i32) => "an integer",
        serialize_i64(i64) => "an integer",
        serialize_u8(u8) => "an integer",
        serialize_u16(u16) => "an integer",
        serialize_u32(u32) => "an integer",
        serialize_u64(u64) => "an integer",
        serialize_f32(f32) => "a float",
        serialize_f64(f64) => "a float",
        serialize_char(char) => "a character",
        serialize_str(&str) => "a string",
        serialize_bytes(&[u8]) => "bytes",
    }

    fn serialize_none(self) -> Result<Record, RecordError> {
        Err(not_a_record("none"))
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Record, RecordError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Record, RecordError> {
        Err(not_a_record("unit"))
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<Record, RecordError> {
        Err(not_a_record(&format!("unit struct {}", name)))
    }

    fn serialize_unit_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<Record, RecordError> {
        Err(not_a_record(&format!("enum variant {}::{}", name, variant)))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Record, RecordError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _value: &T,
    ) -> Result<Record, RecordError> {
        Err(not_a_record(&format!("enum variant {}::{}", name, variant)))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, RecordError> {
        Err(not_a_record("a sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, RecordError> {
        Err(not_a_record("a tuple"))
    }

    fn serialize_tuple_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, RecordError> {
        Err(not_a_record(&format!("tuple struct {}", name)))
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, RecordError> {
        Err(not_a_record(&format!("enum variant {}::{}", name, variant)))
    }

    fn serialize_map(self, len: Option<usize>) -> Result<Self::SerializeMap, RecordError> {
        Ok(RecordBuilder::with_capacity(len.unwrap_or(0)))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<Self::SerializeStruct, RecordError> {
        Ok(RecordBuilder::with_capacity(len))
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, RecordError> {
        Err(not_a_record(&format!("enum variant {}::{}", name, variant)))
    }
}

/// Collects fields or map entries into a [`Record`].
struct RecordBuilder {
    record: Record,
    pending_key: Option<String>,
}

impl RecordBuilder {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            record: Record::with_capacity(capacity),
            pending_key: None,
        }
    }

    fn insert<T: Serialize + ?Sized>(&mut self, key: String, value: &T) -> Result<(), RecordError> {
        let value = serde_json::to_value(value).map_err(|source| RecordError::Value {
            field: key.clone(),
            source,
        })?;
        self.record.insert(key, value);
        Ok(())
    }
}

impl ser::SerializeMap for RecordBuilder {
    type Ok = Record;
    type Error = RecordError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), RecordError> {
        self.pending_key = Some(key.serialize(KeySerializer)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), RecordError> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| RecordError::Custom("map value serialized before its key".to_string()))?;
        self.insert(key, value)
    }

    fn end(self) -> Result<Record, RecordError> {
        Ok(self.record)
    }
}

impl ser::SerializeStruct for RecordBuilder {
    type Ok = Record;
    type Error = RecordError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), RecordError> {
        self.insert(key.to_string(), value)
    }

    fn end(self) -> Result<Record, RecordError> {
        Ok(self.record)
    }
}

/// Serializer for map keys; only strings (and single characters) pass.
struct KeySerializer;

impl Serializer for KeySerializer {
    type Ok = String;
    type Error = RecordError;
    type SerializeSeq = Impossible<String, RecordError>;
    type SerializeTuple = Impossible<String, RecordError>;
    type SerializeTupleStruct = Impossible<String, RecordError>;
    type SerializeTupleVariant = Impossible<String, RecordError>;
    type SerializeMap = Impossible<String, RecordError>;
    type SerializeStruct = Impossible<String, RecordError>;
    type SerializeStructVariant = Impossible<String, RecordError>;

    reject_primitives! {
        String, not_a_string_key;
        serialize_bool(bool) => "a boolean",
        serialize_i8(i8) => "an integer",
        serialize_i16(i16) => "an integer",
        serialize_i32(i32) => "an integer",
        serialize_i64(i64) => "an integer",
        serialize_u8(u8) => "an integer",
        serialize_u16(u16) => "an integer",
        serialize_u32(u32) => "an integer",
        serialize_u64(u64) => "an integer",
        serialize_f32(f32) => "a float",
        serialize_f64(f64) => "a float",
        serialize_bytes(&[u8]) => "bytes",
    }

    fn serialize_char(self, value: char) -> Result<String, RecordError> {
        Ok(value.to_string())
    }

    fn serialize_str(self, value: &str) -> Result<String, RecordError> {
        Ok(value.to_string())
    }

    fn serialize_none(self) -> Result<String, RecordError> {
        Err(not_a_string_key("none"))
    }

    fn serialize_some<T: Serialize + ?Sized>(self, _value: &T) -> Result<String, RecordError> {
        Err(not_a_string_key("an option"))
    }

    fn serialize_unit(self) -> Result<String, RecordError> {
        Err(not_a_string_key("unit"))
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<String, RecordError> {
        Err(not_a_string_key(&format!("unit struct {}", name)))
    }

    fn serialize_unit_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<String, RecordError> {
        Err(not_a_string_key(&format!("enum variant {}::{}", name, variant)))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<String, RecordError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _value: &T,
    ) -> Result<String, RecordError> {
        Err(not_a_string_key(&format!("enum variant {}::{}", name, variant)))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, RecordError> {
        Err(not_a_string_key("a sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, RecordError> {
        Err(not_a_string_key("a tuple"))
    }

    fn serialize_tuple_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, RecordError> {
        Err(not_a_string_key(&format!("tuple struct {}", name)))
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, RecordError> {
        Err(not_a_string_key(&format!("enum variant {}::{}", name, variant)))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, RecordError> {
        Err(not_a_string_key("a map"))
    }

    fn serialize_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, RecordError> {
        Err(not_a_string_key(&format!("struct {}", name)))
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, RecordError> {
        Err(not_a_string_key(&format!("enum variant {}::{}", name, variant)))
    }
}
