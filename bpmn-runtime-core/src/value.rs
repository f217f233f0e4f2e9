use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

// ─── Value ────────────────────────────────────────────────────

/// A variable value. Closed union; anything outside it travels as
/// `Custom` bytes tagged with a registered codec.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum VariableValue {
    Null,
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Double(f64),
    String(String),
    /// Text past the configured long-string threshold.
    LongString(String),
    Date(DateTime<Utc>),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Custom { type_tag: String, payload: Vec<u8> },
}

/// Type discriminator of a stored value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableType {
    Null,
    Boolean,
    Integer,
    Long,
    Double,
    String,
    LongString,
    Date,
    Bytes,
    Json,
    Custom,
}

impl VariableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableType::Null => "null",
            VariableType::Boolean => "boolean",
            VariableType::Integer => "integer",
            VariableType::Long => "long",
            VariableType::Double => "double",
            VariableType::String => "string",
            VariableType::LongString => "longString",
            VariableType::Date => "date",
            VariableType::Bytes => "bytes",
            VariableType::Json => "json",
            VariableType::Custom => "custom",
        }
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl VariableValue {
    pub fn variable_type(&self) -> VariableType {
        match self {
            VariableValue::Null => VariableType::Null,
            VariableValue::Boolean(_) => VariableType::Boolean,
            VariableValue::Integer(_) => VariableType::Integer,
            VariableValue::Long(_) => VariableType::Long,
            VariableValue::Double(_) => VariableType::Double,
            VariableValue::String(_) => VariableType::String,
            VariableValue::LongString(_) => VariableType::LongString,
            VariableValue::Date(_) => VariableType::Date,
            VariableValue::Bytes(_) => VariableType::Bytes,
            VariableValue::Json(_) => VariableType::Json,
            VariableValue::Custom { .. } => VariableType::Custom,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, VariableValue::Null)
    }

    /// Text content of `String` and `LongString` values.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            VariableValue::String(s) | VariableValue::LongString(s) => Some(s),
            _ => None,
        }
    }

    /// Move text across the long-string boundary in either direction.
    pub fn normalized(self, long_string_threshold: usize) -> Self {
        match self {
            VariableValue::String(s) if s.chars().count() > long_string_threshold => {
                VariableValue::LongString(s)
            }
            VariableValue::LongString(s) if s.chars().count() <= long_string_threshold => {
                VariableValue::String(s)
            }
            other => other,
        }
    }

    /// Encode a serde value as a `Custom` payload under `type_tag`.
    pub fn custom<T: Serialize>(type_tag: &str, value: &T) -> EngineResult<Self> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| EngineError::invalid_argument(format!("encoding '{}': {}", type_tag, e)))?;
        Ok(VariableValue::Custom {
            type_tag: type_tag.to_string(),
            payload,
        })
    }

    /// Decode a `Custom` payload written by [`VariableValue::custom`].
    /// Returns `None` when the value is not a `Custom` with this tag.
    pub fn decode_custom<T: DeserializeOwned>(&self, type_tag: &str) -> Option<T> {
        match self {
            VariableValue::Custom {
                type_tag: tag,
                payload,
            } if tag == type_tag => serde_json::from_slice(payload).ok(),
            _ => None,
        }
    }
}

impl From<bool> for VariableValue {
    fn from(v: bool) -> Self {
        VariableValue::Boolean(v)
    }
}

impl From<i32> for VariableValue {
    fn from(v: i32) -> Self {
        VariableValue::Integer(v)
    }
}

impl From<i64> for VariableValue {
    fn from(v: i64) -> Self {
        VariableValue::Long(v)
    }
}

impl From<f64> for VariableValue {
    fn from(v: f64) -> Self {
        VariableValue::Double(v)
    }
}

impl From<&str> for VariableValue {
    fn from(v: &str) -> Self {
        VariableValue::String(v.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(v: String) -> Self {
        VariableValue::String(v)
    }
}

impl From<Vec<u8>> for VariableValue {
    fn from(v: Vec<u8>) -> Self {
        VariableValue::Bytes(v)
    }
}

impl From<DateTime<Utc>> for VariableValue {
    fn from(v: DateTime<Utc>) -> Self {
        VariableValue::Date(v)
    }
}

impl From<serde_json::Value> for VariableValue {
    fn from(v: serde_json::Value) -> Self {
        VariableValue::Json(v)
    }
}

// ─── Typed reads ──────────────────────────────────────────────

/// Checked conversion out of a stored value.
pub trait FromVariable: Sized {
    /// Name used in `TypeMismatch` errors.
    const EXPECTED: &'static str;

    fn from_variable(value: &VariableValue) -> Option<Self>;
}

impl FromVariable for bool {
    const EXPECTED: &'static str = "boolean";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromVariable for i32 {
    const EXPECTED: &'static str = "integer";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromVariable for i64 {
    const EXPECTED: &'static str = "long";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::Integer(i) => Some(i64::from(*i)),
            VariableValue::Long(l) => Some(*l),
            _ => None,
        }
    }
}

impl FromVariable for f64 {
    const EXPECTED: &'static str = "double";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::Double(d) => Some(*d),
            _ => None,
        }
    }
}

impl FromVariable for String {
    const EXPECTED: &'static str = "string";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        value.as_text().map(str::to_string)
    }
}

impl FromVariable for Vec<u8> {
    const EXPECTED: &'static str = "bytes";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }
}

impl FromVariable for DateTime<Utc> {
    const EXPECTED: &'static str = "date";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::Date(d) => Some(*d),
            _ => None,
        }
    }
}

impl FromVariable for serde_json::Value {
    const EXPECTED: &'static str = "json";

    fn from_variable(value: &VariableValue) -> Option<Self> {
        match value {
            VariableValue::Json(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Convert a looked-up value, mapping an incompatible type to `TypeMismatch`.
/// A stored `Null` reads as absent.
pub fn typed<T: FromVariable>(name: &str, value: Option<VariableValue>) -> EngineResult<Option<T>> {
    match value {
        None | Some(VariableValue::Null) => Ok(None),
        Some(v) => match T::from_variable(&v) {
            Some(t) => Ok(Some(t)),
            None => Err(EngineError::TypeMismatch {
                name: name.to_string(),
                expected: T::EXPECTED,
                actual: v.variable_type(),
            }),
        },
    }
}

// ─── Codecs ───────────────────────────────────────────────────

/// Extension point for `Custom` values, looked up by type tag.
pub trait VariableCodec: Send + Sync {
    fn type_tag(&self) -> &str;

    /// Accept or reject a payload before it is stored.
    fn validate(&self, payload: &[u8]) -> Result<(), String>;
}

/// Codec for any serde type encoded as JSON bytes.
pub struct JsonCodec<T> {
    type_tag: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new(type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> VariableCodec for JsonCodec<T> {
    fn type_tag(&self) -> &str {
        &self.type_tag
    }

    fn validate(&self, payload: &[u8]) -> Result<(), String> {
        serde_json::from_slice::<T>(payload)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Registered codecs keyed by type tag.
#[derive(Default, Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn VariableCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, codec: Arc<dyn VariableCodec>) {
        self.codecs.insert(codec.type_tag().to_string(), codec);
    }

    pub fn with(mut self, codec: Arc<dyn VariableCodec>) -> Self {
        self.register(codec);
        self
    }

    pub fn get(&self, type_tag: &str) -> Option<&Arc<dyn VariableCodec>> {
        self.codecs.get(type_tag)
    }

    /// Check a value about to be written. Only `Custom` values consult the
    /// table; everything else is accepted as-is.
    pub fn check(&self, name: &str, value: &VariableValue) -> EngineResult<()> {
        let VariableValue::Custom { type_tag, payload } = value else {
            return Ok(());
        };
        let codec = self.get(type_tag).ok_or_else(|| {
            EngineError::invalid_argument(format!(
                "no codec registered for type '{}' (variable '{}')",
                type_tag, name
            ))
        })?;
        codec.validate(payload).map_err(|e| {
            EngineError::invalid_argument(format!(
                "variable '{}' rejected by codec '{}': {}",
                name, type_tag, e
            ))
        })
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.codecs.keys().collect();
        tags.sort();
        f.debug_struct("CodecRegistry").field("tags", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Address {
        street: String,
        number: u32,
    }

    #[test]
    fn test_long_string_normalization() {
        let long = "a".repeat(4001);
        let v = VariableValue::from(long.clone()).normalized(4000);
        assert_eq!(v.variable_type(), VariableType::LongString);
        assert_eq!(v.as_text(), Some(long.as_str()));

        let short = VariableValue::LongString("abc".into()).normalized(4000);
        assert_eq!(short, VariableValue::String("abc".into()));
    }

    #[test]
    fn test_typed_read() {
        let v = Some(VariableValue::Integer(7));
        assert_eq!(typed::<i64>("n", v.clone()).unwrap(), Some(7));
        assert_eq!(typed::<i32>("n", v.clone()).unwrap(), Some(7));
        assert_eq!(typed::<String>("n", None).unwrap(), None);
        assert_eq!(typed::<String>("n", Some(VariableValue::Null)).unwrap(), None);

        let err = typed::<bool>("n", v).unwrap_err();
        assert!(matches!(
            err,
            EngineError::TypeMismatch {
                expected: "boolean",
                actual: VariableType::Integer,
                ..
            }
        ));
    }

    #[test]
    fn test_long_string_reads_as_string() {
        let v = Some(VariableValue::LongString("x".repeat(5000)));
        let s = typed::<String>("text", v).unwrap().unwrap();
        assert_eq!(s.len(), 5000);
    }

    #[test]
    fn test_codec_registry_checks_custom_values() {
        let registry =
            CodecRegistry::new().with(Arc::new(JsonCodec::<Address>::new("address")));

        let addr = Address {
            street: "Main".into(),
            number: 12,
        };
        let value = VariableValue::custom("address", &addr).unwrap();
        registry.check("home", &value).unwrap();
        assert_eq!(value.decode_custom::<Address>("address"), Some(addr));

        let bad = VariableValue::Custom {
            type_tag: "address".into(),
            payload: b"{}".to_vec(),
        };
        assert!(matches!(
            registry.check("home", &bad),
            Err(EngineError::InvalidArgument(_))
        ));

        let unknown = VariableValue::Custom {
            type_tag: "money".into(),
            payload: vec![],
        };
        assert!(registry.check("price", &unknown).is_err());
        registry.check("plain", &VariableValue::Long(1)).unwrap();
    }
}
