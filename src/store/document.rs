use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};

/// A schemaless record as the store sees it: a flat JSON object.
///
/// Typed records go through [`DocumentCodec`]; the accessors here turn a
/// missing field or a wrong type into `MalformedDocument`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style field setter
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    fn required(&self, field: &str) -> AppResult<&Value> {
        self.0
            .get(field)
            .ok_or_else(|| AppError::MalformedDocument(format!("missing field '{}'", field)))
    }

    fn wrong_type(field: &str, expected: &str) -> AppError {
        AppError::MalformedDocument(format!("field '{}' is not {}", field, expected))
    }

    pub fn str_field(&self, field: &str) -> AppResult<&str> {
        self.required(field)?
            .as_str()
            .ok_or_else(|| Self::wrong_type(field, "a string"))
    }

    /// Missing and `null` both read as `None`
    pub fn opt_str_field(&self, field: &str) -> AppResult<Option<&str>> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_str()
                .map(Some)
                .ok_or_else(|| Self::wrong_type(field, "a string")),
        }
    }

    pub fn f64_field(&self, field: &str) -> AppResult<f64> {
        self.required(field)?
            .as_f64()
            .ok_or_else(|| Self::wrong_type(field, "a number"))
    }

    pub fn u64_field(&self, field: &str) -> AppResult<u64> {
        self.required(field)?
            .as_u64()
            .ok_or_else(|| Self::wrong_type(field, "a non-negative integer"))
    }

    /// RFC 3339 timestamp stored as a string
    pub fn timestamp_field(&self, field: &str) -> AppResult<DateTime<Utc>> {
        let raw = self.str_field(field)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| {
                AppError::MalformedDocument(format!("field '{}' is not a timestamp: {}", field, e))
            })
    }
}

/// Explicit mapping between a typed record and its stored document
pub trait DocumentCodec: Sized {
    fn encode(&self) -> Document;
    fn decode(document: &Document) -> AppResult<Self>;
}

/// Identity codec, for cycles that act on a document without reading it
impl DocumentCodec for Document {
    fn encode(&self) -> Document {
        self.clone()
    }

    fn decode(document: &Document) -> AppResult<Self> {
        Ok(document.clone())
    }
}
