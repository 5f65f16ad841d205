//! The native JSON type.
//!
//! JSON documents are carried as text. On the wire they are UTF-16LE in an
//! NVARCHAR(MAX) envelope; the parameter is declared `json` only when the
//! server acknowledged JSON support during login.

use std::fmt;

use crate::error::TypeError;

/// A JSON document as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Json(String);

impl Json {
    /// Wrap JSON text. The text is not validated.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The JSON text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the JSON text.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }

    /// Parse into a [`serde_json::Value`].
    pub fn to_value(&self) -> Result<serde_json::Value, TypeError> {
        serde_json::from_str(&self.0).map_err(|e| TypeError::InvalidJson(e.to_string()))
    }
}

impl From<serde_json::Value> for Json {
    fn from(value: serde_json::Value) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Json {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Json {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for Json {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
