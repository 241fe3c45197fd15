//! Message payloads
//!
//! Structured payloads travel as flat JSON text. Binary payloads (audio) go on
//! the wire untouched.

use serde_json::Value;

use crate::Result;

/// Body of a bus message
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(Value),
    Binary(Vec<u8>),
}

impl Payload {
    /// Bytes put on the wire
    ///
    /// # Errors
    ///
    /// Returns error if a structured payload cannot be serialized
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Self::Text(text) => text.as_bytes().to_vec(),
            Self::Json(value) => serde_json::to_vec(value)?,
            Self::Binary(bytes) => bytes.clone(),
        })
    }

    /// Interpret received bytes
    ///
    /// JSON objects and arrays become `Json`, other UTF-8 becomes `Text`,
    /// anything else stays `Binary`.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Self {
        let Ok(text) = std::str::from_utf8(bytes) else {
            return Self::Binary(bytes.to_vec());
        };

        match serde_json::from_str::<Value>(text) {
            Ok(value @ (Value::Object(_) | Value::Array(_))) => Self::Json(value),
            _ => Self::Text(text.to_string()),
        }
    }

    /// String field of a JSON object payload
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&str> {
        match self {
            Self::Json(value) => value.get(key)?.as_str(),
            _ => None,
        }
    }

    /// Device the message is addressed to: its `uid`, else its `siteId`
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.field("uid")
            .filter(|uid| !uid.is_empty())
            .or_else(|| self.field("siteId").filter(|site| !site.is_empty()))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}
