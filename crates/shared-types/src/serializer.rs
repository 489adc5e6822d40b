//! # Serialization Adapter
//!
//! One immutable set of codec options used for both publish and consume, so
//! that a round trip is lossless for every registered event type.
//!
//! Rust field names are snake_case; the naming policy rewrites struct field
//! names on the way out and maps them back on the way in. Map keys are data
//! and are never renamed, and null omission only drops `None` struct fields.
//! Keys are emitted in sorted order, which makes encoding deterministic for a
//! given input and configuration.

mod field_keys;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Errors raised while converting events to and from wire payloads.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// The event could not be encoded.
    #[error("Failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    /// The payload could not be decoded into the requested type.
    #[error("Failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// The payload is not valid UTF-8 text.
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// Naming convention applied to struct field names on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamingPolicy {
    /// Keys are written exactly as the Rust field names.
    #[default]
    AsIs,
    /// `order_id` -> `orderId`
    CamelCase,
    /// `order_id` -> `OrderId`
    PascalCase,
    /// `orderId` / `OrderId` -> `order_id`
    SnakeCase,
}

impl NamingPolicy {
    fn encode_key(self, key: &str) -> String {
        match self {
            Self::AsIs => key.to_string(),
            Self::CamelCase => to_camel_case(key, false),
            Self::PascalCase => to_camel_case(key, true),
            Self::SnakeCase => to_snake_case(key),
        }
    }

    fn decode_key(self, key: &str) -> String {
        match self {
            Self::AsIs => key.to_string(),
            Self::CamelCase | Self::PascalCase | Self::SnakeCase => to_snake_case(key),
        }
    }
}

impl fmt::Display for NamingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AsIs => "as-is",
            Self::CamelCase => "camel",
            Self::PascalCase => "pascal",
            Self::SnakeCase => "snake",
        };
        f.write_str(name)
    }
}

/// Unknown naming policy name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown naming policy: {0} (expected as-is, camel, pascal or snake)")]
pub struct ParseNamingPolicyError(pub String);

impl FromStr for NamingPolicy {
    type Err = ParseNamingPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "as-is" | "asis" | "none" => Ok(Self::AsIs),
            "camel" | "camelcase" => Ok(Self::CamelCase),
            "pascal" | "pascalcase" => Ok(Self::PascalCase),
            "snake" | "snakecase" | "snake_case" => Ok(Self::SnakeCase),
            other => Err(ParseNamingPolicyError(other.to_string())),
        }
    }
}

/// Codec options shared by every encode and decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SerializerOptions {
    /// Naming convention for struct field names.
    pub naming: NamingPolicy,
    /// Drop struct fields whose value is `null`.
    pub omit_nulls: bool,
    /// Escape every non-ASCII character as `\uXXXX`.
    pub escape_non_ascii: bool,
}

/// Encodes and decodes integration events with a fixed set of options.
///
/// Cloning is cheap; clones share the same options.
#[derive(Debug, Clone, Default)]
pub struct EventSerializer {
    options: Arc<SerializerOptions>,
}

impl EventSerializer {
    /// Create a serializer with the given options.
    #[must_use]
    pub fn new(options: SerializerOptions) -> Self {
        Self {
            options: Arc::new(options),
        }
    }

    /// Options in use.
    #[must_use]
    pub fn options(&self) -> &SerializerOptions {
        &self.options
    }

    /// Encode a value into a UTF-8 JSON payload.
    pub fn serialize<T: Serialize + DeserializeOwned>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        let mut tree = serde_json::to_value(value).map_err(SerializationError::Encode)?;

        let SerializerOptions {
            naming, omit_nulls, ..
        } = *self.options;
        if naming != NamingPolicy::AsIs || omit_nulls {
            let plan = field_keys::plan::<T>(&tree, naming).map_err(SerializationError::Encode)?;
            tree = plan.apply(tree, omit_nulls);
        }

        let text = serde_json::to_string(&tree).map_err(SerializationError::Encode)?;
        let text = if self.options.escape_non_ascii {
            escape_non_ascii(&text)
        } else {
            text
        };

        Ok(text.into_bytes())
    }

    /// Decode a payload produced with the same options.
    pub fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, SerializationError> {
        let text = std::str::from_utf8(payload)?;
        let tree: Value = serde_json::from_str(text).map_err(SerializationError::Decode)?;

        match self.options.naming {
            NamingPolicy::AsIs => serde_json::from_value(tree),
            naming => field_keys::decode(&tree, naming),
        }
        .map_err(SerializationError::Decode)
    }
}

// Non-ASCII characters only ever occur inside JSON strings, so escaping them
// in place keeps the document valid.
fn escape_non_ascii(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut units = [0u16; 2];
    for c in text.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

fn to_camel_case(key: &str, upper_first: bool) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = upper_first;
    for c in key.chars() {
        if c == '_' {
            upper_next = !out.is_empty() || upper_first;
            continue;
        }
        if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
