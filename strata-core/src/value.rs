//! Property types and values
//!
//! Externally supplied values arrive as text ([`RawValue`]) and are coerced to
//! a typed, binary-safe [`InternalValue`] before they reach any item state.

use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, StateError};
use crate::id::{Name, NodeId};

/// Declared type of a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    String,
    Binary,
    Long,
    Double,
    Decimal,
    Date,
    Boolean,
    Name,
    Path,
    Reference,
    WeakReference,
    Uri,
    Undefined,
}

impl PropertyType {
    /// Type name as used in system view documents
    pub fn name(&self) -> &'static str {
        match self {
            PropertyType::String => "String",
            PropertyType::Binary => "Binary",
            PropertyType::Long => "Long",
            PropertyType::Double => "Double",
            PropertyType::Decimal => "Decimal",
            PropertyType::Date => "Date",
            PropertyType::Boolean => "Boolean",
            PropertyType::Name => "Name",
            PropertyType::Path => "Path",
            PropertyType::Reference => "Reference",
            PropertyType::WeakReference => "WeakReference",
            PropertyType::Uri => "URI",
            PropertyType::Undefined => "undefined",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        let ty = match name {
            "String" => PropertyType::String,
            "Binary" => PropertyType::Binary,
            "Long" => PropertyType::Long,
            "Double" => PropertyType::Double,
            "Decimal" => PropertyType::Decimal,
            "Date" => PropertyType::Date,
            "Boolean" => PropertyType::Boolean,
            "Name" => PropertyType::Name,
            "Path" => PropertyType::Path,
            "Reference" => PropertyType::Reference,
            "WeakReference" => PropertyType::WeakReference,
            "URI" => PropertyType::Uri,
            "undefined" | "Undefined" => PropertyType::Undefined,
            other => {
                return Err(StateError::ValueFormat(format!("Unknown property type '{}'", other)));
            }
        };
        Ok(ty)
    }

    /// REFERENCE or WEAKREFERENCE
    pub fn is_reference(&self) -> bool {
        matches!(self, PropertyType::Reference | PropertyType::WeakReference)
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed value held by a property state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InternalValue {
    String(String),
    Binary(Bytes),
    Long(i64),
    Double(f64),
    Decimal(String),
    Date(DateTime<FixedOffset>),
    Boolean(bool),
    Name(Name),
    Path(String),
    Reference(NodeId),
    WeakReference(NodeId),
    Uri(String),
}

impl InternalValue {
    pub fn property_type(&self) -> PropertyType {
        match self {
            InternalValue::String(_) => PropertyType::String,
            InternalValue::Binary(_) => PropertyType::Binary,
            InternalValue::Long(_) => PropertyType::Long,
            InternalValue::Double(_) => PropertyType::Double,
            InternalValue::Decimal(_) => PropertyType::Decimal,
            InternalValue::Date(_) => PropertyType::Date,
            InternalValue::Boolean(_) => PropertyType::Boolean,
            InternalValue::Name(_) => PropertyType::Name,
            InternalValue::Path(_) => PropertyType::Path,
            InternalValue::Reference(_) => PropertyType::Reference,
            InternalValue::WeakReference(_) => PropertyType::WeakReference,
            InternalValue::Uri(_) => PropertyType::Uri,
        }
    }

    /// Target node of a reference value
    pub fn reference_target(&self) -> Option<&NodeId> {
        match self {
            InternalValue::Reference(id) | InternalValue::WeakReference(id) => Some(id),
            _ => None,
        }
    }

    /// Serialized text form (base64 for binaries, RFC 3339 for dates)
    pub fn to_text(&self) -> String {
        match self {
            InternalValue::String(s)
            | InternalValue::Decimal(s)
            | InternalValue::Path(s)
            | InternalValue::Uri(s) => s.clone(),
            InternalValue::Binary(b) => base64::engine::general_purpose::STANDARD.encode(b),
            InternalValue::Long(v) => v.to_string(),
            InternalValue::Double(v) => v.to_string(),
            InternalValue::Date(d) => d.to_rfc3339(),
            InternalValue::Boolean(b) => b.to_string(),
            InternalValue::Name(n) => n.to_string(),
            InternalValue::Reference(id) | InternalValue::WeakReference(id) => id.to_string(),
        }
    }

    /// Convert to `target` through the text form; `Undefined` keeps the value
    pub fn convert(&self, target: PropertyType) -> Result<InternalValue> {
        if target == PropertyType::Undefined || target == self.property_type() {
            return Ok(self.clone());
        }
        RawValue::new(self.to_text()).coerce(target)
    }
}

/// Externally supplied, not yet typed value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawValue(String);

impl RawValue {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Coerce to `target`; `Undefined` is treated as `String`
    pub fn coerce(&self, target: PropertyType) -> Result<InternalValue> {
        let text = self.0.as_str();
        let value = match target {
            PropertyType::String | PropertyType::Undefined => InternalValue::String(text.to_string()),
            PropertyType::Binary => {
                let data = base64::engine::general_purpose::STANDARD
                    .decode(text.trim())
                    .map_err(|e| format_error(text, target, e))?;
                InternalValue::Binary(Bytes::from(data))
            }
            PropertyType::Long => {
                InternalValue::Long(text.trim().parse().map_err(|e| format_error(text, target, e))?)
            }
            PropertyType::Double => {
                InternalValue::Double(text.trim().parse().map_err(|e| format_error(text, target, e))?)
            }
            PropertyType::Decimal => {
                let trimmed = text.trim();
                trimmed
                    .parse::<f64>()
                    .map_err(|e| format_error(text, target, e))?;
                InternalValue::Decimal(trimmed.to_string())
            }
            PropertyType::Date => InternalValue::Date(
                DateTime::parse_from_rfc3339(text.trim()).map_err(|e| format_error(text, target, e))?,
            ),
            PropertyType::Boolean => match text.trim() {
                t if t.eq_ignore_ascii_case("true") => InternalValue::Boolean(true),
                t if t.eq_ignore_ascii_case("false") => InternalValue::Boolean(false),
                _ => return Err(format_error(text, target, "not a boolean")),
            },
            PropertyType::Name => {
                if text.is_empty() || text.contains('/') {
                    return Err(format_error(text, target, "not a valid name"));
                }
                InternalValue::Name(Name::from(text))
            }
            PropertyType::Path => {
                if text.is_empty() {
                    return Err(format_error(text, target, "empty path"));
                }
                InternalValue::Path(text.to_string())
            }
            PropertyType::Reference => InternalValue::Reference(NodeId::parse(text)?),
            PropertyType::WeakReference => InternalValue::WeakReference(NodeId::parse(text)?),
            PropertyType::Uri => {
                if text.chars().any(char::is_whitespace) {
                    return Err(format_error(text, target, "whitespace in URI"));
                }
                InternalValue::Uri(text.to_string())
            }
        };
        Ok(value)
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

fn format_error(text: &str, target: PropertyType, cause: impl fmt::Display) -> StateError {
    StateError::ValueFormat(format!("Cannot convert '{}' to {}: {}", text, target, cause))
}
