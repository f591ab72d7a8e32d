//! Typed property values.
//!
//! Every property declares a [`ValueKind`] at registration time. Candidate
//! values arriving over the wire are checked against that kind with
//! [`ValueKind::coerce`] before any setter runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::PropertyError;

/// Declared type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `true` / `false`
    Boolean,
    /// One of a fixed, ordered set of named states. The integer enumerant is
    /// the index into this slice.
    Enumerant(&'static [&'static str]),
    /// HSB or RGB color record
    Color,
}

/// Color record, either hue/saturation/brightness or an RGB triplet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Color {
    Hsb {
        hue: u8,
        saturation: u8,
        brightness: u8,
    },
    Rgb {
        red: u8,
        green: u8,
        blue: u8,
    },
}

/// Current or candidate value of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyValue {
    Boolean(bool),
    Enumerant { index: u8, name: &'static str },
    Color(Color),
}

impl PropertyValue {
    /// Build an enumerant value from a variant name.
    ///
    /// Returns `None` when `name` is not one of `variants`.
    pub fn enumerant(variants: &'static [&'static str], name: &str) -> Option<Self> {
        variants
            .iter()
            .position(|v| v.eq_ignore_ascii_case(name))
            .and_then(|index| Self::enumerant_at(variants, index))
    }

    /// Build an enumerant value from its integer index.
    pub fn enumerant_at(variants: &'static [&'static str], index: usize) -> Option<Self> {
        let name = variants.get(index)?;
        let index = u8::try_from(index).ok()?;
        Some(PropertyValue::Enumerant { index, name })
    }

    /// Wire representation.
    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::Boolean(b) => Value::Bool(*b),
            PropertyValue::Enumerant { name, .. } => Value::String((*name).to_string()),
            PropertyValue::Color(Color::Hsb {
                hue,
                saturation,
                brightness,
            }) => serde_json::json!({
                "hue": hue,
                "saturation": saturation,
                "brightness": brightness,
            }),
            PropertyValue::Color(Color::Rgb { red, green, blue }) => {
                serde_json::json!({"red": red, "green": green, "blue": blue})
            }
        }
    }

    /// Whether this value has the shape declared by `kind`.
    pub fn is_kind(&self, kind: ValueKind) -> bool {
        match (self, kind) {
            (PropertyValue::Boolean(_), ValueKind::Boolean) => true,
            (PropertyValue::Color(_), ValueKind::Color) => true,
            (PropertyValue::Enumerant { name, .. }, ValueKind::Enumerant(variants)) => {
                variants.contains(name)
            }
            _ => false,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_enumerant(&self) -> Option<&'static str> {
        match self {
            PropertyValue::Enumerant { name, .. } => Some(*name),
            _ => None,
        }
    }

    pub fn as_color(&self) -> Option<Color> {
        match self {
            PropertyValue::Color(color) => Some(*color),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl ValueKind {
    /// Type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            ValueKind::Boolean => "boolean",
            ValueKind::Enumerant(_) => "enumerant",
            ValueKind::Color => "color",
        }
    }

    /// Check a wire value against this kind and convert it.
    ///
    /// Enumerants accept either a variant name (case-insensitive) or the
    /// integer index of the variant.
    pub fn coerce(&self, property: &str, candidate: &Value) -> Result<PropertyValue, PropertyError> {
        let mismatch = || PropertyError::TypeMismatch {
            property: property.to_string(),
            expected: self.type_name(),
            found: candidate.to_string(),
        };

        match *self {
            ValueKind::Boolean => candidate
                .as_bool()
                .map(PropertyValue::Boolean)
                .ok_or_else(mismatch),
            ValueKind::Enumerant(variants) => match candidate {
                Value::String(name) => PropertyValue::enumerant(variants, name),
                Value::Number(n) => n
                    .as_u64()
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(|i| PropertyValue::enumerant_at(variants, i)),
                _ => None,
            }
            .ok_or_else(mismatch),
            ValueKind::Color => serde_json::from_value::<Color>(candidate.clone())
                .map(PropertyValue::Color)
                .map_err(|_| mismatch()),
        }
    }
}
