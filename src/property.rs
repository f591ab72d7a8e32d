//! The property table: the single source of truth for exposed device state.
//!
//! Each property is a name, a declared [`ValueKind`], and a getter/setter pair
//! supplied by the surrounding application. The table never touches hardware
//! itself. Membership is fixed once [`PropertyTableBuilder::build`] returns.
//!
//! Cross-property safety rules are expressed as [`Interlock`]s. A write that
//! trips an interlock is not an error: [`PropertyTable::set`] reports
//! [`WriteOutcome::Rejected`] carrying the unchanged current value.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::error::{PropertyError, TableBuildError};
use crate::value::{PropertyValue, ValueKind};

/// Reads the live value of a property.
pub type Getter = Box<dyn Fn() -> PropertyValue + Send>;

/// Applies a candidate value and returns the value actually in effect.
///
/// A setter that cannot apply the candidate (e.g. the hardware did not
/// respond) returns the previous value instead.
pub type Setter = Box<dyn FnMut(PropertyValue) -> PropertyValue + Send>;

struct Property {
    kind: ValueKind,
    getter: Getter,
    setter: Setter,
}

/// A rule that refuses one specific write while another property is in one
/// of a set of states.
///
/// # Example
///
/// ```rust
/// use prontrd::property::Interlock;
/// use prontrd::value::PropertyValue;
///
/// const STATES: &[&str] = &["IDLE", "PRINTING"];
///
/// let interlock = Interlock::new("psu_power", PropertyValue::Boolean(false))
///     .while_in(
///         "printer_state",
///         [PropertyValue::enumerant(STATES, "PRINTING").unwrap()],
///     );
/// assert_eq!(interlock.property(), "psu_power");
/// ```
#[derive(Debug, Clone)]
pub struct Interlock {
    property: String,
    forbidden: PropertyValue,
    condition: String,
    active_when: Vec<PropertyValue>,
}

impl Interlock {
    /// Guard writes of `forbidden` to `property`.
    pub fn new(property: impl Into<String>, forbidden: PropertyValue) -> Self {
        Self {
            property: property.into(),
            forbidden,
            condition: String::new(),
            active_when: Vec::new(),
        }
    }

    /// Engage the interlock while `condition` reads as any of `states`.
    pub fn while_in(
        mut self,
        condition: impl Into<String>,
        states: impl IntoIterator<Item = PropertyValue>,
    ) -> Self {
        self.condition = condition.into();
        self.active_when = states.into_iter().collect();
        self
    }

    /// Guarded property name.
    pub fn property(&self) -> &str {
        &self.property
    }

    /// Property whose state engages the interlock.
    pub fn condition(&self) -> &str {
        &self.condition
    }

    fn guards(&self, property: &str, candidate: &PropertyValue) -> bool {
        self.property == property && self.forbidden == *candidate
    }

    fn engaged_by(&self, condition_value: &PropertyValue) -> bool {
        self.active_when.contains(condition_value)
    }
}

/// Result of a write that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The setter ran; this is the value now in effect.
    Applied(PropertyValue),
    /// An interlock refused the write; `current` is unchanged.
    Rejected {
        current: PropertyValue,
        reason: String,
    },
}

impl WriteOutcome {
    /// The value to report back to the client.
    pub fn value(&self) -> PropertyValue {
        match self {
            WriteOutcome::Applied(value) => *value,
            WriteOutcome::Rejected { current, .. } => *current,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, WriteOutcome::Rejected { .. })
    }
}

/// Named, typed device state with registered accessors.
pub struct PropertyTable {
    properties: BTreeMap<String, Property>,
    interlocks: Vec<Interlock>,
}

impl PropertyTable {
    /// Start assembling a table.
    pub fn builder() -> PropertyTableBuilder {
        PropertyTableBuilder::default()
    }

    /// Whether `name` is a registered property.
    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    /// Registered property names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Declared kind of `name`.
    pub fn kind(&self, name: &str) -> Option<ValueKind> {
        self.properties.get(name).map(|p| p.kind)
    }

    /// Read the current value of `name`.
    pub fn get(&self, name: &str) -> Result<PropertyValue, PropertyError> {
        let property = self
            .properties
            .get(name)
            .ok_or_else(|| PropertyError::NotFound(name.to_string()))?;
        Ok((property.getter)())
    }

    /// Type-check a wire value and write it.
    pub fn set(&mut self, name: &str, candidate: &Value) -> Result<WriteOutcome, PropertyError> {
        let kind = self
            .kind(name)
            .ok_or_else(|| PropertyError::NotFound(name.to_string()))?;
        let candidate = kind.coerce(name, candidate)?;
        self.set_value(name, candidate)
    }

    /// Write an already-typed value.
    ///
    /// Interlocks are checked before the setter runs. A setter that reports a
    /// value other than `candidate` is logged and its result is returned as
    /// [`WriteOutcome::Applied`].
    pub fn set_value(
        &mut self,
        name: &str,
        candidate: PropertyValue,
    ) -> Result<WriteOutcome, PropertyError> {
        let kind = self
            .kind(name)
            .ok_or_else(|| PropertyError::NotFound(name.to_string()))?;
        if !candidate.is_kind(kind) {
            return Err(PropertyError::TypeMismatch {
                property: name.to_string(),
                expected: kind.type_name(),
                found: candidate.to_string(),
            });
        }

        if let Some(reason) = self.interlock_reason(name, &candidate) {
            let current = self.get(name)?;
            return Ok(WriteOutcome::Rejected { current, reason });
        }

        let property = self
            .properties
            .get_mut(name)
            .ok_or_else(|| PropertyError::NotFound(name.to_string()))?;
        let applied = (property.setter)(candidate);

        if applied == candidate {
            debug!(property = name, value = %applied, "Property written");
        } else {
            warn!(
                property = name,
                requested = %candidate,
                actual = %applied,
                "Setter did not apply requested value"
            );
        }

        Ok(WriteOutcome::Applied(applied))
    }

    fn interlock_reason(&self, name: &str, candidate: &PropertyValue) -> Option<String> {
        self.interlocks
            .iter()
            .filter(|interlock| interlock.guards(name, candidate))
            .find_map(|interlock| {
                let state = self.get(interlock.condition()).ok()?;
                interlock.engaged_by(&state).then(|| {
                    format!(
                        "cannot set {} to {} while {} is {}",
                        name,
                        candidate,
                        interlock.condition(),
                        state
                    )
                })
            })
    }
}

impl fmt::Debug for PropertyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyTable")
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .field("interlocks", &self.interlocks)
            .finish()
    }
}

/// Builder for [`PropertyTable`].
#[derive(Default)]
pub struct PropertyTableBuilder {
    properties: BTreeMap<String, Property>,
    interlocks: Vec<Interlock>,
    duplicate: Option<String>,
}

impl PropertyTableBuilder {
    /// Register a property with its accessors.
    pub fn property<G, S>(mut self, name: impl Into<String>, kind: ValueKind, getter: G, setter: S) -> Self
    where
        G: Fn() -> PropertyValue + Send + 'static,
        S: FnMut(PropertyValue) -> PropertyValue + Send + 'static,
    {
        let name = name.into();
        if self.properties.contains_key(&name) {
            self.duplicate.get_or_insert(name);
            return self;
        }
        self.properties.insert(
            name,
            Property {
                kind,
                getter: Box::new(getter),
                setter: Box::new(setter),
            },
        );
        self
    }

    /// Add a cross-property safety rule.
    pub fn interlock(mut self, interlock: Interlock) -> Self {
        self.interlocks.push(interlock);
        self
    }

    /// Freeze the table.
    pub fn build(self) -> Result<PropertyTable, TableBuildError> {
        if let Some(name) = self.duplicate {
            return Err(TableBuildError::DuplicateProperty(name));
        }

        for interlock in &self.interlocks {
            for referenced in [interlock.property(), interlock.condition()] {
                if !self.properties.contains_key(referenced) {
                    return Err(TableBuildError::UnknownInterlockProperty {
                        property: interlock.property().to_string(),
                        missing: referenced.to_string(),
                    });
                }
            }
        }

        Ok(PropertyTable {
            properties: self.properties,
            interlocks: self.interlocks,
        })
    }
}
