//! Device properties as a single tagged type

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Enumeration(String),
    Command,
    String(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Integer(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v:.2}"),
            PropertyValue::Boolean(v) => write!(f, "{v}"),
            PropertyValue::Enumeration(v) | PropertyValue::String(v) => f.write_str(v),
            PropertyValue::Command => f.write_str("<command>"),
        }
    }
}

/// Value, default and limits of a property, by type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyKind {
    Integer {
        value: i64,
        default: i64,
        min: i64,
        max: i64,
        step: i64,
    },
    Float {
        value: f64,
        default: f64,
        min: f64,
        max: f64,
    },
    Boolean {
        value: bool,
        default: bool,
    },
    Enumeration {
        value: String,
        default: String,
        entries: Vec<String>,
    },
    Command,
    String {
        value: String,
        default: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub kind: PropertyKind,
    pub read_only: bool,
}

impl Property {
    pub fn integer(name: &str, value: i64, min: i64, max: i64, step: i64) -> Self {
        Self::new(
            name,
            PropertyKind::Integer {
                value,
                default: value,
                min,
                max,
                step: step.max(1),
            },
        )
    }

    pub fn float(name: &str, value: f64, min: f64, max: f64) -> Self {
        Self::new(
            name,
            PropertyKind::Float {
                value,
                default: value,
                min,
                max,
            },
        )
    }

    pub fn boolean(name: &str, value: bool) -> Self {
        Self::new(
            name,
            PropertyKind::Boolean {
                value,
                default: value,
            },
        )
    }

    pub fn enumeration(name: &str, value: &str, entries: &[&str]) -> Self {
        Self::new(
            name,
            PropertyKind::Enumeration {
                value: value.to_owned(),
                default: value.to_owned(),
                entries: entries.iter().map(|e| (*e).to_owned()).collect(),
            },
        )
    }

    pub fn command(name: &str) -> Self {
        Self::new(name, PropertyKind::Command)
    }

    pub fn string(name: &str, value: &str) -> Self {
        Self::new(
            name,
            PropertyKind::String {
                value: value.to_owned(),
                default: value.to_owned(),
            },
        )
    }

    fn new(name: &str, kind: PropertyKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn get(&self) -> PropertyValue {
        match &self.kind {
            PropertyKind::Integer { value, .. } => PropertyValue::Integer(*value),
            PropertyKind::Float { value, .. } => PropertyValue::Float(*value),
            PropertyKind::Boolean { value, .. } => PropertyValue::Boolean(*value),
            PropertyKind::Enumeration { value, .. } => PropertyValue::Enumeration(value.clone()),
            PropertyKind::Command => PropertyValue::Command,
            PropertyKind::String { value, .. } => PropertyValue::String(value.clone()),
        }
    }

    pub fn default_value(&self) -> PropertyValue {
        match &self.kind {
            PropertyKind::Integer { default, .. } => PropertyValue::Integer(*default),
            PropertyKind::Float { default, .. } => PropertyValue::Float(*default),
            PropertyKind::Boolean { default, .. } => PropertyValue::Boolean(*default),
            PropertyKind::Enumeration { default, .. } => PropertyValue::Enumeration(default.clone()),
            PropertyKind::Command => PropertyValue::Command,
            PropertyKind::String { default, .. } => PropertyValue::String(default.clone()),
        }
    }

    /// Inclusive limits of numeric properties
    pub fn range(&self) -> Option<(PropertyValue, PropertyValue)> {
        match &self.kind {
            PropertyKind::Integer { min, max, .. } => {
                Some((PropertyValue::Integer(*min), PropertyValue::Integer(*max)))
            }
            PropertyKind::Float { min, max, .. } => {
                Some((PropertyValue::Float(*min), PropertyValue::Float(*max)))
            }
            _ => None,
        }
    }

    /// Checks `new` against type, limits and writability without storing it
    pub fn validate(&self, new: &PropertyValue) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly(self.name.clone()));
        }
        let in_range = match (&self.kind, new) {
            (PropertyKind::Integer { min, max, step, .. }, PropertyValue::Integer(v)) => {
                (*min..=*max).contains(v) && (*step <= 0 || (v - min) % step == 0)
            }
            (PropertyKind::Float { min, max, .. }, PropertyValue::Float(v)) => *v >= *min && *v <= *max,
            (PropertyKind::Boolean { .. }, PropertyValue::Boolean(_)) => true,
            (PropertyKind::Enumeration { entries, .. }, PropertyValue::Enumeration(v)) => {
                entries.iter().any(|e| e == v)
            }
            (PropertyKind::Command, PropertyValue::Command) => true,
            (PropertyKind::String { .. }, PropertyValue::String(_)) => true,
            _ => false,
        };
        if in_range {
            Ok(())
        } else {
            Err(Error::OutOfRange(self.name.clone()))
        }
    }

    pub fn set(&mut self, new: PropertyValue) -> Result<()> {
        self.validate(&new)?;
        match (&mut self.kind, new) {
            (PropertyKind::Integer { value, .. }, PropertyValue::Integer(v)) => *value = v,
            (PropertyKind::Float { value, .. }, PropertyValue::Float(v)) => *value = v,
            (PropertyKind::Boolean { value, .. }, PropertyValue::Boolean(v)) => *value = v,
            (PropertyKind::Enumeration { value, .. }, PropertyValue::Enumeration(v)) => *value = v,
            (PropertyKind::String { value, .. }, PropertyValue::String(v)) => *value = v,
            _ => {}
        }
        Ok(())
    }
}

/// Finds `name` in `properties`
pub fn find_property<'a>(properties: &'a mut [Property], name: &str) -> Result<&'a mut Property> {
    properties
        .iter_mut()
        .find(|p| p.name == name)
        .ok_or_else(|| Error::UnknownProperty(name.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_set_honors_range_and_step() {
        let mut p = Property::integer("Gain", 10, 0, 100, 5);
        assert!(p.set(PropertyValue::Integer(35)).is_ok());
        assert_eq!(p.get(), PropertyValue::Integer(35));
        assert!(matches!(p.set(PropertyValue::Integer(36)), Err(Error::OutOfRange(_))));
        assert!(matches!(p.set(PropertyValue::Integer(105)), Err(Error::OutOfRange(_))));
        assert_eq!(p.default_value(), PropertyValue::Integer(10));
    }

    #[test]
    fn read_only_rejects_set() {
        let mut p = Property::integer("SensorWidth", 2592, 2592, 2592, 1).read_only();
        assert!(matches!(p.set(PropertyValue::Integer(2592)), Err(Error::ReadOnly(_))));
    }

    #[test]
    fn type_mismatch_is_out_of_range() {
        let mut p = Property::enumeration("Mode", "a", &["a", "b"]);
        assert!(p.set(PropertyValue::Boolean(true)).is_err());
        assert!(p.set(PropertyValue::Enumeration("b".into())).is_ok());
        assert!(p.range().is_none());
    }
}
