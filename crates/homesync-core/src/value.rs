// ── Typed state values ──

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::catalog::ValueKind;
use crate::error::CoreError;

/// Live value of one state variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Structured(Value),
}

impl StateValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Number(_) => ValueKind::Number,
            Self::Text(_) => ValueKind::String,
            Self::Structured(_) => ValueKind::Structured,
        }
    }

    /// Convert a raw hub state string into a value of `kind`.
    ///
    /// Booleans are `true` only for `"on"`. Structured values that are not
    /// valid JSON become an empty object.
    pub fn from_hub_state(key: &str, raw: &str, kind: ValueKind) -> Result<Self, CoreError> {
        match kind {
            ValueKind::Bool => Ok(Self::Bool(raw == "on")),
            ValueKind::Number => {
                raw.trim()
                    .parse::<f64>()
                    .map(Self::Number)
                    .map_err(|_| CoreError::Conversion {
                        key: key.to_owned(),
                        raw: raw.to_owned(),
                        kind,
                    })
            }
            ValueKind::String => Ok(Self::Text(raw.to_owned())),
            ValueKind::Structured => Ok(Self::Structured(
                serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(Map::new())),
            )),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            Self::Structured(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Structured(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}
