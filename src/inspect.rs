//! Bounded-depth dehydration of host state for deep inspection.
//!
//! Host values may form cycles (containers are shared `Rc`s). Safety comes
//! from the depth ceiling alone: any container reached at the ceiling turns
//! into [`InspectedValue::MaxDepth`], so recursion always terminates.
//!
//! JSON has no NaN or infinities, so those travel as
//! [`InspectedValue::NonFinite`] instead of a number.

use crate::identity::NodeId;

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

/// Runtime value as handed over by an adapter.
#[derive(Debug, Clone)]
pub enum HostValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Function(String),
    List(Rc<RefCell<Vec<HostValue>>>),
    Object(Rc<RefCell<Vec<(String, HostValue)>>>),
}

impl HostValue {
    pub fn list(items: Vec<HostValue>) -> Self {
        HostValue::List(Rc::new(RefCell::new(items)))
    }

    pub fn object(entries: Vec<(String, HostValue)>) -> Self {
        HostValue::Object(Rc::new(RefCell::new(entries)))
    }
}

impl From<&serde_json::Value> for HostValue {
    fn from(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => HostValue::Null,
            Value::Bool(b) => HostValue::Bool(*b),
            Value::Number(n) => HostValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => HostValue::String(s.clone()),
            Value::Array(items) => HostValue::list(items.iter().map(HostValue::from).collect()),
            Value::Object(map) => HostValue::object(
                map.iter()
                    .map(|(k, v)| (k.clone(), HostValue::from(v)))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InspectedValue {
    Null,
    Bool {
        value: bool,
    },
    Number {
        value: f64,
    },
    NonFinite {
        value: NonFinite,
    },
    String {
        value: String,
    },
    Function {
        name: String,
    },
    List {
        items: Vec<InspectedValue>,
        /// Entries left out past the per-container limit.
        #[serde(default)]
        truncated: usize,
    },
    Object {
        entries: Vec<InspectedEntry>,
        #[serde(default)]
        truncated: usize,
    },
    MaxDepth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonFinite {
    #[serde(rename = "NaN")]
    Nan,
    Infinity,
    #[serde(rename = "-Infinity")]
    NegInfinity,
}

impl NonFinite {
    /// `None` for finite numbers.
    pub fn of(value: f64) -> Option<Self> {
        if value.is_nan() {
            Some(NonFinite::Nan)
        } else if value.is_infinite() {
            Some(if value > 0.0 {
                NonFinite::Infinity
            } else {
                NonFinite::NegInfinity
            })
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectedEntry {
    pub key: String,
    pub value: InspectedValue,
}

/// One answered id of an inspect request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectedNode {
    pub id: NodeId,
    pub data: InspectedValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DehydrateLimits {
    pub max_depth: usize,
    pub max_entries: usize,
}

pub fn dehydrate(value: &HostValue, limits: DehydrateLimits) -> InspectedValue {
    dehydrate_at(value, 0, limits)
}

fn dehydrate_at(value: &HostValue, depth: usize, limits: DehydrateLimits) -> InspectedValue {
    match value {
        HostValue::Null => InspectedValue::Null,
        HostValue::Bool(value) => InspectedValue::Bool { value: *value },
        HostValue::Number(value) => match NonFinite::of(*value) {
            Some(value) => InspectedValue::NonFinite { value },
            None => InspectedValue::Number { value: *value },
        },
        HostValue::String(value) => InspectedValue::String {
            value: value.clone(),
        },
        HostValue::Function(name) => InspectedValue::Function { name: name.clone() },
        HostValue::List(_) | HostValue::Object(_) if depth >= limits.max_depth => {
            InspectedValue::MaxDepth
        }
        HostValue::List(items) => {
            let items = items.borrow();
            InspectedValue::List {
                items: items
                    .iter()
                    .take(limits.max_entries)
                    .map(|v| dehydrate_at(v, depth + 1, limits))
                    .collect(),
                truncated: items.len().saturating_sub(limits.max_entries),
            }
        }
        HostValue::Object(entries) => {
            let entries = entries.borrow();
            InspectedValue::Object {
                entries: entries
                    .iter()
                    .take(limits.max_entries)
                    .map(|(key, v)| InspectedEntry {
                        key: key.clone(),
                        value: dehydrate_at(v, depth + 1, limits),
                    })
                    .collect(),
                truncated: entries.len().saturating_sub(limits.max_entries),
            }
        }
    }
}
