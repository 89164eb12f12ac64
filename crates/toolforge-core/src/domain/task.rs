//! Incoming task requests and io-type hints.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A request to solve one task. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: Uuid,
    pub description: String,
    /// Argument passed to the tool's entry point. `null` when absent.
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub io: IoSpec,
}

impl TaskRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            args: None,
            io: IoSpec::default(),
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_io(mut self, io: IoSpec) -> Self {
        self.io = io;
        self
    }
}

/// Optional input/output type hints for a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoSpec {
    #[serde(default)]
    pub input_type: Option<IoType>,
    #[serde(default)]
    pub output_type: Option<IoType>,
}

impl IoSpec {
    pub fn new(input_type: Option<IoType>, output_type: Option<IoType>) -> Self {
        Self {
            input_type,
            output_type,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_type.is_none() && self.output_type.is_none()
    }
}

/// Coarse value type used for contracts, search filters, and result checks.
///
/// Parsed leniently from Python annotation text: `List[int]` and
/// `typing.Sequence[float]` are both `List`, `int | float` is `Number`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IoType {
    Int,
    Float,
    Number,
    Str,
    Bool,
    List,
    Dict,
    Any,
    Null,
    Other(String),
}

impl IoType {
    pub fn parse(annotation: &str) -> Self {
        let text: String = annotation.chars().filter(|c| !c.is_whitespace()).collect();
        let text = text.trim_matches(|c| c == '"' || c == '\'');
        let text = text.strip_prefix("typing.").unwrap_or(text);

        if is_number_union(text) {
            return IoType::Number;
        }
        if let Some(inner) = text
            .strip_prefix("Optional[")
            .and_then(|rest| rest.strip_suffix(']'))
        {
            return IoType::parse(inner);
        }

        let base = text.split('[').next().unwrap_or(text);
        match base.to_ascii_lowercase().as_str() {
            "int" | "integer" => IoType::Int,
            "float" | "double" => IoType::Float,
            "number" | "numeric" | "decimal" | "fraction" => IoType::Number,
            "str" | "string" | "text" => IoType::Str,
            "bool" | "boolean" => IoType::Bool,
            "list" | "sequence" | "tuple" | "iterable" | "array" | "set" | "frozenset" => {
                IoType::List
            }
            "dict" | "mapping" | "object" | "map" => IoType::Dict,
            "any" | "generic" | "" => IoType::Any,
            "none" | "null" => IoType::Null,
            other => IoType::Other(other.to_string()),
        }
    }

    /// Whether a value declared as `declared` satisfies an expectation of `self`.
    pub fn accepts(&self, declared: &IoType) -> bool {
        use IoType::*;
        match (self, declared) {
            (Any, _) | (_, Any) => true,
            (Number, Int | Float) | (Int | Float, Number) => true,
            (Float, Int) => true,
            (a, b) => a == b,
        }
    }

    /// Whether a concrete JSON value has this shape.
    pub fn matches_value(&self, value: &Value) -> bool {
        match self {
            IoType::Int => value.is_i64() || value.is_u64(),
            IoType::Float | IoType::Number => value.is_number(),
            IoType::Str => value.is_string(),
            IoType::Bool => value.is_boolean(),
            IoType::List => value.is_array(),
            IoType::Dict => value.is_object(),
            IoType::Null => value.is_null(),
            IoType::Any | IoType::Other(_) => true,
        }
    }
}

fn is_number_union(text: &str) -> bool {
    let members: Vec<&str> = if let Some(inner) = text
        .strip_prefix("Union[")
        .and_then(|rest| rest.strip_suffix(']'))
    {
        inner.split(',').collect()
    } else if text.contains('|') {
        text.split('|').collect()
    } else {
        return false;
    };
    members.len() > 1 && members.iter().all(|m| matches!(*m, "int" | "float"))
}

impl From<String> for IoType {
    fn from(s: String) -> Self {
        IoType::parse(&s)
    }
}

impl From<IoType> for String {
    fn from(t: IoType) -> Self {
        t.to_string()
    }
}

impl fmt::Display for IoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IoType::Int => "int",
            IoType::Float => "float",
            IoType::Number => "number",
            IoType::Str => "str",
            IoType::Bool => "bool",
            IoType::List => "list",
            IoType::Dict => "dict",
            IoType::Any => "any",
            IoType::Null => "none",
            IoType::Other(name) => name,
        };
        f.write_str(s)
    }
}
