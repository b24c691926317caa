use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::context::IterationMeta;
use crate::error::{FuyuzoraError, Result};

/// Runtime value type resolved against during rendering
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(HashMap<String, Value>),
    Lambda(Lambda),
    /// Iteration metadata pushed on the context stack by section iteration.
    /// Never produced by data conversion.
    Iteration(IterationMeta),
}

/// Discriminant-only view of a `Value`, used by resolution hints to check
/// that a cached fast path still applies to the current context object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    Null,
    Bool,
    Integer,
    Float,
    String,
    Array,
    Map,
    Lambda,
    Iteration,
}

/// How a lambda participates in rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LambdaKind {
    /// Receives the section's reconstructed literal block (or an empty string
    /// for a variable tag); its return value is written verbatim.
    Literal,
    /// Receives the section's children rendered to a buffer (or an empty
    /// string for a variable tag); its return value is compiled as a one-off
    /// template and rendered against the current context.
    Interpolated,
}

/// A callable value. Invoked by variable and section tags per its kind.
#[derive(Clone)]
pub struct Lambda {
    kind: LambdaKind,
    f: Arc<dyn Fn(&str) -> String + Send + Sync>,
}

impl Lambda {
    pub fn literal(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            kind: LambdaKind::Literal,
            f: Arc::new(f),
        }
    }

    pub fn interpolated(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            kind: LambdaKind::Interpolated,
            f: Arc::new(f),
        }
    }

    pub fn kind(&self) -> LambdaKind {
        self.kind
    }

    pub fn invoke(&self, input: &str) -> String {
        (self.f)(input)
    }
}

impl fmt::Debug for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lambda").field("kind", &self.kind).finish()
    }
}

impl PartialEq for Lambda {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && Arc::ptr_eq(&self.f, &other.f)
    }
}

impl Value {
    /// Convert a JSON value to a Fuyuzora Value
    pub fn from_json(json: JsonValue) -> Result<Self> {
        match json {
            JsonValue::Null => Ok(Value::Null),
            JsonValue::Bool(b) => Ok(Value::Bool(b)),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float(f))
                } else {
                    Err(FuyuzoraError::TypeError {
                        message: format!("Unrepresentable number: {}", n),
                    })
                }
            }
            JsonValue::String(s) => Ok(Value::String(s)),
            JsonValue::Array(arr) => {
                let values: Result<Vec<Value>> = arr.into_iter().map(Value::from_json).collect();
                Ok(Value::Array(values?))
            }
            JsonValue::Object(obj) => {
                let mut map = HashMap::new();
                for (k, v) in obj {
                    map.insert(k, Value::from_json(v)?);
                }
                Ok(Value::Map(map))
            }
        }
    }

    /// Convert any serializable data through `serde_json`
    pub fn from_serialize<T: Serialize>(data: T) -> Result<Self> {
        let json = serde_json::to_value(data).map_err(|e| FuyuzoraError::TypeError {
            message: format!("Serialization failed: {}", e),
        })?;
        Self::from_json(json)
    }

    /// Truthiness for section rendering: only null, `false` and an empty
    /// array suppress a section.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Array(arr) => !arr.is_empty(),
            _ => true,
        }
    }

    /// Textual form for variable interpolation
    pub fn stringify(&self) -> Result<String> {
        match self {
            Value::Null => Ok(String::new()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Integer(n) => Ok(n.to_string()),
            Value::Float(f) => Ok(f.to_string()),
            Value::String(s) => Ok(s.clone()),
            Value::Array(_) | Value::Map(_) | Value::Lambda(_) | Value::Iteration(_) => {
                Err(FuyuzoraError::TypeError {
                    message: format!("Cannot stringify {}", self.type_name()),
                })
            }
        }
    }

    pub fn shape(&self) -> ValueShape {
        match self {
            Value::Null => ValueShape::Null,
            Value::Bool(_) => ValueShape::Bool,
            Value::Integer(_) => ValueShape::Integer,
            Value::Float(_) => ValueShape::Float,
            Value::String(_) => ValueShape::String,
            Value::Array(_) => ValueShape::Array,
            Value::Map(_) => ValueShape::Map,
            Value::Lambda(_) => ValueShape::Lambda,
            Value::Iteration(_) => ValueShape::Iteration,
        }
    }

    /// Get the type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Lambda(_) => "lambda",
            Value::Iteration(_) => "iteration",
        }
    }
}
