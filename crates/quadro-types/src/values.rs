//! # Generic Values
//!
//! The variant type that flows in both directions across the bridge, the
//! bounded positional argument list of a remote call, and its result.

use crate::errors::{CallError, MalformedArguments};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of positional arguments a remote call can carry.
pub const MAX_CALL_ARGS: usize = 8;

/// A generic value.
///
/// Serializes to plain JSON (`Empty` is `null`) so notifications can be handed
/// to the web view unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variant {
    /// Absent value.
    #[default]
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Ordered sequence; arrays and multi-value replies arrive as lists.
    List(Vec<Variant>),
    /// String-keyed mapping.
    Map(BTreeMap<String, Variant>),
}

impl Variant {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Variant>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Name of the held kind, for log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Variant {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Variant {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Variant {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<Variant>> for Variant {
    fn from(value: Vec<Variant>) -> Self {
        Self::List(value)
    }
}

impl From<BTreeMap<String, Variant>> for Variant {
    fn from(value: BTreeMap<String, Variant>) -> Self {
        Self::Map(value)
    }
}

impl<T: Into<Variant>> From<Option<T>> for Variant {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Empty, Into::into)
    }
}

/// Ordered positional arguments of a remote call, bounded by [`MAX_CALL_ARGS`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallArguments {
    values: Vec<Variant>,
}

impl CallArguments {
    /// An empty argument list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from any sequence of values, rejecting more than [`MAX_CALL_ARGS`].
    pub fn from_values<I, V>(values: I) -> Result<Self, MalformedArguments>
    where
        I: IntoIterator<Item = V>,
        V: Into<Variant>,
    {
        let values: Vec<Variant> = values.into_iter().map(Into::into).collect();
        if values.len() > MAX_CALL_ARGS {
            return Err(MalformedArguments::TooManyArguments {
                count: values.len(),
                max: MAX_CALL_ARGS,
            });
        }
        Ok(Self { values })
    }

    /// Append one value.
    pub fn push(&mut self, value: impl Into<Variant>) -> Result<(), MalformedArguments> {
        if self.values.len() == MAX_CALL_ARGS {
            return Err(MalformedArguments::TooManyArguments {
                count: MAX_CALL_ARGS + 1,
                max: MAX_CALL_ARGS,
            });
        }
        self.values.push(value.into());
        Ok(())
    }

    /// Builder-style [`CallArguments::push`].
    pub fn with(mut self, value: impl Into<Variant>) -> Result<Self, MalformedArguments> {
        self.push(value)?;
        Ok(self)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Variant] {
        &self.values
    }

    /// Values as they go on the wire.
    ///
    /// Trailing absent values are omitted. An absent value followed by a
    /// present one has no wire representation and is rejected.
    pub fn to_wire(&self) -> Result<Vec<Variant>, MalformedArguments> {
        let present = self
            .values
            .iter()
            .rposition(|v| !v.is_empty())
            .map_or(0, |last| last + 1);

        if let Some(position) = self.values[..present].iter().position(Variant::is_empty) {
            return Err(MalformedArguments::AbsentArgument { position });
        }
        Ok(self.values[..present].to_vec())
    }
}

impl TryFrom<Vec<Variant>> for CallArguments {
    type Error = MalformedArguments;

    fn try_from(values: Vec<Variant>) -> Result<Self, Self::Error> {
        Self::from_values(values)
    }
}

/// Outcome of a remote call: exactly one value or exactly one failure.
#[derive(Debug, Clone, PartialEq)]
pub enum CallResult {
    /// Reply payload; `Variant::Empty` when the method returns nothing.
    Value(Variant),
    Failed(CallError),
}

impl CallResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    #[must_use]
    pub fn value(&self) -> Option<&Variant> {
        match self {
            Self::Value(v) => Some(v),
            Self::Failed(_) => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&CallError> {
        match self {
            Self::Value(_) => None,
            Self::Failed(e) => Some(e),
        }
    }

    /// Convert into a `Result` for use with `?`.
    pub fn into_result(self) -> Result<Variant, CallError> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Failed(e) => Err(e),
        }
    }
}

impl From<Result<Variant, CallError>> for CallResult {
    fn from(result: Result<Variant, CallError>) -> Self {
        match result {
            Ok(v) => Self::Value(v),
            Err(e) => Self::Failed(e),
        }
    }
}
