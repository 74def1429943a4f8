//! Input schema validation.
//!
//! A [`Validator`] inspects a method's raw JSON input before the handler
//! runs. Rejections are logged by the dispatcher and never answered
//! automatically; the handler simply does not run.
//!
//! Two implementations ship with the crate:
//!
//! - [`TypedValidator`] - the input must deserialize into `T`
//! - [`FnValidator`] - an arbitrary closure
//!
//! # Example
//!
//! ```
//! use sockrpc::validate::{TypedValidator, Validator};
//! use serde::Deserialize;
//! use serde_json::json;
//!
//! #[derive(Deserialize)]
//! struct Greet {
//!     name: String,
//! }
//!
//! let validator = TypedValidator::<Greet>::new();
//! assert!(validator.validate(&json!({"name": "ada"})).is_ok());
//! assert!(validator.validate(&json!({"name": 7})).is_err());
//! ```

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    /// JSON pointer-ish location of the offending value ("" for the root).
    pub path: String,
    /// Human readable description.
    pub message: String,
}

impl ValidationError {
    /// Create a new validation error.
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Structured list of validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Error)]
#[serde(transparent)]
#[error("{}", join_errors(.0))]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    /// Errors with a single entry.
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self(vec![ValidationError::new(path, message)])
    }

    /// Number of failures.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no failure was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the failures.
    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    /// Serialize the failures for structured logging or error details.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|err| {
            if err.path.is_empty() {
                err.message.clone()
            } else {
                format!("{}: {}", err.path, err.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Schema-validation capability attached to a method.
pub trait Validator: Send + Sync + 'static {
    /// Validate the raw input, returning the (possibly normalized) value.
    fn validate(&self, input: &Value) -> Result<Value, ValidationErrors>;
}

/// Accepts input that deserializes into `T`.
pub struct TypedValidator<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> TypedValidator<T>
where
    T: DeserializeOwned + 'static,
{
    /// Create a new typed validator.
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for TypedValidator<T>
where
    T: DeserializeOwned + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Validator for TypedValidator<T>
where
    T: DeserializeOwned + 'static,
{
    fn validate(&self, input: &Value) -> Result<Value, ValidationErrors> {
        match T::deserialize(input) {
            Ok(_) => Ok(input.clone()),
            Err(e) => Err(ValidationErrors::single("", e.to_string())),
        }
    }
}

/// Validator backed by a closure.
pub struct FnValidator<F> {
    check: F,
}

impl<F> FnValidator<F>
where
    F: Fn(&Value) -> Result<Value, ValidationErrors> + Send + Sync + 'static,
{
    /// Wrap a closure as a validator.
    pub fn new(check: F) -> Self {
        Self { check }
    }
}

impl<F> Validator for FnValidator<F>
where
    F: Fn(&Value) -> Result<Value, ValidationErrors> + Send + Sync + 'static,
{
    fn validate(&self, input: &Value) -> Result<Value, ValidationErrors> {
        (self.check)(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_typed_accepts_matching_input() {
        let v = TypedValidator::<Point>::new();
        let out = v.validate(&json!({"x": 1, "y": 2})).unwrap();
        assert_eq!(out, json!({"x": 1, "y": 2}));
    }

    #[test]
    fn test_typed_rejects_missing_field() {
        let v = TypedValidator::<Point>::new();
        let err = v.validate(&json!({"x": 1})).unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err.to_string().contains("y"));
    }

    #[test]
    fn test_fn_validator_can_normalize() {
        let v = FnValidator::new(|input: &Value| match input.as_str() {
            Some(s) => Ok(Value::String(s.trim().to_string())),
            None => Err(ValidationErrors::single("", "expected a string")),
        });

        assert_eq!(v.validate(&json!("  hi ")).unwrap(), json!("hi"));
        assert!(v.validate(&json!(3)).is_err());
    }

    #[test]
    fn test_errors_display_and_value() {
        let errs = ValidationErrors(vec![
            ValidationError::new("/a", "required"),
            ValidationError::new("", "bad root"),
        ]);
        assert_eq!(errs.to_string(), "/a: required; bad root");
        assert_eq!(
            errs.to_value(),
            json!([
                {"path": "/a", "message": "required"},
                {"path": "", "message": "bad root"}
            ])
        );
    }
}
