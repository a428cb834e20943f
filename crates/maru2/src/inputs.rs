//! Resolution of caller-supplied inputs against parameter definitions.

use indexmap::IndexMap;
use maru2_models::{InputParameter, Scalar};
use regex::Regex;
use thiserror::Error;
use tracing::warn;

/// A step's or caller's `with` map.
pub type With = IndexMap<String, serde_yaml::Value>;

/// Errors produced while merging inputs.
#[derive(Debug, Error, PartialEq)]
pub enum InputError {
    /// A required input had no caller value and no default.
    #[error("missing required input `{0}`")]
    Missing(String),

    /// The parameter's default has a type coercion can't target.
    #[error("unsupported default type for input `{0}` (expected bool, string, int, or uint)")]
    UnsupportedDefault(String),

    /// The caller's value can't be coerced to the default's type.
    #[error("cannot coerce input `{input}` to {expected}")]
    Coercion {
        /// The offending input name.
        input: String,
        /// The type the default dictates.
        expected: &'static str,
    },

    /// The effective value doesn't match the parameter's `validate` regex.
    #[error("input `{input}` does not match `{pattern}`")]
    Validation {
        /// The offending input name.
        input: String,
        /// The pattern that was applied.
        pattern: String,
    },

    /// The parameter's `validate` pattern doesn't compile.
    #[error("invalid validation pattern for input `{0}`: {1}")]
    BadPattern(String, String),
}

/// Merges a caller's `with` map against a task's parameter definitions,
/// producing the effective inputs.
pub fn merge(
    caller: &With,
    params: &IndexMap<String, InputParameter>,
) -> Result<With, InputError> {
    let mut effective = caller.clone();

    for (name, param) in params {
        let supplied = effective.contains_key(name);

        if supplied && let Some(message) = &param.deprecated_message {
            warn!("input `{name}` is deprecated: {message}");
        }

        if !supplied {
            if let Some(env_name) = &param.default_from_env
                && let Ok(value) = std::env::var(env_name)
            {
                effective.insert(name.clone(), serde_yaml::Value::String(value));
            } else if let Some(default) = &param.default {
                effective.insert(name.clone(), default.to_value());
            } else if param.is_required() {
                return Err(InputError::Missing(name.clone()));
            }
        } else if let Some(default) = &param.default {
            let coerced = coerce(name, &effective[name], default)?;
            effective.insert(name.clone(), coerced);
        }

        if let Some(pattern) = &param.validate
            && let Some(value) = effective.get(name)
        {
            let regex = Regex::new(pattern)
                .map_err(|e| InputError::BadPattern(name.clone(), e.to_string()))?;
            let text = stringify(value);
            if !regex.is_match(&text) {
                return Err(InputError::Validation {
                    input: name.clone(),
                    pattern: pattern.clone(),
                });
            }
        }
    }

    Ok(effective)
}

/// Coerces a caller-supplied value to the type of the parameter's default.
fn coerce(
    name: &str,
    value: &serde_yaml::Value,
    default: &Scalar,
) -> Result<serde_yaml::Value, InputError> {
    use serde_yaml::Value;

    let coercion = |expected| InputError::Coercion {
        input: name.to_string(),
        expected,
    };

    match default {
        Scalar::Bool(_) => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => s
                .parse::<bool>()
                .map(Value::Bool)
                .map_err(|_| coercion("bool")),
            _ => Err(coercion("bool")),
        },
        Scalar::Int(_) => match value {
            Value::Number(n) if n.is_i64() => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|i| Value::Number(i.into()))
                .map_err(|_| coercion("int")),
            _ => Err(coercion("int")),
        },
        Scalar::Uint(_) => match value {
            Value::Number(n) if n.is_u64() => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<u64>()
                .map(|u| Value::Number(u.into()))
                .map_err(|_| coercion("uint")),
            _ => Err(coercion("uint")),
        },
        Scalar::String(_) => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            _ => Err(coercion("string")),
        },
        Scalar::Float(_) => Err(InputError::UnsupportedDefault(name.to_string())),
    }
}

/// Stringifies an effective value for regex validation and `INPUT_*` env
/// vars.
pub(crate) fn stringify(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Derives the environment-variable form of an input name: `-` becomes
/// `_`, everything uppercased. The runner prefixes `INPUT_` on top.
pub fn to_env_var(name: &str) -> String {
    name.replace('-', "_").to_uppercase()
}
