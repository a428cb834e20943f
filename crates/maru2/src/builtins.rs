//! The builtins registry: `builtin:<name>` step references.
//!
//! Each builtin binds a rendered `with` map into a typed request with
//! weakly-typed scalar coercion, and returns untyped outputs for later
//! steps to consume via `from(...)`.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use thiserror::Error;

use crate::engine::StepOutputs;
use crate::inputs::With;

mod echo;
mod fetch;

/// Errors produced by builtin lookup, binding, and execution.
#[derive(Debug, Error)]
pub enum BuiltinError {
    /// No builtin registered under the given name.
    #[error("unknown builtin `{0}`")]
    NotFound(String),

    /// A required `with` key is absent.
    #[error("builtin `{builtin}` is missing required key `{key}`")]
    MissingKey {
        /// The builtin being invoked.
        builtin: String,
        /// The absent key.
        key: String,
    },

    /// A `with` key the builtin doesn't declare.
    #[error("builtin `{builtin}` does not accept key `{key}`")]
    UnknownKey {
        /// The builtin being invoked.
        builtin: String,
        /// The offending key.
        key: String,
    },

    /// The rendered `with` map doesn't bind into the typed request.
    #[error("cannot bind `with` into builtin `{builtin}`: {message}")]
    Binding {
        /// The builtin being invoked.
        builtin: String,
        /// serde's complaint.
        message: String,
    },

    /// The builtin itself failed.
    #[error("builtin `{0}` failed")]
    Execution(String, #[source] anyhow::Error),
}

/// A single builtin operation.
#[async_trait]
pub trait Builtin: Send + Sync {
    /// `with` keys that must be present.
    fn required(&self) -> &'static [&'static str];

    /// `with` keys that may be present.
    fn optional(&self) -> &'static [&'static str] {
        &[]
    }

    /// Executes against a fully-rendered `with` map.
    async fn execute(&self, with: &With) -> anyhow::Result<StepOutputs>;
}

/// A name → builtin table.
///
/// The engine owns a registry; [`Registry::default_builtins`] is the stock
/// set, and callers may register their own on top.
pub struct Registry {
    builtins: IndexMap<&'static str, Box<dyn Builtin>>,
}

impl Registry {
    fn empty() -> Self {
        Self {
            builtins: Default::default(),
        }
    }

    /// Constructs a registry with all stock builtins registered.
    pub fn default_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("echo", Box::new(echo::Echo));
        registry.register("fetch", Box::new(fetch::Fetch));
        registry
    }

    /// Registers (or replaces) a builtin.
    pub fn register(&mut self, name: &'static str, builtin: Box<dyn Builtin>) {
        self.builtins.insert(name, builtin);
    }

    /// Statically checks that a step's `with` keys bind into the named
    /// builtin: every required key present, no undeclared keys.
    ///
    /// This runs against the *unrendered* map during workflow validation,
    /// so values aren't inspected, only keys.
    pub fn validate(&self, name: &str, with: &With) -> Result<(), BuiltinError> {
        let builtin = self
            .builtins
            .get(name)
            .ok_or_else(|| BuiltinError::NotFound(name.to_string()))?;

        for key in builtin.required() {
            if !with.contains_key(*key) {
                return Err(BuiltinError::MissingKey {
                    builtin: name.to_string(),
                    key: (*key).to_string(),
                });
            }
        }

        for key in with.keys() {
            if !builtin.required().contains(&key.as_str())
                && !builtin.optional().contains(&key.as_str())
            {
                return Err(BuiltinError::UnknownKey {
                    builtin: name.to_string(),
                    key: key.clone(),
                });
            }
        }

        Ok(())
    }

    /// Executes a builtin against a rendered `with` map.
    ///
    /// In dry-run mode the rendered map is printed and nothing executes.
    pub async fn execute(
        &self,
        name: &str,
        with: &With,
        dry_run: bool,
    ) -> Result<Option<StepOutputs>, BuiltinError> {
        let builtin = self
            .builtins
            .get(name)
            .ok_or_else(|| BuiltinError::NotFound(name.to_string()))?;

        if dry_run {
            let rendered = serde_yaml::to_string(with).unwrap_or_default();
            anstream::println!("builtin:{name}");
            for line in rendered.trim_end().lines() {
                anstream::println!("  {line}");
            }
            return Ok(None);
        }

        builtin
            .execute(with)
            .await
            .map(Some)
            .map_err(|e| BuiltinError::Execution(name.to_string(), e))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("builtins", &self.builtins.len())
            .finish()
    }
}

/// Binds a rendered `with` map into a typed request.
pub(crate) fn bind<T: DeserializeOwned>(
    builtin: &'static str,
    with: &With,
) -> Result<T, BuiltinError> {
    let binding_error = |message: String| BuiltinError::Binding {
        builtin: builtin.to_string(),
        message,
    };

    let value = serde_json::to_value(with).map_err(|e| binding_error(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| binding_error(e.to_string()))
}

/// Weak scalar coercion for string-typed request fields: YAML numbers and
/// booleans stringify instead of failing the bind.
pub(crate) fn coerce_string<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Weak {
        String(String),
        Number(serde_json::Number),
        Bool(bool),
    }

    Ok(match Weak::deserialize(de)? {
        Weak::String(s) => s,
        Weak::Number(n) => n.to_string(),
        Weak::Bool(b) => b.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn with(pairs: &[(&str, serde_yaml::Value)]) -> With {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn validate_checks_key_structure() {
        let registry = Registry::default_builtins();

        assert!(registry
            .validate("echo", &with(&[("text", "hi".into())]))
            .is_ok());

        assert!(matches!(
            registry.validate("echo", &With::new()),
            Err(BuiltinError::MissingKey { key, .. }) if key == "text"
        ));

        assert!(matches!(
            registry.validate(
                "echo",
                &with(&[("text", "hi".into()), ("volume", "11".into())])
            ),
            Err(BuiltinError::UnknownKey { key, .. }) if key == "volume"
        ));

        assert!(matches!(
            registry.validate("nope", &With::new()),
            Err(BuiltinError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn echo_roundtrips_text() {
        let registry = Registry::default_builtins();

        let outputs = registry
            .execute("echo", &with(&[("text", "hello".into())]), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outputs["text"], json!("hello"));

        // Weak coercion: a YAML number binds into the string field.
        let outputs = registry
            .execute("echo", &with(&[("text", 42.into())]), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outputs["text"], json!("42"));
    }

    #[tokio::test]
    async fn dry_run_executes_nothing() {
        let registry = Registry::default_builtins();
        let outputs = registry
            .execute("echo", &with(&[("text", "hello".into())]), true)
            .await
            .unwrap();
        assert_eq!(outputs, None);
    }
}
