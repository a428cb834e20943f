//! `${{ ... }}` text templating.
//!
//! Template spans are full expressions, evaluated with the same engine as
//! step conditionals and stringified into the surrounding text. Nested
//! `with` maps and lists are templated recursively.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use indexmap::IndexMap;
use maru2_expressions::{EvalError, Evaluator, Expr, ParseError, Scope, Value};
use thiserror::Error;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// Errors produced while rendering a template.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// A `${{` with no matching `}}`.
    #[error("unterminated `${{{{` at byte {0}")]
    Unterminated(usize),

    /// The span's expression failed to parse.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The span's expression failed to evaluate.
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Registered `which("name")` shortcuts: a concurrent map with put-once
/// semantics.
///
/// The engine owns its registry; [`WhichRegistry::global`] exists for the
/// register-at-init pattern.
#[derive(Debug, Default)]
pub struct WhichRegistry {
    shortcuts: RwLock<HashMap<String, String>>,
}

impl WhichRegistry {
    /// The process-wide default registry.
    pub fn global() -> &'static Arc<WhichRegistry> {
        static GLOBAL: OnceLock<Arc<WhichRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(Default::default)
    }

    /// Registers a shortcut. Returns `false` (and leaves the existing
    /// value alone) when the name is already taken.
    pub fn register(&self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let mut shortcuts = self.shortcuts.write().expect("shortcut lock poisoned");
        match shortcuts.entry(name.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(value.into());
                true
            }
        }
    }

    /// Looks up a registered shortcut.
    pub fn get(&self, name: &str) -> Option<String> {
        self.shortcuts
            .read()
            .expect("shortcut lock poisoned")
            .get(name)
            .cloned()
    }
}

/// Renders every `${{ ... }}` span in `input`.
pub fn render_str(input: &str, scope: &dyn Scope, dry_run: bool) -> Result<String, TemplateError> {
    if !input.contains(OPEN) {
        return Ok(input.to_string());
    }

    let evaluator = Evaluator::new(scope, dry_run);
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    let mut offset = 0;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);

        let span_start = offset + start;
        let inner = &rest[start + OPEN.len()..];
        let Some(end) = inner.find(CLOSE) else {
            return Err(TemplateError::Unterminated(span_start));
        };

        let expr = Expr::parse(inner[..end].trim())?;
        let value = evaluator.evaluate(&expr)?;
        out.push_str(&stringify(&value));

        let consumed = start + OPEN.len() + end + CLOSE.len();
        offset += consumed;
        rest = &rest[consumed..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Renders a YAML value in place: strings are templated, maps and
/// sequences recurse, every other scalar passes through untouched.
pub fn render_value(
    value: &serde_yaml::Value,
    scope: &dyn Scope,
    dry_run: bool,
) -> Result<serde_yaml::Value, TemplateError> {
    match value {
        serde_yaml::Value::String(s) => {
            Ok(serde_yaml::Value::String(render_str(s, scope, dry_run)?))
        }
        serde_yaml::Value::Sequence(items) => Ok(serde_yaml::Value::Sequence(
            items
                .iter()
                .map(|item| render_value(item, scope, dry_run))
                .collect::<Result<_, _>>()?,
        )),
        serde_yaml::Value::Mapping(map) => {
            let mut rendered = serde_yaml::Mapping::with_capacity(map.len());
            for (key, value) in map {
                rendered.insert(key.clone(), render_value(value, scope, dry_run)?);
            }
            Ok(serde_yaml::Value::Mapping(rendered))
        }
        other => Ok(other.clone()),
    }
}

/// Renders a step's `with` map.
pub fn render_with(
    with: &IndexMap<String, serde_yaml::Value>,
    scope: &dyn Scope,
    dry_run: bool,
) -> Result<IndexMap<String, serde_yaml::Value>, TemplateError> {
    with.iter()
        .map(|(key, value)| Ok((key.clone(), render_value(value, scope, dry_run)?)))
        .collect()
}

/// How expression values splice into surrounding text: nil disappears,
/// scalars print bare, and compound values serialize as JSON.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        compound => compound.to_string(),
    }
}
