//! Semantic validation for parsed workflows.
//!
//! Structural problems (bad YAML, non-scalar `env` values) are caught at
//! deserialization; everything here is about rules serde can't express:
//! identifier patterns, run/uses exclusivity, forbidden env keys.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::{Task, Workflow};

/// The pattern input names, `with` keys, step ids, and env-var names must
/// match.
pub static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap()
});

/// The pattern task names must match. Task names additionally allow `-`,
/// which is conventional for CLI-facing names.
pub static TASK_NAME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_-]*$").unwrap()
});

/// A semantic-validation failure, naming the offending location.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A task name doesn't match [`TASK_NAME`].
    #[error("invalid task name `{0}`")]
    TaskName(String),

    /// An input name doesn't match [`IDENTIFIER`].
    #[error("invalid input name `{name}` in `{scope}`")]
    InputName {
        /// The offending input name.
        name: String,
        /// The task (or `workflow`) declaring it.
        scope: String,
    },

    /// A step has both `run` and `uses`, or neither.
    #[error("task `{task}` step {index} must have exactly one of `run` or `uses`")]
    StepBody {
        /// The containing task.
        task: String,
        /// The step index within the task.
        index: usize,
    },

    /// A `with` key doesn't match [`IDENTIFIER`].
    #[error("task `{task}` step {index} has invalid `with` key `{key}`")]
    WithKey {
        /// The containing task.
        task: String,
        /// The step index within the task.
        index: usize,
        /// The offending key.
        key: String,
    },

    /// A step `env` entry sets `PWD` (any casing).
    #[error("task `{task}` step {index} must not set `PWD`")]
    ForbiddenEnv {
        /// The containing task.
        task: String,
        /// The step index within the task.
        index: usize,
    },

    /// A step `env` key doesn't match [`IDENTIFIER`].
    #[error("task `{task}` step {index} has invalid env key `{key}`")]
    EnvKey {
        /// The containing task.
        task: String,
        /// The step index within the task.
        index: usize,
        /// The offending key.
        key: String,
    },

    /// A step id doesn't match [`IDENTIFIER`].
    #[error("task `{task}` step {index} has invalid id `{id}`")]
    StepId {
        /// The containing task.
        task: String,
        /// The step index within the task.
        index: usize,
        /// The offending id.
        id: String,
    },

    /// An input declares both `default` and `default-from-env`.
    #[error("input `{name}` in `{scope}` declares both `default` and `default-from-env`")]
    ConflictingDefaults {
        /// The offending input name.
        name: String,
        /// The task (or `workflow`) declaring it.
        scope: String,
    },

    /// An input's `default-from-env` doesn't name a valid env var.
    #[error("input `{name}` in `{scope}` has invalid `default-from-env` `{env}`")]
    DefaultFromEnv {
        /// The offending input name.
        name: String,
        /// The task (or `workflow`) declaring it.
        scope: String,
        /// The offending env-var name.
        env: String,
    },

    /// An alias's `token-from-env` doesn't name a valid env var.
    #[error("alias `{alias}` has invalid `token-from-env` `{env}`")]
    TokenFromEnv {
        /// The offending alias name.
        alias: String,
        /// The offending env-var name.
        env: String,
    },
}

/// Validates a parsed workflow against the semantic rules above.
pub fn validate(wf: &Workflow) -> Result<(), ValidationError> {
    validate_inputs("workflow", &wf.inputs)?;

    for (alias, def) in &wf.aliases {
        if let Some(env) = &def.token_from_env
            && !IDENTIFIER.is_match(env)
        {
            return Err(ValidationError::TokenFromEnv {
                alias: alias.clone(),
                env: env.clone(),
            });
        }
    }

    for (name, task) in &wf.tasks {
        if !TASK_NAME.is_match(name) {
            return Err(ValidationError::TaskName(name.clone()));
        }
        validate_task(name, task)?;
    }

    Ok(())
}

fn validate_task(name: &str, task: &Task) -> Result<(), ValidationError> {
    validate_inputs(name, &task.inputs)?;

    for (index, step) in task.steps.iter().enumerate() {
        if step.body().is_none() {
            return Err(ValidationError::StepBody {
                task: name.into(),
                index,
            });
        }

        for key in step.with.keys() {
            if !IDENTIFIER.is_match(key) {
                return Err(ValidationError::WithKey {
                    task: name.into(),
                    index,
                    key: key.clone(),
                });
            }
        }

        for key in step.env.keys() {
            if key.eq_ignore_ascii_case("PWD") {
                return Err(ValidationError::ForbiddenEnv {
                    task: name.into(),
                    index,
                });
            }
            if !IDENTIFIER.is_match(key) {
                return Err(ValidationError::EnvKey {
                    task: name.into(),
                    index,
                    key: key.clone(),
                });
            }
        }

        if let Some(id) = &step.id
            && !IDENTIFIER.is_match(id)
        {
            return Err(ValidationError::StepId {
                task: name.into(),
                index,
                id: id.clone(),
            });
        }
    }

    Ok(())
}

fn validate_inputs(
    scope: &str,
    inputs: &indexmap::IndexMap<String, crate::InputParameter>,
) -> Result<(), ValidationError> {
    for (name, param) in inputs {
        if !IDENTIFIER.is_match(name) {
            return Err(ValidationError::InputName {
                name: name.clone(),
                scope: scope.into(),
            });
        }

        if param.default.is_some() && param.default_from_env.is_some() {
            return Err(ValidationError::ConflictingDefaults {
                name: name.clone(),
                scope: scope.into(),
            });
        }

        if let Some(env) = &param.default_from_env
            && !IDENTIFIER.is_match(env)
        {
            return Err(ValidationError::DefaultFromEnv {
                name: name.clone(),
                scope: scope.into(),
                env: env.clone(),
            });
        }
    }

    Ok(())
}

/// Returns the workflow's task names with `default` first (when present)
/// and the remainder in a locale-independent (byte-wise) sort.
pub fn ordered_task_names(wf: &Workflow) -> Vec<&str> {
    let mut names: Vec<&str> = wf
        .tasks
        .keys()
        .map(String::as_str)
        .filter(|name| *name != "default")
        .collect();
    names.sort_unstable();

    if wf.tasks.contains_key("default") {
        names.insert(0, "default");
    }

    names
}
