//! Data models for maru2 workflows.
//!
//! A workflow is a YAML document with a `schema-version`, an ordered map of
//! tasks, and optional workflow-level inputs and host aliases. Parsing is
//! two-staged: the schema version is peeked first so that documents written
//! against older schemas get a pointed error instead of a wall of serde
//! noise.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

use std::fmt::{self, Display};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub mod validate;

pub use validate::{ValidationError, ordered_task_names, validate};

/// The only schema version this crate accepts.
pub const SCHEMA_VERSION: &str = "v1";

/// Errors produced while turning YAML bytes into a [`Workflow`].
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The document declares `schema-version: v0`, which predates this
    /// parser and has no upgrade path other than rewriting the document.
    #[error("schema-version `v0` is no longer supported; migrate the document to `v1`")]
    SchemaV0,

    /// The document declares a schema version this parser doesn't know.
    #[error("unsupported schema-version `{0}` (expected `v1`)")]
    UnsupportedSchema(String),

    /// The document is missing `schema-version` entirely.
    #[error("missing `schema-version` (expected `v1`)")]
    MissingSchema,

    /// The document is not syntactically valid against the v1 model.
    #[error("invalid workflow syntax")]
    Syntax(#[from] serde_yaml::Error),
}

/// Parses a workflow document from raw YAML bytes.
///
/// This performs the schema-version gate and the full structural
/// deserialization, but *not* semantic validation; see [`validate`].
pub fn from_slice(bytes: &[u8]) -> Result<Workflow, WorkflowError> {
    #[derive(Deserialize)]
    #[serde(rename_all = "kebab-case")]
    struct VersionPeek {
        #[serde(default)]
        schema_version: Option<serde_yaml::Value>,
    }

    let peek: VersionPeek = serde_yaml::from_slice(bytes)?;
    match peek.schema_version {
        Some(serde_yaml::Value::String(v)) if v == SCHEMA_VERSION => {}
        Some(serde_yaml::Value::String(v)) if v == "v0" => return Err(WorkflowError::SchemaV0),
        Some(serde_yaml::Value::String(v)) => return Err(WorkflowError::UnsupportedSchema(v)),
        Some(other) => {
            return Err(WorkflowError::UnsupportedSchema(
                serde_yaml::to_string(&other).unwrap_or_default().trim().to_string(),
            ));
        }
        None => return Err(WorkflowError::MissingSchema),
    }

    Ok(serde_yaml::from_slice(bytes)?)
}

/// An entire maru2 workflow document.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Workflow {
    /// Invariant: `"v1"`. Enforced by [`from_slice`].
    pub schema_version: String,

    /// Workflow-level input parameters. Rarely used directly; tasks
    /// usually declare their own.
    #[serde(default)]
    pub inputs: IndexMap<String, InputParameter>,

    /// The tasks of this workflow, in declaration order.
    #[serde(default)]
    pub tasks: IndexMap<String, Task>,

    /// Host aliases, expanding `<alias>:<owner>/<repo>@<ref>` references
    /// into package URLs.
    #[serde(default)]
    pub aliases: IndexMap<String, Alias>,
}

/// A single named task: a sequence of steps with optional inputs.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Task {
    /// Human-readable description, surfaced by `maru2 list`.
    #[serde(default)]
    pub description: Option<String>,

    /// Input parameters accepted by this task.
    #[serde(default)]
    pub inputs: IndexMap<String, InputParameter>,

    /// The steps to execute, strictly in order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One step of a task.
///
/// Exactly one of [`Step::run`] and [`Step::uses`] must be set; this is
/// enforced by [`validate`] rather than at deserialization time so that the
/// error can name the offending task and index.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Step {
    /// An inline shell script.
    #[serde(default)]
    pub run: Option<String>,

    /// A reference to a builtin, a task in this workflow, or a task in
    /// another workflow (`file:`, `http(s):`, `pkg:`).
    #[serde(default)]
    pub uses: Option<String>,

    /// Inputs passed to the referenced task or builtin. String values may
    /// contain `${{ … }}` templates, recursively through nested maps and
    /// lists.
    #[serde(default)]
    pub with: IndexMap<String, serde_yaml::Value>,

    /// Extra environment variables for the child process. Values are
    /// scalars only; `PWD` is forbidden.
    #[serde(default)]
    pub env: IndexMap<String, Scalar>,

    /// Step identifier. Required for the step's outputs to be visible to
    /// later steps via `from("id", "key")`.
    #[serde(default)]
    pub id: Option<String>,

    /// Cosmetic display name.
    #[serde(default)]
    pub name: Option<String>,

    /// Conditional expression deciding whether this step runs.
    #[serde(default)]
    pub r#if: Option<String>,

    /// Working directory, relative to the task's working directory.
    #[serde(default)]
    pub dir: Option<String>,

    /// The shell used for `run` scripts.
    #[serde(default)]
    pub shell: Shell,

    /// Wall-clock budget for this step, e.g. `"30s"` or `"5m"`.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Suppress the child's stdout and stderr. The outputs file is still
    /// honored.
    #[serde(default)]
    pub mute: bool,
}

/// The body of a validated step: a script or a reference, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepBody<'a> {
    /// An inline script (`run:`).
    Run(&'a str),
    /// A reference (`uses:`).
    Uses(&'a str),
}

impl Step {
    /// Returns this step's body, or `None` if the step is structurally
    /// invalid (both or neither of `run`/`uses` set).
    pub fn body(&self) -> Option<StepBody<'_>> {
        match (self.run.as_deref(), self.uses.as_deref()) {
            (Some(run), None) => Some(StepBody::Run(run)),
            (None, Some(uses)) => Some(StepBody::Uses(uses)),
            _ => None,
        }
    }
}

/// Shells supported for `run` steps.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    /// `sh -e -c <script>` (the default).
    #[default]
    Sh,
    /// `bash -e -o pipefail -c <script>`.
    Bash,
    /// PowerShell Core.
    Pwsh,
    /// Windows PowerShell.
    Powershell,
}

impl Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shell::Sh => write!(f, "sh"),
            Shell::Bash => write!(f, "bash"),
            Shell::Pwsh => write!(f, "pwsh"),
            Shell::Powershell => write!(f, "powershell"),
        }
    }
}

/// An input parameter definition.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct InputParameter {
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,

    /// When set, callers supplying this input get a warning containing
    /// this message.
    #[serde(default)]
    pub deprecated_message: Option<String>,

    /// Whether a value must be available after defaulting. Unset means
    /// required.
    #[serde(default)]
    pub required: Option<bool>,

    /// Static default value. Mutually exclusive with
    /// [`InputParameter::default_from_env`].
    #[serde(default)]
    pub default: Option<Scalar>,

    /// Name of an environment variable to read the default from.
    #[serde(default)]
    pub default_from_env: Option<String>,

    /// Regex applied to the stringified effective value.
    #[serde(default)]
    pub validate: Option<String>,
}

impl InputParameter {
    /// Whether this parameter must resolve to a value.
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(true)
    }
}

/// A host alias: `myorg: {type: github, base-url: ..., token-from-env: ...}`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Alias {
    /// The kind of host the alias points at.
    pub r#type: AliasType,

    /// Non-default base URL, e.g. a GitHub Enterprise or self-hosted
    /// GitLab instance.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable holding the bearer token for this host.
    #[serde(default)]
    pub token_from_env: Option<String>,
}

/// The package types an alias may expand to.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AliasType {
    /// `pkg:github/...`
    Github,
    /// `pkg:gitlab/...`
    Gitlab,
}

impl Display for AliasType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AliasType::Github => write!(f, "github"),
            AliasType::Gitlab => write!(f, "gitlab"),
        }
    }
}

/// A YAML scalar: the only values allowed for step `env` entries and input
/// defaults.
///
/// Complex values (maps, sequences) are rejected at deserialization time,
/// which is what makes a non-scalar `env` value a parse error rather than a
/// runtime surprise.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Scalar {
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// An unsigned integer too large for `i64`.
    Uint(u64),
    /// A float.
    Float(f64),
    /// A string. YAML nulls collapse to the empty string.
    String(#[serde(deserialize_with = "null_to_default")] String),
}

impl Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Uint(u) => write!(f, "{u}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::String(s) => write!(f, "{s}"),
        }
    }
}

impl Scalar {
    /// Converts this scalar into the equivalent [`serde_yaml::Value`].
    pub fn to_value(&self) -> serde_yaml::Value {
        match self {
            Scalar::Bool(b) => serde_yaml::Value::Bool(*b),
            Scalar::Int(i) => serde_yaml::Value::Number((*i).into()),
            Scalar::Uint(u) => serde_yaml::Value::Number((*u).into()),
            Scalar::Float(x) => serde_yaml::Value::Number((*x).into()),
            Scalar::String(s) => serde_yaml::Value::String(s.clone()),
        }
    }
}

fn null_to_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let value = Option::<T>::deserialize(de)?;
    Ok(value.unwrap_or_default())
}
