//! maru2: a YAML task runner.
//!
//! Workflows declare tasks; tasks declare steps; steps run shell scripts,
//! invoke builtins, or reference tasks in other workflows — in the same
//! file, on disk, behind an HTTP(S) URL, or addressed as a `pkg:` purl on
//! GitHub or GitLab. Remote references flow through a policy-driven,
//! content-addressed store, and whole dependency closures can be published
//! as OCI artifacts.

pub mod builtins;
pub mod config;
pub mod engine;
pub mod fetch;
pub mod inputs;
pub mod publish;
pub mod store;
pub mod template;
pub mod trace;
pub mod uses;

pub use engine::{CommandOutputs, Engine, StepOutputs};
pub use fetch::{FetchPolicy, Service};
pub use inputs::With;
pub use store::Store;
pub use trace::TraceError;
pub use uses::{Uses, resolve};
