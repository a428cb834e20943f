//! Parsing, canonicalization, and origin-relative resolution of `uses:`
//! references.
//!
//! A reference is one of:
//!
//! - `file:<path>[?task=<name>]` (or a bare path)
//! - `http(s)://host/path[?task=<name>]`
//! - `pkg:github/<owner>/<repo>@<ref>[?task=<name>][#<subpath>]`
//! - `pkg:gitlab/<owner>/<project>@<ref>[?task=<name>][#<subpath>]`
//! - `<alias>:<owner>/<repo>@<ref>...`, expanded via the workflow's aliases
//! - `builtin:<name>`
//!
//! Bare task names never reach this module; the engine checks the current
//! workflow's task table before resolving.

use std::fmt::{self, Display};

use indexmap::IndexMap;
use maru2_models::{Alias, AliasType};
use thiserror::Error;
use url::Url;

/// The filename a reference resolves to when its path collapses to `.`.
pub const DEFAULT_FILENAME: &str = "tasks.yaml";

/// The git ref a purl defaults to when `@<ref>` is omitted.
pub const DEFAULT_VERSION: &str = "main";

/// Errors produced while parsing or resolving a reference.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsesError {
    /// The reference has a scheme this resolver doesn't know and that no
    /// alias covers.
    #[error("unknown scheme in `{0}`")]
    UnknownScheme(String),

    /// A `pkg:` reference names a package type other than `github` or
    /// `gitlab`.
    #[error("unsupported package type `{0}` (expected `github` or `gitlab`)")]
    UnsupportedPackageType(String),

    /// The reference is structurally broken.
    #[error("malformed reference `{reference}`: {message}")]
    Malformed {
        /// The offending reference.
        reference: String,
        /// What was wrong with it.
        message: String,
    },
}

impl UsesError {
    fn malformed(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            reference: reference.into(),
            message: message.into(),
        }
    }
}

/// A canonicalized `uses:` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Uses {
    /// A local file.
    File(FileUses),
    /// An HTTP(S) URL.
    Remote(RemoteUses),
    /// A package URL on a git host.
    Pkg(PkgUses),
    /// A builtin, e.g. `builtin:echo`. Only valid as a step reference,
    /// never as a workflow origin.
    Builtin(String),
}

/// A `file:` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUses {
    /// The (cleaned) path, relative or absolute.
    pub path: String,
    /// The task to run, when addressed as `?task=<name>`.
    pub task: Option<String>,
}

/// An `http(s):` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUses {
    /// The URL, with any `task` query parameter extracted out.
    pub url: Url,
    /// The task to run.
    pub task: Option<String>,
}

/// The git hosts a purl can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkgHost {
    /// `pkg:github/...`
    Github,
    /// `pkg:gitlab/...`
    Gitlab,
}

impl Display for PkgHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PkgHost::Github => write!(f, "github"),
            PkgHost::Gitlab => write!(f, "gitlab"),
        }
    }
}

impl From<AliasType> for PkgHost {
    fn from(value: AliasType) -> Self {
        match value {
            AliasType::Github => PkgHost::Github,
            AliasType::Gitlab => PkgHost::Gitlab,
        }
    }
}

/// A `pkg:` reference.
///
/// `base_url` and `token_from_env` are per-request fetcher configuration
/// carried over from an alias; they are not part of the canonical string
/// form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgUses {
    /// The hosting service.
    pub host: PkgHost,
    /// Owner (GitHub) or namespace path (GitLab, possibly nested).
    pub namespace: String,
    /// Repository or project name.
    pub name: String,
    /// Git ref. Defaults to [`DEFAULT_VERSION`].
    pub version: String,
    /// Path of the workflow file within the repository. Defaults to
    /// [`DEFAULT_FILENAME`].
    pub subpath: String,
    /// The task to run.
    pub task: Option<String>,
    /// Non-default API base URL, from an alias.
    pub base_url: Option<Url>,
    /// Env var holding the bearer token, from an alias.
    pub token_from_env: Option<String>,
}

impl Display for Uses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uses::File(file) => {
                write!(f, "file:{}", file.path)?;
                if let Some(task) = &file.task {
                    write!(f, "?task={task}")?;
                }
                Ok(())
            }
            Uses::Remote(remote) => {
                if let Some(task) = &remote.task {
                    let mut url = remote.url.clone();
                    url.query_pairs_mut().append_pair("task", task);
                    write!(f, "{url}")
                } else {
                    write!(f, "{}", remote.url)
                }
            }
            Uses::Pkg(pkg) => {
                write!(
                    f,
                    "pkg:{}/{}/{}@{}",
                    pkg.host, pkg.namespace, pkg.name, pkg.version
                )?;
                if let Some(task) = &pkg.task {
                    write!(f, "?task={task}")?;
                }
                write!(f, "#{}", pkg.subpath)
            }
            Uses::Builtin(name) => write!(f, "builtin:{name}"),
        }
    }
}

impl Uses {
    /// Parses a reference, expanding aliases, without applying any origin.
    pub fn parse(reference: &str, aliases: &IndexMap<String, Alias>) -> Result<Self, UsesError> {
        if let Some(name) = reference.strip_prefix("builtin:") {
            if name.is_empty() {
                return Err(UsesError::malformed(reference, "empty builtin name"));
            }
            return Ok(Uses::Builtin(name.to_string()));
        }

        if reference.starts_with("pkg:") {
            return parse_purl(reference, None, None);
        }

        if reference.starts_with("http://") || reference.starts_with("https://") {
            let mut url = Url::parse(reference)
                .map_err(|e| UsesError::malformed(reference, e.to_string()))?;
            let task = take_query_task(&mut url);
            return Ok(Uses::Remote(RemoteUses { url, task }));
        }

        if let Some(rest) = reference.strip_prefix("file:") {
            let (path, task) = split_task(rest);
            return Ok(Uses::File(FileUses {
                path: clean_file_path(&path),
                task,
            }));
        }

        if let Some(scheme) = scheme_of(reference) {
            if let Some(alias) = aliases.get(scheme) {
                let body = &reference[scheme.len() + 1..];
                let expanded = format!("pkg:{}/{}", alias.r#type, body);
                let base_url = alias
                    .base_url
                    .as_deref()
                    .map(Url::parse)
                    .transpose()
                    .map_err(|e| {
                        UsesError::malformed(reference, format!("alias base-url: {e}"))
                    })?;
                return parse_purl(&expanded, base_url, alias.token_from_env.clone());
            }
            return Err(UsesError::UnknownScheme(reference.to_string()));
        }

        // No scheme at all: a bare path.
        let (path, task) = split_task(reference);
        Ok(Uses::File(FileUses {
            path: clean_file_path(&path),
            task,
        }))
    }

    /// The task this reference addresses, if any.
    pub fn task(&self) -> Option<&str> {
        match self {
            Uses::File(file) => file.task.as_deref(),
            Uses::Remote(remote) => remote.task.as_deref(),
            Uses::Pkg(pkg) => pkg.task.as_deref(),
            Uses::Builtin(_) => None,
        }
    }

    /// This reference with its task component cleared: the identity of the
    /// *workflow*, used as the store key and for crawl deduplication.
    pub fn without_task(&self) -> Uses {
        let mut cleared = self.clone();
        match &mut cleared {
            Uses::File(file) => file.task = None,
            Uses::Remote(remote) => remote.task = None,
            Uses::Pkg(pkg) => pkg.task = None,
            Uses::Builtin(_) => {}
        }
        cleared
    }
}

/// Resolves a reference against an optional origin.
///
/// Only relative `file:` references are origin-sensitive; every other shape
/// parses the same regardless of where it was found.
pub fn resolve(
    origin: Option<&Uses>,
    reference: &str,
    aliases: &IndexMap<String, Alias>,
) -> Result<Uses, UsesError> {
    let parsed = Uses::parse(reference, aliases)?;

    let Uses::File(file) = &parsed else {
        return Ok(parsed);
    };
    if file.path.starts_with('/') {
        return Ok(parsed);
    }

    match origin {
        None | Some(Uses::Builtin(_)) => Ok(parsed),
        Some(Uses::File(origin)) => Ok(Uses::File(FileUses {
            path: join_clean(parent_dir(&origin.path), &file.path),
            task: file.task.clone(),
        })),
        Some(Uses::Remote(origin)) => {
            let url = origin
                .url
                .join(&file.path)
                .map_err(|e| UsesError::malformed(reference, e.to_string()))?;
            Ok(Uses::Remote(RemoteUses {
                url,
                task: file.task.clone(),
            }))
        }
        Some(Uses::Pkg(origin)) => Ok(Uses::Pkg(PkgUses {
            subpath: join_clean(parent_dir(&origin.subpath), &file.path),
            task: file.task.clone(),
            ..origin.clone()
        })),
    }
}

fn parse_purl(
    reference: &str,
    base_url: Option<Url>,
    token_from_env: Option<String>,
) -> Result<Uses, UsesError> {
    let rest = reference.strip_prefix("pkg:").unwrap_or(reference);

    // Qualifiers (`?task=...`) and subpath (`#...`) are accepted in either
    // order; the canonical form emits qualifiers first.
    let mut base = rest;
    let mut query = "";
    let mut fragment = "";
    match (base.find('?'), base.find('#')) {
        (Some(q), Some(h)) if q < h => {
            query = &rest[q + 1..h];
            fragment = &rest[h + 1..];
            base = &rest[..q];
        }
        (Some(q), Some(h)) => {
            fragment = &rest[h + 1..q];
            query = &rest[q + 1..];
            base = &rest[..h];
        }
        (Some(q), None) => {
            query = &rest[q + 1..];
            base = &rest[..q];
        }
        (None, Some(h)) => {
            fragment = &rest[h + 1..];
            base = &rest[..h];
        }
        (None, None) => {}
    }

    let task = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "task")
        .map(|(_, value)| value.to_string());

    let (path, version) = match base.rsplit_once('@') {
        Some((path, version)) if !version.is_empty() => (path, version),
        Some((path, _)) => (path, DEFAULT_VERSION),
        None => (base, DEFAULT_VERSION),
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 3 {
        return Err(UsesError::malformed(
            reference,
            "expected `pkg:<type>/<namespace>/<name>`",
        ));
    }

    let host = match segments[0] {
        "github" => PkgHost::Github,
        "gitlab" => PkgHost::Gitlab,
        other => return Err(UsesError::UnsupportedPackageType(other.to_string())),
    };

    let name = segments[segments.len() - 1].to_string();
    let namespace = segments[1..segments.len() - 1].join("/");

    let subpath = clean_file_path(fragment.trim_start_matches('/'));

    Ok(Uses::Pkg(PkgUses {
        host,
        namespace,
        name,
        version: version.to_string(),
        subpath,
        task,
        base_url,
        token_from_env,
    }))
}

/// Extracts the scheme of a reference, if it has one.
fn scheme_of(reference: &str) -> Option<&str> {
    let (scheme, _) = reference.split_once(':')?;
    let mut chars = scheme.chars();
    let head = chars.next()?;
    if head.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-'))
    {
        Some(scheme)
    } else {
        None
    }
}

/// Splits a `?task=<name>` suffix off a non-URL reference.
fn split_task(reference: &str) -> (String, Option<String>) {
    let Some((path, query)) = reference.split_once('?') else {
        return (reference.to_string(), None);
    };

    let task = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "task")
        .map(|(_, value)| value.to_string());

    (path.to_string(), task)
}

fn take_query_task(url: &mut Url) -> Option<String> {
    let mut task = None;
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(key, value)| {
            if key == "task" {
                task = Some(value.to_string());
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect();

    if task.is_some() {
        if remaining.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(remaining);
        }
    }

    task
}

/// Lexical path cleaning, after Go's `path.Clean`.
fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();

    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if out.last().is_some_and(|c| *c != "..") {
                    out.pop();
                } else if !rooted {
                    out.push("..");
                }
            }
            comp => out.push(comp),
        }
    }

    let joined = out.join("/");
    match (rooted, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Cleans a file path and applies the default filename when the path
/// collapses to `.`.
fn clean_file_path(path: &str) -> String {
    let cleaned = clean_path(path);
    if cleaned == "." || cleaned == "/" {
        DEFAULT_FILENAME.to_string()
    } else {
        cleaned
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    }
}

fn join_clean(dir: &str, rel: &str) -> String {
    if dir.is_empty() {
        clean_file_path(rel)
    } else {
        clean_file_path(&format!("{dir}/{rel}"))
    }
}
