//! Policy-driven, cache-backed fetching of workflow bytes.
//!
//! The [`Service`] dispatches on the reference's scheme: local files are
//! read directly (the file *is* the source of truth, so the cache is
//! bypassed), while HTTP(S) and `pkg:` references flow through the
//! content store according to the configured [`FetchPolicy`].

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use indexmap::IndexMap;
use maru2_models::{Alias, Workflow};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::store::{Store, StoreError};
use crate::uses::{Uses, resolve};

mod github;
mod gitlab;
mod http;
mod local;

/// Default per-request timeout, further bounded by the caller's
/// cancellation token.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How many redirect hops the HTTP fetcher will follow.
const MAX_REDIRECTS: usize = 10;

/// When the fetcher consults the source of truth vs. the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Hit the source every time; refresh the cache on success.
    Always,
    /// Serve from cache when present; otherwise fetch and cache.
    #[default]
    IfNotPresent,
    /// Serve only from cache; error when absent.
    Never,
}

impl std::fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchPolicy::Always => write!(f, "always"),
            FetchPolicy::IfNotPresent => write!(f, "if-not-present"),
            FetchPolicy::Never => write!(f, "never"),
        }
    }
}

/// Errors produced by fetch operations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The referenced content does not exist (HTTP 404, missing file, or a
    /// `never` policy with a cold cache).
    #[error("`{0}` not found")]
    NotFound(String),

    /// The source answered with a non-success status.
    #[error("transport error fetching `{reference}`: {status}")]
    Transport {
        /// The canonical reference being fetched.
        reference: String,
        /// The offending status line.
        status: String,
    },

    /// The reference's scheme cannot be fetched (e.g. `builtin:`).
    #[error("unsupported scheme for fetch: `{0}`")]
    UnsupportedScheme(String),

    /// The caller's cancellation token fired mid-fetch.
    #[error("fetch cancelled")]
    Cancelled,

    /// Filesystem trouble reading a local reference.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The content store misbehaved.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The HTTP client failed below the status-code level.
    #[error("request error")]
    Request(#[from] reqwest::Error),

    /// A fetcher built an invalid request URL out of the reference.
    #[error("invalid request URL")]
    Url(#[from] url::ParseError),
}

/// A scheme-specific fetcher.
#[async_trait]
trait Fetch: Send + Sync {
    async fn fetch(&self, uses: &Uses) -> Result<Vec<u8>, FetchError>;
}

/// The fetcher service: scheme dispatch, fetch policy, and content store.
pub struct Service {
    policy: FetchPolicy,
    store: Mutex<Store>,
    aliases: IndexMap<String, Alias>,
    local: local::LocalFetcher,
    http: http::HttpFetcher,
    github: github::GithubFetcher,
    gitlab: gitlab::GitlabFetcher,
}

impl Service {
    /// Creates a service over the given store, with system-level aliases
    /// (typically from the user's config file).
    pub fn new(
        policy: FetchPolicy,
        store: Store,
        aliases: IndexMap<String, Alias>,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(concat!("maru2/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            policy,
            store: Mutex::new(store),
            aliases,
            local: local::LocalFetcher,
            http: http::HttpFetcher::new(client.clone()),
            github: github::GithubFetcher::new(client.clone()),
            gitlab: gitlab::GitlabFetcher::new(client),
        })
    }

    /// The configured fetch policy.
    pub fn policy(&self) -> FetchPolicy {
        self.policy
    }

    /// The system-level aliases merged under `wf`'s own aliases.
    pub fn aliases_for(&self, wf: &Workflow) -> IndexMap<String, Alias> {
        let mut merged = self.aliases.clone();
        for (name, alias) in &wf.aliases {
            merged.insert(name.clone(), alias.clone());
        }
        merged
    }

    /// Runs a closure against the underlying store.
    pub fn with_store<T>(&self, f: impl FnOnce(&mut Store) -> T) -> T {
        let mut store = self.store.lock().expect("store mutex poisoned");
        f(&mut store)
    }

    /// Fetches the bytes behind a reference, honoring the fetch policy.
    #[instrument(skip(self, cancel))]
    pub async fn fetch(
        &self,
        cancel: &CancellationToken,
        uses: &Uses,
    ) -> Result<Vec<u8>, FetchError> {
        match uses {
            // The local filesystem is its own source of truth.
            Uses::File(_) => self.local.fetch(uses).await,
            Uses::Builtin(name) => Err(FetchError::UnsupportedScheme(format!("builtin:{name}"))),
            Uses::Remote(_) | Uses::Pkg(_) => self.fetch_cached(cancel, uses).await,
        }
    }

    async fn fetch_cached(
        &self,
        cancel: &CancellationToken,
        uses: &Uses,
    ) -> Result<Vec<u8>, FetchError> {
        let id = uses.without_task().to_string();

        match self.policy {
            FetchPolicy::Never => self
                .with_store(|store| store.read(&id))?
                .ok_or(FetchError::NotFound(id)),
            FetchPolicy::IfNotPresent => {
                if let Some(bytes) = self.with_store(|store| store.read(&id))? {
                    debug!(reference = %id, "cache hit");
                    return Ok(bytes);
                }
                self.fetch_live(cancel, uses, &id).await
            }
            FetchPolicy::Always => self.fetch_live(cancel, uses, &id).await,
        }
    }

    async fn fetch_live(
        &self,
        cancel: &CancellationToken,
        uses: &Uses,
        id: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let fetcher: &dyn Fetch = match uses {
            Uses::Remote(_) => &self.http,
            Uses::Pkg(pkg) => match pkg.host {
                crate::uses::PkgHost::Github => &self.github,
                crate::uses::PkgHost::Gitlab => &self.gitlab,
            },
            _ => return Err(FetchError::UnsupportedScheme(uses.to_string())),
        };

        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = fetcher.fetch(uses) => result?,
        };

        self.with_store(|store| store.put(id, &bytes))?;
        Ok(bytes)
    }

    /// Fetches and parses the workflow behind a reference.
    pub async fn fetch_workflow(
        &self,
        cancel: &CancellationToken,
        uses: &Uses,
    ) -> anyhow::Result<Workflow> {
        let bytes = self.fetch(cancel, uses).await?;
        let wf = maru2_models::from_slice(&bytes).with_context(|| format!("parsing {uses}"))?;
        maru2_models::validate(&wf).with_context(|| format!("validating {uses}"))?;
        Ok(wf)
    }

    /// Breadth-first crawl of a workflow's external `uses` edges,
    /// deduplicating by canonical reference (which also terminates cycles).
    ///
    /// Remote dependencies land in the store as a side effect of fetching;
    /// local `file:` dependencies are returned as canonical-reference →
    /// bytes, since the store never holds them.
    pub async fn fetch_all(
        &self,
        cancel: &CancellationToken,
        wf: &Workflow,
        origin: &Uses,
    ) -> anyhow::Result<IndexMap<String, Vec<u8>>> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(origin.without_task().to_string());

        let mut locals: IndexMap<String, Vec<u8>> = IndexMap::new();
        let mut queue: VecDeque<Uses> = self.external_edges(wf, origin).into();

        while let Some(target) = queue.pop_front() {
            if cancel.is_cancelled() {
                anyhow::bail!("crawl cancelled");
            }

            let id = target.without_task().to_string();
            if !visited.insert(id.clone()) {
                continue;
            }

            let bytes = self
                .fetch(cancel, &target)
                .await
                .with_context(|| format!("crawling {id}"))?;

            if matches!(target, Uses::File(_)) {
                locals.insert(id.clone(), bytes.clone());
            }

            let dep = maru2_models::from_slice(&bytes)
                .with_context(|| format!("crawling {id}"))?;
            maru2_models::validate(&dep).with_context(|| format!("crawling {id}"))?;

            queue.extend(self.external_edges(&dep, &target.without_task()));
        }

        Ok(locals)
    }

    /// The resolved external references of a workflow: every `uses` edge
    /// that is neither a builtin nor a task in the same file.
    fn external_edges(&self, wf: &Workflow, origin: &Uses) -> Vec<Uses> {
        let aliases = self.aliases_for(wf);
        let mut edges = Vec::new();

        for task in wf.tasks.values() {
            for step in &task.steps {
                let Some(reference) = step.uses.as_deref() else {
                    continue;
                };
                if reference.starts_with("builtin:") || wf.tasks.contains_key(reference) {
                    continue;
                }
                match resolve(Some(origin), reference, &aliases) {
                    Ok(target) => edges.push(target),
                    Err(e) => {
                        tracing::warn!(reference, origin = %origin, "skipping unresolvable edge: {e}");
                    }
                }
            }
        }

        edges
    }
}
