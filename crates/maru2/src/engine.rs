//! The task orchestrator: step sequencing, conditional gating, context
//! rebinding for cleanup, and dispatch into scripts, builtins, and
//! sub-tasks.

use std::time::Duration;

use anyhow::anyhow;
use camino::{Utf8Path, Utf8PathBuf};
use futures::FutureExt;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use maru2_expressions::{Evaluator, Expr, Scope, Value};
use maru2_models::{Step, StepBody, Workflow};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::builtins::Registry;
use crate::fetch::Service;
use crate::inputs::{self, With};
use crate::template::{self, WhichRegistry};
use crate::trace::{TraceError, origin_frame, step_frame};
use crate::uses::{Uses, resolve};

mod outputs;
mod script;

pub use script::OUTPUT_ENV;

/// The outputs of a single step: key → value.
pub type StepOutputs = IndexMap<String, Value>;

/// Outputs accumulated across a task's identified steps: step id → outputs.
pub type CommandOutputs = IndexMap<String, StepOutputs>;

/// A task stack frame, for in-file cycle detection: (origin, task name).
type Frame = (String, String);

/// The maru2 execution engine.
///
/// Owns the fetcher service, the builtins registry, and the `which`
/// shortcut registry; `run` is reentrant and each invocation owns its own
/// output map.
pub struct Engine {
    svc: Service,
    builtins: Registry,
    shortcuts: std::sync::Arc<WhichRegistry>,
    base_env: Vec<(String, String)>,
    dry_run: bool,
}

impl Engine {
    /// Creates an engine over a fetcher service, with the stock builtins,
    /// the global shortcut registry, and the parent process environment.
    pub fn new(svc: Service) -> Self {
        Self {
            svc,
            builtins: Registry::default_builtins(),
            shortcuts: WhichRegistry::global().clone(),
            base_env: std::env::vars().collect(),
            dry_run: false,
        }
    }

    /// Replaces the builtins registry.
    #[must_use]
    pub fn with_builtins(mut self, builtins: Registry) -> Self {
        self.builtins = builtins;
        self
    }

    /// Replaces the `which` shortcut registry.
    #[must_use]
    pub fn with_shortcuts(mut self, shortcuts: std::sync::Arc<WhichRegistry>) -> Self {
        self.shortcuts = shortcuts;
        self
    }

    /// Replaces the base environment handed to child processes.
    #[must_use]
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.base_env = env;
        self
    }

    /// Toggles dry-run mode: every step is scheduled, templates render
    /// placeholders for unknowns, and nothing executes.
    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// The underlying fetcher service.
    pub fn service(&self) -> &Service {
        &self.svc
    }

    /// Full semantic validation: the model-level rules plus builtin
    /// `with`-binding checks, which need the registry.
    pub fn validate_workflow(&self, wf: &Workflow) -> anyhow::Result<()> {
        maru2_models::validate(wf)?;

        for (task_name, task) in &wf.tasks {
            for (index, step) in task.steps.iter().enumerate() {
                if let Some(uses) = step.uses.as_deref()
                    && let Some(name) = uses.strip_prefix("builtin:")
                {
                    self.builtins
                        .validate(name, &step.with)
                        .map_err(|e| anyhow!("task `{task_name}` step {index}: {e}"))?;
                }
            }
        }

        Ok(())
    }

    /// Runs a task to completion.
    ///
    /// `cancel` is the task context: cancel it (e.g. from a SIGINT
    /// handler) and the running step is killed, `cancelled()` turns true
    /// for subsequent `if` evaluations, and cleanup steps still run.
    ///
    /// On failure the returned [`TraceError`] carries the first error, the
    /// logical stack trace, and any outputs of the last executed step.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        wf: &Workflow,
        task_name: &str,
        with: &With,
        origin: &Uses,
        cwd: &Utf8Path,
    ) -> Result<Option<StepOutputs>, TraceError> {
        self.run_task(cancel, None, wf, task_name, with.clone(), origin, cwd, Vec::new())
            .await
    }

    #[allow(clippy::too_many_arguments)]
    fn run_task<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        deadline: Option<Instant>,
        wf: &'a Workflow,
        task_name: &'a str,
        with: With,
        origin: &'a Uses,
        cwd: &'a Utf8Path,
        stack: Vec<Frame>,
    ) -> BoxFuture<'a, Result<Option<StepOutputs>, TraceError>> {
        async move {
            let frame_key: Frame = (origin.to_string(), task_name.to_string());
            if stack.contains(&frame_key) {
                return Err(TraceError::new(anyhow!(
                    "task cycle detected: `{task_name}` is already on the stack"
                ))
                .frame(origin_frame(origin)));
            }

            let Some(task) = wf.tasks.get(task_name) else {
                return Err(TraceError::new(anyhow!("task `{task_name}` not found"))
                    .frame(origin_frame(origin)));
            };

            let effective = inputs::merge(&with, &task.inputs)
                .map_err(|e| TraceError::new(e).frame(origin_frame(origin)))?;

            let mut outputs = CommandOutputs::new();
            let mut first_err: Option<TraceError> = None;
            let mut last_output: Option<StepOutputs> = None;
            let mut cancel_logged = false;
            let last_index = task.steps.len().saturating_sub(1);

            for (index, step) in task.steps.iter().enumerate() {
                let was_cancelled = cancel.is_cancelled();
                if was_cancelled && !cancel_logged {
                    warn!("task cancelled");
                    cancel_logged = true;
                }

                let scope = StepScope {
                    inputs: &effective,
                    outputs: &outputs,
                    failed: first_err.is_some(),
                    cancelled: was_cancelled,
                    shortcuts: self.shortcuts.as_ref(),
                };

                let should_run = match self.should_run(step.r#if.as_deref(), &scope) {
                    Ok(should_run) => should_run,
                    Err(e) => {
                        if first_err.is_some() {
                            warn!("skipping step {index}: {e:#}");
                            continue;
                        }
                        return Err(TraceError::new(e)
                            .frame(step_frame(task_name, index, origin))
                            .with_outputs(last_output));
                    }
                };

                if !should_run && !self.dry_run {
                    debug!(step = index, task = task_name, "skipped");
                    continue;
                }

                // A cancelled task still runs its `always()`/`cancelled()`
                // cleanup steps; those get a fresh token so they aren't
                // killed on entry. Likewise an exhausted deadline stops
                // applying, so cleanup can run past it; `cancelled()`
                // stays false for deadlines.
                let step_cancel = if was_cancelled {
                    CancellationToken::new()
                } else {
                    cancel.child_token()
                };
                let ambient = deadline.filter(|d| Instant::now() < *d);
                let step_deadline = effective_deadline(ambient, step.timeout);

                let result = self
                    .run_step(
                        &step_cancel,
                        step_deadline,
                        step,
                        &scope,
                        wf,
                        origin,
                        cwd,
                        &stack,
                        &frame_key,
                    )
                    .await;

                match result {
                    Ok(step_outputs) => {
                        if index == last_index {
                            last_output = step_outputs.clone();
                        }
                        if let Some(id) = &step.id
                            && let Some(step_outputs) = step_outputs
                        {
                            outputs.insert(id.clone(), step_outputs);
                        }
                        debug!(step = index, task = task_name, "step complete");
                    }
                    Err(mut e) => {
                        let nested = e.take_outputs();
                        if index == last_index {
                            last_output = nested.clone();
                        }
                        if let Some(id) = &step.id
                            && let Some(nested) = nested
                        {
                            outputs.insert(id.clone(), nested);
                        }

                        let e = e.frame(step_frame(task_name, index, origin));
                        if first_err.is_none() {
                            first_err = Some(e);
                        } else {
                            warn!("step {index} failed after an earlier error: {e}");
                        }
                    }
                }
            }

            match first_err {
                Some(e) => Err(e.with_outputs(last_output)),
                None => Ok(last_output),
            }
        }
        .boxed()
    }

    /// Evaluates a step's `if`. An empty expression means "run iff the
    /// task hasn't failed yet".
    fn should_run(&self, expr: Option<&str>, scope: &StepScope<'_>) -> anyhow::Result<bool> {
        let Some(expr) = expr.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(!scope.failed);
        };

        let parsed = Expr::parse(expr)?;
        let evaluator = Evaluator::new(scope, self.dry_run);
        Ok(evaluator.evaluate_condition(&parsed)?)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        step: &Step,
        scope: &StepScope<'_>,
        wf: &Workflow,
        origin: &Uses,
        cwd: &Utf8Path,
        stack: &[Frame],
        frame_key: &Frame,
    ) -> Result<Option<StepOutputs>, TraceError> {
        match step.body() {
            Some(StepBody::Run(raw)) => {
                self.run_script_step(cancel, deadline, step, raw, scope, cwd)
                    .await
            }
            Some(StepBody::Uses(reference)) => {
                self.run_uses_step(
                    cancel, deadline, step, reference, scope, wf, origin, cwd, stack, frame_key,
                )
                .await
            }
            None => Err(TraceError::new(anyhow!(
                "step has neither `run` nor `uses`"
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_script_step(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        step: &Step,
        raw: &str,
        scope: &StepScope<'_>,
        cwd: &Utf8Path,
    ) -> Result<Option<StepOutputs>, TraceError> {
        let rendered = template::render_str(raw, scope, self.dry_run).map_err(TraceError::new)?;

        let mut env = self.base_env.clone();
        for (name, value) in scope.inputs {
            env.push((
                format!("INPUT_{}", inputs::to_env_var(name)),
                inputs::stringify(value),
            ));
        }
        for (key, value) in &step.env {
            if key.eq_ignore_ascii_case("PWD") {
                return Err(TraceError::new(anyhow!("step env must not set `PWD`")));
            }
            let value =
                template::render_str(&value.to_string(), scope, self.dry_run)
                    .map_err(TraceError::new)?;
            env.push((key.clone(), value));
        }

        let dir: Utf8PathBuf = match &step.dir {
            Some(dir) => cwd.join(dir),
            None => cwd.to_path_buf(),
        };

        let title = step.name.clone().unwrap_or_else(|| {
            rendered
                .lines()
                .next()
                .unwrap_or_default()
                .to_string()
        });
        script::print_script(&title, &rendered);

        if self.dry_run {
            return Ok(None);
        }

        let parsed = script::run_script(
            &rendered,
            step.shell,
            &dir,
            env,
            step.mute,
            deadline,
            cancel,
        )
        .await
        .map_err(TraceError::new)?;

        if parsed.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            parsed
                .into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect(),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_uses_step(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        step: &Step,
        reference: &str,
        scope: &StepScope<'_>,
        wf: &Workflow,
        origin: &Uses,
        cwd: &Utf8Path,
        stack: &[Frame],
        frame_key: &Frame,
    ) -> Result<Option<StepOutputs>, TraceError> {
        let rendered =
            template::render_with(&step.with, scope, self.dry_run).map_err(TraceError::new)?;

        if let Some(name) = reference.strip_prefix("builtin:") {
            // Builtins hold no nested cleanup state, so aborting the call
            // on cancel or deadline is safe.
            return tokio::select! {
                _ = cancel.cancelled() => Err(TraceError::new(anyhow!("step cancelled"))),
                _ = until(deadline) => Err(TraceError::new(anyhow!("step timed out"))),
                result = self.builtins.execute(name, &rendered, self.dry_run) => {
                    result.map_err(TraceError::new)
                }
            };
        }

        let mut stack = stack.to_vec();
        stack.push(frame_key.clone());

        // A bare name addressing a task in this workflow recurses with the
        // same origin; anything else resolves, fetches, and recurses with
        // the fetched reference as the new origin. The nested task observes
        // the deadline cooperatively, so its own cleanup steps still run
        // after an expiry.
        if wf.tasks.contains_key(reference) {
            return self
                .run_task(cancel, deadline, wf, reference, rendered, origin, cwd, stack)
                .await;
        }

        let aliases = self.svc.aliases_for(wf);
        let target = resolve(Some(origin), reference, &aliases).map_err(TraceError::new)?;
        let sub_wf = tokio::select! {
            _ = until(deadline) => return Err(TraceError::new(anyhow!("step timed out"))),
            result = self.svc.fetch_workflow(cancel, &target) => {
                result.map_err(TraceError::new)?
            }
        };
        let sub_task = target.task().unwrap_or("default").to_string();
        let sub_origin = target.without_task();

        self.run_task(
            cancel,
            deadline,
            &sub_wf,
            &sub_task,
            rendered,
            &sub_origin,
            cwd,
            stack,
        )
        .await
    }
}

/// The deadline a step runs under: the sooner of the ambient deadline and
/// the step's own `timeout:`.
fn effective_deadline(ambient: Option<Instant>, timeout: Option<Duration>) -> Option<Instant> {
    let own = timeout.map(|duration| Instant::now() + duration);
    match (ambient, own) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Resolves when the deadline passes; never, when there is none.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The expression scope for one step, snapshotting task state at step
/// entry.
struct StepScope<'a> {
    inputs: &'a With,
    outputs: &'a CommandOutputs,
    failed: bool,
    cancelled: bool,
    shortcuts: &'a WhichRegistry,
}

impl Scope for StepScope<'_> {
    fn input(&self, name: &str) -> Option<Value> {
        self.inputs
            .get(name)
            .and_then(|value| serde_json::to_value(value).ok())
    }

    fn output(&self, step_id: &str, key: &str) -> Option<Value> {
        self.outputs.get(step_id)?.get(key).cloned()
    }

    fn failed(&self) -> bool {
        self.failed
    }

    fn cancelled(&self) -> bool {
        self.cancelled
    }

    fn which(&self, name: &str) -> Option<String> {
        self.shortcuts.get(name).or_else(|| {
            which::which(name)
                .ok()
                .and_then(|path| path.to_str().map(String::from))
        })
    }
}
