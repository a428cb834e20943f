//! Error tracing across task recursion.
//!
//! As an error unwinds out of nested task invocations, each level adds a
//! frame of the form `at <task>[<idx>] (<origin>)`. Frames are collected
//! innermost-first, which is the order they're printed in.

use std::fmt;

use crate::engine::StepOutputs;
use crate::uses::Uses;

/// An error carrying a logical stack trace, plus any outputs the task
/// produced before (or while cleaning up after) the failure.
#[derive(Debug)]
pub struct TraceError {
    cause: anyhow::Error,
    frames: Vec<String>,
    outputs: Option<StepOutputs>,
}

impl TraceError {
    /// Wraps an error with an empty trace.
    pub fn new(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            cause: cause.into(),
            frames: Vec::new(),
            outputs: None,
        }
    }

    /// Adds a frame. Frames accumulate innermost-first as the error
    /// unwinds.
    #[must_use]
    pub fn frame(mut self, frame: String) -> Self {
        self.frames.push(frame);
        self
    }

    /// Attaches the last executed step's outputs, mirroring how a task
    /// returns outputs next to its first error.
    #[must_use]
    pub fn with_outputs(mut self, outputs: Option<StepOutputs>) -> Self {
        self.outputs = outputs;
        self
    }

    /// The trace frames, innermost (most recent) first.
    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    /// The outputs of the last executed step, if any survived the failure.
    pub fn outputs(&self) -> Option<&StepOutputs> {
        self.outputs.as_ref()
    }

    /// Takes the outputs out of this error.
    pub fn take_outputs(&mut self) -> Option<StepOutputs> {
        self.outputs.take()
    }

    /// The underlying cause.
    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)
    }
}

impl std::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// Formats the frame for a step failure.
pub fn step_frame(task: &str, index: usize, origin: &Uses) -> String {
    format!("at {task}[{index}] ({origin})")
}

/// Formats the frame for a failure with no step context, e.g. a missing
/// task.
pub fn origin_frame(origin: &Uses) -> String {
    format!("at ({origin})")
}
