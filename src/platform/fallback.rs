//! Ordered fallback plans for control operations with no single reliable
//! native command.
//!
//! A plan is a list of steps evaluated in order. Each step may be guarded on
//! the outcome of an earlier step and says what its success or failure means
//! for the whole plan: keep going, stop with success, or stop with failure.

use log::{debug, warn};

use super::runner::{display_command, CommandRunner};
use super::{ProviderError, ProviderResult};

/// When a step is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Always,
    /// Only if the named earlier step ran and failed
    Failed(&'static str),
    /// Only if the named earlier step ran and succeeded
    Succeeded(&'static str),
}

/// What a step outcome means for the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Succeed,
    Fail,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub label: &'static str,
    pub args: Vec<String>,
    pub guard: Guard,
    pub on_success: Flow,
    pub on_failure: Flow,
}

impl Step {
    pub fn new(label: &'static str, args: Vec<String>) -> Self {
        Self {
            label,
            args,
            guard: Guard::Always,
            on_success: Flow::Continue,
            on_failure: Flow::Continue,
        }
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guard = guard;
        self
    }

    pub fn on_success(mut self, flow: Flow) -> Self {
        self.on_success = flow;
        self
    }

    pub fn on_failure(mut self, flow: Flow) -> Self {
        self.on_failure = flow;
        self
    }
}

/// Result of one attempted step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub label: &'static str,
    pub succeeded: bool,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct FallbackPlan {
    operation: String,
    program: &'static str,
    steps: Vec<Step>,
    when_exhausted: Flow,
}

impl FallbackPlan {
    /// `operation` names the plan in errors ("start com.example.foo")
    pub fn new(operation: impl Into<String>, program: &'static str) -> Self {
        Self {
            operation: operation.into(),
            program,
            steps: Vec::new(),
            when_exhausted: Flow::Fail,
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Outcome when every step ran (or was skipped) without a decision
    pub fn when_exhausted(mut self, flow: Flow) -> Self {
        self.when_exhausted = flow;
        self
    }

    /// Evaluate the plan against a runner.
    ///
    /// Returns the attempts made alongside the outcome so callers and tests
    /// can see exactly which branches ran.
    pub async fn execute(&self, runner: &dyn CommandRunner) -> (Vec<Attempt>, ProviderResult<()>) {
        let mut attempts: Vec<Attempt> = Vec::new();

        for step in &self.steps {
            let allowed = match step.guard {
                Guard::Always => true,
                Guard::Failed(label) => attempts.iter().any(|a| a.label == label && !a.succeeded),
                Guard::Succeeded(label) => attempts.iter().any(|a| a.label == label && a.succeeded),
            };
            if !allowed {
                debug!("{}: skipping {}", self.operation, step.label);
                continue;
            }

            debug!("{}: attempting {}", self.operation, step.label);
            let attempt = match runner.run(self.program, &step.args).await {
                Ok(output) => Attempt {
                    label: step.label,
                    succeeded: output.success(),
                    output: output.combined(),
                },
                Err(e) => Attempt {
                    label: step.label,
                    succeeded: false,
                    output: e.to_string(),
                },
            };

            let flow = if attempt.succeeded {
                step.on_success
            } else {
                debug!("{}: {} failed: {}", self.operation, step.label, attempt.output);
                step.on_failure
            };
            attempts.push(attempt);

            match flow {
                Flow::Continue => {}
                Flow::Succeed => return (attempts, Ok(())),
                Flow::Fail => {
                    let result = Err(self.failure(step, &attempts));
                    return (attempts, result);
                }
            }
        }

        let result = match self.when_exhausted {
            Flow::Fail => {
                warn!("{}: all methods failed", self.operation);
                let detail = attempts
                    .iter()
                    .map(|a| format!("{}: {}", a.label, a.output))
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(ProviderError::execution(self.operation.clone(), detail))
            }
            Flow::Succeed | Flow::Continue => Ok(()),
        };
        (attempts, result)
    }

    fn failure(&self, step: &Step, attempts: &[Attempt]) -> ProviderError {
        warn!("{}: all methods failed, last was {}", self.operation, step.label);
        let output = attempts.last().map(|a| a.output.clone()).unwrap_or_default();
        ProviderError::execution(display_command(self.program, &step.args), output)
    }
}
