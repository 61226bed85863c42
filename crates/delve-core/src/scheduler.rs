//! Dependency scheduler
//!
//! Executes a validated plan:
//! - A step becomes ready once every dependency is done
//! - Ready steps run concurrently up to `max_concurrency`, lowest id first
//! - A failure fails only its step; transitive dependents are skipped and
//!   unrelated branches keep running
//! - After every completion the early termination monitor is consulted
//! - A clarification reply pauses only the replying step; the plan suspends
//!   once nothing else can make progress
//!
//! Capability calls run as spawned tasks. On early termination the handles
//! are dropped: the calls finish in the background and their results are
//! discarded.

use crate::capability::{
    Capability, CapabilityOutcome, CapabilityRegistry, SharedContext, StepInput,
};
use crate::config::OrchestratorConfig;
use crate::context::{ExecutionContext, SkipReason, StepStatus};
use crate::error::{ContextError, StepErrorKind};
use crate::monitor::{EarlyTerminationMonitor, Verdict};
use delve_plan::{Plan, Step, StepId, StepRouter};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a plan execution ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Every step reached a terminal status
    Completed {
        /// Final records
        context: ExecutionContext,
        /// Whether the monitor cut the plan short
        early_terminated: bool,
    },
    /// A step is waiting for caller input
    Suspended {
        /// Records so far; paused steps are pending
        context: ExecutionContext,
        /// Lowest paused step
        step_id: StepId,
        /// Questions of every paused step, in step order
        questions: Vec<String>,
    },
}

/// Bounded-concurrency plan executor
#[derive(Debug, Clone)]
pub struct DependencyScheduler {
    router: StepRouter,
    registry: CapabilityRegistry,
    monitor: EarlyTerminationMonitor,
    max_concurrency: usize,
    step_timeout: Duration,
}

impl DependencyScheduler {
    /// Create a scheduler
    #[must_use]
    pub fn new(router: StepRouter, registry: CapabilityRegistry, config: &OrchestratorConfig) -> Self {
        Self {
            router,
            registry,
            monitor: EarlyTerminationMonitor::new(&config.early_termination),
            max_concurrency: config.scheduler.max_concurrency.max(1),
            step_timeout: config.scheduler.step_timeout(),
        }
    }

    /// With max concurrency
    #[inline]
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// With step timeout
    #[inline]
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Maximum concurrently running steps
    #[inline]
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Execute a plan from the given records
    ///
    /// Pass a fresh [`ExecutionContext`] to start, or the context of a
    /// suspended run to resume its paused steps. Done steps are never run
    /// again.
    pub async fn execute(
        &self,
        plan: &Plan,
        mut context: ExecutionContext,
        shared: Arc<SharedContext>,
    ) -> ScheduleOutcome {
        let plan_id = plan.id();
        let mut in_flight = FuturesUnordered::new();
        let mut paused: BTreeMap<StepId, Vec<String>> = BTreeMap::new();
        let mut early_terminated = false;

        loop {
            while in_flight.len() < self.max_concurrency {
                let Some(step) = next_ready(plan, &context, &paused) else {
                    break;
                };
                log_context_error(context.mark_running(step.id));

                let capability = match self.resolve(step) {
                    Ok(capability) => capability,
                    Err(kind) => {
                        self.fail(plan, &mut context, step.id, kind, 0);
                        continue;
                    }
                };

                tracing::info!(
                    plan_id = %plan_id,
                    step_id = step.id.0,
                    step_type = %step.step_type,
                    "step dispatched"
                );
                let input = StepInput {
                    plan_id,
                    step: step.clone(),
                    dependency_outputs: context.dependency_outputs(step),
                };
                let shared = Arc::clone(&shared);
                let timeout = self.step_timeout;
                let id = step.id;
                let handle = tokio::spawn(async move {
                    let started = Instant::now();
                    let result = tokio::time::timeout(timeout, capability.invoke(&input, &shared)).await;
                    (result, started.elapsed())
                });
                in_flight.push(handle.map(move |joined| (id, joined)));
            }

            let Some((id, joined)) = in_flight.next().await else {
                break;
            };

            let (result, elapsed) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    let kind = StepErrorKind::capability(format!("capability task ended abnormally: {err}"));
                    self.fail(plan, &mut context, id, kind, 0);
                    continue;
                }
            };
            let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    let kind = StepErrorKind::Timeout {
                        ms: u64::try_from(self.step_timeout.as_millis()).unwrap_or(u64::MAX),
                    };
                    self.fail(plan, &mut context, id, kind, elapsed_ms);
                    continue;
                }
            };

            match outcome {
                CapabilityOutcome::Output(text) if text.trim().is_empty() => {
                    let kind = StepErrorKind::capability("capability returned no output");
                    self.fail(plan, &mut context, id, kind, elapsed_ms);
                }
                CapabilityOutcome::Output(text) => {
                    let Some(step) = plan.step(id) else { continue };
                    tracing::info!(
                        plan_id = %plan_id,
                        step_id = id.0,
                        step_type = %step.step_type,
                        elapsed_ms,
                        chars = text.chars().count(),
                        "step completed"
                    );
                    let verdict = self.monitor.evaluate(
                        step.step_type,
                        &text,
                        context
                            .records()
                            .filter(|(other, r)| *other != id && !r.status.is_terminal())
                            .map(|(_, r)| r.step_type),
                    );
                    log_context_error(context.mark_done(id, text, elapsed_ms));

                    if verdict == Verdict::Terminate {
                        let skipped = terminate(&mut context);
                        paused.clear();
                        early_terminated = true;
                        tracing::info!(
                            plan_id = %plan_id,
                            step_id = id.0,
                            skipped,
                            "early termination, remaining steps skipped"
                        );
                        break;
                    }
                }
                CapabilityOutcome::Failed(message) => {
                    self.fail(plan, &mut context, id, StepErrorKind::capability(message), elapsed_ms);
                }
                CapabilityOutcome::Clarification(questions) => {
                    if shared.allow_clarification {
                        tracing::info!(
                            plan_id = %plan_id,
                            step_id = id.0,
                            questions = questions.len(),
                            "step paused for clarification"
                        );
                        log_context_error(context.mark_paused(id));
                        paused.insert(id, questions);
                    } else {
                        self.fail(plan, &mut context, id, StepErrorKind::ClarificationRefused, elapsed_ms);
                    }
                }
            }
        }

        if let Some((&step_id, _)) = paused.iter().next() {
            let mut questions: Vec<String> = Vec::new();
            for q in paused.into_values().flatten() {
                if !questions.contains(&q) {
                    questions.push(q);
                }
            }
            return ScheduleOutcome::Suspended {
                context,
                step_id,
                questions,
            };
        }

        ScheduleOutcome::Completed {
            context,
            early_terminated,
        }
    }

    fn resolve(&self, step: &Step) -> Result<Arc<dyn Capability>, StepErrorKind> {
        let kind = self.router.route(step.step_type)?;
        self.registry
            .get(kind)
            .ok_or_else(|| StepErrorKind::capability(format!("no {kind} capability registered")))
    }

    /// Fail a step and skip everything downstream of it
    fn fail(
        &self,
        plan: &Plan,
        context: &mut ExecutionContext,
        id: StepId,
        kind: StepErrorKind,
        elapsed_ms: u64,
    ) {
        tracing::warn!(
            plan_id = %plan.id(),
            step_id = id.0,
            error = %kind,
            "step failed"
        );
        log_context_error(context.mark_failed(id, kind, elapsed_ms));

        for dependent in plan.transitive_dependents(id) {
            if context.status(dependent) == Some(StepStatus::Pending) {
                tracing::info!(
                    plan_id = %plan.id(),
                    step_id = dependent.0,
                    failed = id.0,
                    "step skipped, upstream failure"
                );
                log_context_error(
                    context.mark_skipped(dependent, SkipReason::UpstreamFailure { failed: id }),
                );
            }
        }
    }
}

/// Lowest-id pending step, not paused, with every dependency done
fn next_ready<'p>(
    plan: &'p Plan,
    context: &ExecutionContext,
    paused: &BTreeMap<StepId, Vec<String>>,
) -> Option<&'p Step> {
    plan.steps().iter().find(|step| {
        context.status(step.id) == Some(StepStatus::Pending)
            && !paused.contains_key(&step.id)
            && context.dependencies_done(step)
    })
}

/// Skip every unfinished step; returns how many
fn terminate(context: &mut ExecutionContext) -> usize {
    let mut ids = context.ids_with(StepStatus::Pending);
    ids.extend(context.ids_with(StepStatus::Running));
    for id in &ids {
        log_context_error(context.mark_skipped(*id, SkipReason::EarlyTermination));
    }
    ids.len()
}

fn log_context_error(result: Result<(), ContextError>) {
    if let Err(err) = result {
        tracing::error!(error = %err, "execution record out of sync");
    }
}
