use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bench_error::BenchError;
use crate::evaluator;
use crate::feedback;
use crate::metrics::MetricsCollector;
use crate::obfuscate::obfuscate_scope;
use crate::sandbox::SandboxLauncher;
use crate::task::LoadedTask;
use crate::types::{
    AttemptStatus, Feedback, Phase, PhaseOutcome, PhaseView, RuleView, RunOutcome, RunReport,
    TaskView,
};
use crate::workspace::{SolutionFingerprint, SolutionWait, Workspace};
use crate::{log_debug, log_info};

/// Parameters for one run.
pub struct RunParams {
    pub agent_id: String,
    pub poll_interval: Duration,
    /// One-shot mode: evaluate the existing `solution` once and stop.
    pub single: bool,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            agent_id: "anonymous".to_string(),
            poll_interval: Duration::from_millis(500),
            single: false,
        }
    }
}

/// How the attempt loop for one phase ended.
#[derive(Debug, PartialEq, Eq)]
enum PhaseEnd {
    /// An attempt came back `valid`; advance (or complete if last).
    Satisfied,
    /// Per-phase attempt budget consumed without a valid attempt.
    Exhausted,
    /// Global attempt budget consumed.
    TotalExhausted,
    /// One-shot mode: the single counted attempt finished with this status.
    SingleDone(AttemptStatus),
    /// Operator quit or external cancellation.
    Quit,
}

/// The task execution state machine.
///
/// Drives `phase -> attempt* -> advance or terminate`: publishes the phase
/// view, waits for a solution, obtains a callable from the sandbox, runs the
/// evaluator, writes feedback, and applies the termination rules. On every
/// phase entry after the first, the previous solution is re-evaluated
/// against the new phase's rules as a free, uncounted signal.
pub struct Runner<'a> {
    task: &'a LoadedTask,
    sandbox: &'a dyn SandboxLauncher,
    workspace: &'a Workspace,
    params: RunParams,
    metrics: MetricsCollector,
    /// Global counted-attempt counter; attempt ids are monotone per task.
    total_attempts: u32,
    /// Most recent feedback (counted or implicit), baseline for deltas.
    last_feedback: Option<Feedback>,
    /// Most recent evaluated solution source, input to implicit evaluations.
    last_source: Option<String>,
    /// Implicit evaluation of the phase currently being attempted, kept so
    /// republished phase views retain it.
    current_implicit: Option<Feedback>,
}

impl<'a> Runner<'a> {
    pub fn new(
        task: &'a LoadedTask,
        sandbox: &'a dyn SandboxLauncher,
        workspace: &'a Workspace,
        params: RunParams,
    ) -> Self {
        let metrics = MetricsCollector::new(&task.config.task_id, &params.agent_id);
        Self {
            task,
            sandbox,
            workspace,
            params,
            metrics,
            total_attempts: 0,
            last_feedback: None,
            last_source: None,
            current_implicit: None,
        }
    }

    /// Execute the task to termination and emit the report.
    ///
    /// On an internal error a best-effort partial report with `error` status
    /// is still written before the error propagates.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<RunReport, BenchError> {
        match self.run_inner(cancel).await {
            Ok(outcome) => {
                let report = self.metrics.report(outcome);
                self.workspace.write_report(&report)?;
                Ok(report)
            }
            Err(e) => {
                let report = self.metrics.report(RunOutcome::Error);
                let _ = self.workspace.write_report(&report);
                Err(e)
            }
        }
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> Result<RunOutcome, BenchError> {
        self.workspace.publish_problem(&self.task.problem)?;
        self.workspace.publish_task(&self.task_view())?;

        // Baseline: whatever `solution` holds at start is not an attempt.
        let (_, mut fingerprint) = self.workspace.read_solution()?;

        let total_phases = self.task.config.phases.len();
        for (idx, phase) in self.task.config.phases.iter().enumerate() {
            let is_last = idx + 1 == total_phases;
            self.metrics.begin_phase(phase.id);

            // Implicit phase-transition evaluation: a free signal about what
            // the inherited solution now violates. Never counted.
            self.current_implicit = match self.last_source.clone() {
                Some(source) if phase.id > 0 => {
                    let fb = self.evaluate_source(&source, phase, None).await;
                    self.metrics.record_implicit(fb.clone());
                    self.last_feedback = Some(fb.clone());
                    Some(fb)
                }
                _ => None,
            };

            self.workspace.publish_phase(&self.phase_view(phase, 0))?;

            let implicit_valid = self
                .current_implicit
                .as_ref()
                .map(|fb| fb.status == AttemptStatus::Valid)
                .unwrap_or(false);

            if implicit_valid {
                // The inherited solution already satisfies this phase; cross
                // it without requiring a re-submission.
                log_info!("[phase {}] Satisfied by inherited solution", phase.id);
                self.metrics.finish_phase(PhaseOutcome::Valid);
                if is_last {
                    return Ok(RunOutcome::Completed);
                }
                continue;
            }

            match self.run_phase(phase, &mut fingerprint, cancel).await? {
                PhaseEnd::Satisfied => {
                    self.metrics.finish_phase(PhaseOutcome::Valid);
                    if is_last {
                        return Ok(RunOutcome::Completed);
                    }
                }
                PhaseEnd::Exhausted => {
                    log_info!(
                        "[phase {}] Attempt budget exhausted without a valid solution",
                        phase.id
                    );
                    self.metrics.finish_phase(PhaseOutcome::Failed);
                    return Ok(RunOutcome::Failed);
                }
                PhaseEnd::TotalExhausted => {
                    log_info!("[phase {}] Total attempt budget exhausted", phase.id);
                    self.metrics.finish_phase(PhaseOutcome::Failed);
                    return Ok(RunOutcome::Failed);
                }
                PhaseEnd::Quit => {
                    log_info!("[phase {}] Operator quit", phase.id);
                    self.metrics.finish_phase(PhaseOutcome::Aborted);
                    return Ok(RunOutcome::Aborted);
                }
                PhaseEnd::SingleDone(status) => {
                    let (phase_outcome, run_outcome) = match status {
                        AttemptStatus::Valid if is_last => {
                            (PhaseOutcome::Valid, RunOutcome::Completed)
                        }
                        AttemptStatus::Valid => (PhaseOutcome::Valid, RunOutcome::Failed),
                        AttemptStatus::Error => (PhaseOutcome::Error, RunOutcome::Error),
                        _ => (PhaseOutcome::Failed, RunOutcome::Failed),
                    };
                    self.metrics.finish_phase(phase_outcome);
                    return Ok(run_outcome);
                }
            }
        }

        // Phase list is non-empty by validation; the loop always returns.
        Err(BenchError::Internal(
            "phase loop ended without a terminal state".to_string(),
        ))
    }

    /// Attempt loop for one phase.
    async fn run_phase(
        &mut self,
        phase: &Phase,
        fingerprint: &mut SolutionFingerprint,
        cancel: &CancellationToken,
    ) -> Result<PhaseEnd, BenchError> {
        let limits = self.task.config.limits.clone();
        let mut phase_attempts = 0u32;

        loop {
            // A phase entered with the global budget already spent can never
            // receive a counted attempt; stop instead of waiting forever.
            if self.total_attempts >= limits.max_total_attempts {
                return Ok(PhaseEnd::TotalExhausted);
            }

            let source = if self.params.single {
                let (source, fp) = self.workspace.read_solution()?;
                *fingerprint = fp;
                source
            } else {
                log_info!(
                    "[phase {}] Waiting for solution ({}/{} phase attempts used)",
                    phase.id,
                    phase_attempts,
                    limits.max_attempts_per_phase
                );
                match self
                    .workspace
                    .wait_for_solution(fingerprint, self.params.poll_interval, cancel)
                    .await
                {
                    SolutionWait::NewSolution {
                        source,
                        fingerprint: fp,
                    } => {
                        *fingerprint = fp;
                        source
                    }
                    SolutionWait::Cancelled | SolutionWait::QuitRequested => {
                        return Ok(PhaseEnd::Quit);
                    }
                }
            };

            // Evaluating: counted regardless of load success.
            self.total_attempts += 1;
            phase_attempts += 1;
            let attempt_id = self.total_attempts;
            log_info!(
                "[phase {}] Evaluating attempt {} ({} bytes)",
                phase.id,
                attempt_id,
                source.len()
            );

            let fb = self.evaluate_source(&source, phase, Some(attempt_id)).await;
            self.metrics.record_attempt(fb.summary.coverage);
            self.workspace.write_feedback(&fb)?;
            self.workspace
                .publish_phase(&self.phase_view(phase, phase_attempts))?;

            let status = fb.status;
            log_info!(
                "[phase {}] Attempt {}: {} (coverage {:.2})",
                phase.id,
                attempt_id,
                status,
                fb.summary.coverage
            );

            self.last_feedback = Some(fb);
            self.last_source = Some(source);

            if self.params.single {
                return Ok(PhaseEnd::SingleDone(status));
            }

            // Termination priority
            if status == AttemptStatus::Valid {
                return Ok(PhaseEnd::Satisfied);
            }
            if phase_attempts >= limits.max_attempts_per_phase {
                return Ok(PhaseEnd::Exhausted);
            }
            if self.total_attempts >= limits.max_total_attempts {
                return Ok(PhaseEnd::TotalExhausted);
            }
        }
    }

    /// Load the source and evaluate it against one phase. Load failures
    /// short-circuit into `error`-status feedback; they never crash the run.
    async fn evaluate_source(
        &self,
        source: &str,
        phase: &Phase,
        attempt_id: Option<u32>,
    ) -> Feedback {
        let config = &self.task.config;
        let timeout = Duration::from_secs_f64(config.execution.timeout_seconds);

        match self
            .sandbox
            .load(
                source,
                &config.interface.function_name,
                &config.interface.allowed_imports,
                timeout,
            )
            .await
        {
            Ok(mut callable) => {
                let evaluation = evaluator::evaluate(
                    callable.as_mut(),
                    &self.task.tests,
                    phase,
                    &self.task.evaluator,
                )
                .await;
                if let Some(secs) = evaluation.timed_out {
                    // The deadline killed the session mid-pass; the whole
                    // attempt is an execution error, not a verdict.
                    feedback::build_error(
                        phase,
                        attempt_id,
                        "Timeout",
                        &format!("call exceeded the {:.1}s budget", secs),
                    )
                } else {
                    feedback::build(phase, attempt_id, &evaluation, self.last_feedback.as_ref())
                }
            }
            Err(load_err) => {
                log_debug!("[sandbox] Load failed: {}", load_err);
                feedback::build_error(
                    phase,
                    attempt_id,
                    load_err.error_type(),
                    &load_err.to_string(),
                )
            }
        }
    }

    fn task_view(&self) -> TaskView {
        let config = &self.task.config;
        TaskView {
            task_id: config.task_id.clone(),
            name: config.name.clone(),
            difficulty: config.difficulty,
            interface: config.interface.clone(),
            execution: config.execution.clone(),
            limits: config.limits.clone(),
            total_phases: config.phases.len() as u32,
        }
    }

    /// The agent-facing phase view. Rule scopes are obfuscated here; rule
    /// ids, descriptions, and counters pass through verbatim.
    fn phase_view(&self, phase: &Phase, attempts_used: u32) -> PhaseView {
        let limits = &self.task.config.limits;
        PhaseView {
            phase_id: phase.id,
            description: phase.description.clone(),
            rules: phase
                .rules
                .iter()
                .map(|r| RuleView {
                    id: r.id.clone(),
                    description: r.description.clone(),
                    scopes: r.scopes.iter().map(|s| obfuscate_scope(s)).collect(),
                })
                .collect(),
            implicit_evaluation: self.current_implicit.clone(),
            attempts_used_this_phase: attempts_used,
            attempts_remaining_this_phase: limits
                .max_attempts_per_phase
                .saturating_sub(attempts_used),
            total_attempts_remaining: limits
                .max_total_attempts
                .saturating_sub(self.total_attempts),
        }
    }
}
