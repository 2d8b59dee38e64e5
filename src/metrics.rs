use std::time::Instant;

use crate::types::{
    Feedback, OverallReport, PhaseOutcome, PhaseReport, RunOutcome, RunReport,
};

/// Bookkeeping for one phase while it is active.
#[derive(Debug)]
struct PhaseMetrics {
    phase_id: u32,
    attempts: u32,
    final_coverage: f64,
    status: PhaseOutcome,
    started: Instant,
    duration_seconds: f64,
    implicit_evaluation: Option<Feedback>,
}

/// Accumulates per-phase attempts, coverage, durations, and statuses, and
/// renders the final run report. Owned by the runner; phases are recorded in
/// entry order.
#[derive(Debug)]
pub struct MetricsCollector {
    task_id: String,
    agent_id: String,
    run_started: Instant,
    phases: Vec<PhaseMetrics>,
}

impl MetricsCollector {
    pub fn new(task_id: &str, agent_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            run_started: Instant::now(),
            phases: Vec::new(),
        }
    }

    /// Start tracking a phase. Phases are finished in the order they begin.
    pub fn begin_phase(&mut self, phase_id: u32) {
        self.phases.push(PhaseMetrics {
            phase_id,
            attempts: 0,
            final_coverage: 0.0,
            status: PhaseOutcome::Failed,
            started: Instant::now(),
            duration_seconds: 0.0,
            implicit_evaluation: None,
        });
    }

    /// Attach the implicit phase-transition evaluation snapshot.
    pub fn record_implicit(&mut self, feedback: Feedback) {
        if let Some(current) = self.phases.last_mut() {
            current.implicit_evaluation = Some(feedback);
        }
    }

    /// Record one counted attempt and its coverage.
    pub fn record_attempt(&mut self, coverage: f64) {
        if let Some(current) = self.phases.last_mut() {
            current.attempts += 1;
            current.final_coverage = coverage;
        }
    }

    /// Close out the current phase. A phase satisfied purely by its implicit
    /// evaluation has zero attempts; its final coverage comes from that
    /// snapshot.
    pub fn finish_phase(&mut self, status: PhaseOutcome) {
        if let Some(current) = self.phases.last_mut() {
            current.status = status;
            current.duration_seconds = current.started.elapsed().as_secs_f64();
            if current.attempts == 0 {
                if let Some(ref implicit) = current.implicit_evaluation {
                    current.final_coverage = implicit.summary.coverage;
                }
            }
        }
    }

    /// Counted attempts across all phases.
    pub fn total_attempts(&self) -> u32 {
        self.phases.iter().map(|p| p.attempts).sum()
    }

    /// Phases that ended `valid`.
    pub fn phases_completed(&self) -> u32 {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseOutcome::Valid)
            .count() as u32
    }

    /// Render the final report.
    pub fn report(&self, status: RunOutcome) -> RunReport {
        RunReport {
            task_id: self.task_id.clone(),
            agent_id: self.agent_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            phases: self
                .phases
                .iter()
                .map(|p| PhaseReport {
                    phase_id: p.phase_id,
                    status: p.status,
                    attempts: p.attempts,
                    final_coverage: p.final_coverage,
                    duration_seconds: p.duration_seconds,
                    implicit_evaluation: p.implicit_evaluation.clone(),
                })
                .collect(),
            overall: OverallReport {
                status,
                total_attempts: self.total_attempts(),
                phases_completed: self.phases_completed(),
                total_duration_seconds: self.run_started.elapsed().as_secs_f64(),
            },
        }
    }
}
