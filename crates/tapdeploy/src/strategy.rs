//! Ordered fallback chains for external steps.
//!
//! A step (an install, a build) is a list of strategies tried in order. The
//! first strategy that exits successfully ends the chain. Success on the
//! first strategy is `Succeeded`; success on a later one is `Degraded`, so
//! a fallback is always visible in the receipt. If every strategy fails the
//! step is `Failed` with the last reason.

use std::time::Instant;

use tapdeploy_process::{CommandRequest, run_command};
use tapdeploy_types::{StepOutcome, StrategyAttempt};

/// One way of performing a step.
#[derive(Debug, Clone)]
pub struct Strategy {
    pub name: String,
    pub request: CommandRequest,
}

impl Strategy {
    pub fn new(name: impl Into<String>, request: CommandRequest) -> Self {
        Self {
            name: name.into(),
            request,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainResult {
    /// Strategy that succeeded, or the last one tried.
    pub selected: Option<String>,
    pub outcome: StepOutcome,
    pub attempts: Vec<StrategyAttempt>,
    pub duration_ms: u64,
    /// The last failed attempt hit its timeout.
    pub timed_out: bool,
}

impl ChainResult {
    /// Downgrade a success to `Degraded` with the given reason.
    pub fn degrade(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.outcome = match std::mem::replace(&mut self.outcome, StepOutcome::Succeeded) {
            StepOutcome::Succeeded => StepOutcome::Degraded { reason },
            StepOutcome::Degraded { reason: earlier } => StepOutcome::Degraded {
                reason: format!("{reason}; {earlier}"),
            },
            failed @ StepOutcome::Failed { .. } => failed,
        };
    }
}

/// Run `strategies` in order until one succeeds.
///
/// `on_attempt` is called after each attempt, before the next strategy
/// starts.
pub fn run_strategies(
    strategies: &[Strategy],
    output_lines: usize,
    mut on_attempt: impl FnMut(&StrategyAttempt),
) -> ChainResult {
    let start = Instant::now();
    let mut attempts = Vec::with_capacity(strategies.len());
    let mut last_reason = "no strategy configured".to_string();
    let mut timed_out = false;

    for (index, strategy) in strategies.iter().enumerate() {
        let attempt = attempt(strategy, output_lines);
        on_attempt(&attempt);

        let succeeded = attempt.outcome.is_success();
        if let StepOutcome::Failed { reason } = &attempt.outcome {
            last_reason = format!("{}: {reason}", strategy.name);
        }
        timed_out = attempt.timed_out;
        attempts.push(attempt);

        if succeeded {
            let outcome = if index == 0 {
                StepOutcome::Succeeded
            } else {
                StepOutcome::Degraded {
                    reason: format!("fell back to {} after {last_reason}", strategy.name),
                }
            };
            return ChainResult {
                selected: Some(strategy.name.clone()),
                outcome,
                attempts,
                duration_ms: start.elapsed().as_millis() as u64,
                timed_out: false,
            };
        }
    }

    ChainResult {
        selected: strategies.last().map(|s| s.name.clone()),
        outcome: StepOutcome::Failed {
            reason: last_reason,
        },
        attempts,
        duration_ms: start.elapsed().as_millis() as u64,
        timed_out,
    }
}

fn attempt(strategy: &Strategy, output_lines: usize) -> StrategyAttempt {
    let command = strategy.request.display();
    match run_command(&strategy.request) {
        Ok(out) => {
            let outcome = if out.success() {
                StepOutcome::Succeeded
            } else if out.timed_out {
                StepOutcome::Failed {
                    reason: format!("timed out after {}", humantime::format_duration(out.duration())),
                }
            } else {
                match out.exit_code {
                    Some(code) => StepOutcome::Failed {
                        reason: format!("exit code {code}"),
                    },
                    None => StepOutcome::Failed {
                        reason: "terminated by signal".to_string(),
                    },
                }
            };
            StrategyAttempt {
                strategy: strategy.name.clone(),
                command,
                exit_code: out.exit_code,
                timed_out: out.timed_out,
                duration_ms: out.duration_ms,
                outcome,
                stdout_tail: non_empty(out.stdout_tail(output_lines)),
                stderr_tail: non_empty(out.stderr_tail(output_lines)),
            }
        }
        Err(err) => StrategyAttempt {
            strategy: strategy.name.clone(),
            command,
            exit_code: None,
            timed_out: false,
            duration_ms: 0,
            outcome: StepOutcome::Failed {
                reason: format!("{err:#}"),
            },
            stdout_tail: None,
            stderr_tail: None,
        },
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() { None } else { Some(s) }
}
