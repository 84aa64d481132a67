use std::sync::Arc;

use contextshot_contracts::edits::{JobStatus, PendingJob, ProviderFailure, ProviderOutcome};
use contextshot_contracts::events::{BatchEvent, EventPayload, EventWriter};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::{CancelToken, Clock, Wait};
use crate::config::PollPolicy;
use crate::emit_event;
use crate::provider::{extract_generated_image, ProviderClient};
use crate::transport::{error_chain_text, HttpReply};

/// Final outcome of a pending job and how many status requests it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub outcome: ProviderOutcome,
    pub attempts: u32,
}

/// Result of classifying one status request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PollStep {
    Status(JobStatus),
    /// The request did not yield a usable status; retried within the budget.
    Transient(String),
    /// The provider answered with something that cannot lead to success.
    Fatal(ProviderFailure),
}

/// Drives a pending job to a terminal outcome.
///
/// Every status request costs one attempt from `PollPolicy::max_attempts`,
/// whether it reported `Queued`/`Running` or failed in transit. Running out
/// of attempts is a `timeout` failure. The poller sleeps `interval` between
/// attempts and never after the last one.
pub struct JobPoller {
    client: Arc<ProviderClient>,
    clock: Arc<dyn Clock>,
    policy: PollPolicy,
    events: Option<EventWriter>,
}

impl JobPoller {
    pub fn new(client: Arc<ProviderClient>, clock: Arc<dyn Clock>, policy: PollPolicy) -> Self {
        Self {
            client,
            clock,
            policy,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<EventWriter>) -> Self {
        self.events = events;
        self
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub fn await_completion(&self, job: &PendingJob, cancel: &CancelToken) -> PollReport {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_transient: Option<String> = None;

        for attempt in 1..=max_attempts {
            let step = classify_poll_reply(self.client.fetch_status(job));
            self.record_attempt(job, attempt, &step);

            match step {
                PollStep::Status(JobStatus::Succeeded(image)) => {
                    info!(job_id = %job.job_id, attempt, "job completed");
                    return PollReport {
                        outcome: ProviderOutcome::Immediate(image),
                        attempts: attempt,
                    };
                }
                PollStep::Status(JobStatus::Failed { reason }) => {
                    warn!(job_id = %job.job_id, attempt, %reason, "provider reported job failure");
                    return PollReport {
                        outcome: ProviderOutcome::Failed(ProviderFailure::job_failed(format!(
                            "job {}: {reason}",
                            job.job_id
                        ))),
                        attempts: attempt,
                    };
                }
                PollStep::Fatal(failure) => {
                    warn!(job_id = %job.job_id, attempt, %failure, "job status unusable");
                    return PollReport {
                        outcome: ProviderOutcome::Failed(failure),
                        attempts: attempt,
                    };
                }
                PollStep::Status(status) => {
                    debug!(
                        job_id = %job.job_id,
                        attempt,
                        max_attempts,
                        status = status.label(),
                        "job still in progress"
                    );
                }
                PollStep::Transient(detail) => {
                    warn!(job_id = %job.job_id, attempt, max_attempts, error = %detail, "transient status poll failure, retrying");
                    last_transient = Some(detail);
                }
            }

            if attempt == max_attempts {
                break;
            }
            if self.clock.sleep(self.policy.interval, cancel) == Wait::Interrupted {
                let why = match cancel.interruption(self.clock.now()) {
                    Some(interruption) => interruption.as_str(),
                    None => "cancelled",
                };
                info!(job_id = %job.job_id, attempt, reason = why, "stopped polling");
                return PollReport {
                    outcome: ProviderOutcome::Failed(ProviderFailure::cancelled(format!(
                        "{why} while polling job {} after {attempt} attempts",
                        job.job_id
                    ))),
                    attempts: attempt,
                };
            }
        }

        warn!(job_id = %job.job_id, max_attempts, "job polling timed out");
        PollReport {
            outcome: ProviderOutcome::Failed(ProviderFailure::timeout(
                max_attempts,
                last_transient.as_deref(),
            )),
            attempts: max_attempts,
        }
    }

    fn record_attempt(&self, job: &PendingJob, attempt: u32, step: &PollStep) {
        let (state, terminal) = match step {
            PollStep::Status(status) => (status.label(), status.is_terminal()),
            PollStep::Transient(_) => ("transient_error", false),
            PollStep::Fatal(_) => ("fatal_error", true),
        };
        let mut payload = EventPayload::new();
        payload.insert("job_id".to_string(), Value::String(job.job_id.clone()));
        payload.insert("attempt".to_string(), Value::from(attempt));
        payload.insert("max_attempts".to_string(), Value::from(self.policy.max_attempts));
        payload.insert("state".to_string(), Value::String(state.to_string()));
        payload.insert("terminal".to_string(), Value::Bool(terminal));
        emit_event(self.events.as_ref(), BatchEvent::JobPolled, payload);
    }
}

/// Maps one status response onto the job state machine.
///
/// Status vocabulary: `pending` is queued; `processing` and `IN_PROGRESS`
/// are running; `completed` and `COMPLETED` succeed; `failed` fails. Any
/// other value is a hard failure rather than a reason to keep polling.
pub(crate) fn classify_poll_reply(reply: anyhow::Result<HttpReply>) -> PollStep {
    let reply = match reply {
        Ok(reply) => reply,
        Err(err) => return PollStep::Transient(error_chain_text(&err, 480)),
    };

    if !reply.is_success() {
        if is_transient_status(reply.status) {
            return PollStep::Transient(format!("status request returned HTTP {}", reply.status));
        }
        return PollStep::Fatal(ProviderFailure::http_status(reply.status, &reply.body));
    }

    let body = match reply.json() {
        Ok(body) => body,
        Err(err) => return PollStep::Transient(error_chain_text(&err, 480)),
    };
    let raw_status = body.get("status").and_then(Value::as_str).unwrap_or_default();

    match raw_status {
        "pending" => PollStep::Status(JobStatus::Queued),
        "processing" | "IN_PROGRESS" => PollStep::Status(JobStatus::Running),
        "completed" | "COMPLETED" => match extract_generated_image(&body) {
            Some(image) => PollStep::Status(JobStatus::Succeeded(image)),
            None => PollStep::Fatal(ProviderFailure::malformed(
                reply.status,
                &reply.body,
                "completed job is missing result.image_url",
            )),
        },
        "failed" => {
            let reason = body
                .get("error")
                .map(|value| match value {
                    Value::String(text) => text.trim().to_string(),
                    other => other.to_string(),
                })
                .filter(|text| !text.is_empty())
                .unwrap_or_else(|| "Unknown error".to_string());
            PollStep::Status(JobStatus::Failed { reason })
        }
        other => PollStep::Fatal(ProviderFailure::unknown_status(other, &reply.body)),
    }
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (500..600).contains(&status)
}
