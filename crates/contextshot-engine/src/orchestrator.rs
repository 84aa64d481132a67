use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use contextshot_contracts::edits::ProviderOutcome;
use contextshot_contracts::events::{BatchEvent, EventPayload, EventWriter};
use contextshot_contracts::runs::{
    BatchItem, BatchItemResult, BatchSummary, Interruption, ItemOutcome,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::clock::{CancelToken, Clock, Wait};
use crate::config::{BatchOptions, PollPolicy};
use crate::emit_event;
use crate::poller::JobPoller;
use crate::provider::ProviderClient;

/// Runs a batch of edits one at a time.
///
/// Items are processed strictly in order with `pace_interval` between them.
/// A failed item is recorded and the batch moves on; only cancellation or
/// the batch deadline stop it early, and then the summary holds the items
/// processed so far.
pub struct BatchOrchestrator {
    client: Arc<ProviderClient>,
    poller: JobPoller,
    clock: Arc<dyn Clock>,
    options: BatchOptions,
    events: Option<EventWriter>,
}

impl BatchOrchestrator {
    pub fn new(
        client: Arc<ProviderClient>,
        clock: Arc<dyn Clock>,
        policy: PollPolicy,
        options: BatchOptions,
    ) -> Self {
        let poller = JobPoller::new(Arc::clone(&client), Arc::clone(&clock), policy);
        Self {
            client,
            poller,
            clock,
            options,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.poller = self.poller.with_events(Some(events.clone()));
        self.events = Some(events);
        self
    }

    pub fn run(&self, items: Vec<BatchItem>, cancel: &CancelToken) -> Result<BatchSummary> {
        if items.is_empty() && !self.options.allow_empty {
            bail!("batch has no items to process");
        }
        let deadline = self
            .options
            .deadline
            .and_then(|budget| self.clock.now().checked_add(budget));
        let cancel = match deadline {
            Some(deadline) => cancel.with_deadline(deadline),
            None => cancel.clone(),
        };

        let total = items.len();
        let mut summary = BatchSummary::new(total);
        let mut interruption: Option<Interruption> = None;

        info!(
            items = total,
            pace_ms = millis(self.options.pace_interval),
            poll_attempts = self.poller.policy().max_attempts,
            "batch started"
        );
        let mut payload = EventPayload::new();
        payload.insert("requested".to_string(), Value::from(total));
        payload.insert(
            "pace_ms".to_string(),
            Value::from(millis(self.options.pace_interval)),
        );
        emit_event(self.events.as_ref(), BatchEvent::BatchStarted, payload);

        for (position, item) in items.into_iter().enumerate() {
            if position > 0 {
                let mut payload = EventPayload::new();
                payload.insert("next_position".to_string(), Value::from(position));
                emit_event(self.events.as_ref(), BatchEvent::BatchPaced, payload);
                if self.clock.sleep(self.options.pace_interval, &cancel) == Wait::Interrupted {
                    interruption = Some(self.interruption_or_cancelled(&cancel));
                    break;
                }
            }
            if let Some(stop) = cancel.interruption(self.clock.now()) {
                interruption = Some(stop);
                break;
            }

            let result = self.process_item(position, total, item, &cancel);
            summary.push(result);

            if position + 1 == total {
                break;
            }
            if let Some(stop) = cancel.interruption(self.clock.now()) {
                interruption = Some(stop);
                break;
            }
        }

        let summary = summary.finish(interruption);
        match summary.interruption {
            Some(stop) => warn!(
                processed = summary.items.len(),
                requested = total,
                reason = stop.as_str(),
                "batch stopped early"
            ),
            None => info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                "batch finished"
            ),
        }
        let mut payload = EventPayload::new();
        payload.insert("requested".to_string(), Value::from(total));
        payload.insert("processed".to_string(), Value::from(summary.items.len()));
        payload.insert("succeeded".to_string(), Value::from(summary.succeeded));
        payload.insert("failed".to_string(), Value::from(summary.failed));
        payload.insert(
            "interruption".to_string(),
            summary
                .interruption
                .map(|stop| Value::String(stop.as_str().to_string()))
                .unwrap_or(Value::Null),
        );
        emit_event(self.events.as_ref(), BatchEvent::BatchFinished, payload);

        Ok(summary)
    }

    fn process_item(
        &self,
        position: usize,
        total: usize,
        item: BatchItem,
        cancel: &CancelToken,
    ) -> BatchItemResult {
        let started = self.clock.now();
        let BatchItem {
            variation_id,
            request,
            metrics,
        } = item;

        info!(
            position,
            total,
            variation = %variation_id,
            operation = request.operation().as_str(),
            "submitting variation"
        );
        let mut payload = EventPayload::new();
        payload.insert("position".to_string(), Value::from(position));
        payload.insert("variation_id".to_string(), Value::String(variation_id.clone()));
        payload.insert(
            "operation".to_string(),
            Value::String(request.operation().as_str().to_string()),
        );
        payload.insert(
            "image".to_string(),
            Value::String(request.image_fingerprint()),
        );
        payload.insert(
            "seed".to_string(),
            request.seed().map(Value::from).unwrap_or(Value::Null),
        );
        emit_event(self.events.as_ref(), BatchEvent::ItemSubmitted, payload);

        let mut polls = 0;
        let submitted = self.client.submit(&request);
        let submit_kind = submitted.kind();
        let outcome = match submitted {
            ProviderOutcome::Pending(job) => {
                let report = self.poller.await_completion(&job, cancel);
                polls = report.attempts;
                report.outcome
            }
            other => other,
        };
        let outcome = ItemOutcome::from_final(outcome, &request);
        let elapsed_ms = millis(self.clock.now().saturating_duration_since(started));

        match &outcome {
            ItemOutcome::Succeeded { result_url, .. } => {
                info!(position, variation = %variation_id, %result_url, polls, "variation generated")
            }
            ItemOutcome::Failed { error } => {
                warn!(position, variation = %variation_id, %error, polls, "variation failed")
            }
        }
        let mut payload = EventPayload::new();
        payload.insert("position".to_string(), Value::from(position));
        payload.insert("variation_id".to_string(), Value::String(variation_id.clone()));
        payload.insert(
            "submit_outcome".to_string(),
            Value::String(submit_kind.to_string()),
        );
        payload.insert("polls".to_string(), Value::from(polls));
        payload.insert("elapsed_ms".to_string(), Value::from(elapsed_ms));
        payload.insert(
            "outcome".to_string(),
            serde_json::to_value(&outcome).unwrap_or(Value::Null),
        );
        emit_event(self.events.as_ref(), BatchEvent::ItemFinished, payload);

        BatchItemResult {
            position,
            variation_id,
            outcome,
            metrics,
            polls,
            elapsed_ms,
        }
    }

    fn interruption_or_cancelled(&self, cancel: &CancelToken) -> Interruption {
        cancel
            .interruption(self.clock.now())
            .unwrap_or(Interruption::Cancelled)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use contextshot_contracts::edits::{EditRequest, FailureReason};
    use contextshot_contracts::events::EventWriter;
    use contextshot_contracts::runs::{
        BatchAggregates, BatchItem, Interruption, ItemOutcome, VariationMetrics,
    };
    use serde_json::{json, Value};

    use super::{millis, BatchOrchestrator};
    use crate::clock::{CancelToken, Clock, ManualClock, Wait};
    use crate::config::{BatchOptions, PollPolicy, ProviderConfig};
    use crate::provider::ProviderClient;
    use crate::testing::{Scripted, ScriptedTransport};

    const PACE: Duration = Duration::from_secs(3);
    const POLL: Duration = Duration::from_millis(500);

    fn orchestrator(
        transport: &Arc<ScriptedTransport>,
        clock: &Arc<ManualClock>,
        options: BatchOptions,
    ) -> BatchOrchestrator {
        let client = ProviderClient::with_transport(
            ProviderConfig::new("tok").with_api_base("https://bria.test/v2"),
            transport.clone(),
        );
        BatchOrchestrator::new(
            Arc::new(client),
            clock.clone(),
            PollPolicy::new(5, POLL),
            options,
        )
    }

    fn paced() -> BatchOptions {
        BatchOptions {
            pace_interval: PACE,
            ..BatchOptions::default()
        }
    }

    fn items(count: usize) -> Vec<BatchItem> {
        (0..count)
            .map(|idx| BatchItem {
                variation_id: format!("variation-{idx}"),
                request: EditRequest::replace_background(vec![7u8; 16], "on a linen tablecloth")
                    .with_seed(Some(100 + idx as i64)),
                metrics: VariationMetrics {
                    cost_saved: 100.0,
                    time_saved_hours: 2.0,
                    predicted_ctr: 0.04,
                    engagement_score: 8.0,
                },
            })
            .collect()
    }

    fn immediate(url: &str) -> Scripted {
        Scripted::reply(200, json!({"result": {"image_url": url}}))
    }

    #[test]
    fn synchronous_success_does_not_poll() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_post(immediate("https://cdn.bria.test/0.png"));
        let clock = Arc::new(ManualClock::new());

        let summary = orchestrator(&transport, &clock, paced()).run(items(1), &CancelToken::new())?;

        assert_eq!(summary.items.len(), 1);
        assert_eq!(summary.items[0].outcome.result_url(), Some("https://cdn.bria.test/0.png"));
        assert_eq!(summary.items[0].polls, 0);
        assert_eq!(transport.count("GET"), 0);
        assert!(clock.sleeps().is_empty());
        Ok(())
    }

    #[test]
    fn mixed_batch_keeps_order_and_counts() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_post(immediate("https://cdn.bria.test/0.png"));
        transport.push_post(Scripted::raw(500, "internal error"));
        transport.push_post(Scripted::accepted("req-2"));
        transport.push_post(Scripted::network("connection refused"));
        transport.push_get(Scripted::status("pending"));
        transport.push_get(Scripted::status("processing"));
        transport.push_get(Scripted::completed("https://cdn.bria.test/2.png"));
        let clock = Arc::new(ManualClock::new());

        let summary = orchestrator(&transport, &clock, paced()).run(items(4), &CancelToken::new())?;

        assert!(summary.is_complete());
        assert_eq!(summary.items.len(), 4);
        let ids: Vec<&str> = summary.items.iter().map(|item| item.variation_id.as_str()).collect();
        assert_eq!(ids, vec!["variation-0", "variation-1", "variation-2", "variation-3"]);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 2);

        assert_eq!(
            summary.items[1].outcome.error().map(|err| (err.reason, err.status_code)),
            Some((FailureReason::HttpStatus, Some(500)))
        );
        assert_eq!(summary.items[2].polls, 3);
        assert_eq!(summary.items[2].outcome.result_url(), Some("https://cdn.bria.test/2.png"));
        assert_eq!(
            summary.items[3].outcome.error().map(|err| err.reason),
            Some(FailureReason::Network)
        );

        assert_eq!(summary.aggregates.total_cost_saved, 200.0);
        assert_eq!(summary.aggregates.ai_generation_cost, 1.0);

        let pacing = clock.sleeps().iter().filter(|sleep| **sleep == PACE).count();
        assert_eq!(pacing, 3);
        assert_eq!(clock.sleeps().iter().filter(|sleep| **sleep == POLL).count(), 2);
        Ok(())
    }

    #[test]
    fn pacing_is_unconditional_and_skips_after_last_item() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..5 {
            transport.push_post(Scripted::raw(503, "overloaded"));
        }
        let clock = Arc::new(ManualClock::new());

        let summary = orchestrator(&transport, &clock, paced()).run(items(5), &CancelToken::new())?;

        assert_eq!(summary.items.len(), 5);
        assert_eq!(summary.failed, 5);
        assert_eq!(clock.sleeps(), vec![PACE; 4]);
        assert_eq!(summary.aggregates, BatchAggregates::default());
        Ok(())
    }

    #[test]
    fn seeds_and_prompt_reach_the_wire() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_post(immediate("https://cdn.bria.test/0.png"));
        transport.push_post(immediate("https://cdn.bria.test/1.png"));
        let clock = Arc::new(ManualClock::new());

        let summary = orchestrator(&transport, &clock, paced()).run(items(2), &CancelToken::new())?;

        let seeds: Vec<Value> = transport
            .calls()
            .iter()
            .filter_map(|call| call.payload.as_ref().map(|payload| payload["seed"].clone()))
            .collect();
        assert_eq!(seeds, vec![json!(100), json!(101)]);
        assert_eq!(
            summary.items[1].outcome,
            ItemOutcome::Succeeded {
                result_url: "https://cdn.bria.test/1.png".to_string(),
                refined_prompt: Some("on a linen tablecloth".to_string()),
                seed: Some(101),
            }
        );
        Ok(())
    }

    #[test]
    fn cancellation_during_pacing_keeps_processed_items_only() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_post(immediate("https://cdn.bria.test/0.png"));
        transport.push_post(immediate("https://cdn.bria.test/1.png"));
        transport.push_post(immediate("https://cdn.bria.test/2.png"));
        let cancel = CancelToken::new();
        transport.cancel_after_posts(2, cancel.clone());
        let clock = Arc::new(ManualClock::new());

        let summary = orchestrator(&transport, &clock, paced()).run(items(4), &cancel)?;

        assert_eq!(summary.interruption, Some(Interruption::Cancelled));
        assert_eq!(summary.items.len(), 2);
        assert_eq!(summary.succeeded, 2);
        assert!(!summary.is_complete());
        assert_eq!(transport.count("POST"), 2);
        Ok(())
    }

    #[test]
    fn deadline_while_polling_records_in_flight_item_as_cancelled() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_post(immediate("https://cdn.bria.test/0.png"));
        transport.push_post(Scripted::accepted("req-1"));
        for _ in 0..5 {
            transport.push_get(Scripted::status("processing"));
        }
        let clock = Arc::new(ManualClock::new());
        let options = BatchOptions {
            pace_interval: PACE,
            deadline: Some(Duration::from_secs(4)),
            allow_empty: true,
        };

        let summary = orchestrator(&transport, &clock, options).run(items(3), &CancelToken::new())?;

        assert_eq!(summary.interruption, Some(Interruption::DeadlineExceeded));
        assert_eq!(summary.items.len(), 2);
        assert_eq!(
            summary.items[1].outcome.error().map(|err| err.reason),
            Some(FailureReason::Cancelled)
        );
        assert_eq!(summary.items[1].polls, 2);
        assert_eq!(summary.succeeded, 1);
        Ok(())
    }

    #[test]
    fn empty_batch_policy_is_configurable() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::new());
        let clock = Arc::new(ManualClock::new());

        let summary = orchestrator(&transport, &clock, paced()).run(Vec::new(), &CancelToken::new())?;
        assert!(summary.items.is_empty());
        assert!(summary.is_complete());

        let strict = BatchOptions {
            allow_empty: false,
            ..paced()
        };
        let err = orchestrator(&transport, &clock, strict)
            .run(Vec::new(), &CancelToken::new())
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert_eq!(err, "batch has no items to process");
        Ok(())
    }

    #[test]
    fn batch_events_are_written_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_post(Scripted::accepted("req-0"));
        transport.push_post(Scripted::raw(400, "bad image"));
        transport.push_get(Scripted::completed("https://cdn.bria.test/0.png"));
        let clock = Arc::new(ManualClock::new());

        orchestrator(&transport, &clock, paced())
            .with_events(EventWriter::new(&events_path, "batch-test"))
            .run(items(2), &CancelToken::new())?;

        let raw = std::fs::read_to_string(&events_path)?;
        let rows: Vec<Value> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .collect();
        let types: Vec<&str> = rows
            .iter()
            .filter_map(|row| row.get("type").and_then(Value::as_str))
            .collect();
        assert_eq!(
            types,
            vec![
                "batch_started",
                "item_submitted",
                "job_polled",
                "item_finished",
                "batch_paced",
                "item_submitted",
                "item_finished",
                "batch_finished",
            ]
        );
        assert!(rows.iter().all(|row| row["batch_id"] == json!("batch-test")));
        assert_eq!(rows[2]["terminal"], json!(true));
        assert_eq!(rows[3]["submit_outcome"], json!("pending"));
        assert_eq!(rows[3]["outcome"]["status"], json!("succeeded"));
        assert_eq!(rows[6]["submit_outcome"], json!("failed"));
        assert_eq!(rows[6]["outcome"]["error"]["status_code"], json!(400));
        assert_eq!(rows[7]["succeeded"], json!(1));
        Ok(())
    }

    #[test]
    fn unrepresentable_deadline_means_no_deadline() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_post(immediate("https://cdn.bria.test/0.png"));
        let clock = Arc::new(ManualClock::new());
        let options = BatchOptions {
            deadline: Some(Duration::from_secs(u64::MAX)),
            ..paced()
        };

        let summary = orchestrator(&transport, &clock, options).run(items(1), &CancelToken::new())?;

        assert!(summary.is_complete());
        assert_eq!(summary.interruption, None);
        assert_eq!(summary.succeeded, 1);
        Ok(())
    }

    /// Moves forward one second every time it is read.
    struct SteppingClock {
        origin: Instant,
        reads: AtomicU32,
    }

    impl Clock for SteppingClock {
        fn now(&self) -> Instant {
            let step = self.reads.fetch_add(1, Ordering::SeqCst);
            self.origin + Duration::from_secs(u64::from(step))
        }

        fn sleep(&self, _duration: Duration, _cancel: &CancelToken) -> Wait {
            Wait::Elapsed
        }
    }

    #[test]
    fn deadline_passing_during_last_item_keeps_batch_complete() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_post(immediate("https://cdn.bria.test/0.png"));
        let client = ProviderClient::with_transport(ProviderConfig::new("tok"), transport.clone());
        let clock = Arc::new(SteppingClock {
            origin: Instant::now(),
            reads: AtomicU32::new(0),
        });
        let options = BatchOptions {
            deadline: Some(Duration::from_millis(3500)),
            ..paced()
        };
        let orchestrator = BatchOrchestrator::new(
            Arc::new(client),
            clock.clone(),
            PollPolicy::new(5, POLL),
            options,
        );

        let summary = orchestrator.run(items(1), &CancelToken::new())?;

        assert!(clock.reads.load(Ordering::SeqCst) >= 4);
        assert_eq!(summary.items.len(), 1);
        assert_eq!(summary.interruption, None);
        assert!(summary.is_complete());
        Ok(())
    }

    #[test]
    fn millis_saturates_instead_of_truncating() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
