//! Background-replacement batches against the Bria image-editing API.
//!
//! `ProviderClient` speaks the wire contract, `JobPoller` drives async jobs
//! to completion and `BatchOrchestrator` runs variations one after another.
//! All waiting goes through a `Clock` so tests run in virtual time.

mod clock;
mod config;
mod orchestrator;
mod poller;
mod provider;
mod transport;

#[cfg(test)]
mod testing;

use contextshot_contracts::events::{BatchEvent, EventPayload, EventWriter};

pub use clock::{CancelToken, Clock, ManualClock, SystemClock, Wait};
pub use config::{
    non_empty_env, BatchOptions, PollPolicy, ProviderConfig, DEFAULT_API_BASE,
    DEFAULT_PACE_INTERVAL, DEFAULT_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL,
};
pub use orchestrator::BatchOrchestrator;
pub use poller::{JobPoller, PollReport};
pub use provider::{build_payload, interpret_submit_reply, ProviderClient};
pub use transport::{error_chain_text, is_timeout_error, HttpReply, HttpTransport, ReqwestTransport};

/// Appends an event when a writer is configured. A failed write is logged
/// and otherwise ignored so the batch keeps going.
pub(crate) fn emit_event(events: Option<&EventWriter>, event: BatchEvent, payload: EventPayload) {
    let Some(writer) = events else {
        return;
    };
    if let Err(err) = writer.emit(event, payload) {
        tracing::warn!(
            batch_id = writer.batch_id(),
            path = %writer.path().display(),
            event = event.as_str(),
            error = %format!("{err:#}"),
            "failed to append batch event"
        );
    }
}

#[cfg(test)]
mod tests {
    use contextshot_contracts::events::{BatchEvent, EventPayload, EventWriter};

    use super::emit_event;

    #[test]
    fn failed_event_write_does_not_interrupt_caller() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path(), "batch-dir");
        emit_event(Some(&writer), BatchEvent::BatchStarted, EventPayload::new());
        emit_event(None, BatchEvent::BatchFinished, EventPayload::new());
        assert!(temp.path().is_dir());
        Ok(())
    }
}
