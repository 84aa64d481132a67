use std::sync::Arc;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use contextshot_contracts::edits::{
    EditOperation, EditRequest, GeneratedImage, PendingJob, ProviderFailure, ProviderOutcome,
};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::transport::{
    error_chain_text, is_timeout_error, HttpReply, HttpTransport, ReqwestTransport,
};

const AUTH_HEADER: &str = "api_token";
const SHOT_SIZE: [u32; 2] = [1200, 1200];
const PLACEMENT_PADDING: u32 = 20;

/// Client for the provider's image edit endpoints.
///
/// One `submit` is one HTTP call. The client never retries a submission;
/// pending jobs are driven to completion by [`crate::JobPoller`].
pub struct ProviderClient {
    config: ProviderConfig,
    transport: Arc<dyn HttpTransport>,
}

impl ProviderClient {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(config.request_timeout)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: ProviderConfig, transport: Arc<dyn HttpTransport>) -> Self {
        info!(
            api_base = %config.api_base,
            token = %config.token_hint(),
            "provider client initialized"
        );
        Self { config, transport }
    }

    pub fn endpoint(&self, operation: EditOperation) -> String {
        format!("{}/{}", self.config.api_base, operation.endpoint_path())
    }

    pub fn submit(&self, request: &EditRequest) -> ProviderOutcome {
        let endpoint = self.endpoint(request.operation());
        let payload = build_payload(request);
        debug!(
            %endpoint,
            operation = request.operation().as_str(),
            image = %request.image_fingerprint(),
            image_bytes = request.image().len(),
            "submitting edit request"
        );

        let reply = match self.transport.post_json(
            &endpoint,
            &[(AUTH_HEADER, self.config.api_token.as_str()), ("Content-Type", "application/json")],
            &payload,
        ) {
            Ok(reply) => reply,
            Err(err) => {
                let detail = error_chain_text(&err, 480);
                warn!(%endpoint, timeout = is_timeout_error(&err), error = %detail, "edit submission transport failure");
                return ProviderOutcome::Failed(ProviderFailure::network(detail));
            }
        };

        let outcome = interpret_submit_reply(&reply);
        match &outcome {
            ProviderOutcome::Immediate(image) => {
                debug!(result_url = %image.result_url, "edit completed synchronously")
            }
            ProviderOutcome::Pending(job) => {
                debug!(job_id = %job.job_id, "edit accepted for asynchronous processing")
            }
            ProviderOutcome::Failed(failure) => warn!(%failure, "edit submission failed"),
        }
        outcome
    }

    /// One status request for a pending job. `Err` is a transport failure.
    pub fn fetch_status(&self, job: &PendingJob) -> Result<HttpReply> {
        self.transport.get(
            &job.status_url,
            &[(AUTH_HEADER, self.config.api_token.as_str())],
        )
    }
}

/// Request body for an edit. Quality options are fixed at the provider's
/// highest-fidelity settings.
pub fn build_payload(request: &EditRequest) -> Value {
    let image = BASE64.encode(request.image());
    match request.operation() {
        EditOperation::RemoveBackground => json!({
            "image": image,
            "sync": true,
        }),
        EditOperation::ReplaceBackground => {
            let mut payload = map_object(json!({
                "image": image,
                "prompt": request.prompt(),
                "force_rmbg": false,
                "placement_type": "automatic",
                "shot_size": SHOT_SIZE,
                "sync": true,
                "preserve_alpha": true,
                "original_quality": true,
                "visual_input_content_moderation": true,
                "visual_output_content_moderation": true,
                "mask_type": "automatic",
                "padding": PLACEMENT_PADDING,
            }));
            if let Some(seed) = request.seed() {
                payload.insert("seed".to_string(), Value::Number(seed.into()));
            }
            Value::Object(payload)
        }
    }
}

/// Maps a submit response onto the sync / async / failed contract:
/// 200 carries `result.image_url`, 202 carries `request_id` and `status_url`.
pub fn interpret_submit_reply(reply: &HttpReply) -> ProviderOutcome {
    match reply.status {
        200 => {
            let Ok(body) = reply.json() else {
                return ProviderOutcome::Failed(ProviderFailure::malformed(
                    reply.status,
                    &reply.body,
                    "response body is not JSON",
                ));
            };
            match extract_generated_image(&body) {
                Some(image) => ProviderOutcome::Immediate(image),
                None => ProviderOutcome::Failed(ProviderFailure::malformed(
                    reply.status,
                    &reply.body,
                    "missing result.image_url",
                )),
            }
        }
        202 => {
            let Ok(body) = reply.json() else {
                return ProviderOutcome::Failed(ProviderFailure::malformed(
                    reply.status,
                    &reply.body,
                    "response body is not JSON",
                ));
            };
            let job_id = body.get("request_id").and_then(value_as_id);
            let status_url = body
                .get("status_url")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty());
            match (job_id, status_url) {
                (Some(job_id), Some(status_url)) => ProviderOutcome::Pending(PendingJob {
                    job_id,
                    status_url: status_url.to_string(),
                }),
                _ => ProviderOutcome::Failed(ProviderFailure::malformed(
                    reply.status,
                    &reply.body,
                    "missing request_id or status_url",
                )),
            }
        }
        status => ProviderOutcome::Failed(ProviderFailure::http_status(status, &reply.body)),
    }
}

/// Reads `result.image_url` plus the optional `seed` and `refined_prompt`
/// echoed next to it.
pub(crate) fn extract_generated_image(body: &Value) -> Option<GeneratedImage> {
    let result = body.get("result")?.as_object()?;
    let result_url = result
        .get("image_url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())?;
    Some(GeneratedImage {
        result_url: result_url.to_string(),
        seed: result.get("seed").and_then(parse_value_to_i64),
        refined_prompt: result
            .get("refined_prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string),
    })
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(raw) => Some(raw.trim().to_string()).filter(|value| !value.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn parse_value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|raw| raw.round() as i64)),
        Value::String(raw) => raw.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
