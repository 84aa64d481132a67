use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const BODY_EXCERPT_MAX_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOperation {
    #[default]
    ReplaceBackground,
    RemoveBackground,
}

impl EditOperation {
    pub fn endpoint_path(self) -> &'static str {
        match self {
            Self::ReplaceBackground => "image/edit/replace_background",
            Self::RemoveBackground => "image/edit/remove_background",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReplaceBackground => "replace_background",
            Self::RemoveBackground => "remove_background",
        }
    }
}

/// One edit to submit to the provider.
///
/// The image bytes are shared, so a batch that edits the same product photo
/// under several prompts holds a single copy of the upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRequest {
    image: Arc<[u8]>,
    prompt: String,
    seed: Option<i64>,
    operation: EditOperation,
}

impl EditRequest {
    pub fn replace_background(image: impl Into<Arc<[u8]>>, prompt: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            prompt: prompt.into(),
            seed: None,
            operation: EditOperation::ReplaceBackground,
        }
    }

    pub fn remove_background(image: impl Into<Arc<[u8]>>) -> Self {
        Self {
            image: image.into(),
            prompt: String::new(),
            seed: None,
            operation: EditOperation::RemoveBackground,
        }
    }

    pub fn with_seed(mut self, seed: Option<i64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn seed(&self) -> Option<i64> {
        self.seed
    }

    pub fn operation(&self) -> EditOperation {
        self.operation
    }

    /// Short digest of the image payload, safe to put in logs and events.
    pub fn image_fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.image[..]);
        hex::encode(&digest[..6])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub result_url: String,
    pub seed: Option<i64>,
    pub refined_prompt: Option<String>,
}

impl GeneratedImage {
    pub fn new(result_url: impl Into<String>) -> Self {
        Self {
            result_url: result_url.into(),
            seed: None,
            refined_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJob {
    pub job_id: String,
    pub status_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Network,
    Timeout,
    HttpStatus,
    MalformedResponse,
    JobFailed,
    UnknownStatus,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::HttpStatus => "http_status",
            Self::MalformedResponse => "malformed_response",
            Self::JobFailed => "job_failed",
            Self::UnknownStatus => "unknown_status",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why one edit did not produce an image, with enough context to report it
/// without asking the provider again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub reason: FailureReason,
    pub status_code: Option<u16>,
    pub body_excerpt: Option<String>,
    pub detail: Option<String>,
}

impl ProviderFailure {
    fn new(reason: FailureReason) -> Self {
        Self {
            reason,
            status_code: None,
            body_excerpt: None,
            detail: None,
        }
    }

    pub fn network(detail: impl Into<String>) -> Self {
        Self::new(FailureReason::Network).with_detail(detail)
    }

    pub fn timeout(attempts: u32, last_transient: Option<&str>) -> Self {
        let mut detail = format!("job did not finish within {attempts} status polls");
        if let Some(last) = last_transient {
            detail.push_str(&format!("; last transient error: {last}"));
        }
        Self::new(FailureReason::Timeout).with_detail(detail)
    }

    pub fn http_status(status_code: u16, body: &str) -> Self {
        Self::new(FailureReason::HttpStatus).with_response(status_code, body)
    }

    pub fn malformed(status_code: u16, body: &str, detail: impl Into<String>) -> Self {
        Self::new(FailureReason::MalformedResponse)
            .with_response(status_code, body)
            .with_detail(detail)
    }

    pub fn job_failed(message: impl Into<String>) -> Self {
        Self::new(FailureReason::JobFailed).with_detail(message)
    }

    pub fn unknown_status(raw_status: &str, body: &str) -> Self {
        Self::new(FailureReason::UnknownStatus)
            .with_detail(format!("unrecognized job status '{raw_status}'"))
            .with_body(body)
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::new(FailureReason::Cancelled).with_detail(detail)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if !detail.trim().is_empty() {
            self.detail = Some(detail);
        }
        self
    }

    fn with_response(mut self, status_code: u16, body: &str) -> Self {
        self.status_code = Some(status_code);
        self.with_body(body)
    }

    fn with_body(mut self, body: &str) -> Self {
        let trimmed = body.trim();
        if !trimmed.is_empty() {
            self.body_excerpt = Some(truncate_text(trimmed, BODY_EXCERPT_MAX_CHARS));
        }
        self
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)?;
        if let Some(code) = self.status_code {
            write!(f, " (status {code})")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        if let Some(body) = &self.body_excerpt {
            write!(f, " | body: {body}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderOutcome {
    Immediate(GeneratedImage),
    Pending(PendingJob),
    Failed(ProviderFailure),
}

impl ProviderOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Immediate(_) => "immediate",
            Self::Pending(_) => "pending",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded(GeneratedImage),
    Failed { reason: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded(_) => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Cuts `value` to `max_chars` characters, marking the cut with `…`.
pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
