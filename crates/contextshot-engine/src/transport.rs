use std::time::Duration;

use anyhow::{Context, Result};
use contextshot_contracts::edits::truncate_text;
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

/// Status and raw body of a response that made it back over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<Value> {
        serde_json::from_str(&self.body).context("provider returned invalid JSON payload")
    }
}

/// The two HTTP calls the provider contract needs.
///
/// `Err` means no response was received (connect failure, timeout, body read
/// failure); any status code, including 4xx/5xx, comes back as `Ok`.
pub trait HttpTransport: Send + Sync {
    fn post_json(&self, url: &str, headers: &[(&str, &str)], payload: &Value) -> Result<HttpReply>;
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpReply>;
}

pub struct ReqwestTransport {
    http: HttpClient,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed to build provider HTTP client")?;
        Ok(Self { http })
    }
}

impl HttpTransport for ReqwestTransport {
    fn post_json(&self, url: &str, headers: &[(&str, &str)], payload: &Value) -> Result<HttpReply> {
        let mut request = self.http.post(url).json(payload);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request
            .send()
            .with_context(|| format!("provider request failed ({url})"))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .with_context(|| format!("provider response body read failed ({url})"))?;
        Ok(HttpReply { status, body })
    }

    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpReply> {
        let mut request = self.http.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request
            .send()
            .with_context(|| format!("provider status request failed ({url})"))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .with_context(|| format!("provider status body read failed ({url})"))?;
        Ok(HttpReply { status, body })
    }
}

pub fn is_timeout_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(reqwest::Error::is_timeout)
            .unwrap_or(false)
    })
}

/// Flattens an error chain into one line, dropping repeated causes.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::{error_chain_text, is_timeout_error, HttpReply};

    #[test]
    fn error_chain_text_flattens_and_dedupes() {
        let err = anyhow!("connection refused")
            .context("connection refused")
            .context("provider request failed (https://bria.test)");
        assert_eq!(
            error_chain_text(&err, 200),
            "provider request failed (https://bria.test) | caused by: connection refused"
        );
        assert!(!is_timeout_error(&err));
        assert_eq!(error_chain_text(&err, 10), "provider r…");
    }

    #[test]
    fn reply_json_reports_invalid_payload() {
        let reply = HttpReply::new(200, "<html>");
        assert!(reply.is_success());
        let err = reply.json().err().map(|err| err.to_string()).unwrap_or_default();
        assert_eq!(err, "provider returned invalid JSON payload");
        assert!(!HttpReply::new(202, "{}").json().is_err());
        assert!(!HttpReply::new(500, "").is_success());
    }
}
