use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::clock::CancelToken;
use crate::transport::{HttpReply, HttpTransport};

pub(crate) enum Scripted {
    Reply(HttpReply),
    Network(String),
}

impl Scripted {
    pub(crate) fn reply(status: u16, body: Value) -> Self {
        Self::Reply(HttpReply::new(status, body.to_string()))
    }

    pub(crate) fn raw(status: u16, body: &str) -> Self {
        Self::Reply(HttpReply::new(status, body))
    }

    pub(crate) fn network(message: &str) -> Self {
        Self::Network(message.to_string())
    }

    pub(crate) fn status(status: &str) -> Self {
        Self::reply(200, serde_json::json!({ "status": status }))
    }

    pub(crate) fn completed(url: &str) -> Self {
        Self::reply(
            200,
            serde_json::json!({ "status": "COMPLETED", "result": { "image_url": url } }),
        )
    }

    pub(crate) fn accepted(job_id: &str) -> Self {
        Self::reply(
            202,
            serde_json::json!({
                "request_id": job_id,
                "status_url": format!("https://bria.test/v2/status/{job_id}"),
            }),
        )
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub payload: Option<Value>,
}

impl RecordedCall {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// In-memory transport that replays queued responses in order and records
/// every call it receives.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    posts: Mutex<VecDeque<Scripted>>,
    gets: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<RecordedCall>>,
    cancel_after_posts: Mutex<Option<(usize, CancelToken)>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_post(&self, scripted: Scripted) {
        lock(&self.posts).push_back(scripted);
    }

    pub(crate) fn push_get(&self, scripted: Scripted) {
        lock(&self.gets).push_back(scripted);
    }

    /// Cancels `token` once `count` submissions have been answered.
    pub(crate) fn cancel_after_posts(&self, count: usize, token: CancelToken) {
        *lock(&self.cancel_after_posts) = Some((count, token));
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub(crate) fn count(&self, method: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.method == method)
            .count()
    }

    fn record(&self, method: &'static str, url: &str, headers: &[(&str, &str)], payload: Option<&Value>) {
        lock(&self.calls).push(RecordedCall {
            method,
            url: url.to_string(),
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            payload: payload.cloned(),
        });
    }

    fn answer(queue: &Mutex<VecDeque<Scripted>>, url: &str) -> Result<HttpReply> {
        match lock(queue).pop_front() {
            Some(Scripted::Reply(reply)) => Ok(reply),
            Some(Scripted::Network(message)) => {
                Err(anyhow!(message).context(format!("provider request failed ({url})")))
            }
            None => Err(anyhow!("no scripted response left for {url}")),
        }
    }
}

impl HttpTransport for ScriptedTransport {
    fn post_json(&self, url: &str, headers: &[(&str, &str)], payload: &Value) -> Result<HttpReply> {
        self.record("POST", url, headers, Some(payload));
        let reply = Self::answer(&self.posts, url);
        if let Some((count, token)) = lock(&self.cancel_after_posts).as_ref() {
            if self.count("POST") >= *count {
                token.cancel();
            }
        }
        reply
    }

    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpReply> {
        self.record("GET", url, headers, None);
        Self::answer(&self.gets, url)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
