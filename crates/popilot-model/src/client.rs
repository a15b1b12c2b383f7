// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use popilot_config::{ChatConfig, ModelConfig, ModelFamily};

use crate::FileAttachment;

/// Which transport/header family the client uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Long-form endpoint, `Authorization: Bearer …`.
    Sso,
    /// Short-form agent endpoint, `X-Api-Key: …`.
    ApiKey,
}

/// One rendered chat request.  `text` is the transformer's flattened
/// conversation; `files` are uploaded attachments referenced by URL.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub text: String,
    pub files: Vec<FileAttachment>,
    /// Server-side conversation key.  Sent as `chat_threads_id` when known.
    pub thread_id: Option<i64>,
}

/// Events yielded by a transport stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental text.  Transports that report cumulative text convert to
    /// deltas before yielding.
    TextDelta(String),
    /// Server-assigned thread id seen in this stream.
    ThreadId(i64),
    /// The client dropped the stream and is about to retry the request.
    /// Consumers should reset any per-round display accumulator.
    Restart,
    Done,
}

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ChatError>> + Send>>;

/// Errors surfaced by the chat client.  Tool errors never appear here —
/// these unwind the current turn only.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    #[error("request timed out after {0} s")]
    Timeout(u64),
    #[error("request cancelled")]
    Cancelled,
    #[error("authentication rejected (401)")]
    Unauthorized,
    #[error("chat endpoint returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("backend error after {retries} retries: {message}")]
    Backend { retries: u32, message: String },
}

/// Opens one streaming request.  `ChatStreamClient` is the production
/// implementation; tests inject a scripted mock.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self, req: &ChatRequest) -> Result<ResponseStream, ChatError>;
}

/// Result of a fully consumed (and possibly retried) chat request.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub text: String,
    pub thread_id: Option<i64>,
}

// ─── Backend error markers ────────────────────────────────────────────────────

/// The backend signals its own JSON-parse failures *inside* reply text.
/// This specific marker is retryable at the client layer (with a thread id).
pub fn is_backend_parse_error(text: &str) -> bool {
    text.contains("failed to parse stringified json")
}

/// Transient error shapes tested by the loop controller after accumulation.
pub fn is_transient_backend_error(text: &str) -> bool {
    if is_backend_parse_error(text)
        || text.contains("Unexpected token")
        || text.contains("Internal Server Error")
    {
        return true;
    }
    // Some failures arrive as a quoted JSON fragment: `"{"error": ...`.
    let trimmed = text.trim_start();
    trimmed.starts_with('"') && trimmed.to_ascii_lowercase().contains("error")
}

// ─── Client ───────────────────────────────────────────────────────────────────

pub struct ChatStreamClient {
    config: ChatConfig,
    model: ModelConfig,
    family: ModelFamily,
    auth_mode: AuthMode,
    credential: String,
    client: reqwest::Client,
}

impl ChatStreamClient {
    pub fn new(
        config: ChatConfig,
        model: ModelConfig,
        family: ModelFamily,
        auth_mode: AuthMode,
        credential: String,
    ) -> Self {
        Self {
            config,
            model,
            family,
            auth_mode,
            credential,
            client: reqwest::Client::new(),
        }
    }

    /// Switch transports at runtime (e.g. after the user logs in).
    pub fn set_auth_mode(&mut self, mode: AuthMode, credential: String) {
        self.auth_mode = mode;
        self.credential = credential;
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth_mode
    }

    pub fn model_family(&self) -> ModelFamily {
        self.family
    }

    /// Long-form JSON body per the backend wire format.  All `param_filters`
    /// values are one-element arrays.
    fn long_form_body(&self, req: &ChatRequest) -> Value {
        let user = &self.config.user;
        let mut filters = json!({
            "dept_code": [&user.dept_code],
            "sclpst_code": [&user.sclpst_code],
            "email_1": [&user.email],
        });
        if let Some(uid) = &user.user_id {
            filters["user_id"] = json!([uid]);
        }
        if let Some(nm) = &user.name {
            filters["nm"] = json!([nm]);
        }

        // Aliases resolve to the family's canonical model; a full model name
        // is forwarded verbatim with the configured provider.
        let (model_name, provider) = match self.model.name.as_str() {
            alias @ ("claude" | "gpt" | "gemini") => {
                let (_, name, provider) = ModelConfig::resolve(alias)
                    .expect("builtin alias always resolves");
                (name.to_string(), provider.to_string())
            }
            full => (full.to_string(), self.model.provider.clone()),
        };
        let deployment = self
            .model
            .deployment_name
            .clone()
            .unwrap_or_else(|| model_name.clone());

        let mut body = json!({
            "app_type": "browser",
            "device_type": "pc",
            "users_id": &self.config.users_id,
            "chat_rooms_id": &self.config.chat_rooms_id,
            "llms": {
                "model_config": {
                    "provider": provider,
                    "model_name": model_name,
                    "deployment_name": deployment,
                }
            },
            "param_filters": filters,
            "queries": { "type": "text", "text": &req.text },
            "scenarios_id": &self.config.scenarios_id,
            "sse_status_enabled": true,
        });
        if let Some(tid) = req.thread_id {
            body["chat_threads_id"] = json!(tid);
        }
        body
    }

    async fn open_long_form(&self, req: &ChatRequest) -> Result<ResponseStream, ChatError> {
        let body = self.long_form_body(req);
        debug!(thread_id = ?req.thread_id, "opening long-form chat stream");

        let resp = self
            .client
            .post(&self.config.base_url)
            .bearer_auth(&self.credential)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        check_status(&resp)?;
        Ok(sse_stream(resp, parse_long_form_line))
    }

    async fn open_short_form(&self, req: &ChatRequest) -> Result<ResponseStream, ChatError> {
        let url = format!(
            "{}/agent/api/a{}/{}",
            self.config.agent_base_url.trim_end_matches('/'),
            self.config.agent_slot,
            self.family.path_segment()
        );
        let files: Vec<Value> = req
            .files
            .iter()
            .filter_map(|f| {
                f.url.as_ref().map(|url| {
                    json!({ "id": &f.id, "name": &f.name, "url": url })
                })
            })
            .collect();
        debug!(url = %url, files = files.len(), "opening short-form chat stream");
        let body = json!({ "message": &req.text, "stream": true, "files": files });

        let resp = self
            .client
            .post(&url)
            .header("X-Api-Key", &self.credential)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        check_status(&resp)?;

        let is_sse = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/event-stream"))
            .unwrap_or(false);

        if is_sse {
            // Short-form `replies` is cumulative; convert to deltas.
            return Ok(cumulative_to_deltas(sse_stream(resp, parse_short_form_line)));
        }

        // Single JSON object fallback.
        let body = resp
            .text()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;
        let text = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v["replies"].as_str().map(str::to_string))
            .unwrap_or(body);
        let events = vec![Ok(StreamEvent::TextDelta(text)), Ok(StreamEvent::Done)];
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

#[async_trait]
impl ChatTransport for ChatStreamClient {
    async fn open(&self, req: &ChatRequest) -> Result<ResponseStream, ChatError> {
        match self.auth_mode {
            AuthMode::Sso => self.open_long_form(req).await,
            AuthMode::ApiKey => self.open_short_form(req).await,
        }
    }
}

fn check_status(resp: &reqwest::Response) -> Result<(), ChatError> {
    let status = resp.status();
    if status.as_u16() == 401 {
        return Err(ChatError::Unauthorized);
    }
    if !status.is_success() {
        return Err(ChatError::Http {
            status: status.as_u16(),
            body: String::new(),
        });
    }
    Ok(())
}

// ─── SSE framing ──────────────────────────────────────────────────────────────

/// Wrap a response's byte stream into framed `data:` line events.
///
/// Lines can be split across TCP chunks and multi-byte UTF-8 sequences can be
/// split across reads, so framing happens on raw bytes: only complete lines
/// (terminated by `\n`) are decoded; the remainder is carried forward.  On
/// stream close any trailing unterminated line is flushed.
fn sse_stream(
    resp: reqwest::Response,
    parse_line: fn(&str) -> Vec<StreamEvent>,
) -> ResponseStream {
    let byte_stream = resp.bytes_stream();
    let event_stream = byte_stream
        .map(|chunk| Some(chunk.map_err(|e| ChatError::Network(e.to_string()))))
        .chain(futures::stream::once(async { None }))
        .scan(Vec::<u8>::new(), move |buf, item| {
            let mut events: Vec<Result<StreamEvent, ChatError>> = Vec::new();
            match item {
                // End of stream: flush the trailing unterminated line.
                None => {
                    if !buf.is_empty() {
                        let line = String::from_utf8_lossy(buf).to_string();
                        events.extend(parse_frame_line(&line, parse_line).into_iter().map(Ok));
                        buf.clear();
                    }
                    events.push(Ok(StreamEvent::Done));
                }
                Some(Ok(bytes)) => {
                    buf.extend_from_slice(&bytes);
                    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line_bytes[..pos])
                            .trim_end_matches('\r')
                            .to_string();
                        events.extend(parse_frame_line(&line, parse_line).into_iter().map(Ok));
                    }
                }
                Some(Err(e)) => events.push(Err(e)),
            }
            futures::future::ready(Some(events))
        })
        .flat_map(futures::stream::iter);
    Box::pin(event_stream)
}

fn parse_frame_line(line: &str, parse_line: fn(&str) -> Vec<StreamEvent>) -> Vec<StreamEvent> {
    // Non-`data:` lines (comments, event names, keep-alives) are ignored.
    let Some(data) = line.strip_prefix("data:") else {
        return vec![];
    };
    let data = data.trim();
    if data.is_empty() {
        return vec![];
    }
    parse_line(data)
}

/// Long-form event: `{"data":{"documents":[{"chat_threads_id":…,"replies":{"text":"…"}}]}}`.
fn parse_long_form_line(data: &str) -> Vec<StreamEvent> {
    let Ok(v) = serde_json::from_str::<Value>(data) else {
        return vec![];
    };
    let mut events = Vec::new();
    if let Some(docs) = v["data"]["documents"].as_array() {
        for doc in docs {
            if let Some(tid) = doc["chat_threads_id"].as_i64() {
                events.push(StreamEvent::ThreadId(tid));
            }
            if let Some(text) = doc["replies"]["text"].as_str() {
                if !text.is_empty() {
                    events.push(StreamEvent::TextDelta(text.to_string()));
                }
            }
        }
    }
    events
}

/// Short-form event: `{"replies":"<whole text so far>"}` (cumulative).
fn parse_short_form_line(data: &str) -> Vec<StreamEvent> {
    let Ok(v) = serde_json::from_str::<Value>(data) else {
        return vec![];
    };
    match v["replies"].as_str() {
        Some(text) => vec![StreamEvent::TextDelta(text.to_string())],
        None => vec![],
    }
}

/// Adapter for cumulative transports: each `TextDelta` carries the whole
/// text so far; emit only the suffix beyond what was already seen.
fn cumulative_to_deltas(inner: ResponseStream) -> ResponseStream {
    let stream = inner
        .scan(String::new(), |seen, item| {
            let mapped = match item {
                Ok(StreamEvent::TextDelta(whole)) => {
                    if whole.len() > seen.len() && whole.starts_with(seen.as_str()) {
                        let delta = whole[seen.len()..].to_string();
                        *seen = whole;
                        Some(Ok(StreamEvent::TextDelta(delta)))
                    } else if whole.starts_with(seen.as_str()) {
                        None
                    } else {
                        // Server restarted the text; treat the whole payload
                        // as fresh output.
                        *seen = whole.clone();
                        Some(Ok(StreamEvent::TextDelta(whole)))
                    }
                }
                other => Some(other),
            };
            futures::future::ready(Some(mapped))
        })
        .filter_map(futures::future::ready);
    Box::pin(stream)
}

// ─── Drive: consume with timeout, cancellation and retry ─────────────────────

/// Consume one chat request end to end.
///
/// Forwards every event to `tx` for live display.  Handles the client-level
/// retry: when the backend reports its own JSON-parse failure inside reply
/// text AND a thread id is known, the reader is dropped, the client sleeps
/// `retry_delay_ms`, and the same payload is re-sent with `chat_threads_id` —
/// up to `max_retries` times.  Without a thread id the text is returned as-is
/// and the caller's transient-error handling applies.
///
/// The wall clock covers each attempt separately.  `cancel` aborts at the
/// next suspension point; a dropped sender counts as cancellation.
pub async fn complete_with_retry(
    transport: &dyn ChatTransport,
    mut req: ChatRequest,
    timeout_secs: u64,
    max_retries: u32,
    retry_delay_ms: u64,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &mut oneshot::Receiver<()>,
) -> Result<ChatOutcome, ChatError> {
    let mut attempt: u32 = 0;

    'attempts: loop {
        let mut stream = transport.open(&req).await?;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        let mut text = String::new();
        let mut thread_id = req.thread_id;

        loop {
            let event = tokio::select! {
                biased;
                _ = &mut *cancel => return Err(ChatError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ChatError::Timeout(timeout_secs));
                }
                ev = stream.next() => ev,
            };

            match event {
                None => break,
                Some(Err(e)) => return Err(e),
                Some(Ok(StreamEvent::Done)) => break,
                Some(Ok(StreamEvent::ThreadId(tid))) => {
                    thread_id = Some(tid);
                    let _ = tx.send(StreamEvent::ThreadId(tid)).await;
                }
                Some(Ok(StreamEvent::Restart)) => {}
                Some(Ok(StreamEvent::TextDelta(delta))) => {
                    if is_backend_parse_error(&delta) && thread_id.is_some() {
                        if attempt < max_retries {
                            attempt += 1;
                            warn!(
                                attempt,
                                "backend json parse error mid-stream; retrying with thread id"
                            );
                            drop(stream);
                            tokio::time::sleep(Duration::from_millis(retry_delay_ms)).await;
                            req.thread_id = thread_id;
                            let _ = tx.send(StreamEvent::Restart).await;
                            continue 'attempts;
                        }
                        return Err(ChatError::Backend {
                            retries: attempt,
                            message: delta,
                        });
                    }
                    text.push_str(&delta);
                    let _ = tx.send(StreamEvent::TextDelta(delta)).await;
                }
            }
        }

        return Ok(ChatOutcome { text, thread_id });
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
