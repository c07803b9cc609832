//! Single-consumer sink: owns all per-request analytics state so nothing
//! downstream of the dispatcher has to share it across tasks.

use crate::cost::estimate_cost_usd;
use account_store::writer::{AsyncDbWriter, WriteJob};
use account_store::RequestUsage;
use bytes::Bytes;
use common::time::now_ms;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Cap on the in-memory SSE text buffer used for incremental line parsing.
pub const SSE_BUFFER_CAP: usize = 64 * 1024;
/// A request with no activity for this long is finalized as an orphan.
pub const ORPHAN_TIMEOUT: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Tunable knobs for the sink's streaming buffer and orphan sweep, threaded
/// in from an operator's `[tuning]` config table.
#[derive(Debug, Clone, Copy)]
pub struct SinkTuning {
    pub sse_buffer_cap: usize,
    pub orphan_timeout: Duration,
}

impl Default for SinkTuning {
    fn default() -> Self {
        Self {
            sse_buffer_cap: SSE_BUFFER_CAP,
            orphan_timeout: ORPHAN_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub enum SinkEvent {
    Start {
        request_id: String,
        account_id: Option<String>,
        method: String,
        path: String,
        bypass_session: bool,
        agent_used: Option<String>,
        request_payload: Option<Bytes>,
    },
    Chunk {
        request_id: String,
        bytes: Bytes,
    },
    End {
        request_id: String,
        status: Option<u16>,
        success: bool,
        error: Option<String>,
        /// Full body, for non-streaming responses that never sent `Chunk`s.
        full_body: Option<Bytes>,
        /// How many accounts were tried before this response, known only
        /// once the dispatcher has finished (so it cannot be part of `Start`).
        failover_attempts: u32,
    },
    Shutdown,
}

struct RequestState {
    account_id: Option<String>,
    method: String,
    path: String,
    agent_used: Option<String>,
    usage: RequestUsage,
    sse_buffer: String,
    sse_buffer_cap: usize,
    captured_body: Vec<u8>,
    request_payload: Option<Bytes>,
    failover_attempts: u32,
    last_activity_ms: u64,
}

impl RequestState {
    fn new(
        account_id: Option<String>,
        method: String,
        path: String,
        agent_used: Option<String>,
        request_payload: Option<Bytes>,
        sse_buffer_cap: usize,
    ) -> Self {
        Self {
            account_id,
            method,
            path,
            agent_used,
            usage: RequestUsage::default(),
            sse_buffer: String::new(),
            sse_buffer_cap,
            captured_body: Vec::new(),
            request_payload,
            failover_attempts: 0,
            last_activity_ms: now_ms(),
        }
    }

    fn feed_chunk(&mut self, bytes: &[u8]) {
        self.last_activity_ms = now_ms();
        self.captured_body.extend_from_slice(bytes);
        self.sse_buffer.push_str(&String::from_utf8_lossy(bytes));
        if self.sse_buffer.len() > self.sse_buffer_cap {
            let excess = self.sse_buffer.len() - self.sse_buffer_cap;
            self.sse_buffer.drain(..excess);
        }

        let Some(last_newline) = self.sse_buffer.rfind('\n') else {
            return;
        };
        let complete: Vec<String> = self.sse_buffer[..=last_newline].lines().map(str::to_string).collect();
        let tail = self.sse_buffer[last_newline + 1..].to_string();
        for line in complete {
            self.apply_line(&line);
        }
        self.sse_buffer = tail;
    }

    fn apply_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return;
        }
        if let Ok(value) = serde_json::from_str::<Value>(data) {
            apply_usage_fields(&mut self.usage, &value);
        }
    }

    fn apply_full_body(&mut self, bytes: &[u8]) {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            apply_usage_fields(&mut self.usage, &value);
        }
    }
}

fn apply_usage_fields(usage: &mut RequestUsage, value: &Value) {
    if let Some(message) = value.get("message") {
        if let Some(model) = message.get("model").and_then(Value::as_str) {
            usage.model = Some(model.to_string());
        }
        if let Some(u) = message.get("usage") {
            merge_usage_object(usage, u);
        }
    }
    if let Some(delta) = value.get("message_delta") {
        if let Some(u) = delta.get("usage") {
            if let Some(output) = u.get("output_tokens").and_then(Value::as_u64) {
                usage.output_tokens = output;
            }
        }
    }
    if let Some(u) = value.get("usage") {
        merge_usage_object(usage, u);
    }
}

fn merge_usage_object(usage: &mut RequestUsage, value: &Value) {
    if let Some(v) = value.get("input_tokens").and_then(Value::as_u64) {
        usage.input_tokens = v;
    }
    if let Some(v) = value.get("cache_read_input_tokens").and_then(Value::as_u64) {
        usage.cache_read_input_tokens = v;
    }
    if let Some(v) = value.get("cache_creation_input_tokens").and_then(Value::as_u64) {
        usage.cache_creation_input_tokens = v;
    }
    if let Some(v) = value.get("output_tokens").and_then(Value::as_u64) {
        usage.output_tokens = v;
    }
}

/// Handle to the background sink task.
#[derive(Clone)]
pub struct PostProcessor {
    tx: mpsc::Sender<SinkEvent>,
}

impl PostProcessor {
    pub fn spawn(writer: AsyncDbWriter, tuning: SinkTuning) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(run(rx, writer, tuning));
        Self { tx }
    }

    pub async fn send(&self, event: SinkEvent) {
        if self.tx.send(event).await.is_err() {
            warn!("post processor channel closed, dropping event");
        }
    }

    pub async fn shutdown(&self) {
        self.send(SinkEvent::Shutdown).await;
    }
}

async fn run(mut rx: mpsc::Receiver<SinkEvent>, writer: AsyncDbWriter, tuning: SinkTuning) {
    let mut requests: HashMap<String, RequestState> = HashMap::new();
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(SinkEvent::Shutdown) | None => break,
                    Some(event) => handle_event(event, &mut requests, &writer, &tuning).await,
                }
            }
            _ = ticker.tick() => {
                sweep_orphans(&mut requests, &writer, tuning.orphan_timeout).await;
            }
        }
    }

    for (request_id, state) in requests.drain() {
        finalize(&request_id, state, true, None, &writer).await;
    }
}

async fn handle_event(
    event: SinkEvent,
    requests: &mut HashMap<String, RequestState>,
    writer: &AsyncDbWriter,
    tuning: &SinkTuning,
) {
    match event {
        SinkEvent::Start {
            request_id,
            account_id,
            method,
            path,
            bypass_session,
            agent_used,
            request_payload,
        } => {
            writer
                .enqueue(WriteJob::InsertRequestStart {
                    request_id: request_id.clone(),
                    account_id: account_id.clone(),
                    method: method.clone(),
                    path: path.clone(),
                    timestamp_ms: now_ms(),
                })
                .await;

            if let Some(account_id) = &account_id {
                writer
                    .enqueue(WriteJob::UpdateUsage {
                        account_id: account_id.clone(),
                    })
                    .await;
                writer
                    .enqueue(WriteJob::UpdateSessionSafe {
                        account_id: account_id.clone(),
                        bypass_session,
                    })
                    .await;
            }

            requests.insert(
                request_id,
                RequestState::new(account_id, method, path, agent_used, request_payload, tuning.sse_buffer_cap),
            );
        }
        SinkEvent::Chunk { request_id, bytes } => {
            if let Some(state) = requests.get_mut(&request_id) {
                state.feed_chunk(&bytes);
            }
        }
        SinkEvent::End {
            request_id,
            status,
            success,
            error,
            full_body,
            failover_attempts,
        } => {
            if let Some(mut state) = requests.remove(&request_id) {
                if let Some(body) = &full_body {
                    state.apply_full_body(body);
                    if state.captured_body.is_empty() {
                        state.captured_body.extend_from_slice(body);
                    }
                }
                state.failover_attempts = failover_attempts;
                finalize_with_status(&request_id, state, success, status, error, writer).await;
            }
        }
        SinkEvent::Shutdown => {}
    }
}

async fn sweep_orphans(requests: &mut HashMap<String, RequestState>, writer: &AsyncDbWriter, orphan_timeout: Duration) {
    let now = now_ms();
    let orphan_timeout_ms = orphan_timeout.as_millis() as u64;
    let orphaned: Vec<String> = requests
        .iter()
        .filter(|(_, s)| now.saturating_sub(s.last_activity_ms) > orphan_timeout_ms)
        .map(|(id, _)| id.clone())
        .collect();

    for request_id in orphaned {
        if let Some(state) = requests.remove(&request_id) {
            debug!(request_id, "finalizing orphaned request");
            finalize_with_status(&request_id, state, false, None, Some("orphan timeout".into()), writer).await;
        }
    }
}

async fn finalize(request_id: &str, state: RequestState, success: bool, error: Option<String>, writer: &AsyncDbWriter) {
    finalize_with_status(request_id, state, success, None, error, writer).await;
}

async fn finalize_with_status(
    request_id: &str,
    mut state: RequestState,
    success: bool,
    status: Option<u16>,
    error: Option<String>,
    writer: &AsyncDbWriter,
) {
    state.usage.total_tokens = state.usage.input_tokens
        + state.usage.output_tokens
        + state.usage.cache_read_input_tokens
        + state.usage.cache_creation_input_tokens;
    state.usage.cost_usd = estimate_cost_usd(&state.usage);

    writer
        .enqueue(WriteJob::UpdateRequestUsage {
            request_id: request_id.to_string(),
            usage: state.usage.clone(),
        })
        .await;

    writer
        .enqueue(WriteJob::FinalizeRequest {
            record: account_store::RequestRecord {
                id: request_id.to_string(),
                account_id: state.account_id,
                model: state.usage.model.clone(),
                method: state.method,
                path: state.path,
                status,
                success,
                error,
                agent_used: state.agent_used,
                usage: state.usage,
                failover_attempts: state.failover_attempts,
                timestamp_ms: now_ms(),
            },
        })
        .await;

    if state.request_payload.is_some() || !state.captured_body.is_empty() {
        writer
            .enqueue(WriteJob::PersistPayload {
                request_id: request_id.to_string(),
                request_payload: state.request_payload.map(|b| b.to_vec()),
                response_payload: if state.captured_body.is_empty() {
                    None
                } else {
                    Some(state.captured_body)
                },
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_chunk_parses_message_usage() {
        let mut state = RequestState::new(Some("acct-1".into()), "POST".into(), "/v1/messages".into(), None, None, SSE_BUFFER_CAP);
        let line = "data: {\"message\":{\"model\":\"claude-3-5-haiku-20241022\",\"usage\":{\"input_tokens\":10,\"output_tokens\":0}}}\n";
        state.feed_chunk(line.as_bytes());
        assert_eq!(state.usage.model.as_deref(), Some("claude-3-5-haiku-20241022"));
        assert_eq!(state.usage.input_tokens, 10);
    }

    #[test]
    fn feed_chunk_accumulates_message_delta_output_tokens() {
        let mut state = RequestState::new(None, "POST".into(), "/v1/messages".into(), None, None, SSE_BUFFER_CAP);
        state.feed_chunk(b"data: {\"message_delta\":{\"usage\":{\"output_tokens\":42}}}\n");
        assert_eq!(state.usage.output_tokens, 42);
    }

    #[test]
    fn feed_chunk_keeps_incomplete_tail_across_calls() {
        let mut state = RequestState::new(None, "POST".into(), "/v1/messages".into(), None, None, SSE_BUFFER_CAP);
        state.feed_chunk(b"data: {\"usage\":{\"in");
        assert_eq!(state.usage.input_tokens, 0);
        state.feed_chunk(b"put_tokens\":5}}\n");
        assert_eq!(state.usage.input_tokens, 5);
    }

    #[test]
    fn feed_chunk_ignores_done_sentinel() {
        let mut state = RequestState::new(None, "POST".into(), "/v1/messages".into(), None, None, SSE_BUFFER_CAP);
        state.feed_chunk(b"data: [DONE]\n");
        assert_eq!(state.usage.input_tokens, 0);
    }

    #[test]
    fn sse_buffer_is_trimmed_at_cap() {
        let mut state = RequestState::new(None, "POST".into(), "/v1/messages".into(), None, None, SSE_BUFFER_CAP);
        let filler = "x".repeat(SSE_BUFFER_CAP + 1000);
        state.feed_chunk(filler.as_bytes());
        assert!(state.sse_buffer.len() <= SSE_BUFFER_CAP);
    }

    #[test]
    fn apply_full_body_extracts_top_level_usage() {
        let mut state = RequestState::new(None, "POST".into(), "/v1/messages".into(), None, None, SSE_BUFFER_CAP);
        state.apply_full_body(br#"{"usage":{"input_tokens":7,"output_tokens":3}}"#);
        assert_eq!(state.usage.input_tokens, 7);
        assert_eq!(state.usage.output_tokens, 3);
    }

    #[tokio::test]
    async fn start_then_end_roundtrip_through_writer() {
        let store = account_store::AccountStore::connect_in_memory().await.unwrap();
        let account = account_store::Account {
            id: "acct-1".into(),
            name: "acct-1".into(),
            provider: "anthropic".into(),
            credential: account_store::Credential::OAuth {
                refresh_token: "rt".into(),
                access_token: Some("at".into()),
                expires_at_ms: Some(now_ms() + 1_000_000),
            },
            created_at_ms: Some(now_ms()),
            usage: account_store::Usage::default(),
            rate_limit: account_store::RateLimit::default(),
            policy: account_store::Policy::default(),
        };
        store.insert_account(&account).await.unwrap();
        let writer = AsyncDbWriter::spawn(store.clone());
        let processor = PostProcessor::spawn(writer.clone(), SinkTuning::default());

        processor
            .send(SinkEvent::Start {
                request_id: "req-1".into(),
                account_id: Some("acct-1".into()),
                method: "POST".into(),
                path: "/v1/messages".into(),
                bypass_session: false,
                agent_used: None,
                request_payload: None,
            })
            .await;
        processor
            .send(SinkEvent::End {
                request_id: "req-1".into(),
                status: Some(200),
                success: true,
                error: None,
                full_body: Some(Bytes::from_static(br#"{"usage":{"input_tokens":5,"output_tokens":2}}"#)),
                failover_attempts: 1,
            })
            .await;

        for _ in 0..50 {
            let found = store.find_by_id("acct-1").await.unwrap().unwrap();
            if found.usage.request_count == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("usage update never applied");
    }
}
