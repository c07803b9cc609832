//! Per-request orchestration: account selection, token resolution, upstream
//! dispatch with rate-limit failover, and handoff to the response forwarder.

use crate::agent_interceptor::{discover_valid_agent_paths, rewrite_model_for_agent};
use crate::error::{Error, Result};
use crate::header_codec::sanitize_request;
use crate::post_processor::PostProcessor;
use crate::response_forwarder::{self, ForwardContext, Upstream};
use crate::strategy::{eligible_accounts, Strategy};
use crate::types::RequestMeta;
use account_store::writer::{AsyncDbWriter, WriteJob};
use account_store::{Account, AccountStore, Credential};
use bytes::Bytes;
use common::time::now_ms;
use provider::adapter::{ProviderAdapter, RateLimitInfo};
use provider::AdapterRegistry;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use token_manager::TokenManager;
use tracing::{debug, warn};

/// Default upstream base for accounts without a `custom_endpoint` override.
const DEFAULT_UPSTREAM_BASE: &str = "https://api.anthropic.com";

/// Default Zai rate-limit window when a 429 carries no machine-readable reset.
const ZAI_DEFAULT_RESET_MS: u64 = 5 * 60 * 60 * 1000;

const THINKING_SIGNATURE_ERROR: &str = "Invalid `signature` in `thinking` block";
const THINKING_FIRST_BLOCK_ERROR: &str = "final `assistant` message must start with a thinking block";

pub struct Dispatcher {
    store: AccountStore,
    writer: AsyncDbWriter,
    token_manager: Arc<TokenManager>,
    registry: Arc<AdapterRegistry>,
    strategy: Arc<dyn Strategy>,
    http: reqwest::Client,
    post_processor: PostProcessor,
    agent_path_bases: Vec<PathBuf>,
}

impl Dispatcher {
    pub fn new(
        store: AccountStore,
        writer: AsyncDbWriter,
        token_manager: Arc<TokenManager>,
        registry: Arc<AdapterRegistry>,
        strategy: Arc<dyn Strategy>,
        http: reqwest::Client,
        post_processor: PostProcessor,
        agent_path_bases: Vec<PathBuf>,
    ) -> Self {
        Self {
            store,
            writer,
            token_manager,
            registry,
            strategy,
            http,
            post_processor,
            agent_path_bases,
        }
    }

    /// Dispatch one inbound request end to end, returning the response the
    /// caller should send back to the client.
    pub async fn dispatch(&self, meta: RequestMeta, body: Bytes) -> Result<axum::response::Response> {
        let adapter = self
            .registry
            .find_for_path(&meta.path)
            .ok_or_else(|| Error::NoAdapter(meta.path.clone()))?;

        let mut json_body: Option<Value> = serde_json::from_slice(&body).ok();
        let mut agent_used = None;
        if let Some(body_val) = json_body.as_mut() {
            agent_used = rewrite_model_for_agent(body_val).map(str::to_string);
            let _ = discover_valid_agent_paths(body_val, &self.agent_path_bases);
        }

        let accounts = self.select_accounts(&meta, adapter.name()).await;

        if accounts.is_empty() {
            let (upstream, _, is_streaming) = self
                .attempt(&meta, None, &*adapter, json_body.clone(), &body)
                .await?;
            return Ok(self
                .finish(meta, None, agent_used, body, 0, upstream, is_streaming)
                .await);
        }

        let mut attempts = 0u32;
        for account in &accounts {
            attempts += 1;
            self.reconcile_rate_limit(account).await;
            self.token_manager.hydrate(account.clone()).await;

            let outcome = self
                .attempt(&meta, Some(account), &*adapter, json_body.clone(), &body)
                .await;

            match outcome {
                Ok((upstream, rate_limit, is_streaming)) => {
                    self.record_rate_limit(account, &rate_limit).await;
                    if rate_limit.is_rate_limited {
                        debug!(account_id = %account.id, "account rate limited, trying next");
                        continue;
                    }
                    return Ok(self
                        .finish(
                            meta,
                            Some(account.id.clone()),
                            agent_used,
                            body,
                            attempts,
                            upstream,
                            is_streaming,
                        )
                        .await);
                }
                Err(err) => {
                    warn!(account_id = %account.id, error = %common::redact::redact_error(&err), "account attempt failed");
                    continue;
                }
            }
        }

        Err(Error::ServiceUnavailable {
            attempts,
            reason: "all accounts exhausted".into(),
        })
    }

    async fn select_accounts(&self, meta: &RequestMeta, adapter_name: &str) -> Vec<Account> {
        if let Some(forced_id) = meta.forced_account_id() {
            return match self.store.find_by_id(&forced_id).await {
                Ok(Some(account)) => vec![account],
                _ => Vec::new(),
            };
        }

        let all = match self.store.list_all().await {
            Ok(accounts) => accounts,
            Err(err) => {
                warn!(error = %common::redact::redact_error(&err), "account load failed, degrading to unauthenticated forwarding");
                return Vec::new();
            }
        };

        let candidates: Vec<Account> = all.into_iter().filter(|a| a.provider == adapter_name).collect();
        let eligible = eligible_accounts(candidates);
        self.strategy.order(meta, eligible)
    }

    async fn reconcile_rate_limit(&self, account: &Account) {
        if let Some(until) = account.rate_limit.limited_until_ms {
            if until <= now_ms() {
                self.writer
                    .enqueue(WriteJob::ClearRateLimitedIfExpired {
                        account_id: account.id.clone(),
                    })
                    .await;
            }
        }
    }

    /// Issue one upstream attempt. Returns the forwardable upstream, the
    /// rate-limit verdict (so the caller can decide whether to fail over),
    /// and whether the response should be streamed to the client.
    async fn attempt(
        &self,
        meta: &RequestMeta,
        account: Option<&Account>,
        adapter: &dyn ProviderAdapter,
        json_body: Option<Value>,
        raw_body: &Bytes,
    ) -> Result<(Upstream, RateLimitInfo, bool)> {
        let mut headers = meta.headers.clone();
        sanitize_request(&mut headers);

        let (access_token, api_key) = match account {
            Some(account) => {
                let token = self.token_manager.get_valid_access_token(&account.id).await?;
                match &account.credential {
                    Credential::OAuth { .. } => (Some(token), None),
                    Credential::ApiKey { .. } => (None, Some(token)),
                }
            }
            None => (None, None),
        };
        adapter.prepare_headers(&mut headers, access_token.as_deref(), api_key.as_deref());

        let base = account
            .and_then(|a| a.policy.custom_endpoint.clone())
            .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE.to_string());
        let url = adapter.build_url(&base, &meta.path, None);

        let body_bytes = match json_body.clone() {
            Some(mut value) => {
                adapter.transform_request_body(&mut value);
                serde_json::to_vec(&value).unwrap_or_else(|_| raw_body.to_vec())
            }
            None => raw_body.to_vec(),
        };

        let method = reqwest::Method::from_bytes(meta.method.as_bytes()).unwrap_or(reqwest::Method::POST);
        let response = self
            .http
            .request(method.clone(), &url)
            .headers(headers.clone())
            .body(body_bytes.clone())
            .send()
            .await?;

        let is_claude_family = account.map(|a| a.provider == "anthropic").unwrap_or(true);
        if is_claude_family && response.status().as_u16() == 400 {
            let status = response.status();
            let resp_headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();

            if (text.contains(THINKING_SIGNATURE_ERROR) || text.contains(THINKING_FIRST_BLOCK_ERROR))
                && let Some(mut value) = json_body.clone()
            {
                strip_thinking_blocks(&mut value);
                adapter.transform_request_body(&mut value);
                let retried_body = serde_json::to_vec(&value).unwrap_or(body_bytes);
                let retried = self
                    .http
                    .request(method, &url)
                    .headers(headers)
                    .body(retried_body)
                    .send()
                    .await?;
                let is_streaming = adapter.is_streaming_response(retried.headers());
                let rate_limit = rate_limit_from_headers(adapter, &retried);
                return Ok((Upstream::Live(retried), rate_limit, is_streaming));
            }

            // Not the thinking-block case: a genuine upstream error. Log the
            // body (redacted) since it's already consumed and otherwise only
            // ever reaches the client.
            warn!(
                account_id = ?account.map(|a| a.id.as_str()),
                status = status.as_u16(),
                body = %common::redact::redact_body(&text),
                "upstream returned error response"
            );

            // The body is already consumed, so hand the forwarder the bytes
            // we already have.
            return Ok((
                Upstream::Buffered {
                    status,
                    headers: resp_headers,
                    body: Bytes::from(text),
                },
                RateLimitInfo::default(),
                false,
            ));
        }

        let is_streaming = adapter.is_streaming_response(response.headers());
        let rate_limit = rate_limit_from_headers(adapter, &response);

        if rate_limit.is_rate_limited && rate_limit.reset_ms.is_none() {
            // No machine-readable reset in the headers; some upstreams (Zai)
            // only carry it in the 429 body. Buffer once to check, then hand
            // the forwarder the same bytes rather than reading twice.
            let status = response.status();
            let resp_headers = response.headers().clone();
            let body = response.bytes().await.unwrap_or_default();
            let rate_limit = adapter
                .parse_rate_limit_from_body(&body)
                .unwrap_or(rate_limit);
            return Ok((
                Upstream::Buffered { status, headers: resp_headers, body },
                rate_limit,
                false,
            ));
        }

        Ok((Upstream::Live(response), rate_limit, is_streaming))
    }

    async fn record_rate_limit(&self, account: &Account, info: &RateLimitInfo) {
        if info.is_rate_limited {
            let until = info.reset_ms.unwrap_or_else(|| now_ms() + ZAI_DEFAULT_RESET_MS);
            self.writer
                .enqueue(WriteJob::MarkRateLimited {
                    account_id: account.id.clone(),
                    until_ms: until,
                })
                .await;
        }
    }

    async fn finish(
        &self,
        meta: RequestMeta,
        account_id: Option<String>,
        agent_used: Option<String>,
        request_body: Bytes,
        attempts: u32,
        upstream: Upstream,
        is_streaming: bool,
    ) -> axum::response::Response {
        let ctx = ForwardContext {
            request_id: meta.request_id,
            account_id,
            method: meta.method,
            path: meta.path,
            bypass_session: meta.bypass_session(),
            agent_used,
            request_payload: Some(request_body),
            failover_attempts: attempts.saturating_sub(1),
        };

        response_forwarder::forward(ctx, upstream, is_streaming, &self.post_processor).await
    }
}

fn rate_limit_from_headers(adapter: &dyn ProviderAdapter, response: &reqwest::Response) -> RateLimitInfo {
    adapter.parse_rate_limit(response.status().as_u16(), response.headers())
}

/// Strip `thinking` content blocks from assistant messages and drop any
/// message left with no remaining content, per the one-shot retry rule.
fn strip_thinking_blocks(body: &mut Value) {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };

    messages.retain_mut(|message| {
        if message.get("role").and_then(Value::as_str) != Some("assistant") {
            return true;
        }
        if let Some(content) = message.get_mut("content").and_then(Value::as_array_mut) {
            content.retain(|block| block.get("type").and_then(Value::as_str) != Some("thinking"));
            !content.is_empty()
        } else {
            true
        }
    });

    if let Some(obj) = body.as_object_mut() {
        obj.remove("thinking");
    }
}
