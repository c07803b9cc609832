//! Turns an upstream `reqwest::Response` into the client-facing axum
//! response while tee-ing the same bytes to the post-processor sink.
//!
//! Streaming responses are never buffered in full: a background task reads
//! the upstream stream once, forwarding each chunk to both the client body
//! channel and the sink, so client-visible bytes are never delayed by the
//! sink's own pace. Non-streaming responses are already fully buffered (the
//! dispatcher needs the body to parse usage anyway) so the tee is just a
//! cheap `Bytes` clone handed to a spawned task.

use crate::header_codec::sanitize_proxy_response;
use crate::post_processor::{PostProcessor, SinkEvent};
use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use http::HeaderMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

/// Everything the forwarder needs about the request this response answers.
pub struct ForwardContext {
    pub request_id: String,
    pub account_id: Option<String>,
    pub method: String,
    pub path: String,
    pub bypass_session: bool,
    pub agent_used: Option<String>,
    pub request_payload: Option<Bytes>,
    pub failover_attempts: u32,
}

/// What the dispatcher hands the forwarder: either a live upstream response
/// it hasn't read yet, or one the dispatcher already buffered itself (the
/// thinking-block retry path inspects the body before deciding whether to
/// forward it, so by the time it reaches here the bytes are already in hand).
pub enum Upstream {
    Live(reqwest::Response),
    Buffered {
        status: http::StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
}

impl Upstream {
    fn status(&self) -> http::StatusCode {
        match self {
            Upstream::Live(response) => response.status(),
            Upstream::Buffered { status, .. } => *status,
        }
    }

    fn headers(&self) -> HeaderMap {
        match self {
            Upstream::Live(response) => response.headers().clone(),
            Upstream::Buffered { headers, .. } => headers.clone(),
        }
    }
}

/// A 404 on the provider's well-known discovery surface is not a real
/// failure; callers probe it to check capability support.
fn is_expected_not_found(status: u16, path: &str) -> bool {
    status == 404 && path.starts_with("/.well-known/")
}

/// Consume `upstream`, emit sink events through `post_processor`, and
/// return the response to hand back to the client.
pub async fn forward(
    ctx: ForwardContext,
    upstream: Upstream,
    is_streaming: bool,
    post_processor: &PostProcessor,
) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers();
    sanitize_proxy_response(&mut headers);

    info!(
        request_id = %ctx.request_id,
        method = %ctx.method,
        path = %ctx.path,
        account_id = ?ctx.account_id,
        status = status.as_u16(),
        agent_used = ?ctx.agent_used,
        "request-start"
    );

    post_processor
        .send(SinkEvent::Start {
            request_id: ctx.request_id.clone(),
            account_id: ctx.account_id.clone(),
            method: ctx.method.clone(),
            path: ctx.path.clone(),
            bypass_session: ctx.bypass_session,
            agent_used: ctx.agent_used.clone(),
            request_payload: ctx.request_payload,
        })
        .await;

    match upstream {
        Upstream::Buffered { body, .. } => forward_already_buffered(ctx, status, headers, body, post_processor).await,
        Upstream::Live(response) if is_streaming => {
            forward_streaming(ctx, status, headers, response, post_processor).await
        }
        Upstream::Live(response) => forward_buffered(ctx, status, headers, response, post_processor).await,
    }
}

async fn forward_already_buffered(
    ctx: ForwardContext,
    status: http::StatusCode,
    headers: HeaderMap,
    body: Bytes,
    post_processor: &PostProcessor,
) -> Response {
    let success = status.is_success() || is_expected_not_found(status.as_u16(), &ctx.path);
    post_processor
        .send(SinkEvent::End {
            request_id: ctx.request_id.clone(),
            status: Some(status.as_u16()),
            success,
            error: None,
            full_body: Some(body.clone()),
            failover_attempts: ctx.failover_attempts,
        })
        .await;
    crate::header_codec::with_sanitized_proxy_headers(status, headers, Body::from(body))
}

async fn forward_streaming(
    ctx: ForwardContext,
    status: http::StatusCode,
    headers: HeaderMap,
    upstream: reqwest::Response,
    post_processor: &PostProcessor,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(64);
    let sink = post_processor.clone();
    let request_id = ctx.request_id.clone();
    let path = ctx.path.clone();
    let failover_attempts = ctx.failover_attempts;

    tokio::spawn(async move {
        let mut stream = upstream.bytes_stream();
        let mut success = true;
        let mut last_status = status.as_u16();

        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    sink.send(SinkEvent::Chunk {
                        request_id: request_id.clone(),
                        bytes: chunk.clone(),
                    })
                    .await;
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(request_id = %request_id, error = %common::redact::redact_error(&err), "upstream stream error");
                    success = false;
                    last_status = 0;
                    let _ = tx.send(Err(std::io::Error::other(err))).await;
                    break;
                }
            }
        }

        if last_status != 0 {
            success = http::StatusCode::from_u16(last_status)
                .map(|s| s.is_success() || is_expected_not_found(last_status, &path))
                .unwrap_or(success);
        }

        sink.send(SinkEvent::End {
            request_id,
            status: Some(status.as_u16()),
            success,
            error: None,
            full_body: None,
            failover_attempts,
        })
        .await;
    });

    let body = Body::from_stream(ReceiverStream::new(rx));
    crate::header_codec::with_sanitized_proxy_headers(status, headers, body)
}

async fn forward_buffered(
    ctx: ForwardContext,
    status: http::StatusCode,
    headers: HeaderMap,
    upstream: reqwest::Response,
    post_processor: &PostProcessor,
) -> Response {
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(err) => {
            post_processor
                .send(SinkEvent::End {
                    request_id: ctx.request_id.clone(),
                    status: None,
                    success: false,
                    error: Some(err.to_string()),
                    full_body: None,
                    failover_attempts: ctx.failover_attempts,
                })
                .await;
            return crate::header_codec::with_sanitized_proxy_headers(
                http::StatusCode::BAD_GATEWAY,
                HeaderMap::new(),
                Body::empty(),
            );
        }
    };

    let success = status.is_success() || is_expected_not_found(status.as_u16(), &ctx.path);
    post_processor
        .send(SinkEvent::End {
            request_id: ctx.request_id.clone(),
            status: Some(status.as_u16()),
            success,
            error: None,
            full_body: Some(body.clone()),
            failover_attempts: ctx.failover_attempts,
        })
        .await;

    crate::header_codec::with_sanitized_proxy_headers(status, headers, Body::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_404_is_expected() {
        assert!(is_expected_not_found(404, "/.well-known/anthropic/client-info"));
        assert!(!is_expected_not_found(404, "/v1/messages"));
        assert!(!is_expected_not_found(500, "/.well-known/anything"));
    }
}
