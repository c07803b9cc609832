//! Header sanitization applied at the request and response boundaries.
//!
//! Mirrors the teacher's hop-by-hop stripping, generalized from one fixed
//! list to the two distinct request/response lists the proxy needs.

use axum::body::Body;
use axum::response::Response;
use http::HeaderMap;

const REQUEST_STRIP: &[&str] = &["accept-encoding", "content-encoding", "content-length", "transfer-encoding"];
const RESPONSE_STRIP: &[&str] = &["content-encoding", "content-length", "transfer-encoding"];

fn strip(headers: &mut HeaderMap, names: &[&str]) {
    for name in names {
        headers.remove(*name);
    }
}

/// Strip headers that would otherwise desync the upstream request: the
/// runtime's HTTP client negotiates its own encoding and framing.
pub fn sanitize_request(headers: &mut HeaderMap) {
    strip(headers, REQUEST_STRIP);
}

/// Strip headers invalidated by the runtime already having decompressed the
/// body before it reaches this layer.
pub fn sanitize_proxy_response(headers: &mut HeaderMap) {
    strip(headers, RESPONSE_STRIP);
}

/// Rebuild a response with sanitized headers, preserving status and body.
pub fn with_sanitized_proxy_headers(status: http::StatusCode, mut headers: HeaderMap, body: Body) -> Response {
    sanitize_proxy_response(&mut headers);
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn sanitize_request_strips_encoding_and_framing_headers() {
        let mut headers = headers_with(&[
            ("accept-encoding", "gzip"),
            ("content-encoding", "gzip"),
            ("content-length", "10"),
            ("transfer-encoding", "chunked"),
            ("authorization", "Bearer x"),
        ]);
        sanitize_request(&mut headers);
        assert!(headers.get("accept-encoding").is_none());
        assert!(headers.get("content-encoding").is_none());
        assert!(headers.get("content-length").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("authorization").is_some());
    }

    #[test]
    fn sanitize_proxy_response_keeps_accept_encoding() {
        let mut headers = headers_with(&[("accept-encoding", "gzip"), ("content-length", "5")]);
        sanitize_proxy_response(&mut headers);
        assert!(headers.get("accept-encoding").is_some());
        assert!(headers.get("content-length").is_none());
    }

    #[test]
    fn with_sanitized_proxy_headers_preserves_status() {
        let headers = headers_with(&[("content-length", "5")]);
        let response = with_sanitized_proxy_headers(http::StatusCode::OK, headers, Body::empty());
        assert_eq!(response.status(), http::StatusCode::OK);
        assert!(response.headers().get("content-length").is_none());
    }
}
