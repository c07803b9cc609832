//! In-progress authorization-flow bookkeeping.
//!
//! `OAuthSession` is created when an admin starts an authorization flow and
//! consumed exactly once when the callback arrives with the authorization
//! code. The session id doubles as the CSRF `state` parameter sent to the
//! authorization server: it is a base64url-encoded JSON envelope carrying a
//! random token plus the creation timestamp, so the callback handler can
//! reject a state whose embedded timestamp has aged past the allowed window
//! without a second lookup table.

use crate::error::{Error, Result};
use crate::pkce::{build_authorization_url, compute_challenge, generate_verifier};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use common::time::now_ms;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Session lifetime: entries older than this are treated as expired and
/// purged on the next insert or lookup.
const SESSION_TTL_MS: u64 = 10 * 60 * 1000;

/// Window during which a state's embedded timestamp is accepted at the
/// token-exchange step: `[now - 5 min, now]`.
const STATE_VALIDITY_MS: u64 = 5 * 60 * 1000;

#[derive(Serialize, Deserialize)]
struct StateEnvelope {
    #[serde(rename = "csrfToken")]
    csrf_token: String,
    #[serde(rename = "timestampMs")]
    timestamp_ms: u64,
}

/// A short-lived, in-progress authorization session.
pub struct OAuthSession {
    /// Also the CSRF `state` value sent to the authorization server.
    pub id: String,
    pub account_name: String,
    pub mode: String,
    pub code_verifier: Secret<String>,
    pub created_at_ms: u64,
    pub challenge: Option<String>,
}

/// Process-wide store of in-flight authorization sessions, keyed by state.
pub struct OAuthSessionStore {
    sessions: Mutex<HashMap<String, OAuthSession>>,
}

impl Default for OAuthSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OAuthSessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new authorization flow: generate a PKCE pair and CSRF state,
    /// register the session, and return the full authorization URL.
    ///
    /// `mode` distinguishes authorization variants (e.g. "max" subscription
    /// vs "console" API-key-creating flows) without the store itself caring
    /// which.
    pub fn begin(&self, account_name: &str, mode: &str) -> String {
        let verifier = generate_verifier();
        let challenge = compute_challenge(&verifier);
        let state = encode_state(&random_csrf_token());

        let session = OAuthSession {
            id: state.clone(),
            account_name: account_name.to_string(),
            mode: mode.to_string(),
            code_verifier: Secret::new(verifier),
            created_at_ms: now_ms(),
            challenge: Some(challenge.clone()),
        };

        let mut sessions = self.sessions.lock().expect("oauth session lock poisoned");
        purge_expired(&mut sessions);
        sessions.insert(state.clone(), session);

        build_authorization_url(&state, &challenge)
    }

    /// Validate and consume a session by its state value. Removes the entry
    /// unconditionally once found (single use), even when validation fails,
    /// since a state that failed validation should never be retried.
    pub fn take(&self, state: &str) -> Result<OAuthSession> {
        let mut sessions = self.sessions.lock().expect("oauth session lock poisoned");
        purge_expired(&mut sessions);

        let session = sessions
            .remove(state)
            .ok_or_else(|| Error::InvalidState("unknown or already-consumed state".to_string()))?;

        validate_state_timestamp(state)?;

        if now_ms().saturating_sub(session.created_at_ms) > SESSION_TTL_MS {
            return Err(Error::InvalidState("session expired".to_string()));
        }

        Ok(session)
    }

    /// Number of sessions currently tracked (test/observability hook).
    pub fn len(&self) -> usize {
        self.sessions.lock().expect("oauth session lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 32 random bytes rendered as hex, per the CSRF state envelope shape
/// (`{ csrfToken (32 random bytes as hex), timestampMs }`).
fn random_csrf_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn encode_state(csrf_token: &str) -> String {
    let envelope = StateEnvelope {
        csrf_token: csrf_token.to_string(),
        timestamp_ms: now_ms(),
    };
    let json = serde_json::to_vec(&envelope).expect("state envelope must serialize");
    URL_SAFE_NO_PAD.encode(json)
}

/// Property: the token-exchange step accepts a state iff its embedded
/// timestamp is within `[now - STATE_VALIDITY_MS, now]`.
fn validate_state_timestamp(state: &str) -> Result<()> {
    let bytes = URL_SAFE_NO_PAD
        .decode(state)
        .map_err(|e| Error::InvalidState(format!("malformed state encoding: {e}")))?;
    let envelope: StateEnvelope = serde_json::from_slice(&bytes)
        .map_err(|e| Error::InvalidState(format!("malformed state payload: {e}")))?;

    let now = now_ms();
    let lower_bound = now.saturating_sub(STATE_VALIDITY_MS);
    if envelope.timestamp_ms < lower_bound || envelope.timestamp_ms > now {
        return Err(Error::InvalidState(
            "state timestamp outside accepted window".to_string(),
        ));
    }
    Ok(())
}

fn purge_expired(sessions: &mut HashMap<String, OAuthSession>) {
    let now = now_ms();
    sessions.retain(|_, s| now.saturating_sub(s.created_at_ms) <= SESSION_TTL_MS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_returns_url_with_state_and_challenge() {
        let store = OAuthSessionStore::new();
        let url = store.begin("acct-1", "max");
        assert!(url.contains("code_challenge="));
        assert!(url.contains("state="));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn take_consumes_session_exactly_once() {
        let store = OAuthSessionStore::new();
        let url = store.begin("acct-1", "max");
        let state = extract_state(&url);

        let session = store.take(&state).unwrap();
        assert_eq!(session.account_name, "acct-1");
        assert!(store.is_empty());

        let second = store.take(&state);
        assert!(second.is_err());
    }

    #[test]
    fn take_unknown_state_errors() {
        let store = OAuthSessionStore::new();
        let result = store.take("not-a-real-state");
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[test]
    fn take_rejects_state_with_stale_timestamp() {
        let stale = encode_state_at(&random_csrf_token(), now_ms() - STATE_VALIDITY_MS - 60_000);
        let store = OAuthSessionStore::new();
        // Force-insert a session under the stale state so `take` gets past
        // the "unknown state" check and exercises timestamp validation.
        {
            let mut sessions = store.sessions.lock().unwrap();
            sessions.insert(
                stale.clone(),
                OAuthSession {
                    id: stale.clone(),
                    account_name: "acct".into(),
                    mode: "max".into(),
                    code_verifier: Secret::new("verifier".into()),
                    created_at_ms: now_ms() - STATE_VALIDITY_MS - 60_000,
                    challenge: None,
                },
            );
        }
        let result = store.take(&stale);
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[test]
    fn take_rejects_future_timestamp() {
        let future = encode_state_at(&random_csrf_token(), now_ms() + 60_000);
        let store = OAuthSessionStore::new();
        {
            let mut sessions = store.sessions.lock().unwrap();
            sessions.insert(
                future.clone(),
                OAuthSession {
                    id: future.clone(),
                    account_name: "acct".into(),
                    mode: "max".into(),
                    code_verifier: Secret::new("verifier".into()),
                    created_at_ms: now_ms(),
                    challenge: None,
                },
            );
        }
        let result = store.take(&future);
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[test]
    fn begin_purges_expired_sessions_on_insert() {
        let store = OAuthSessionStore::new();
        {
            let mut sessions = store.sessions.lock().unwrap();
            sessions.insert(
                "stale".to_string(),
                OAuthSession {
                    id: "stale".into(),
                    account_name: "old".into(),
                    mode: "max".into(),
                    code_verifier: Secret::new("v".into()),
                    created_at_ms: now_ms() - SESSION_TTL_MS - 1,
                    challenge: None,
                },
            );
        }
        store.begin("new-acct", "max");
        let sessions = store.sessions.lock().unwrap();
        assert!(!sessions.contains_key("stale"));
    }

    fn extract_state(url: &str) -> String {
        url.split("state=").nth(1).unwrap().to_string()
    }

    fn encode_state_at(csrf_token: &str, timestamp_ms: u64) -> String {
        let envelope = StateEnvelope {
            csrf_token: csrf_token.to_string(),
            timestamp_ms,
        };
        let json = serde_json::to_vec(&envelope).unwrap();
        URL_SAFE_NO_PAD.encode(json)
    }
}
