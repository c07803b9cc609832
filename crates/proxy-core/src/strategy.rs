//! Pluggable account ordering, with session affinity held by the default
//! implementation.
//!
//! The spec leaves the exact ordering open but fixes one invariant: once an
//! account is selected, it keeps serving the same "session" until rate
//! limited. `SESSION_WINDOW_MS` is this implementation's choice for how
//! long a session is considered live without an explicit session-end
//! signal from upstream — see the design notes for why 5 hours was picked.

use crate::types::RequestMeta;
use account_store::Account;
use common::time::now_ms;

/// How long an account's session affinity holds once started, absent a
/// rate-limit event or explicit reset.
pub const SESSION_WINDOW_MS: u64 = 5 * 60 * 60 * 1000;

pub trait Strategy: Send + Sync {
    /// Order `candidates` for `meta`. The Dispatcher tries them in order
    /// until one succeeds.
    fn order(&self, meta: &RequestMeta, candidates: Vec<Account>) -> Vec<Account>;
}

/// Default strategy: prefer an account with a live, unexpired session, then
/// fall back to priority (descending) and least-recently-used.
#[derive(Debug, Default)]
pub struct SessionAffinityStrategy;

impl Strategy for SessionAffinityStrategy {
    fn order(&self, _meta: &RequestMeta, mut candidates: Vec<Account>) -> Vec<Account> {
        let now = now_ms();

        candidates.sort_by(|a, b| {
            let a_session = has_live_session(a, now);
            let b_session = has_live_session(b, now);
            b_session
                .cmp(&a_session)
                .then_with(|| b.policy.priority.cmp(&a.policy.priority))
                .then_with(|| a.usage.last_used_ms.unwrap_or(0).cmp(&b.usage.last_used_ms.unwrap_or(0)))
        });

        candidates
    }
}

fn has_live_session(account: &Account, now: u64) -> bool {
    match account.usage.session_start_ms {
        Some(start) => now.saturating_sub(start) < SESSION_WINDOW_MS,
        None => false,
    }
}

/// Filter out paused accounts and accounts still inside an active rate-limit
/// window. Called before `Strategy::order` so candidates are always usable.
pub fn eligible_accounts(accounts: Vec<Account>) -> Vec<Account> {
    let now = now_ms();
    accounts
        .into_iter()
        .filter(|a| !a.policy.paused)
        .filter(|a| match a.rate_limit.limited_until_ms {
            Some(until) => until <= now,
            None => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_store::{Credential, Policy, RateLimit, Usage};

    fn account(id: &str, priority: i64, session_start_ms: Option<u64>) -> Account {
        Account {
            id: id.into(),
            name: id.into(),
            provider: "anthropic".into(),
            credential: Credential::OAuth {
                refresh_token: "rt".into(),
                access_token: Some("at".into()),
                expires_at_ms: Some(now_ms() + 1_000_000),
            },
            created_at_ms: Some(now_ms()),
            usage: Usage {
                session_start_ms,
                ..Usage::default()
            },
            rate_limit: RateLimit::default(),
            policy: Policy {
                priority,
                ..Policy::default()
            },
        }
    }

    fn meta() -> RequestMeta {
        RequestMeta {
            request_id: "r".into(),
            method: "POST".into(),
            path: "/v1/messages".into(),
            timestamp_ms: now_ms(),
            headers: http::HeaderMap::new(),
        }
    }

    #[test]
    fn live_session_account_is_ordered_first() {
        let strategy = SessionAffinityStrategy;
        let low_priority_with_session = account("a", 0, Some(now_ms()));
        let high_priority_no_session = account("b", 10, None);

        let ordered = strategy.order(
            &meta(),
            vec![high_priority_no_session, low_priority_with_session],
        );
        assert_eq!(ordered[0].id, "a");
    }

    #[test]
    fn expired_session_falls_back_to_priority() {
        let strategy = SessionAffinityStrategy;
        let stale_session = account("a", 0, Some(now_ms() - SESSION_WINDOW_MS - 1));
        let high_priority = account("b", 10, None);

        let ordered = strategy.order(&meta(), vec![stale_session, high_priority]);
        assert_eq!(ordered[0].id, "b");
    }

    #[test]
    fn eligible_accounts_excludes_paused() {
        let mut paused = account("a", 0, None);
        paused.policy.paused = true;
        let active = account("b", 0, None);

        let eligible = eligible_accounts(vec![paused, active]);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, "b");
    }

    #[test]
    fn eligible_accounts_excludes_active_rate_limit() {
        let mut limited = account("a", 0, None);
        limited.rate_limit.limited_until_ms = Some(now_ms() + 60_000);
        let active = account("b", 0, None);

        let eligible = eligible_accounts(vec![limited, active]);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, "b");
    }

    #[test]
    fn eligible_accounts_includes_expired_rate_limit() {
        let mut expired = account("a", 0, None);
        expired.rate_limit.limited_until_ms = Some(now_ms() - 1000);

        let eligible = eligible_accounts(vec![expired]);
        assert_eq!(eligible.len(), 1);
    }
}
