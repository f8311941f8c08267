//! Per-provider sliding-window request tracking and the cooldown map that
//! §4.3's failure classifier feeds.
//!
//! The sliding-window mechanics are grounded in a conventional RPM/TPM
//! tracker; this spec only needs the cooldown side (a provider recently
//! classified as `auth`/`rate_limit`/`server_error` is skipped until its
//! cooldown expires), so the tracker here is simplified to that purpose.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

/// Classification of a provider adapter failure (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Auth,
    Permission,
    RateLimit,
    ServerError,
    FatalRequest,
    Timeout,
    Network,
}

impl FailureClass {
    /// Classify an adapter failure from its HTTP status (if any) and
    /// message text, per §4.3.
    pub fn classify(status: Option<u16>, message: &str) -> Self {
        if let Some(status) = status {
            match status {
                401 => return FailureClass::Auth,
                403 => return FailureClass::Permission,
                429 => return FailureClass::RateLimit,
                400 | 404 | 409 | 422 => return FailureClass::FatalRequest,
                s if s >= 500 => return FailureClass::ServerError,
                _ => {}
            }
        }
        let lower = message.to_lowercase();
        if lower.contains("timeout") || lower.contains("abort") {
            FailureClass::Timeout
        } else if lower.contains("econn")
            || lower.contains("network")
            || lower.contains("enotfound")
            || lower.contains("ehostunreach")
        {
            FailureClass::Network
        } else if lower.contains("validation") || lower.contains("malformed") || lower.contains("bad-request")
        {
            FailureClass::FatalRequest
        } else {
            FailureClass::ServerError
        }
    }

    /// Cooldown duration applied after this class of failure, or `None` if
    /// the class carries no cooldown (fatal requests are not retried at
    /// all, so they never cool down).
    pub fn cooldown_seconds(self) -> Option<u64> {
        match self {
            FailureClass::Auth | FailureClass::Permission => Some(900),
            FailureClass::RateLimit => Some(60),
            FailureClass::ServerError => Some(15),
            FailureClass::Timeout | FailureClass::Network => Some(15),
            FailureClass::FatalRequest => None,
        }
    }

    /// Whether failover to the next candidate should be attempted.
    pub fn retryable(self) -> bool {
        !matches!(self, FailureClass::FatalRequest)
    }
}

struct Cooldown {
    until: DateTime<Utc>,
}

/// Tracks which providers are currently in cooldown after a classified
/// failure, so the router can skip them before even attempting a call.
pub struct CooldownTracker {
    cooldowns: Mutex<HashMap<String, Cooldown>>,
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self {
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record_failure(&self, provider_id: &str, class: FailureClass) {
        let Some(secs) = class.cooldown_seconds() else {
            return;
        };
        let mut map = self.cooldowns.lock().await;
        map.insert(
            provider_id.to_string(),
            Cooldown {
                until: Utc::now() + Duration::seconds(secs as i64),
            },
        );
    }

    pub async fn is_in_cooldown(&self, provider_id: &str) -> bool {
        let map = self.cooldowns.lock().await;
        map.get(provider_id)
            .map(|c| c.until > Utc::now())
            .unwrap_or(false)
    }

    pub async fn clear(&self, provider_id: &str) {
        self.cooldowns.lock().await.remove(provider_id);
    }
}

// ── Sliding window RPM tracker (local rate-limit avoidance) ────────────────

pub struct SlidingWindow {
    window_secs: u64,
    max_count: u64,
    events: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new(window_secs: u64, max_count: u64) -> Self {
        Self {
            window_secs,
            max_count,
            events: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(self.window_secs as i64);
        while self.events.front().is_some_and(|t| *t <= cutoff) {
            self.events.pop_front();
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>) {
        self.evict(at);
        self.events.push_back(at);
    }

    pub fn is_limited(&mut self, now: DateTime<Utc>) -> bool {
        self.evict(now);
        self.events.len() as u64 >= self.max_count
    }
}

/// Parse a `Retry-After` header value: integer seconds or an HTTP-date.
pub fn parse_retry_after(header_value: &str) -> Option<std::time::Duration> {
    let trimmed = header_value.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(std::time::Duration::from_secs(secs));
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(trimmed) {
        let now = Utc::now();
        let retry_at = dt.with_timezone(&Utc);
        if retry_at > now {
            return (retry_at - now).to_std().ok();
        }
        return Some(std::time::Duration::ZERO);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_statuses() {
        assert_eq!(FailureClass::classify(Some(401), ""), FailureClass::Auth);
        assert_eq!(FailureClass::classify(Some(403), ""), FailureClass::Permission);
        assert_eq!(FailureClass::classify(Some(429), ""), FailureClass::RateLimit);
        assert_eq!(FailureClass::classify(Some(503), ""), FailureClass::ServerError);
        assert_eq!(FailureClass::classify(Some(400), ""), FailureClass::FatalRequest);
    }

    #[test]
    fn classifies_message_text_when_no_status() {
        assert_eq!(FailureClass::classify(None, "request timeout"), FailureClass::Timeout);
        assert_eq!(FailureClass::classify(None, "ECONNRESET"), FailureClass::Network);
    }

    #[test]
    fn fatal_request_is_not_retryable() {
        assert!(!FailureClass::classify(Some(400), "").retryable());
        assert!(FailureClass::classify(Some(503), "").retryable());
    }

    #[tokio::test]
    async fn cooldown_tracker_marks_and_expires() {
        let tracker = CooldownTracker::new();
        tracker.record_failure("p1", FailureClass::RateLimit).await;
        assert!(tracker.is_in_cooldown("p1").await);
        tracker.clear("p1").await;
        assert!(!tracker.is_in_cooldown("p1").await);
    }

    #[test]
    fn parse_retry_after_integer_seconds() {
        assert_eq!(parse_retry_after("30"), Some(std::time::Duration::from_secs(30)));
    }
}
