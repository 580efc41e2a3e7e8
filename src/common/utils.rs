//! Utility functions for clustermgr

use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fresh participant session identifier
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Worker node address in `host:port` form
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    /// Parse `host:port`. The port follows the last `:`; the host must be
    /// non-empty and must not contain `:`, `/`, whitespace or control
    /// characters (it becomes a store path segment).
    pub fn parse(s: &str) -> crate::Result<Self> {
        let malformed = || crate::Error::MalformedNodeAddress(s.to_string());

        let (host, port) = s.rsplit_once(':').ok_or_else(malformed)?;
        let bad_char = |c: char| c == ':' || c == '/' || c.is_whitespace() || c.is_control();
        if host.is_empty() || host.chars().any(bad_char) {
            return Err(malformed());
        }
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let port: u16 = port.parse().map_err(|_| malformed())?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Instance name used as the node's path segment (`host_port`)
    pub fn node_id(&self) -> String {
        format!("{}_{}", self.host, self.port)
    }
}

impl std::str::FromStr for NodeAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Exponential backoff with jitter, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            current: initial,
            max,
        }
    }

    /// Delay before the next attempt. Doubles each call up to `max`; up to a
    /// quarter of the delay is added as jitter without exceeding `max`.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let jitter_ms = (base.as_millis() / 4) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Retry with exponential backoff while the error is retryable
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt + 1 < max_retries => {
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}
