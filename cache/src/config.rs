use std::{env, error::Error as StdError, str::FromStr, time::Duration};

use crate::error::CacheError;

/// Tuning knobs for the cache, the merger's pending buffer and the fetcher.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Recent messages kept per channel.
    pub message_limit: usize,
    /// Events held per unknown guild before the oldest are dropped.
    pub pending_depth: usize,
    /// How long a held event stays eligible for replay.
    pub pending_ttl: Duration,
    /// Member misses in one guild within this window share one request.
    pub batch_window: Duration,
    /// Retries after the first attempt for transient fetch failures.
    pub fetch_retries: u32,
    /// First retry delay, doubled on every further retry.
    pub fetch_backoff: Duration,
    /// Refetch members that are cached only as stubs.
    pub refine_stubs: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            message_limit: 50,
            pending_depth: 32,
            pending_ttl: Duration::from_secs(30),
            batch_window: Duration::from_millis(50),
            fetch_retries: 3,
            fetch_backoff: Duration::from_millis(250),
            refine_stubs: true,
        }
    }
}

impl CacheConfig {
    /// Reads `CORDSTATE_*` variables from the process environment, falling
    /// back to the defaults for unset ones.
    pub fn from_env() -> Result<Self, CacheError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CacheError> {
        let default = Self::default();
        Ok(Self {
            message_limit: parse(&lookup, "CORDSTATE_MESSAGE_LIMIT", default.message_limit)?,
            pending_depth: parse(&lookup, "CORDSTATE_PENDING_DEPTH", default.pending_depth)?,
            pending_ttl: parse_millis(&lookup, "CORDSTATE_PENDING_TTL_MS", default.pending_ttl)?,
            batch_window: parse_millis(&lookup, "CORDSTATE_BATCH_WINDOW_MS", default.batch_window)?,
            fetch_retries: parse(&lookup, "CORDSTATE_FETCH_RETRIES", default.fetch_retries)?,
            fetch_backoff: parse_millis(
                &lookup,
                "CORDSTATE_FETCH_BACKOFF_MS",
                default.fetch_backoff,
            )?,
            refine_stubs: parse(&lookup, "CORDSTATE_REFINE_STUBS", default.refine_stubs)?,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, CacheError>
where
    T: FromStr,
    T::Err: StdError + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|err| CacheError::config(key, err)),
        None => Ok(default),
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, CacheError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Duration::from_millis)
            .map_err(|err| CacheError::config(key, err)),
        None => Ok(default),
    }
}
