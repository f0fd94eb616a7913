//! Engine configuration.
//!
//! Every knob has a default; `EngineConfig::from_env()` overrides them from
//! `EVENTLANE_*` environment variables. Durations are read as milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Inline and background retry behaviour of the action executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Synchronous attempts before an action is handed to the background queue.
    pub max_retry_count: u32,
    /// Pause between synchronous attempts (zero means immediate).
    pub inline_delay: Duration,
    /// Pause between background attempts of a persistently failing action.
    pub background_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            inline_delay: Duration::ZERO,
            background_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    pub fn with_inline_delay(mut self, delay: Duration) -> Self {
        self.inline_delay = delay;
        self
    }

    pub fn with_background_delay(mut self, delay: Duration) -> Self {
        self.background_delay = delay;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Worker threads draining lanes.
    pub workers: usize,
    /// Hash partitions; items with the same key always share a lane.
    pub lanes: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            lanes: 64,
        }
    }
}

impl MailboxConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes.max(1);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Reload-and-retry rounds after a concurrency conflict.
    pub max_conflict_retries: u32,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Delay before a held-back stream (gap or lost CAS) is tried again.
    pub gap_retry_delay: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            gap_retry_delay: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyConfig {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    /// Pooled connections unused for longer than this are evicted.
    pub idle_timeout: Duration,
    /// Interval of the eviction sweep.
    pub scan_interval: Duration,
    /// Connection attempts before a reply is dropped.
    pub connect_retry_count: u32,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            send_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(60),
            scan_interval: Duration::from_secs(5),
            connect_retry_count: 3,
        }
    }
}

impl ReplyConfig {
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub mailbox: MailboxConfig,
    pub retry: RetryPolicy,
    pub command: CommandConfig,
    pub publish: PublishConfig,
    pub reply: ReplyConfig,
}

impl EngineConfig {
    pub fn with_mailbox(mut self, mailbox: MailboxConfig) -> Self {
        self.mailbox = mailbox;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.command.max_conflict_retries = retries;
        self
    }

    pub fn with_gap_retry_delay(mut self, delay: Duration) -> Self {
        self.publish.gap_retry_delay = delay;
        self
    }

    pub fn with_reply(mut self, reply: ReplyConfig) -> Self {
        self.reply = reply;
        self
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = Env { lookup: &lookup };

        if let Some(v) = env.parse::<usize>("EVENTLANE_WORKERS")? {
            config.mailbox.workers = v.max(1);
        }
        if let Some(v) = env.parse::<usize>("EVENTLANE_LANES")? {
            config.mailbox.lanes = v.max(1);
        }
        if let Some(v) = env.parse("EVENTLANE_MAX_RETRY_COUNT")? {
            config.retry.max_retry_count = v;
        }
        if let Some(v) = env.millis("EVENTLANE_INLINE_DELAY_MS")? {
            config.retry.inline_delay = v;
        }
        if let Some(v) = env.millis("EVENTLANE_BACKGROUND_DELAY_MS")? {
            config.retry.background_delay = v;
        }
        if let Some(v) = env.parse("EVENTLANE_MAX_CONFLICT_RETRIES")? {
            config.command.max_conflict_retries = v;
        }
        if let Some(v) = env.millis("EVENTLANE_GAP_RETRY_DELAY_MS")? {
            config.publish.gap_retry_delay = v;
        }
        if let Some(v) = env.millis("EVENTLANE_REPLY_CONNECT_TIMEOUT_MS")? {
            config.reply.connect_timeout = v;
        }
        if let Some(v) = env.millis("EVENTLANE_REPLY_SEND_TIMEOUT_MS")? {
            config.reply.send_timeout = v;
        }
        if let Some(v) = env.millis("EVENTLANE_REPLY_IDLE_TIMEOUT_MS")? {
            config.reply.idle_timeout = v;
        }
        if let Some(v) = env.millis("EVENTLANE_REPLY_SCAN_INTERVAL_MS")? {
            config.reply.scan_interval = v;
        }
        if let Some(v) = env.parse("EVENTLANE_REPLY_CONNECT_RETRY_COUNT")? {
            config.reply.connect_retry_count = v;
        }

        Ok(config)
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match (self.lookup)(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
        }
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_observed_retry_behaviour() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_retry_count, 3);
        assert_eq!(config.retry.inline_delay, Duration::ZERO);
        assert_eq!(config.mailbox.lanes, 64);
        assert!(config.mailbox.workers >= 1);
        assert_eq!(config.command.max_conflict_retries, 3);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("EVENTLANE_WORKERS", "2"),
            ("EVENTLANE_MAX_RETRY_COUNT", " 5 "),
            ("EVENTLANE_GAP_RETRY_DELAY_MS", "250"),
            ("EVENTLANE_REPLY_IDLE_TIMEOUT_MS", "1000"),
        ]))
        .unwrap();

        assert_eq!(config.mailbox.workers, 2);
        assert_eq!(config.retry.max_retry_count, 5);
        assert_eq!(config.publish.gap_retry_delay, Duration::from_millis(250));
        assert_eq!(config.reply.idle_timeout, Duration::from_secs(1));
        assert_eq!(config.mailbox.lanes, 64);
    }

    #[test]
    fn malformed_value_is_rejected_with_its_key() {
        let err = EngineConfig::from_lookup(lookup_from(&[("EVENTLANE_LANES", "many")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "EVENTLANE_LANES".to_string(),
                value: "many".to_string(),
            }
        );
    }

    #[test]
    fn zero_workers_is_clamped() {
        let config = EngineConfig::from_lookup(lookup_from(&[("EVENTLANE_WORKERS", "0")])).unwrap();
        assert_eq!(config.mailbox.workers, 1);
    }
}
