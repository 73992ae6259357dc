//! Configuration types, built from `RELAY_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::{EnqueueOptions, Source};
use crate::monitor::MonitorConfig;
use crate::processor::ProcessorConfig;
use crate::queue::Backoff;
use crate::sources::AdapterConfig;

/// Queue and processor settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of processor loops to run.
    pub workers: usize,
    pub batch_size: usize,
    pub process_interval: Duration,
    pub visibility_timeout: Duration,
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Remote transform endpoint. `None` uses the passthrough transform.
    pub transform_url: Option<String>,
    pub transform_timeout: Duration,
    /// How long terminal items are kept. `None` keeps them forever.
    pub retention: Option<Duration>,
    pub retention_sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            batch_size: 10,
            process_interval: Duration::from_millis(1000),
            visibility_timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff: Backoff::default(),
            transform_url: None,
            transform_timeout: Duration::from_secs(20),
            retention: None,
            retention_sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl QueueConfig {
    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            priority: 0,
            max_retries: self.max_retries,
            visibility_timeout: self.visibility_timeout,
        }
    }

    /// Processor settings for worker number `index` (1-based ids).
    pub fn processor_config(&self, index: usize) -> ProcessorConfig {
        ProcessorConfig {
            worker_id: format!("worker-{}", index + 1),
            batch_size: self.batch_size,
            interval: self.process_interval,
            backoff: self.backoff,
            transform_timeout: self.transform_timeout,
        }
    }
}

/// One `user:provider[:channel|channel]` entry from `RELAY_SOURCES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub user_id: String,
    pub source: Source,
    pub channels: Vec<String>,
}

impl FromStr for SourceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, ':');
        let user_id = parts.next().unwrap_or_default().trim();
        if user_id.is_empty() {
            return Err(format!("'{s}' is missing a user id"));
        }
        let source: Source = parts
            .next()
            .ok_or_else(|| format!("'{s}' is missing a provider"))?
            .trim()
            .parse()?;
        let channels: Vec<String> = parts
            .next()
            .map(|list| {
                list.split('|')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            user_id: user_id.to_string(),
            source,
            channels,
        })
    }
}

/// Source polling settings.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub sources: Vec<SourceSpec>,
    pub gmail_api_base: Option<String>,
    pub slack_api_base: Option<String>,
    pub graph_api_base: Option<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            max_retries: 3,
            retry_delay: Duration::from_secs(10),
            sources: Vec::new(),
            gmail_api_base: None,
            slack_api_base: None,
            graph_api_base: None,
        }
    }
}

impl MonitorSettings {
    pub fn monitor_config(&self, enqueue: EnqueueOptions) -> MonitorConfig {
        MonitorConfig {
            poll_interval: self.poll_interval,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            enqueue,
            ..MonitorConfig::default()
        }
    }

    pub fn adapter_config(&self, spec: &SourceSpec) -> AdapterConfig {
        let base_url = match spec.source {
            Source::Gmail => self.gmail_api_base.clone(),
            Source::Slack => self.slack_api_base.clone(),
            Source::Teams => self.graph_api_base.clone(),
        };
        AdapterConfig {
            user_id: spec.user_id.clone(),
            base_url,
            channels: spec.channels.clone(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub http_port: u16,
    pub log_dir: Option<PathBuf>,
    pub queue: QueueConfig,
    pub monitors: MonitorSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/inbox-relay.db"),
            http_port: 8080,
            log_dir: None,
            queue: QueueConfig::default(),
            monitors: MonitorSettings::default(),
        }
    }
}

impl Config {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unset keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Lookup(&lookup);
        let defaults = Config::default();

        let queue = QueueConfig {
            workers: env.parse("RELAY_WORKERS", defaults.queue.workers)?,
            batch_size: env.parse("RELAY_BATCH_SIZE", defaults.queue.batch_size)?,
            process_interval: Duration::from_millis(env.parse("RELAY_PROCESS_INTERVAL_MS", 1000)?),
            visibility_timeout: Duration::from_secs(env.parse("RELAY_VISIBILITY_TIMEOUT_SECS", 30)?),
            max_retries: env.parse("RELAY_MAX_RETRIES", defaults.queue.max_retries)?,
            backoff: Backoff::new(
                Duration::from_millis(env.parse("RELAY_BACKOFF_BASE_MS", 2000)?),
                Duration::from_millis(env.parse("RELAY_BACKOFF_MAX_MS", 300_000)?),
            ),
            transform_url: env.string("RELAY_TRANSFORM_URL"),
            transform_timeout: Duration::from_secs(env.parse("RELAY_TRANSFORM_TIMEOUT_SECS", 20)?),
            retention: match env.parse::<u64>("RELAY_RETENTION_DAYS", 0)? {
                0 => None,
                days => Some(Duration::from_secs(days.saturating_mul(24 * 60 * 60))),
            },
            retention_sweep_interval: Duration::from_secs(
                env.parse("RELAY_RETENTION_SWEEP_SECS", 60 * 60)?,
            ),
        };

        if queue.workers == 0 {
            return Err(invalid("RELAY_WORKERS", "must be at least 1"));
        }
        if queue.batch_size == 0 {
            return Err(invalid("RELAY_BATCH_SIZE", "must be at least 1"));
        }
        if queue.max_retries == 0 {
            return Err(invalid("RELAY_MAX_RETRIES", "must be at least 1"));
        }
        if let Err(reason) = queue.enqueue_options().validate() {
            return Err(invalid("RELAY_VISIBILITY_TIMEOUT_SECS", &reason));
        }
        if queue.retention.is_some() && queue.retention_sweep_interval.is_zero() {
            return Err(invalid("RELAY_RETENTION_SWEEP_SECS", "must be at least 1"));
        }
        if queue.transform_timeout >= queue.visibility_timeout {
            return Err(invalid(
                "RELAY_TRANSFORM_TIMEOUT_SECS",
                "must be shorter than RELAY_VISIBILITY_TIMEOUT_SECS",
            ));
        }

        let sources = match env.string("RELAY_SOURCES") {
            Some(list) => list
                .split(',')
                .filter(|entry| !entry.trim().is_empty())
                .map(|entry| entry.parse::<SourceSpec>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| invalid("RELAY_SOURCES", &e))?,
            None => Vec::new(),
        };

        let monitors = MonitorSettings {
            poll_interval: Duration::from_secs(env.parse("RELAY_POLL_INTERVAL_SECS", 60)?),
            max_retries: env.parse("RELAY_MONITOR_MAX_RETRIES", defaults.monitors.max_retries)?,
            retry_delay: Duration::from_secs(env.parse("RELAY_MONITOR_RETRY_DELAY_SECS", 10)?),
            sources,
            gmail_api_base: env.string("RELAY_GMAIL_API_BASE"),
            slack_api_base: env.string("RELAY_SLACK_API_BASE"),
            graph_api_base: env.string("RELAY_GRAPH_API_BASE"),
        };

        Ok(Self {
            db_path: env
                .string("RELAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            http_port: env.parse("RELAY_HTTP_PORT", defaults.http_port)?,
            log_dir: env.string("RELAY_LOG_DIR").map(PathBuf::from),
            queue,
            monitors,
        })
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

struct Lookup<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    /// Non-blank trimmed value.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e: T::Err| invalid(key, &format!("'{raw}': {e}"))),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.db_path, PathBuf::from("./data/inbox-relay.db"));
        assert_eq!(config.queue.workers, 1);
        assert_eq!(config.queue.visibility_timeout, Duration::from_secs(30));
        assert_eq!(config.queue.backoff.base, Duration::from_secs(2));
        assert!(config.queue.transform_url.is_none());
        assert!(config.monitors.sources.is_empty());
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = from_pairs(&[
            ("RELAY_HTTP_PORT", "9090"),
            ("RELAY_WORKERS", "4"),
            ("RELAY_MAX_RETRIES", "5"),
            ("RELAY_TRANSFORM_URL", " http://localhost:7000/transform "),
            ("RELAY_SLACK_API_BASE", "http://127.0.0.1:9999"),
        ])
        .unwrap();
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.queue.workers, 4);
        assert_eq!(config.queue.enqueue_options().max_retries, 5);
        assert_eq!(
            config.queue.transform_url.as_deref(),
            Some("http://localhost:7000/transform")
        );
        assert_eq!(config.queue.processor_config(1).worker_id, "worker-2");
        assert_eq!(
            config.monitors.slack_api_base.as_deref(),
            Some("http://127.0.0.1:9999")
        );
    }

    #[test]
    fn invalid_number_names_the_key() {
        let err = from_pairs(&[("RELAY_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "RELAY_BATCH_SIZE"));
    }

    #[test]
    fn transform_timeout_must_fit_in_lease() {
        let err = from_pairs(&[
            ("RELAY_VISIBILITY_TIMEOUT_SECS", "10"),
            ("RELAY_TRANSFORM_TIMEOUT_SECS", "10"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("RELAY_TRANSFORM_TIMEOUT_SECS"));
    }

    #[test]
    fn visibility_timeout_is_bounded() {
        for secs in ["0", "86401"] {
            let err = from_pairs(&[("RELAY_VISIBILITY_TIMEOUT_SECS", secs)]).unwrap_err();
            assert!(err.to_string().contains("RELAY_VISIBILITY_TIMEOUT_SECS"), "{secs}");
        }
    }

    #[test]
    fn retention_is_opt_in() {
        let config = from_pairs(&[]).unwrap();
        assert!(config.queue.retention.is_none());

        let config = from_pairs(&[
            ("RELAY_RETENTION_DAYS", "7"),
            ("RELAY_RETENTION_SWEEP_SECS", "600"),
        ])
        .unwrap();
        assert_eq!(config.queue.retention, Some(Duration::from_secs(7 * 24 * 60 * 60)));
        assert_eq!(config.queue.retention_sweep_interval, Duration::from_secs(600));

        assert!(
            from_pairs(&[
                ("RELAY_RETENTION_DAYS", "7"),
                ("RELAY_RETENTION_SWEEP_SECS", "0"),
            ])
            .is_err()
        );
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(from_pairs(&[("RELAY_WORKERS", "0")]).is_err());
    }

    #[test]
    fn source_list_parses() {
        let config = from_pairs(&[(
            "RELAY_SOURCES",
            "alice:gmail, bob:slack:C1|C2 ,carol:Teams,",
        )])
        .unwrap();
        let sources = &config.monitors.sources;
        assert_eq!(sources.len(), 3);
        assert_eq!(sources[0].source, Source::Gmail);
        assert_eq!(sources[1].user_id, "bob");
        assert_eq!(sources[1].channels, vec!["C1", "C2"]);
        assert_eq!(sources[2].source, Source::Teams);

        let adapter = config.monitors.adapter_config(&sources[1]);
        assert_eq!(adapter.channels, vec!["C1", "C2"]);
        assert!(adapter.base_url.is_none());
    }

    #[test]
    fn bad_source_entry_rejected() {
        assert!(from_pairs(&[("RELAY_SOURCES", "alice:fax")]).is_err());
        assert!(from_pairs(&[("RELAY_SOURCES", ":gmail")]).is_err());
        assert!(from_pairs(&[("RELAY_SOURCES", "alice")]).is_err());
    }
}
