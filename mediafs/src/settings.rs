use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};

use crate::errors::Error;
use crate::fetch::{BackoffPolicy, FetchConfig};
use crate::scanner::ScanConfig;

/// Everything an instance needs to run, fully resolved.
///
/// Deserializes with defaults for every field left out, so callers only
/// provide what they want to change.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Names the instance in logs.
    pub instance_name: String,
    pub server_url: String,
    pub token: String,
    pub mount_path: PathBuf,
    /// Where generations are persisted, see [crate::cache::from_addr].
    pub cache_addr: String,

    pub workers: usize,
    /// 0 picks four tasks per worker.
    pub queue_capacity: usize,
    pub task_retries: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_delay: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub backoff_base: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub backoff_max: Duration,
    pub max_failures: u32,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconnect_after: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    pub read_attempts: u32,

    /// Interval of periodic Incremental scans, 0 disables them.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub refresh_interval: Duration,
    /// A recovered generation older than this is served, but rescanned right
    /// away.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cache_ttl: Duration,
    pub keep_records: usize,
    /// Whether to scan on startup even if a fresh generation was recovered.
    pub scan_on_start: bool,

    pub fuse_threads: usize,
    pub allow_other: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            instance_name: "default".to_string(),
            server_url: String::new(),
            token: String::new(),
            mount_path: PathBuf::new(),
            cache_addr: "memory://".to_string(),
            workers: 25,
            queue_capacity: 0,
            task_retries: 3,
            retry_delay: Duration::from_millis(500),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            max_failures: 5,
            reconnect_after: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            read_attempts: 3,
            refresh_interval: Duration::from_secs(60 * 60),
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            keep_records: 3,
            scan_on_start: true,
            fuse_threads: 4,
            allow_other: false,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::Settings("workers must be at least 1".into()));
        }
        if self.keep_records == 0 {
            return Err(Error::Settings("keep_records must be at least 1".into()));
        }
        if self.backoff_base > self.backoff_max {
            return Err(Error::Settings(
                "backoff_base must not exceed backoff_max".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Settings("request_timeout must not be 0".into()));
        }
        Ok(())
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            backoff: BackoffPolicy {
                base: self.backoff_base,
                max: self.backoff_max,
                jitter: true,
                max_failures: self.max_failures,
                reconnect_after: self.reconnect_after,
            },
            request_timeout: self.request_timeout,
            read_attempts: self.read_attempts,
        }
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            workers: self.workers,
            queue_capacity: match self.queue_capacity {
                0 => self.workers * 4,
                n => n,
            },
            task_retries: self.task_retries,
            retry_delay: self.retry_delay,
        }
    }

    /// The refresh interval, [None] if periodic scans are disabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        Some(self.refresh_interval).filter(|i| !i.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Settings;

    #[test]
    fn defaults_fill_gaps() {
        let settings: Settings = serde_json::from_str(
            r#"{"server_url": "http://plex.local:32400", "workers": 8, "backoff_base": 250, "refresh_interval": 0}"#,
        )
        .unwrap();

        assert_eq!("http://plex.local:32400", settings.server_url);
        assert_eq!(Duration::from_millis(250), settings.backoff_base);
        assert_eq!(None, settings.refresh_interval());
        assert_eq!(3, settings.task_retries);
        assert_eq!(32, settings.scan_config().queue_capacity);
        assert_eq!(8, settings.scan_config().workers);
        assert_eq!(
            Duration::from_millis(250),
            settings.fetch_config().backoff.base
        );
        settings.validate().unwrap();
    }

    #[test]
    fn default_values() {
        let settings = Settings::default();
        assert_eq!(25, settings.workers);
        assert_eq!(Some(Duration::from_secs(3600)), settings.refresh_interval());
        assert_eq!(Duration::from_millis(500), settings.scan_config().retry_delay);
        assert!(settings.fetch_config().backoff.jitter);
        settings.validate().unwrap();
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(serde_json::from_str::<Settings>(r#"{"wrokers": 3}"#).is_err());
    }

    #[test]
    fn invalid() {
        for settings in [
            Settings {
                workers: 0,
                ..Default::default()
            },
            Settings {
                keep_records: 0,
                ..Default::default()
            },
            Settings {
                backoff_base: Duration::from_secs(60),
                ..Default::default()
            },
        ] {
            assert!(settings.validate().is_err());
        }
    }
}
