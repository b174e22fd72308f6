//! Pool configuration, and parsing for the durations we accept on the
//! command line.

use std::{fmt, str::FromStr};

use clap::Args;

use crate::prelude::*;

/// Tuning knobs for the OCR worker pool and its dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of long-lived workers.
    pub worker_count: usize,

    /// Number of jobs that may wait in the queue.
    pub queue_capacity: usize,

    /// Hard deadline for a single engine call, including waiting for the
    /// engine lock.
    pub engine_call_timeout: Duration,

    /// How long a submission may wait for room in the queue.
    pub admission_timeout: Duration,

    /// How long a submission may wait for its result once queued. Normally
    /// longer than `engine_call_timeout`, so that the worker's own timeout
    /// result wins the race.
    pub result_timeout: Duration,

    /// Where to put temporary image files. `None` means the system default.
    pub temp_dir: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            queue_capacity: 10,
            engine_call_timeout: Duration::from_secs(30),
            admission_timeout: Duration::from_secs(5),
            result_timeout: Duration::from_secs(35),
            temp_dir: None,
        }
    }
}

impl PoolConfig {
    /// Check that this configuration can actually run.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(anyhow!("worker count must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue capacity must be at least 1"));
        }
        if self.result_timeout <= self.engine_call_timeout {
            warn!(
                result_timeout = %HumanDuration(self.result_timeout),
                engine_call_timeout = %HumanDuration(self.engine_call_timeout),
                "result timeout is not longer than the engine timeout; callers may \
                 time out before workers report their own timeouts"
            );
        }
        Ok(())
    }

    /// Where temporary files should be written.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Command-line options for the worker pool.
#[derive(Args, Clone, Debug)]
pub struct PoolOpts {
    /// Number of OCR workers.
    #[clap(long = "workers", env = "OCR_WORKERS", default_value = "3")]
    pub worker_count: usize,

    /// Number of jobs that may wait for a free worker.
    #[clap(long, env = "OCR_QUEUE_CAPACITY", default_value = "10")]
    pub queue_capacity: usize,

    /// Deadline for a single OCR engine call (e.g. "30s", "500ms").
    #[clap(long = "engine-timeout", env = "OCR_ENGINE_TIMEOUT", default_value = "30s")]
    pub engine_call_timeout: HumanDuration,

    /// How long to wait for room in the queue before reporting "busy".
    #[clap(long, env = "OCR_ADMISSION_TIMEOUT", default_value = "5s")]
    pub admission_timeout: HumanDuration,

    /// How long to wait for a queued job's result.
    #[clap(long, env = "OCR_RESULT_TIMEOUT", default_value = "35s")]
    pub result_timeout: HumanDuration,

    /// Directory for temporary image files.
    #[clap(long, env = "OCR_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,
}

impl PoolOpts {
    /// Convert to a validated [`PoolConfig`].
    pub fn to_config(&self) -> Result<PoolConfig> {
        let config = PoolConfig {
            worker_count: self.worker_count,
            queue_capacity: self.queue_capacity,
            engine_call_timeout: self.engine_call_timeout.0,
            admission_timeout: self.admission_timeout.0,
            result_timeout: self.result_timeout.0,
            temp_dir: self.temp_dir.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// A [`Duration`] written as an integer with a `ms`, `s` or `m` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanDuration(pub Duration);

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.0.as_millis();
        if millis % 60_000 == 0 && millis > 0 {
            write!(f, "{}m", millis / 60_000)
        } else if millis % 1000 == 0 {
            write!(f, "{}s", millis / 1000)
        } else {
            write!(f, "{}ms", millis)
        }
    }
}

impl FromStr for HumanDuration {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let s = s.trim();
            let split_at = s
                .find(|c: char| !c.is_ascii_digit())
                .ok_or_else(|| anyhow!("Missing unit (expected ms, s or m)"))?;
            let (amount, unit) = s.split_at(split_at);
            let amount = amount.parse::<u64>()?;
            let duration = match unit {
                "ms" => Duration::from_millis(amount),
                "s" => Duration::from_secs(amount),
                "m" => Duration::from_secs(
                    amount
                        .checked_mul(60)
                        .ok_or_else(|| anyhow!("Duration is too long"))?,
                ),
                _ => return Err(anyhow!("Unsupported unit: {:?}", unit)),
            };
            Ok(Self(duration))
        };
        parse(s).with_context(|| format!("Failed to parse duration: {:?}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let d = HumanDuration::from_str("100ms").unwrap();
        assert_eq!(d.0, Duration::from_millis(100));

        let d = HumanDuration::from_str("30s").unwrap();
        assert_eq!(d.0, Duration::from_secs(30));

        let d = HumanDuration::from_str("2m").unwrap();
        assert_eq!(d.0, Duration::from_secs(120));
    }

    #[test]
    fn test_failed_parse() {
        assert!(HumanDuration::from_str("30").is_err());
        assert!(HumanDuration::from_str("s").is_err());
        assert!(HumanDuration::from_str("10h").is_err());
        assert!(HumanDuration::from_str("-5s").is_err());
    }

    #[test]
    fn test_huge_minutes_are_rejected() {
        let err = HumanDuration::from_str("400000000000000000m").unwrap_err();
        assert!(format!("{err:#}").contains("too long"), "{err:#}");
    }

    #[test]
    fn test_display() {
        for s in ["250ms", "5s", "35s", "2m"] {
            assert_eq!(HumanDuration::from_str(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PoolConfig::default();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.engine_call_timeout, Duration::from_secs(30));
        assert_eq!(config.admission_timeout, Duration::from_secs(5));
        assert_eq!(config.result_timeout, Duration::from_secs(35));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_or_capacity_is_rejected() {
        let config = PoolConfig {
            worker_count: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PoolConfig {
            queue_capacity: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
