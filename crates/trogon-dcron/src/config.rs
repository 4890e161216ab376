use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::env::ReadEnv;
use crate::parser::Parser;

const DEFAULT_LOCK_DIR: &str = "/dcron/lock/{name}";
const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(16);
const DEFAULT_WAIT_LOCK_TIME: Duration = Duration::from_secs(4);
const DEFAULT_WAIT_UNLOCK_TIME: Duration = Duration::from_secs(1);
const DEFAULT_REFRESH_GAP: Duration = Duration::from_secs(4);
const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(16);

const DEFAULT_NAME: &str = "trogon-dcron";
const DEFAULT_SPEC: &str = "@every 1m";
const DEFAULT_SUBJECT: &str = "cron.tick";
const DEFAULT_NATS_URL: &str = "nats://localhost:4222";

/// Placeholder in `lock_dir` replaced by the component name.
pub const NAME_PLACEHOLDER: &str = "{name}";

/// What happens when a job is due while its previous run is still going.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelayExecType {
    /// Drop the new run.
    #[default]
    Skip,
    /// Wait for the previous run, then run.
    Queue,
    /// Run side by side.
    Concurrent,
}

impl FromStr for DelayExecType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "queue" => Ok(Self::Queue),
            "concurrent" => Ok(Self::Concurrent),
            other => Err(format!("unknown delay exec type: {other}")),
        }
    }
}

/// Cron component configuration.
///
/// Resolved from environment variables by [`CronConfig::from_env`]:
/// - `CRON_DISTRIBUTED_TASK`: only the lock holder runs jobs (default: false)
/// - `CRON_IMMEDIATELY_RUN`: fire every job once as soon as scheduling starts (default: false)
/// - `CRON_WITH_SECONDS`: expressions carry a leading seconds field (default: false)
/// - `CRON_TIMEZONE`: IANA zone expressions are evaluated in (default: UTC)
/// - `CRON_DELAY_EXEC_TYPE`: `skip`, `queue` or `concurrent` (default: skip)
/// - `CRON_LOCK_DIR`: lock path template, `{name}` is the component name
///   (default: `/dcron/lock/{name}`)
/// - `CRON_LOCK_TTL`: TTL of the acquired lock (default: 16s)
/// - `CRON_WAIT_LOCK_TIME`: timeout of one acquisition attempt (default: 4s)
/// - `CRON_WAIT_UNLOCK_TIME`: timeout of the release on stop (default: 1s)
/// - `CRON_REFRESH_GAP`: interval between lock refreshes (default: 4s)
/// - `CRON_REFRESH_TTL`: TTL applied by each refresh (default: 16s)
/// - `CRON_LOCK_RETRY_DELAY`: pause after a failed acquisition attempt (default: 0s)
///
/// Durations use `humantime` syntax (`500ms`, `4s`, `1m 30s`). Invalid values
/// fall back to the default.
#[derive(Debug, Clone)]
pub struct CronConfig {
    pub distributed_task: bool,
    pub immediately_run: bool,
    pub with_seconds: bool,
    pub timezone: Tz,
    pub delay_exec_type: DelayExecType,
    pub lock_dir: String,
    pub lock_ttl: Duration,
    pub wait_lock_time: Duration,
    pub wait_unlock_time: Duration,
    pub refresh_gap: Duration,
    pub refresh_ttl: Duration,
    pub lock_retry_delay: Duration,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            distributed_task: false,
            immediately_run: false,
            with_seconds: false,
            timezone: Tz::UTC,
            delay_exec_type: DelayExecType::Skip,
            lock_dir: DEFAULT_LOCK_DIR.to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
            wait_lock_time: DEFAULT_WAIT_LOCK_TIME,
            wait_unlock_time: DEFAULT_WAIT_UNLOCK_TIME,
            refresh_gap: DEFAULT_REFRESH_GAP,
            refresh_ttl: DEFAULT_REFRESH_TTL,
            lock_retry_delay: Duration::ZERO,
        }
    }
}

impl CronConfig {
    pub fn from_env<E: ReadEnv>(env: &E) -> Self {
        let defaults = Self::default();
        Self {
            distributed_task: parse_or(env, "CRON_DISTRIBUTED_TASK", defaults.distributed_task),
            immediately_run: parse_or(env, "CRON_IMMEDIATELY_RUN", defaults.immediately_run),
            with_seconds: parse_or(env, "CRON_WITH_SECONDS", defaults.with_seconds),
            timezone: parse_or(env, "CRON_TIMEZONE", defaults.timezone),
            delay_exec_type: parse_or(env, "CRON_DELAY_EXEC_TYPE", defaults.delay_exec_type),
            lock_dir: env.var("CRON_LOCK_DIR").unwrap_or(defaults.lock_dir),
            lock_ttl: duration_or(env, "CRON_LOCK_TTL", defaults.lock_ttl),
            wait_lock_time: duration_or(env, "CRON_WAIT_LOCK_TIME", defaults.wait_lock_time),
            wait_unlock_time: duration_or(env, "CRON_WAIT_UNLOCK_TIME", defaults.wait_unlock_time),
            refresh_gap: duration_or(env, "CRON_REFRESH_GAP", defaults.refresh_gap),
            refresh_ttl: duration_or(env, "CRON_REFRESH_TTL", defaults.refresh_ttl),
            lock_retry_delay: duration_or(env, "CRON_LOCK_RETRY_DELAY", defaults.lock_retry_delay),
        }
    }

    pub fn with_distributed_task(mut self, enabled: bool) -> Self {
        self.distributed_task = enabled;
        self
    }

    pub fn with_immediately_run(mut self, enabled: bool) -> Self {
        self.immediately_run = enabled;
        self
    }

    pub fn with_seconds(mut self, enabled: bool) -> Self {
        self.with_seconds = enabled;
        self
    }

    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.timezone = tz;
        self
    }

    pub fn with_delay_exec_type(mut self, delay: DelayExecType) -> Self {
        self.delay_exec_type = delay;
        self
    }

    pub fn with_lock_dir(mut self, lock_dir: impl Into<String>) -> Self {
        self.lock_dir = lock_dir.into();
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_wait_lock_time(mut self, timeout: Duration) -> Self {
        self.wait_lock_time = timeout;
        self
    }

    pub fn with_wait_unlock_time(mut self, timeout: Duration) -> Self {
        self.wait_unlock_time = timeout;
        self
    }

    /// Interval and TTL used by the renewal task.
    pub fn with_refresh(mut self, gap: Duration, ttl: Duration) -> Self {
        self.refresh_gap = gap;
        self.refresh_ttl = ttl;
        self
    }

    pub fn with_lock_retry_delay(mut self, delay: Duration) -> Self {
        self.lock_retry_delay = delay;
        self
    }

    /// Lock resource path shared by every replica of the component `name`.
    pub fn lock_path(&self, name: &str) -> String {
        if self.lock_dir.contains(NAME_PLACEHOLDER) {
            self.lock_dir.replace(NAME_PLACEHOLDER, name)
        } else {
            format!("{}/{}", self.lock_dir.trim_end_matches('/'), name)
        }
    }

    pub fn parser(&self) -> Parser {
        Parser::new(self.with_seconds, self.timezone)
    }
}

/// Settings of the `trogon-dcron` binary, which publishes a tick to
/// `subject` on the cadence `spec`.
///
/// - `CRON_NAME`: component name, shared by every replica (default: `trogon-dcron`)
/// - `CRON_SPEC`: cadence expression (default: `@every 1m`)
/// - `CRON_SUBJECT`: subject ticks are published to (default: `cron.tick`)
/// - `NATS_URL`: NATS server (default: `nats://localhost:4222`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
    pub spec: String,
    pub subject: String,
    pub nats_url: String,
}

impl ServiceConfig {
    pub fn from_env<E: ReadEnv>(env: &E) -> Self {
        let read = |key: &str, default: &str| {
            env.var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            name: read("CRON_NAME", DEFAULT_NAME),
            spec: read("CRON_SPEC", DEFAULT_SPEC),
            subject: read("CRON_SUBJECT", DEFAULT_SUBJECT),
            nats_url: read("NATS_URL", DEFAULT_NATS_URL),
        }
    }
}

fn parse_or<E: ReadEnv, T: FromStr>(env: &E, key: &str, default: T) -> T {
    env.var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn duration_or<E: ReadEnv>(env: &E, key: &str, default: Duration) -> Duration {
    env.var(key)
        .ok()
        .and_then(|v| humantime::parse_duration(v.trim()).ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::InMemoryEnv;

    #[test]
    fn defaults_when_no_env_vars() {
        let config = CronConfig::from_env(&InMemoryEnv::new());

        assert!(!config.distributed_task);
        assert!(!config.immediately_run);
        assert!(!config.with_seconds);
        assert_eq!(config.timezone, Tz::UTC);
        assert_eq!(config.delay_exec_type, DelayExecType::Skip);
        assert_eq!(config.lock_dir, "/dcron/lock/{name}");
        assert_eq!(config.lock_ttl, Duration::from_secs(16));
        assert_eq!(config.wait_lock_time, Duration::from_secs(4));
        assert_eq!(config.wait_unlock_time, Duration::from_secs(1));
        assert_eq!(config.refresh_gap, Duration::from_secs(4));
        assert_eq!(config.refresh_ttl, Duration::from_secs(16));
        assert_eq!(config.lock_retry_delay, Duration::ZERO);
    }

    #[test]
    fn reads_all_env_vars() {
        let env = InMemoryEnv::new();
        env.set("CRON_DISTRIBUTED_TASK", "true");
        env.set("CRON_IMMEDIATELY_RUN", "true");
        env.set("CRON_WITH_SECONDS", "true");
        env.set("CRON_TIMEZONE", "Asia/Shanghai");
        env.set("CRON_DELAY_EXEC_TYPE", "queue");
        env.set("CRON_LOCK_DIR", "/jobs/{name}/leader");
        env.set("CRON_LOCK_TTL", "30s");
        env.set("CRON_WAIT_LOCK_TIME", "2s");
        env.set("CRON_WAIT_UNLOCK_TIME", "500ms");
        env.set("CRON_REFRESH_GAP", "10s");
        env.set("CRON_REFRESH_TTL", "1m");
        env.set("CRON_LOCK_RETRY_DELAY", "250ms");

        let config = CronConfig::from_env(&env);

        assert!(config.distributed_task);
        assert!(config.immediately_run);
        assert!(config.with_seconds);
        assert_eq!(config.timezone, chrono_tz::Asia::Shanghai);
        assert_eq!(config.delay_exec_type, DelayExecType::Queue);
        assert_eq!(config.lock_path("billing"), "/jobs/billing/leader");
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
        assert_eq!(config.wait_lock_time, Duration::from_secs(2));
        assert_eq!(config.wait_unlock_time, Duration::from_millis(500));
        assert_eq!(config.refresh_gap, Duration::from_secs(10));
        assert_eq!(config.refresh_ttl, Duration::from_secs(60));
        assert_eq!(config.lock_retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn parser_carries_seconds_mode_and_timezone() {
        let config = CronConfig::default()
            .with_seconds(true)
            .with_timezone(chrono_tz::Asia::Shanghai);
        let parser = config.parser();

        assert!(parser.with_seconds());
        assert_eq!(parser.timezone(), chrono_tz::Asia::Shanghai);
        assert!(parser.parse("0 0 9 * * *").is_ok());
        assert!(parser.parse("0 9 * * *").is_err());
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let env = InMemoryEnv::new();
        env.set("CRON_DISTRIBUTED_TASK", "maybe");
        env.set("CRON_TIMEZONE", "Nowhere/Land");
        env.set("CRON_DELAY_EXEC_TYPE", "parallel");
        env.set("CRON_LOCK_TTL", "forever");

        let config = CronConfig::from_env(&env);

        assert!(!config.distributed_task);
        assert_eq!(config.timezone, Tz::UTC);
        assert_eq!(config.delay_exec_type, DelayExecType::Skip);
        assert_eq!(config.lock_ttl, Duration::from_secs(16));
    }

    #[test]
    fn lock_path_is_the_same_for_every_replica() {
        let config = CronConfig::default();
        assert_eq!(config.lock_path("billing"), "/dcron/lock/billing");
        assert_eq!(config.lock_path("billing"), config.clone().lock_path("billing"));
    }

    #[test]
    fn lock_dir_without_placeholder_appends_the_name() {
        let config = CronConfig::default().with_lock_dir("/locks/");
        assert_eq!(config.lock_path("reports"), "/locks/reports");
    }

    #[test]
    fn service_config_defaults() {
        let service = ServiceConfig::from_env(&InMemoryEnv::new());
        assert_eq!(service.name, "trogon-dcron");
        assert_eq!(service.spec, "@every 1m");
        assert_eq!(service.subject, "cron.tick");
        assert_eq!(service.nats_url, "nats://localhost:4222");
    }

    #[test]
    fn service_config_ignores_blank_values() {
        let env = InMemoryEnv::new();
        env.set("CRON_NAME", "billing");
        env.set("CRON_SPEC", "  ");
        env.set("NATS_URL", "nats://nats:4222");

        let service = ServiceConfig::from_env(&env);
        assert_eq!(service.name, "billing");
        assert_eq!(service.spec, "@every 1m");
        assert_eq!(service.nats_url, "nats://nats:4222");
    }

    #[test]
    fn delay_exec_type_parses_case_insensitively() {
        assert_eq!("SKIP".parse::<DelayExecType>().unwrap(), DelayExecType::Skip);
        assert_eq!(" Concurrent ".parse::<DelayExecType>().unwrap(), DelayExecType::Concurrent);
        assert!("later".parse::<DelayExecType>().is_err());
    }
}
