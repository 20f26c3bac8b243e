use crate::poller::PollPolicy;
use std::time::Duration;

/// Port used when the server address does not name one.
pub const DEFAULT_PORT: u16 = 8000;

/// Tunables for a [`Session`](crate::Session).
///
/// `None` timeouts block indefinitely. Every field can be overridden from the
/// environment with [`SessionConfig::from_env`]:
///
/// | Variable                 | Field             | Notes                    |
/// |--------------------------|-------------------|--------------------------|
/// | `OWL_CONNECT_TIMEOUT_MS` | `connect_timeout` | `0` disables the timeout |
/// | `OWL_STATUS_TIMEOUT_MS`  | `status_timeout`  | `0` disables the timeout |
/// | `OWL_QUERY_TIMEOUT_MS`   | `query_timeout`   | `0` disables the timeout |
/// | `OWL_DEFAULT_PORT`       | `default_port`    |                          |
/// | `OWL_TCP_NODELAY`        | `tcp_nodelay`     | `1/0`, `true/false`, ... |
/// | `OWL_POLL_POLICY`        | `poll_policy`     | `spin`, `yield`, `sleep` |
/// | `OWL_POLL_SLEEP_US`      | sleep interval    | used by `sleep`          |
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub connect_timeout: Option<Duration>,
    pub status_timeout: Option<Duration>,
    pub query_timeout: Option<Duration>,
    pub default_port: u16,
    pub tcp_nodelay: bool,
    /// What the frame poller does between stale polls.
    pub poll_policy: PollPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(5)),
            status_timeout: Some(Duration::from_secs(10)),
            query_timeout: Some(Duration::from_secs(5)),
            default_port: DEFAULT_PORT,
            tcp_nodelay: true,
            poll_policy: PollPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults with `OWL_*` environment overrides applied.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let poll_sleep = Duration::from_micros(read_env_u64("OWL_POLL_SLEEP_US", 500));
        let poll_policy = match read_env_string("OWL_POLL_POLICY", "").as_str() {
            "" => defaults.poll_policy,
            "spin" => PollPolicy::Spin,
            "yield" => PollPolicy::Yield,
            "sleep" => PollPolicy::Sleep(poll_sleep),
            other => {
                log::warn!(
                    "Unknown OWL_POLL_POLICY='{}', using {:?} (supported: spin|yield|sleep)",
                    other,
                    defaults.poll_policy
                );
                defaults.poll_policy
            }
        };

        Self {
            connect_timeout: read_env_timeout("OWL_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            status_timeout: read_env_timeout("OWL_STATUS_TIMEOUT_MS", defaults.status_timeout),
            query_timeout: read_env_timeout("OWL_QUERY_TIMEOUT_MS", defaults.query_timeout),
            default_port: read_env_u64("OWL_DEFAULT_PORT", defaults.default_port as u64)
                .try_into()
                .unwrap_or(defaults.default_port),
            tcp_nodelay: read_env_bool("OWL_TCP_NODELAY", defaults.tcp_nodelay),
            poll_policy,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_status_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.status_timeout = timeout;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll_policy = policy;
        self
    }
}

fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| {
            let v = v.trim().to_ascii_lowercase();
            match v.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        })
        .unwrap_or(default)
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Milliseconds from the environment; `0` means no timeout.
fn read_env_timeout(name: &str, default: Option<Duration>) -> Option<Duration> {
    match std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable names so they can run in parallel.

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.default_port, 8000);
        assert_eq!(config.status_timeout, Some(Duration::from_secs(10)));
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn test_read_env_timeout() {
        std::env::set_var("OWL_TEST_TIMEOUT_A", "250");
        std::env::set_var("OWL_TEST_TIMEOUT_B", "0");
        std::env::set_var("OWL_TEST_TIMEOUT_C", "soon");
        let fallback = Some(Duration::from_secs(1));
        assert_eq!(
            read_env_timeout("OWL_TEST_TIMEOUT_A", fallback),
            Some(Duration::from_millis(250))
        );
        assert_eq!(read_env_timeout("OWL_TEST_TIMEOUT_B", fallback), None);
        assert_eq!(read_env_timeout("OWL_TEST_TIMEOUT_C", fallback), fallback);
        assert_eq!(read_env_timeout("OWL_TEST_TIMEOUT_UNSET", fallback), fallback);
    }

    #[test]
    fn test_read_env_bool() {
        std::env::set_var("OWL_TEST_BOOL_A", " Off ");
        std::env::set_var("OWL_TEST_BOOL_B", "maybe");
        assert!(!read_env_bool("OWL_TEST_BOOL_A", true));
        assert!(read_env_bool("OWL_TEST_BOOL_B", true));
    }

    #[test]
    fn test_builders() {
        let config = SessionConfig::default()
            .with_query_timeout(None)
            .with_poll_policy(PollPolicy::Spin);
        assert_eq!(config.query_timeout, None);
        assert_eq!(config.poll_policy, PollPolicy::Spin);
    }
}
