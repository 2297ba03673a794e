//! Backend configuration.

use std::time::Duration;

use mailgate_core::settings::{self, Settings};

/// Default number of fetch workers per request.
pub const DEFAULT_LIST_WORKERS: usize = 16;

/// Default number of message builder workers.
pub const DEFAULT_BUILD_WORKERS: usize = 16;

/// Default delay before answering a failed login.
pub const DEFAULT_BAD_LOGIN_DELAY: Duration = Duration::from_secs(10);

/// IMAP backend configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendConfig {
    /// Workers resolving the items of one fetch request.
    pub list_workers: usize,
    /// Workers of the shared message builder.
    pub build_workers: usize,
    /// Delay applied before a failed login returns.
    pub bad_login_delay: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            list_workers: DEFAULT_LIST_WORKERS,
            build_workers: DEFAULT_BUILD_WORKERS,
            bad_login_delay: DEFAULT_BAD_LOGIN_DELAY,
        }
    }
}

impl BackendConfig {
    /// Reads the configuration from settings.
    ///
    /// Worker counts below one are raised to one; a negative delay is zero.
    #[must_use]
    pub fn from_settings(prefs: &Settings) -> Self {
        Self {
            list_workers: worker_count(prefs.get_int(settings::IMAP_WORKERS)),
            build_workers: worker_count(prefs.get_int(settings::BUILD_WORKERS)),
            bad_login_delay: Duration::from_millis(
                u64::try_from(prefs.get_int(settings::BAD_LOGIN_DELAY_MS)).unwrap_or(0),
            ),
        }
    }

    /// Sets the fetch worker count (at least one).
    #[must_use]
    pub const fn list_workers(mut self, workers: usize) -> Self {
        self.list_workers = if workers == 0 { 1 } else { workers };
        self
    }

    /// Sets the builder worker count (at least one).
    #[must_use]
    pub const fn build_workers(mut self, workers: usize) -> Self {
        self.build_workers = if workers == 0 { 1 } else { workers };
        self
    }

    /// Sets the failed-login delay.
    #[must_use]
    pub const fn bad_login_delay(mut self, delay: Duration) -> Self {
        self.bad_login_delay = delay;
        self
    }
}

fn worker_count(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_default_settings() {
        let config = BackendConfig::from_settings(&Settings::in_memory());
        assert_eq!(config, BackendConfig::default());
    }

    #[test]
    fn test_invalid_worker_counts_fall_back_to_one() {
        let prefs = Settings::in_memory();
        prefs.set(settings::IMAP_WORKERS, "0");
        prefs.set(settings::BUILD_WORKERS, "-4");
        prefs.set(settings::BAD_LOGIN_DELAY_MS, "-1");

        let config = BackendConfig::from_settings(&prefs);
        assert_eq!(config.list_workers, 1);
        assert_eq!(config.build_workers, 1);
        assert_eq!(config.bad_login_delay, Duration::ZERO);
    }

    #[test]
    fn test_builder_setters() {
        let config = BackendConfig::default()
            .list_workers(0)
            .build_workers(3)
            .bad_login_delay(Duration::from_millis(5));
        assert_eq!(config.list_workers, 1);
        assert_eq!(config.build_workers, 3);
        assert_eq!(config.bad_login_delay, Duration::from_millis(5));
    }
}
