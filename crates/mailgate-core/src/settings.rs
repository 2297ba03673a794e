//! Persistent key-value settings.
//!
//! Settings are a flat string map persisted as a JSON document. A missing or
//! unreadable file is not an error: the store starts from built-in defaults
//! and logs a warning. Typed accessors parse on read; a value that does not
//! parse is logged and read as zero.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, error, warn};

/// Number of workers resolving items of one fetch request.
pub const IMAP_WORKERS: &str = "imap_workers";

/// Number of workers in the shared message builder pool.
pub const BUILD_WORKERS: &str = "build_workers";

/// Delay before answering a failed backend login, in milliseconds.
pub const BAD_LOGIN_DELAY_MS: &str = "bad_login_delay_ms";

/// Directory for local stores and caches.
pub const CACHE_DIR: &str = "cache_dir";

/// File name of the settings document.
const SETTINGS_FILE: &str = "prefs.json";

/// Application directory name.
const APP_DIR: &str = "mailgate";

/// Process-wide settings store.
///
/// Instantiate once and pass it to collaborators.
#[derive(Debug)]
pub struct Settings {
    path: Option<PathBuf>,
    cache: RwLock<BTreeMap<String, String>>,
}

impl Settings {
    /// Loads settings from `path` and fills in defaults.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cache = match load(&path) {
            Ok(cache) => cache,
            Err(e) => {
                warn!(path = %path.display(), "Cannot load preferences file, using defaults: {e}");
                BTreeMap::new()
            }
        };

        let settings = Self {
            path: Some(path),
            cache: RwLock::new(cache),
        };
        settings.set_defaults();
        settings
    }

    /// Creates settings that are never persisted.
    #[must_use]
    pub fn in_memory() -> Self {
        let settings = Self {
            path: None,
            cache: RwLock::new(BTreeMap::new()),
        };
        settings.set_defaults();
        settings
    }

    /// Default location of the settings document.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join(SETTINGS_FILE)
    }

    fn set_defaults(&self) {
        self.set_default(IMAP_WORKERS, "16");
        self.set_default(BUILD_WORKERS, "16");
        self.set_default(BAD_LOGIN_DELAY_MS, "10000");

        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR);
        self.set_default(CACHE_DIR, &cache_dir.to_string_lossy());
    }

    /// Returns the raw value, or an empty string if unset.
    #[must_use]
    pub fn get(&self, key: &str) -> String {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns `true` only for the literal value `"true"`.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key) == "true"
    }

    /// Returns the value as an integer.
    #[must_use]
    pub fn get_int(&self, key: &str) -> i64 {
        let value = self.get(key);
        if value.is_empty() {
            return 0;
        }
        value.parse().unwrap_or_else(|e| {
            error!(key, value = %value, "Cannot parse int: {e}");
            0
        })
    }

    /// Returns the value as a float.
    #[must_use]
    pub fn get_float(&self, key: &str) -> f64 {
        let value = self.get(key);
        if value.is_empty() {
            return 0.0;
        }
        value.parse().unwrap_or_else(|e| {
            error!(key, value = %value, "Cannot parse float64: {e}");
            0.0
        })
    }

    /// Sets a value and persists the document.
    pub fn set(&self, key: &str, value: &str) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());

        if let Err(e) = self.save() {
            warn!(key, "Cannot save preferences: {e}");
        }
    }

    /// Sets a value only if the key is unset or empty. Defaults are kept in
    /// memory and reach the file with the next [`Settings::set`].
    pub fn set_default(&self, key: &str, value: &str) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.entry(key.to_string()).or_default();
        if entry.is_empty() {
            value.clone_into(entry);
        }
    }

    /// Writes the document to disk. A no-op for in-memory settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self) -> crate::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let contents = {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_string_pretty(&*cache)?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        debug!(path = %path.display(), "Preferences saved");
        Ok(())
    }
}

fn load(path: &Path) -> crate::Result<BTreeMap<String, String>> {
    let data = std::fs::read_to_string(path)?;
    if data.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_str(&data)?)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::float_cmp,
    clippy::redundant_clone,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("mailgate-settings-{}-{name}", std::process::id()))
            .join(SETTINGS_FILE)
    }

    #[test]
    fn test_in_memory_defaults() {
        let settings = Settings::in_memory();
        assert_eq!(settings.get_int(IMAP_WORKERS), 16);
        assert_eq!(settings.get_int(BUILD_WORKERS), 16);
        assert_eq!(settings.get_int(BAD_LOGIN_DELAY_MS), 10_000);
        assert!(!settings.get(CACHE_DIR).is_empty());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = temp_path("missing");
        let settings = Settings::new(&path);
        assert_eq!(settings.get_int(IMAP_WORKERS), 16);
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let path = temp_path("corrupt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let settings = Settings::new(&path);
        assert_eq!(settings.get_int(BUILD_WORKERS), 16);

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_corrupt_file_is_left_untouched() {
        let path = temp_path("truncated");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let truncated = r#"{"imap_workers": "4", "custom": "keep-me","#;
        std::fs::write(&path, truncated).unwrap();

        let settings = Settings::new(&path);
        assert_eq!(settings.get_int(IMAP_WORKERS), 16);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), truncated);

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_typed_accessors() {
        let settings = Settings::in_memory();
        settings.set("flag", "true");
        settings.set("other", "yes");
        settings.set("ratio", "0.5");
        settings.set("broken", "abc");

        assert!(settings.get_bool("flag"));
        assert!(!settings.get_bool("other"));
        assert_eq!(settings.get_float("ratio"), 0.5);
        assert_eq!(settings.get_int("broken"), 0);
        assert_eq!(settings.get_int("unset"), 0);
        assert_eq!(settings.get_float("unset"), 0.0);
    }

    #[test]
    fn test_set_default_keeps_existing() {
        let settings = Settings::in_memory();
        settings.set(IMAP_WORKERS, "4");
        settings.set_default(IMAP_WORKERS, "8");
        settings.set_default("new_key", "x");

        assert_eq!(settings.get(IMAP_WORKERS), "4");
        assert_eq!(settings.get("new_key"), "x");
    }

    #[test]
    fn test_values_survive_reload() {
        let path = temp_path("reload");
        {
            let settings = Settings::new(&path);
            settings.set(IMAP_WORKERS, "3");
        }

        let reloaded = Settings::new(&path);
        assert_eq!(reloaded.get_int(IMAP_WORKERS), 3);
        assert_eq!(reloaded.get_int(BUILD_WORKERS), 16);

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
