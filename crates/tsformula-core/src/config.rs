//! Engine configuration: guard defaults overridden by `TSFORMULA_*`
//! environment variables.

use std::time::Duration;

use crate::query::guards::{
    clamp_cache_entries, clamp_depth, clamp_int, DEFAULT_CACHE_ENTRIES, DEFAULT_CACHE_TTL_SECONDS,
    MAX_EVAL_DEPTH, MAX_TIMEOUT_MS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_depth: usize,
    /// Evaluate independent argument sub-trees on the rayon pool.
    pub parallel_fanout: bool,
    /// Per-query deadline; `None` means no deadline.
    pub timeout: Option<Duration>,
    pub cache_entries: usize,
    pub cache_ttl_seconds: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: MAX_EVAL_DEPTH,
            parallel_fanout: true,
            timeout: None,
            cache_entries: DEFAULT_CACHE_ENTRIES,
            cache_ttl_seconds: DEFAULT_CACHE_TTL_SECONDS,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(val) => {
            let v = val.trim().to_lowercase();
            if default {
                !matches!(v.as_str(), "0" | "false" | "no" | "off")
            } else {
                matches!(v.as_str(), "1" | "true" | "yes" | "on")
            }
        }
        Err(_) => default,
    }
}

fn env_int(name: &str) -> Option<i64> {
    std::env::var(name).ok()?.trim().parse::<i64>().ok()
}

impl EngineConfig {
    /// Defaults, with `TSFORMULA_MAX_DEPTH`, `TSFORMULA_PARALLEL`,
    /// `TSFORMULA_TIMEOUT_MS` and `TSFORMULA_CACHE_ENTRIES` applied.
    /// Out-of-range numbers are clamped; unparseable ones are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(depth) = env_int("TSFORMULA_MAX_DEPTH") {
            config.max_depth = clamp_depth(depth);
        }
        config.parallel_fanout = env_flag("TSFORMULA_PARALLEL", config.parallel_fanout);
        if let Some(ms) = env_int("TSFORMULA_TIMEOUT_MS") {
            config.timeout = (ms > 0)
                .then(|| Duration::from_millis(clamp_int(ms, 1, MAX_TIMEOUT_MS as i64) as u64));
        }
        if let Some(entries) = env_int("TSFORMULA_CACHE_ENTRIES") {
            config.cache_entries = clamp_cache_entries(entries);
        }
        config
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = clamp_depth(i64::try_from(max_depth).unwrap_or(i64::MAX));
        self
    }

    pub fn with_parallel_fanout(mut self, parallel: bool) -> Self {
        self.parallel_fanout = parallel;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cache_entries(mut self, entries: usize) -> Self {
        self.cache_entries = clamp_cache_entries(i64::try_from(entries).unwrap_or(i64::MAX));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test touches the environment so parallel tests never race on it.
    #[test]
    fn environment_overrides_defaults() {
        std::env::set_var("TSFORMULA_MAX_DEPTH", "2");
        std::env::set_var("TSFORMULA_PARALLEL", "off");
        std::env::set_var("TSFORMULA_TIMEOUT_MS", "250");
        std::env::set_var("TSFORMULA_CACHE_ENTRIES", "junk");
        let config = EngineConfig::from_env();
        assert_eq!(config.max_depth, crate::query::guards::MIN_EVAL_DEPTH);
        assert!(!config.parallel_fanout);
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.cache_entries, DEFAULT_CACHE_ENTRIES);

        std::env::set_var("TSFORMULA_TIMEOUT_MS", "0");
        std::env::set_var("TSFORMULA_PARALLEL", "yes");
        let config = EngineConfig::from_env();
        assert_eq!(config.timeout, None);
        assert!(config.parallel_fanout);

        for name in [
            "TSFORMULA_MAX_DEPTH",
            "TSFORMULA_PARALLEL",
            "TSFORMULA_TIMEOUT_MS",
            "TSFORMULA_CACHE_ENTRIES",
        ] {
            std::env::remove_var(name);
        }
        assert_eq!(EngineConfig::from_env(), EngineConfig::default());
    }

    #[test]
    fn builders_clamp() {
        let config = EngineConfig::default().with_max_depth(0).with_cache_entries(0);
        assert_eq!(config.max_depth, crate::query::guards::MIN_EVAL_DEPTH);
        assert_eq!(config.cache_entries, 1);
    }
}
