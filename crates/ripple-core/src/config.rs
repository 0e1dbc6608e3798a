#![forbid(unsafe_code)]

//! Engine configuration.
//!
//! Defaults can be overlaid from the environment:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `RIPPLE_RUNAWAY_LIMIT` | [`EngineConfig::runaway_limit`] |
//! | `RIPPLE_DEFER_CALLBACKS` | [`EngineConfig::defer_callbacks`] (`1`, `true`, `yes`, `on`) |
//! | `RIPPLE_MAX_DEFERRED_PER_FLUSH` | [`EngineConfig::max_deferred_per_flush`] |
//!
//! Malformed values are ignored.
//!
//! With the `serde` feature the config also (de)serializes; missing fields
//! take their defaults.

/// Default maximum exit version before a transferring scope is aborted.
pub const DEFAULT_RUNAWAY_LIMIT: u32 = 250;

/// Configuration for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct EngineConfig {
    /// Maximum exit version a scope transfer may reach.
    pub runaway_limit: u32,
    /// Route every barrier callback through the scheduler.
    pub defer_callbacks: bool,
    /// Cap on tasks run per scheduler flush (`None` = unlimited).
    pub max_deferred_per_flush: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runaway_limit: DEFAULT_RUNAWAY_LIMIT,
            defer_callbacks: false,
            max_deferred_per_flush: None,
        }
    }
}

impl EngineConfig {
    /// Set the runaway limit.
    #[must_use]
    pub fn with_runaway_limit(mut self, limit: u32) -> Self {
        self.runaway_limit = limit;
        self
    }

    /// Enable or disable process-wide deferred callbacks.
    #[must_use]
    pub fn with_defer_callbacks(mut self, defer: bool) -> Self {
        self.defer_callbacks = defer;
        self
    }

    /// Cap the number of deferred tasks per flush.
    #[must_use]
    pub fn with_max_deferred_per_flush(mut self, max: Option<usize>) -> Self {
        self.max_deferred_per_flush = max;
        self
    }

    /// Defaults overlaid with `RIPPLE_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an injectable lookup.
    #[must_use]
    pub fn from_env_with<F>(get_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(limit) = get_env("RIPPLE_RUNAWAY_LIMIT").and_then(|v| v.trim().parse().ok()) {
            config.runaway_limit = limit;
        }
        if let Some(flag) = get_env("RIPPLE_DEFER_CALLBACKS").and_then(|v| parse_flag(&v)) {
            config.defer_callbacks = flag;
        }
        if let Some(max) =
            get_env("RIPPLE_MAX_DEFERRED_PER_FLUSH").and_then(|v| v.trim().parse::<usize>().ok())
        {
            config.max_deferred_per_flush = (max > 0).then_some(max);
        }
        config
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
