//! Chat core configuration loaded from environment variables.
//!
//! All settings have defaults, so embedding apps and tests can start from
//! [`ChatConfig::default`] and override only what they need.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

/// Chat core configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Messages fetched by the initial load of a live subscription.
    /// Env: `GROOP_PAGE_SIZE`
    /// Default: `50`
    pub page_size: usize,

    /// Messages fetched per "load older" request.
    /// Env: `GROOP_HISTORY_PAGE_SIZE`
    /// Default: `50`
    pub history_page_size: usize,

    /// How long a confirmed optimistic message lingers before removal.
    /// Env: `GROOP_OPTIMISTIC_GRACE_MS`
    /// Default: `1500`
    pub optimistic_grace: Duration,

    /// Location of the device-local key database. `None` selects the
    /// platform data directory.
    /// Env: `GROOP_KEY_DB_PATH`
    pub key_db_path: Option<PathBuf>,

    /// Maximum characters of plaintext copied into a notification preview.
    /// Env: `GROOP_PREVIEW_LEN`
    /// Default: `100`
    pub notification_preview_len: usize,

    /// Offset used to decide where one calendar day ends for date separators.
    /// Env: `GROOP_UTC_OFFSET_MINUTES`
    /// Default: `0` (UTC)
    pub utc_offset: FixedOffset,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            history_page_size: 50,
            optimistic_grace: Duration::from_millis(1500),
            key_db_path: None,
            notification_preview_len: 100,
            utc_offset: Utc.fix(),
        }
    }
}

impl ChatConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = parse_positive("GROOP_PAGE_SIZE") {
            config.page_size = n;
        }

        if let Some(n) = parse_positive("GROOP_HISTORY_PAGE_SIZE") {
            config.history_page_size = n;
        }

        if let Ok(val) = std::env::var("GROOP_OPTIMISTIC_GRACE_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.optimistic_grace = Duration::from_millis(ms),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid GROOP_OPTIMISTIC_GRACE_MS, using default")
                }
            }
        }

        if let Ok(path) = std::env::var("GROOP_KEY_DB_PATH") {
            if !path.is_empty() {
                config.key_db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(n) = parse_positive("GROOP_PREVIEW_LEN") {
            config.notification_preview_len = n;
        }

        if let Ok(val) = std::env::var("GROOP_UTC_OFFSET_MINUTES") {
            match val.parse::<i32>().ok().and_then(offset_from_minutes) {
                Some(offset) => config.utc_offset = offset,
                None => {
                    tracing::warn!(value = %val, "Invalid GROOP_UTC_OFFSET_MINUTES, using UTC")
                }
            }
        }

        config
    }
}

fn parse_positive(var: &str) -> Option<usize> {
    let val = std::env::var(var).ok()?;
    match val.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            tracing::warn!(var, value = %val, "Invalid value, using default");
            None
        }
    }
}

fn offset_from_minutes(minutes: i32) -> Option<FixedOffset> {
    FixedOffset::east_opt(minutes.checked_mul(60)?)
}
