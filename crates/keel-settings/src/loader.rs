//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`KeelSettings::default()`]
//! 2. If `~/.keel/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `KEEL_*` environment variable overrides (highest priority)
//! 4. Validate the result

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::KeelSettings;

/// `~/.keel`, or `/tmp/.keel` when `HOME` is unset.
pub fn keel_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".keel")
}

pub fn settings_path() -> PathBuf {
    keel_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<KeelSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with process env overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<KeelSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

/// Same as [`load_settings_from_path`] with an injectable env lookup.
pub fn load_with_env<F>(path: &Path, env: F) -> Result<KeelSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(KeelSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: KeelSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, and nulls in
/// `source` leave `target` untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `KEEL_*` overrides. Values that fail to parse or fall outside
/// their range are logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut KeelSettings, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let reader = EnvReader { env };

    if let Some(v) = reader.string("KEEL_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = reader.u64_in("KEEL_PORT", 1, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = reader.u64_in("KEEL_MAX_SEND_QUEUE", 1, 65_536) {
        settings.server.max_send_queue = v as usize;
    }
    if let Some(v) = reader.string("KEEL_AUTH_TOKEN") {
        settings.server.auth_token = Some(v);
    }
    if let Some(v) = reader.u64_in("KEEL_ADVISORY_INTERVAL_SECS", 0, 86_400) {
        settings.server.advisory_interval_secs = v;
    }

    if let Some(v) = reader.u64_in("KEEL_DEFAULT_BUDGET", 1_000, 10_000_000) {
        settings.session.default_budget = v;
    }
    if let Some(v) = reader.u64_in("KEEL_AGENT_TIMEOUT_MS", 10, 600_000) {
        settings.advisory.agent_timeout_ms = v;
    }

    if let Some(v) = reader.string("KEEL_TEST_COMMAND") {
        settings.reality.test_command = Some(v);
    }
    if let Some(v) = reader.string("KEEL_WORKSPACE") {
        settings.reality.workspace_root = Some(v);
    }

    if let Some(v) = reader.string("KEEL_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = reader.bool("KEEL_PERSIST_WARNINGS") {
        settings.logging.persist_warnings = v;
    }
    if let Some(v) = reader.string("KEEL_DB_PATH") {
        settings.database.path = Some(v);
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    env: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.env)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.env)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.env)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, min, max, "invalid numeric env var, ignoring");
        }
        result
    }
}
