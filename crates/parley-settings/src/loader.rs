//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If a settings file is found, deep-merge its values over the defaults
//! 3. Apply `PARLEY_*` environment variable overrides
//!
//! Objects merge recursively, arrays and primitives are replaced, and
//! `null` in the file keeps the default.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{DatabaseType, Settings};

/// Env var naming an explicit settings file.
pub const CONFIG_PATH_ENV: &str = "PARLEY_CONFIG_PATH";

/// Locate the settings file.
///
/// Checked in order: `$PARLEY_CONFIG_PATH`, `./parley.json`,
/// `~/.parley/settings.json`. Returns `None` when none exists.
pub fn find_settings_file() -> Option<PathBuf> {
    let explicit = std::env::var(CONFIG_PATH_ENV).ok().filter(|v| !v.is_empty()).map(PathBuf::from);
    let cwd = std::env::current_dir().ok().map(|d| d.join("parley.json"));
    let home = std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".parley").join("settings.json"));

    [explicit, cwd, home].into_iter().flatten().find(|p| p.is_file())
}

/// Load settings from the discovered file (if any) with env overrides.
pub fn load_settings() -> Result<Settings> {
    match find_settings_file() {
        Some(path) => load_settings_from_path(&path),
        None => {
            debug!("no settings file found, using defaults");
            let mut settings = Settings::default();
            apply_env_overrides(&mut settings);
            Ok(settings)
        }
    }
}

/// Load settings from a specific path with env overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values. `source` wins per key.
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

/// Apply `PARLEY_*` overrides from the process environment.
///
/// Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Empty values count as unset.
pub fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Database ────────────────────────────────────────────────────
    if let Some(v) = env.string("PARLEY_DATABASE_TYPE") {
        match v.to_lowercase().as_str() {
            "sqlite" => settings.database.database_type = DatabaseType::Sqlite,
            "remote" => settings.database.database_type = DatabaseType::Remote,
            _ => warn!(key = "PARLEY_DATABASE_TYPE", value = %v, "unknown database type, ignoring"),
        }
    }
    if let Some(v) = env.string("PARLEY_SQLITE_PATH") {
        settings.database.sqlite_path = v;
    }
    if let Some(v) = env.string("PARLEY_REMOTE_URL") {
        settings.database.remote_url = Some(v);
    }
    if let Some(v) = env.string("PARLEY_REMOTE_KEY") {
        settings.database.remote_key = Some(v);
    }

    // ── Model ───────────────────────────────────────────────────────
    if let Some(v) = env.string("PARLEY_MODEL_ENDPOINT") {
        settings.model.model_endpoint = v;
    }
    if let Some(v) = env.string("PARLEY_MODEL_KEY") {
        settings.model.model_key = v;
    }
    if let Some(v) = env.string("PARLEY_MODEL") {
        settings.model.model = v;
    }
    if let Some(v) = env.u64("PARLEY_MODEL_TIMEOUT_SECS", 1, 3_600) {
        settings.model.request_timeout_secs = v;
    }

    // ── Context ─────────────────────────────────────────────────────
    if let Some(v) = env.u32("PARLEY_MAX_CONTEXT_TOKENS", 1, 10_000_000) {
        settings.context.max_context_tokens = v;
    }
    if let Some(v) = env.u32("PARLEY_RESERVE_TOKENS", 0, 10_000_000) {
        settings.context.reserve_tokens = v;
    }

    // ── Bot ─────────────────────────────────────────────────────────
    if let Some(v) = env.string("PARLEY_ROBOT_CODE") {
        settings.bot.robot_code = v;
    }
    if let Some(v) = env.string("PARLEY_CLIENT_ID") {
        settings.bot.client_id = v;
    }
    if let Some(v) = env.string("PARLEY_CLIENT_SECRET") {
        settings.bot.client_secret = v;
    }
    if let Some(v) = env.string("PARLEY_REPLY_WEBHOOK_URL") {
        settings.bot.reply_webhook_url = Some(v);
    }

    // ── Server / logging ────────────────────────────────────────────
    if let Some(v) = env.string("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("PARLEY_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("PARLEY_LOG_JSON") {
        settings.logging.json = v;
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

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u32(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        self.parsed(name, "u32", |v| parse_u32_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }
}
