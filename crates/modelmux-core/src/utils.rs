//! Utility helpers: path resolution, env expansion, duration serde adapters.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

/// Get the Modelmux data directory (e.g. `~/.modelmux/`).
pub fn get_data_path() -> PathBuf {
    let home = home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".modelmux")
}

/// Get the conversation history directory (e.g. `~/.modelmux/history/`).
pub fn get_history_path() -> PathBuf {
    get_data_path().join("history")
}

/// Get current ISO 8601 timestamp.
pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Encode a string for use as a filename.
///
/// ASCII letters, digits, `-`, `_` and `.` are kept; every other byte becomes
/// `%XX`. Distinct inputs always map to distinct names.
pub fn safe_filename(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Expand `~` to the home directory in a path string.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        home_dir().unwrap_or_else(|| PathBuf::from(".")).join(rest)
    } else if path == "~" {
        home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else {
        PathBuf::from(path)
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("USERPROFILE").ok().map(PathBuf::from))
}

static ENV_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("static regex"));

/// Expand `${VAR}` and `${VAR:-default}` references from the environment.
///
/// An unset variable without a default expands to the empty string.
pub fn expand_env_vars(value: &str) -> String {
    ENV_REF
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(v) => v,
                Err(_) => match caps.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => {
                        warn!(variable = name, "environment variable not set and no default given");
                        String::new()
                    }
                },
            }
        })
        .into_owned()
}

/// Recursively apply [`expand_env_vars`] to every string in a JSON value.
pub fn expand_env_in_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) if s.contains("${") => {
            *s = expand_env_vars(s);
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(expand_env_in_json),
        serde_json::Value::Object(map) => map.values_mut().for_each(expand_env_in_json),
        _ => {}
    }
}

/// Serialize a `Duration` as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serialize a `Duration` as (possibly fractional) seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
