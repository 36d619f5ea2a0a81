use crate::error::ConfigError;
use heph_core::push_wire::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Raw command-line values. Empty strings mean "not given".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub api_url: String,
    pub ws_url: String,
    pub poll_interval_ms: String,
    pub request_timeout_ms: String,
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardConfig {
    pub api_url: Url,
    pub ws_url: Url,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub max_frame_bytes: usize,
    pub debug: bool,
}

impl DashboardConfig {
    pub fn from_env(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        Self::resolve(overrides, |key| std::env::var(key).ok())
    }

    /// Flag, then `HEPH_*` variable, then built-in default.
    pub fn resolve<E>(overrides: &ConfigOverrides, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let lookup = |flag: &str, key: &str| -> Option<String> {
            if !flag.trim().is_empty() {
                return Some(flag.trim().to_string());
            }
            env(key).filter(|value| !value.trim().is_empty())
        };

        let raw_api = lookup(&overrides.api_url, "HEPH_API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let api_url = parse_url("api_url", &raw_api, &["http", "https"])?;
        let ws_url = match lookup(&overrides.ws_url, "HEPH_WS_URL") {
            Some(raw) => parse_url("ws_url", &raw, &["ws", "wss"])?,
            None => derive_ws_url(&api_url)?,
        };
        let poll_interval = parse_millis(
            "poll_interval_ms",
            lookup(&overrides.poll_interval_ms, "HEPH_POLL_INTERVAL_MS"),
            DEFAULT_POLL_INTERVAL_MS,
        )?;
        let request_timeout = parse_millis(
            "request_timeout_ms",
            lookup(&overrides.request_timeout_ms, "HEPH_REQUEST_TIMEOUT_MS"),
            DEFAULT_REQUEST_TIMEOUT_MS,
        )?;
        let debug = overrides.debug
            || env("HEPH_DEBUG")
                .and_then(|value| parse_bool_flag(&value))
                .unwrap_or(false);

        Ok(Self {
            api_url,
            ws_url,
            poll_interval,
            request_timeout,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            debug,
        })
    }
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `http://host/base` becomes `ws://host/base/ws`; `https` maps to `wss`.
pub fn derive_ws_url(api_url: &Url) -> Result<Url, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidUrl {
        field: "ws_url",
        value: api_url.to_string(),
        reason: reason.to_string(),
    };
    let scheme = match api_url.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return Err(invalid("api url must be http or https")),
    };
    let mut ws_url = api_url.clone();
    ws_url
        .set_scheme(scheme)
        .map_err(|_| invalid("scheme cannot be changed"))?;
    ws_url.set_query(None);
    ws_url.set_fragment(None);
    ws_url
        .path_segments_mut()
        .map_err(|_| invalid("url cannot carry a path"))?
        .pop_if_empty()
        .push("ws");
    Ok(ws_url)
}

fn parse_url(field: &'static str, raw: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
        field,
        value: raw.to_string(),
        reason: err.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrl {
            field,
            value: raw.to_string(),
            reason: format!("scheme must be one of {}", schemes.join(", ")),
        });
    }
    Ok(url)
}

fn parse_millis(
    field: &'static str,
    raw: Option<String>,
    default: u64,
) -> Result<Duration, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Duration::from_millis(default));
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(Duration::from_millis(value)),
        _ => Err(ConfigError::InvalidInterval { field, value: raw }),
    }
}
