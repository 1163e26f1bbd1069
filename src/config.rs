use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

pub(crate) fn config_overrides_path() -> Option<PathBuf> {
    env_optional_string("SENSOR_CLIENT_CONFIG_PATH").map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigOverrides {
    #[serde(default)]
    data_url: Option<String>,
    #[serde(default)]
    on_prem_url: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    retry_max_attempts: Option<u32>,
    #[serde(default)]
    retry_base_delay_ms: Option<u64>,
    #[serde(default)]
    retry_max_delay_ms: Option<u64>,
    #[serde(default)]
    page_limit: Option<usize>,
    #[serde(default)]
    max_pages: Option<usize>,
    #[serde(default)]
    load_entity_page_size: Option<usize>,
    #[serde(default)]
    request_timeout_seconds: Option<u64>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_client_id: Option<String>,
}

fn load_config_overrides(path: &Path) -> Option<ConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read client config; using env values"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse client config; using env values"
            );
            None
        }
    }
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn apply_overrides(config: &mut ClientConfig, overrides: &ConfigOverrides) {
    if let Some(url) = trimmed(overrides.data_url.as_deref()) {
        config.data_url = url;
    }
    if let Some(url) = overrides.on_prem_url.as_deref() {
        config.on_prem_url = trimmed(Some(url));
    }
    if let Some(user) = overrides.user_id.as_deref() {
        config.user_id = trimmed(Some(user));
    }
    if let Some(attempts) = overrides.retry_max_attempts.filter(|v| *v != 0) {
        config.retry_max_attempts = attempts.min(10);
    }
    if let Some(delay) = overrides.retry_base_delay_ms.filter(|v| *v != 0) {
        config.retry_base_delay_ms = delay.min(60_000);
    }
    if let Some(delay) = overrides.retry_max_delay_ms.filter(|v| *v != 0) {
        config.retry_max_delay_ms = delay.clamp(100, 10 * 60_000);
    }
    if let Some(limit) = overrides.page_limit.filter(|v| *v != 0) {
        config.page_limit = limit.min(10_000);
    }
    if let Some(pages) = overrides.max_pages.filter(|v| *v != 0) {
        config.max_pages = pages;
    }
    if let Some(size) = overrides.load_entity_page_size.filter(|v| *v != 0) {
        config.load_entity_page_size = size.min(1_000);
    }
    if let Some(timeout) = overrides.request_timeout_seconds.filter(|v| *v != 0) {
        config.request_timeout_seconds = timeout;
    }
    if let Some(tz) = overrides.timezone.as_deref() {
        config.timezone = trimmed(Some(tz));
    }
    if let Some(host) = trimmed(overrides.mqtt_host.as_deref()) {
        config.mqtt_host = host;
    }
    if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
        config.mqtt_port = port;
    }
    if let Some(username) = overrides.mqtt_username.as_deref() {
        config.mqtt_username = trimmed(Some(username));
    }
    if let Some(password) = overrides.mqtt_password.as_deref() {
        config.mqtt_password = trimmed(Some(password));
    }
    if let Some(client_id) = trimmed(overrides.mqtt_client_id.as_deref()) {
        config.mqtt_client_id = client_id;
    }
}

/// File values for settings not given through the environment; env wins.
fn without_env_values(
    overrides: &ConfigOverrides,
    env_is_set: impl Fn(&str) -> bool,
) -> ConfigOverrides {
    let mut file_only = overrides.clone();
    if env_is_set("SENSOR_DATA_URL") {
        file_only.data_url = None;
    }
    if env_is_set("SENSOR_ON_PREM_URL") {
        file_only.on_prem_url = None;
    }
    if env_is_set("SENSOR_USER_ID") {
        file_only.user_id = None;
    }
    if env_is_set("SENSOR_RETRY_MAX_ATTEMPTS") {
        file_only.retry_max_attempts = None;
    }
    if env_is_set("SENSOR_RETRY_BASE_DELAY_MS") {
        file_only.retry_base_delay_ms = None;
    }
    if env_is_set("SENSOR_RETRY_MAX_DELAY_MS") {
        file_only.retry_max_delay_ms = None;
    }
    if env_is_set("SENSOR_PAGE_LIMIT") {
        file_only.page_limit = None;
    }
    if env_is_set("SENSOR_MAX_PAGES") {
        file_only.max_pages = None;
    }
    if env_is_set("SENSOR_LOAD_ENTITY_PAGE_SIZE") {
        file_only.load_entity_page_size = None;
    }
    if env_is_set("SENSOR_REQUEST_TIMEOUT_SECONDS") {
        file_only.request_timeout_seconds = None;
    }
    if env_is_set("SENSOR_TIMEZONE") {
        file_only.timezone = None;
    }
    if env_is_set("SENSOR_MQTT_HOST") {
        file_only.mqtt_host = None;
    }
    if env_is_set("SENSOR_MQTT_PORT") {
        file_only.mqtt_port = None;
    }
    if env_is_set("SENSOR_MQTT_USERNAME") {
        file_only.mqtt_username = None;
    }
    if env_is_set("SENSOR_MQTT_PASSWORD") {
        file_only.mqtt_password = None;
    }
    if env_is_set("SENSOR_MQTT_CLIENT_ID") {
        file_only.mqtt_client_id = None;
    }
    file_only
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub data_url: String,
    pub on_prem_url: Option<String>,
    pub user_id: Option<String>,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub page_limit: usize,
    pub max_pages: usize,
    pub load_entity_page_size: usize,
    pub request_timeout_seconds: u64,
    pub timezone: Option<String>,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
}

impl ClientConfig {
    pub fn new(data_url: impl Into<String>) -> Self {
        Self {
            data_url: data_url.into(),
            on_prem_url: None,
            user_id: None,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            page_limit: 1_000,
            max_pages: 500,
            load_entity_page_size: 100,
            request_timeout_seconds: 30,
            timezone: None,
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_client_id: "sensor-data-client".to_string(),
        }
    }

    pub fn from_env() -> Result<Self> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                tracing::warn!(error = %err, "failed to load .env file");
            }
        }

        let overrides = config_overrides_path().and_then(|path| load_config_overrides(&path));

        let data_url = env_optional_string("SENSOR_DATA_URL")
            .or_else(|| {
                overrides
                    .as_ref()
                    .and_then(|ov| trimmed(ov.data_url.as_deref()))
            })
            .context("SENSOR_DATA_URL must be set (or present as data_url in the client config file)")?;

        let mut config = Self {
            data_url,
            on_prem_url: env_optional_string("SENSOR_ON_PREM_URL"),
            user_id: env_optional_string("SENSOR_USER_ID"),
            retry_max_attempts: env_u32("SENSOR_RETRY_MAX_ATTEMPTS", 3).clamp(1, 10),
            retry_base_delay_ms: env_u64("SENSOR_RETRY_BASE_DELAY_MS", 500).clamp(10, 60_000),
            retry_max_delay_ms: env_u64("SENSOR_RETRY_MAX_DELAY_MS", 30_000)
                .clamp(100, 10 * 60_000),
            page_limit: env_u64("SENSOR_PAGE_LIMIT", 1_000).clamp(1, 10_000) as usize,
            max_pages: env_u64("SENSOR_MAX_PAGES", 500).clamp(1, 100_000) as usize,
            load_entity_page_size: env_u64("SENSOR_LOAD_ENTITY_PAGE_SIZE", 100).clamp(1, 1_000)
                as usize,
            request_timeout_seconds: env_u64("SENSOR_REQUEST_TIMEOUT_SECONDS", 30).clamp(1, 600),
            timezone: env_optional_string("SENSOR_TIMEZONE"),
            mqtt_host: env_string("SENSOR_MQTT_HOST", "127.0.0.1"),
            mqtt_port: env_u16("SENSOR_MQTT_PORT", 1883),
            mqtt_username: env_optional_string("SENSOR_MQTT_USERNAME"),
            mqtt_password: env_optional_string("SENSOR_MQTT_PASSWORD"),
            mqtt_client_id: env_string("SENSOR_MQTT_CLIENT_ID", "sensor-data-client"),
        };

        if let Some(overrides) = overrides.as_ref() {
            let file_only =
                without_env_values(overrides, |key| env_optional_string(key).is_some());
            apply_overrides(&mut config, &file_only);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.data_url)
            .with_context(|| format!("invalid data url {:?}", self.data_url))?;
        if let Some(on_prem) = self.on_prem_url.as_deref() {
            Url::parse(on_prem).with_context(|| format!("invalid on-prem url {on_prem:?}"))?;
        }
        self.tz()?;
        Ok(())
    }

    pub fn tz(&self) -> Result<Option<Tz>> {
        self.timezone
            .as_deref()
            .map(|name| {
                name.parse::<Tz>()
                    .map_err(|_| anyhow::anyhow!("unknown timezone {name:?}"))
            })
            .transpose()
    }
}

fn env_string(key: &str, default: &str) -> String {
    env_optional_string(key).unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
