use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::services::retry::{with_retry, RetryPolicy};

const USER_ID_HEADER: &str = "userID";

/// Response envelope shared by every backend route: `{data, errors?}` or
/// `{success, data}`, optionally with `totalCount` and `message`.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    errors: Option<JsonValue>,
    #[serde(default)]
    data: Option<JsonValue>,
    #[serde(rename = "totalCount", default)]
    total_count: Option<u64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub data: T,
    pub total_count: Option<u64>,
}

fn has_errors(errors: &JsonValue) -> bool {
    match errors {
        JsonValue::Null => false,
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(fields) => !fields.is_empty(),
        JsonValue::String(text) => !text.trim().is_empty(),
        JsonValue::Bool(flag) => *flag,
        JsonValue::Number(_) => true,
    }
}

pub(crate) fn decode_envelope<T: DeserializeOwned>(url: &Url, body: &str) -> Result<ApiResponse<T>> {
    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|err| Error::parse(format!("invalid response body from {url}: {err}")))?;

    let failed = envelope.success == Some(false);
    let errors = envelope.errors.filter(has_errors);
    if failed || errors.is_some() {
        let detail = errors
            .map(|errors| errors.to_string())
            .or(envelope.message)
            .unwrap_or_else(|| "request reported success=false".to_string());
        return Err(Error::Http {
            status: StatusCode::OK.as_u16(),
            url: url.to_string(),
            body: detail,
        });
    }

    let data = match envelope.data {
        Some(JsonValue::Null) | None => {
            return Err(Error::parse(format!("response from {url} has no data field")))
        }
        Some(data) => data,
    };
    let data = serde_json::from_value(data)
        .map_err(|err| Error::parse(format!("unexpected data shape from {url}: {err}")))?;
    Ok(ApiResponse {
        data,
        total_count: envelope.total_count,
    })
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    cloud: Url,
    on_prem: Option<Url>,
    user_id: Option<String>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

fn parse_base(raw: &str, label: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|err| Error::validation(format!("invalid {label} url {raw:?}: {err}")))?;
    if url.cannot_be_a_base() {
        return Err(Error::validation(format!(
            "{label} url {raw:?} cannot be used as a base"
        )));
    }
    Ok(url)
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let cloud = parse_base(&config.data_url, "data")?;
        let on_prem = config
            .on_prem_url
            .as_deref()
            .map(|raw| parse_base(raw, "on-prem"))
            .transpose()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds.max(1)))
            .build()
            .map_err(|err| Error::validation(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            cloud,
            on_prem,
            user_id: config.user_id.clone(),
            retry: RetryPolicy::from_config(config),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn base_url(&self, on_prem: bool) -> Result<&Url> {
        if on_prem {
            self.on_prem.as_ref().ok_or_else(|| {
                Error::validation("on-prem routing requested but no on-prem url is configured")
            })
        } else {
            Ok(&self.cloud)
        }
    }

    pub fn endpoint(&self, on_prem: bool, segments: &[&str]) -> Result<Url> {
        let base = self.base_url(on_prem)?;
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::validation(format!("base url {base} cannot take a path")))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn fetch_once(&self, url: &Url) -> Result<String> {
        let mut request = self.http.get(url.clone());
        if let Some(user_id) = self.user_id.as_deref() {
            request = request.header(USER_ID_HEADER, user_id);
        }
        let resp = request.send().await.map_err(|source| Error::Transport {
            url: url.to_string(),
            source,
        })?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("{} returned 404", url.path())));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Http {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }
        resp.text().await.map_err(|source| Error::Transport {
            url: url.to_string(),
            source,
        })
    }

    /// GET with retry, returning the validated `data` payload.
    pub async fn get_data<T: DeserializeOwned>(
        &self,
        label: &str,
        url: Url,
    ) -> Result<ApiResponse<T>> {
        let url = &url;
        with_retry(&self.retry, label, &self.cancel, |attempt| async move {
            tracing::debug!(label, url = %url, attempt, "GET");
            let body = self.fetch_once(url).await?;
            decode_envelope(url, &body)
        })
        .await
    }
}
