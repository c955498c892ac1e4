use std::fmt;
use std::time::{Duration, SystemTime};

use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, RANGE, RETRY_AFTER};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::pinning::{PinError, PinSet, pinned_tls_config};

const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
const API_KEY_HEADER: &str = "apikey";
const OPERATION_HEADER: &str = "x-sync-operation";
const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("certificate pinning setup failed: {0}")]
    Pinning(#[from] PinError),
    #[error("backend credential is missing")]
    MissingCredential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: String,
    pub call_timeout: Duration,
    pub connect_timeout: Duration,
    pub pins: PinSet,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            pins: PinSet::default(),
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("call_timeout", &self.call_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("pins", &self.pins.len())
            .finish()
    }
}

/// Extra headers attached to a record POST.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordMeta<'a> {
    pub operation: Option<&'a str>,
    pub idempotency_key: Option<&'a str>,
}

#[derive(Serialize)]
struct RecordEnvelope<'a, P: ?Sized> {
    payload: &'a P,
}

#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: Url,
    api_key: String,
    call_timeout: Duration,
}

impl BackendClient {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let mut builder = Client::builder().connect_timeout(config.connect_timeout);
        if !config.pins.is_empty() {
            builder = builder.use_preconfigured_tls(pinned_tls_config(&config.pins)?);
            tracing::info!(
                target: "kiosk_core::client",
                pins = config.pins.len(),
                "certificate pinning enabled"
            );
        }
        Ok(Self {
            http: builder.build()?,
            base_url: parse_base_url(&config.base_url)?,
            api_key: config.api_key,
            call_timeout: config.call_timeout,
        })
    }

    pub fn with_base_url(base_url: &str, api_key: impl Into<String>) -> Result<Self, BackendError> {
        Ok(Self {
            http: Client::new(),
            base_url: parse_base_url(base_url)?,
            api_key: api_key.into(),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Sends `{"payload": ...}` to `endpoint`. Any 2xx counts as applied.
    pub async fn post_record<P: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        payload: &P,
        meta: RecordMeta<'_>,
    ) -> Result<(), BackendError> {
        let url = self.resolve(endpoint)?;
        let mut request = self
            .authorize(self.http.post(url.clone()), &url)?
            .timeout(self.call_timeout)
            .json(&RecordEnvelope { payload });
        if let Some(operation) = meta.operation {
            request = request.header(OPERATION_HEADER, operation);
        }
        if let Some(key) = meta.idempotency_key {
            request = request.header(IDEMPOTENCY_HEADER, key);
        }
        let response = request.send().await?;
        Self::handle_response(response).await?;
        Ok(())
    }

    pub async fn upload_body(
        &self,
        url: &str,
        content_type: &str,
        content_length: u64,
        body: Body,
    ) -> Result<(), BackendError> {
        let url = self.resolve(url)?;
        let response = self
            .authorize(self.http.post(url.clone()), &url)?
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, content_length)
            .body(body)
            .send()
            .await?;
        Self::handle_response(response).await?;
        Ok(())
    }

    /// Opens a download stream, asking for `bytes=<offset>-` when resuming.
    /// Only 200 and 206 are accepted; the caller inspects which one it got.
    pub async fn open_download(&self, url: &str, offset: u64) -> Result<Response, BackendError> {
        let url = self.resolve(url)?;
        let mut request = self.authorize(self.http.get(url.clone()), &url)?;
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await?;
        if matches!(response.status(), StatusCode::OK | StatusCode::PARTIAL_CONTENT) {
            Ok(response)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    fn resolve(&self, target: &str) -> Result<Url, BackendError> {
        match Url::parse(target) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Ok(self.base_url.join(target.trim_start_matches('/'))?)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn authorize(&self, request: RequestBuilder, url: &Url) -> Result<RequestBuilder, BackendError> {
        // Foreign hosts (signed storage links, CDNs) never see the key.
        if url.origin() != self.base_url.origin() {
            return Ok(request);
        }
        if self.api_key.is_empty() {
            return Err(BackendError::MissingCredential);
        }
        Ok(request
            .header(API_KEY_HEADER, &self.api_key)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key)))
    }

    async fn handle_response(response: Response) -> Result<Response, BackendError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: Response) -> BackendError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| parse_retry_after(value, SystemTime::now()));
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(
            target: "kiosk_core::client",
            status = status.as_u16(),
            "backend rejected request"
        );
        BackendError::Api {
            status,
            body,
            retry_after,
        }
    }
}

impl BackendError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            BackendError::Api { status, .. } => classify_api_status(*status),
            BackendError::Request(err) if err.is_builder() => ApiErrorClass::Permanent,
            BackendError::Request(_) => ApiErrorClass::Transient,
            BackendError::MissingCredential => ApiErrorClass::Auth,
            BackendError::Url(_) | BackendError::Pinning(_) => ApiErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BackendError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            BackendError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_base_url(value: &str) -> Result<Url, url::ParseError> {
    if value.ends_with('/') {
        Url::parse(value)
    } else {
        Url::parse(&format!("{value}/"))
    }
}

fn parse_retry_after(value: &str, now: SystemTime) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(now).unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(classify_api_status(StatusCode::FORBIDDEN), ApiErrorClass::Auth);
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::UNPROCESSABLE_ENTITY),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn missing_credential_is_auth() {
        assert_eq!(
            BackendError::MissingCredential.classification(),
            ApiErrorClass::Auth
        );
        assert!(!BackendError::MissingCredential.is_retryable());
    }

    #[test]
    fn parses_retry_after_seconds_and_dates() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(
            parse_retry_after("120", now),
            Some(Duration::from_secs(120))
        );

        let later = httpdate::fmt_http_date(now + Duration::from_secs(30));
        assert_eq!(parse_retry_after(&later, now), Some(Duration::from_secs(30)));

        let earlier = httpdate::fmt_http_date(now - Duration::from_secs(30));
        assert_eq!(parse_retry_after(&earlier, now), Some(Duration::ZERO));

        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn base_url_keeps_path_prefix() {
        let client = BackendClient::with_base_url("https://backend.example/api", "k").unwrap();
        let url = client.resolve("/functions/v1/device-location").unwrap();
        assert_eq!(
            url.as_str(),
            "https://backend.example/api/functions/v1/device-location"
        );
        let absolute = client.resolve("https://cdn.example/f.bin").unwrap();
        assert_eq!(absolute.as_str(), "https://cdn.example/f.bin");
    }

    #[test]
    fn config_debug_redacts_key() {
        let config = BackendConfig::new("https://backend.example", "secret-key");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret-key"));
    }
}
