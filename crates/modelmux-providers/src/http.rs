//! Shared HTTP transport: request execution, per-attempt timeout and
//! classification of vendor failures into [`ProviderErrorKind`]s.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use modelmux_core::config::ProviderConfig;
use modelmux_core::error::{ConfigurationError, ProviderError, ProviderErrorKind};

use crate::wire::ErrorEnvelope;

/// How a provider authenticates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `api-key: <key>` (Azure)
    ApiKeyHeader,
}

/// Connection-pooled client bound to one provider's auth and timeout.
pub(crate) struct HttpTransport {
    client: reqwest::Client,
    headers: HeaderMap,
    timeout: Duration,
    provider_id: String,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("provider", &self.provider_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(config: &ProviderConfig, auth: AuthStyle) -> Result<Self, ConfigurationError> {
        let mut headers = HeaderMap::new();

        if !config.credentials.is_empty() {
            let (name, value) = match auth {
                AuthStyle::Bearer => (
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {}", config.credentials.expose()),
                ),
                AuthStyle::ApiKeyHeader => (
                    HeaderName::from_static("api-key"),
                    config.credentials.expose().to_string(),
                ),
            };
            let mut value = HeaderValue::from_str(&value).map_err(|_| {
                ConfigurationError::Invalid(format!(
                    "provider '{}' has credentials that are not a valid header value",
                    config.id
                ))
            })?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        if let Some(extra) = &config.extra_headers {
            for (key, value) in extra {
                if let (Ok(name), Ok(val)) = (
                    HeaderName::from_bytes(key.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    headers.insert(name, val);
                } else {
                    warn!(provider = %config.id, "Invalid header: {}", key);
                }
            }
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigurationError::Invalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            headers,
            timeout: config.timeout,
            provider_id: config.id.clone(),
        })
    }

    #[cfg(test)]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// POST a JSON body and decode a JSON response.
    ///
    /// The whole exchange, body read included, is bounded by the provider
    /// timeout; on expiry the request future is dropped, which aborts it.
    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, ProviderError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let exchange = async {
            let response = self
                .client
                .post(url)
                .headers(self.headers.clone())
                .json(body)
                .send()
                .await
                .map_err(classify_transport)?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(classify_status(status, &text));
            }

            response
                .json::<T>()
                .await
                .map_err(|e| ProviderError::unavailable(format!("malformed response: {e}")))
        };

        let result = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout(format!(
                "no response within {:.1}s",
                self.timeout.as_secs_f64()
            ))),
        };

        if let Err(e) = &result {
            debug!(provider = %self.provider_id, url, error = %e, "Provider request failed");
        }
        result
    }

    /// GET `url` and report whether it answered 2xx within the timeout.
    pub async fn probe(&self, url: &str) -> bool {
        let request = self.client.get(url).headers(self.headers.clone()).send();
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => {
                let ok = response.status().is_success();
                if !ok {
                    debug!(provider = %self.provider_id, status = %response.status(), "Health probe failed");
                }
                ok
            }
            Ok(Err(e)) => {
                debug!(provider = %self.provider_id, error = %e, "Health probe failed");
                false
            }
            Err(_) => false,
        }
    }
}

/// Map a non-2xx response onto the error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let kind = match status.as_u16() {
        401 | 403 => ProviderErrorKind::AuthFailed,
        429 => ProviderErrorKind::RateLimited,
        408 | 504 => ProviderErrorKind::Timeout,
        400..=499 => ProviderErrorKind::InvalidRequest,
        _ => ProviderErrorKind::Unavailable,
    };

    let detail = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => match envelope.error.code {
            Some(code) => format!("{} ({})", envelope.error.message, code),
            None => envelope.error.message,
        },
        Err(_) => body.chars().take(300).collect(),
    };

    ProviderError::new(kind, format!("HTTP {status}: {detail}"))
}

/// Map a reqwest failure (no HTTP status) onto the error taxonomy.
pub(crate) fn classify_transport(error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::timeout(error.to_string())
    } else if error.is_builder() {
        ProviderError::invalid_request(error.to_string())
    } else {
        ProviderError::unavailable(error.to_string())
    }
}
