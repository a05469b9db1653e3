//! HTTP message-source gateway.
//!
//! The gateway holds the actual source sessions; this adapter speaks its small
//! REST surface:
//!
//! - `POST {base}/sessions/{session}/connect` with `{api_id, api_hash}`
//! - `GET  {base}/sessions/{session}/channels/{identity}`
//! - `GET  {base}/sessions/{session}/channels/{identity}/messages?min_id=&limit=`
//! - `POST {base}/sessions/{session}/disconnect`
//!
//! Non-success statuses map onto [`SourceError`] variants by status code only.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode, Url};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AccountConfig;
use crate::error::{ConfigError, SourceError, SourceResult};
use crate::traits::{ChannelHandle, MessageSource, SourceConnector, SourceMessage};

/// Wait applied when a 429 carries no usable duration.
pub const DEFAULT_RATE_LIMIT_SECS: u64 = 3600;

#[derive(Serialize)]
struct ConnectRequest<'a> {
    api_id: i64,
    api_hash: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GatewayErrorBody {
    error: Option<String>,
    message: Option<String>,
    retry_after: Option<u64>,
}

/// Opens gateway sessions.
pub struct GatewayConnector {
    client: Client,
    base: Url,
}

impl GatewayConnector {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let base = Url::parse(base_url).map_err(|e| ConfigError::Invalid {
            var: "SOURCE_GATEWAY_URL",
            reason: format!("{base_url:?}: {e}"),
        })?;
        if base.cannot_be_a_base() {
            return Err(ConfigError::Invalid {
                var: "SOURCE_GATEWAY_URL",
                reason: format!("{base_url:?} cannot be used as a base URL"),
            });
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid {
                var: "HARVESTER_REQUEST_TIMEOUT_SECS",
                reason: e.to_string(),
            })?;
        Ok(Self { client, base })
    }
}

#[async_trait]
impl SourceConnector for GatewayConnector {
    async fn connect(&self, account: &AccountConfig) -> SourceResult<Box<dyn MessageSource>> {
        let source = GatewaySource {
            client: self.client.clone(),
            base: self.base.clone(),
            session: account.session.clone(),
        };

        let resp = self
            .client
            .post(source.endpoint(&["connect"]))
            .json(&ConnectRequest {
                api_id: account.api_id,
                api_hash: account.api_hash().expose_secret(),
            })
            .send()
            .await
            .map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(classify(resp).await);
        }

        debug!(account = %account.session, "gateway session connected");
        Ok(Box::new(source))
    }
}

/// One gateway session.
pub struct GatewaySource {
    client: Client,
    base: Url,
    session: String,
}

impl GatewaySource {
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["sessions", self.session.as_str()])
                .extend(segments);
        }
        url
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> SourceResult<T> {
        let resp = self.client.get(url).send().await.map_err(transport_error)?;
        if !resp.status().is_success() {
            return Err(classify(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| SourceError::transient(format!("invalid gateway response: {e}")))
    }
}

#[async_trait]
impl MessageSource for GatewaySource {
    async fn resolve(&self, identity: &str) -> SourceResult<ChannelHandle> {
        self.get_json(self.endpoint(&["channels", identity])).await
    }

    async fn fetch_page(
        &self,
        channel: &ChannelHandle,
        after: i64,
        limit: usize,
    ) -> SourceResult<Vec<SourceMessage>> {
        let address = channel.address();
        let mut url = self.endpoint(&["channels", address.as_str(), "messages"]);
        url.query_pairs_mut()
            .append_pair("min_id", &after.to_string())
            .append_pair("limit", &limit.to_string());
        self.get_json(url).await
    }

    async fn disconnect(&self) {
        match self.client.post(self.endpoint(&["disconnect"])).send().await {
            Ok(resp) => debug!(
                account = %self.session,
                status = resp.status().as_u16(),
                "gateway session disconnected"
            ),
            Err(e) => debug!(account = %self.session, error = %e, "gateway disconnect failed"),
        }
    }
}

fn transport_error(e: reqwest::Error) -> SourceError {
    SourceError::transient(format!("gateway request failed: {e}"))
}

/// Map a non-success response onto a source error.
async fn classify(resp: Response) -> SourceError {
    let status = resp.status();
    let header_wait = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = resp.text().await.unwrap_or_default();
    let detail: GatewayErrorBody = serde_json::from_str(&body).unwrap_or_default();
    let reason = detail
        .error
        .or(detail.message)
        .unwrap_or_else(|| format!("{status}: {}", body.trim()));

    match status {
        StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => SourceError::NotFound { reason },
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited {
            seconds: detail
                .retry_after
                .or(header_wait)
                .unwrap_or(DEFAULT_RATE_LIMIT_SECS),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::Auth { reason },
        _ => SourceError::Transient {
            reason: format!("gateway returned {status}: {reason}"),
        },
    }
}
