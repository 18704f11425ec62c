//! reqwest-backed implementation of [`HistoryApi`].

pub mod rate_limit;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use veilchat_shared::api::keys::{PublicKeyBundle, UploadPublicKeyRequest};
use veilchat_shared::api::message::{HistoryRecord, MarkReadRequest, UnreadOverview};
use veilchat_shared::api::user::UserProfile;
use veilchat_shared::error::VeilChatError;
use veilchat_shared::ids::{MessageId, UserId};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::history::HistoryApi;
use rate_limit::{parse_retry_after, RateLimiter};

pub struct RestHistoryApi {
    http_client: Client,
    api_base_url: String,
    access_token: String,
    limiter: RateLimiter,
}

impl RestHistoryApi {
    pub fn new(config: &ClientConfig, access_token: impl Into<String>) -> Result<Self, ClientError> {
        let http_client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            http_client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            limiter: RateLimiter::new(),
        })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http_client
            .request(method, url)
            .bearer_auth(&self.access_token)
    }

    /// Send a request, honouring and feeding the rate limiter.
    async fn execute(&self, url: &str, req: RequestBuilder) -> Result<reqwest::Response, ClientError> {
        if let Some(remaining) = self.limiter.check(url) {
            tracing::debug!(url, remaining_ms = remaining.as_millis() as u64, "skipping rate-limited request");
            return Err(VeilChatError::RateLimited.into());
        }

        let resp = req.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(
                resp.headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            self.limiter.record(url, retry_after);
            return Err(VeilChatError::RateLimited.into());
        }
        Err(error_from_response(resp).await)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.url(path);
        let resp = self.execute(&url, self.request(Method::GET, &url)).await?;
        Ok(resp.json().await?)
    }
}

/// Map a non-success response to an API error, keeping the server's message
/// when it sent one.
async fn error_from_response(resp: reqwest::Response) -> ClientError {
    #[derive(serde::Deserialize)]
    struct ServerError {
        error: String,
    }
    let status = resp.status();
    let detail = match resp.json::<ServerError>().await {
        Ok(body) => body.error,
        Err(_) => format!("HTTP {status}"),
    };
    VeilChatError::from_status(status.as_u16(), detail).into()
}

#[async_trait]
impl HistoryApi for RestHistoryApi {
    async fn conversation_history(&self, peer: UserId) -> Result<Vec<HistoryRecord>, ClientError> {
        self.get_json(&format!("/api/messages/{peer}")).await
    }

    async fn unread_overview(&self) -> Result<Vec<UnreadOverview>, ClientError> {
        self.get_json("/api/messages/unread").await
    }

    async fn mark_read(&self, peer: UserId, message_ids: &[MessageId]) -> Result<(), ClientError> {
        let url = self.url("/api/messages/read");
        let body = MarkReadRequest {
            peer_id: peer,
            message_ids: message_ids.to_vec(),
        };
        self.execute(&url, self.request(Method::POST, &url).json(&body))
            .await?;
        Ok(())
    }

    async fn public_key_bundle(&self, user: UserId) -> Result<PublicKeyBundle, ClientError> {
        self.get_json(&format!("/api/keys/{user}")).await
    }

    async fn upload_public_key(&self, public_key: &str) -> Result<(), ClientError> {
        let url = self.url("/api/keys");
        let body = UploadPublicKeyRequest {
            public_key: public_key.to_string(),
        };
        self.execute(&url, self.request(Method::PUT, &url).json(&body))
            .await?;
        Ok(())
    }

    async fn mark_keys_missing(&self) -> Result<(), ClientError> {
        let url = self.url("/api/keys/missing");
        self.execute(&url, self.request(Method::POST, &url)).await?;
        Ok(())
    }

    async fn user_profile(&self, user: UserId) -> Result<UserProfile, ClientError> {
        self.get_json(&format!("/api/users/{user}")).await
    }
}
