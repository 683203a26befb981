//! REST API Client
//!
//! Thin `reqwest` wrapper over the backend's `/api` endpoints. Authentication
//! is cookie based: the client owns a cookie jar that is shared with the
//! real-time transport so both present the same session.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::error::ApiError;
use super::types::{
    decode_message_list, ApiUser, ConversationDto, ConversationUpdate, Detail, LoginResponse,
    NewConversation, NewMessage, PasswordChange, RegisterRequest, UploadResponse,
};
use super::{AccountApi, ConversationApi};
use crate::messages::HistoryMessage;

/// Request timeout for REST calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// REST client for the chat backend
#[derive(Clone)]
pub struct ApiClient {
    base: Url,
    http: reqwest::Client,
    cookies: Arc<Jar>,
}

impl ApiClient {
    /// Create a client for the backend at `backend_url`
    ///
    /// A trailing slash on `backend_url` is ignored; requests go to
    /// `<backend_url>/api/...`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be
    /// built.
    pub fn new(backend_url: &str) -> Result<Self, ApiError> {
        Self::with_cookie_jar(backend_url, Arc::new(Jar::default()))
    }

    /// Create a client using an existing cookie jar
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be
    /// built.
    pub fn with_cookie_jar(backend_url: &str, cookies: Arc<Jar>) -> Result<Self, ApiError> {
        let trimmed = backend_url.trim_end_matches('/');
        let base = Url::parse(&format!("{trimmed}/api/"))
            .map_err(|e| ApiError::InvalidUrl(format!("{backend_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&cookies))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { base, http, cookies })
    }

    /// Cookie jar shared with the real-time transport
    #[must_use]
    pub fn cookie_jar(&self) -> Arc<Jar> {
        Arc::clone(&self.cookies)
    }

    /// Base URL of the API (`.../api/`)
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, endpoint: &str) -> Result<Url, ApiError> {
        self.base
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))
    }

    fn builder(&self, method: Method, endpoint: &str) -> Result<RequestBuilder, ApiError> {
        Ok(self.http.request(method, self.url(endpoint)?))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let err = ApiError::from_response(status.as_u16(), &body);
            tracing::debug!(status = status.as_u16(), error = %err, "API request failed");
            return Err(err);
        }

        // 204 and empty bodies decode as an empty object
        if status == reqwest::StatusCode::NO_CONTENT || body.trim().is_empty() {
            return Ok(serde_json::from_str("{}")?);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        self.send(self.builder(Method::GET, endpoint)?).await
    }

    async fn with_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(self.builder(method, endpoint)?.json(body)).await
    }

    async fn upload<T: DeserializeOwned>(&self, endpoint: &str, path: &Path) -> Result<T, ApiError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map_or_else(|| "upload".to_string(), |n| n.to_string_lossy().into_owned());
        let form = Form::new().part("file", Part::bytes(bytes).file_name(file_name));
        self.send(self.builder(Method::POST, endpoint)?.multipart(form))
            .await
    }

    /// Upload a chat attachment, returning its public URL
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the upload fails.
    pub async fn upload_file(&self, path: &Path) -> Result<UploadResponse, ApiError> {
        self.upload("messages/upload", path).await
    }

    /// Persist a single message outside the real-time flow
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn save_message(&self, message: &NewMessage) -> Result<HistoryMessage, ApiError> {
        self.with_json(Method::POST, "messages", message).await
    }
}

#[async_trait]
impl ConversationApi for ApiClient {
    async fn list_conversations(&self) -> Result<Vec<ConversationDto>, ApiError> {
        self.get("conversations").await
    }

    async fn create_conversation(&self, request: &NewConversation) -> Result<ConversationDto, ApiError> {
        self.with_json(Method::POST, "conversations", request).await
    }

    async fn update_conversation(
        &self,
        id: i64,
        update: &ConversationUpdate,
    ) -> Result<ConversationDto, ApiError> {
        self.with_json(Method::PUT, &format!("conversations/{id}"), update)
            .await
    }

    async fn delete_conversation(&self, id: i64) -> Result<(), ApiError> {
        let _: Detail = self
            .send(self.builder(Method::DELETE, &format!("conversations/{id}"))?)
            .await?;
        Ok(())
    }

    async fn get_messages(&self, id: i64) -> Result<Vec<HistoryMessage>, ApiError> {
        let raw: Value = self.get(&format!("conversations/{id}/messages")).await?;
        Ok(decode_message_list(raw))
    }
}

#[async_trait]
impl AccountApi for ApiClient {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let body = serde_json::json!({ "username": username, "password": password });
        self.with_json(Method::POST, "auth/login", &body).await
    }

    async fn register(&self, request: &RegisterRequest) -> Result<ApiUser, ApiError> {
        self.with_json(Method::POST, "auth/register", request).await
    }

    async fn logout(&self) -> Result<(), ApiError> {
        let _: Detail = self.send(self.builder(Method::POST, "auth/logout")?).await?;
        Ok(())
    }

    async fn me(&self) -> Result<ApiUser, ApiError> {
        self.get("users/me").await
    }

    async fn change_password(&self, current: &str, new: &str) -> Result<String, ApiError> {
        let body = PasswordChange {
            current_password: current.to_string(),
            new_password: new.to_string(),
        };
        let detail: Detail = self
            .with_json(Method::POST, "users/change-password", &body)
            .await?;
        Ok(detail.detail.or(detail.message).unwrap_or_default())
    }

    async fn upload_avatar(&self, path: &Path) -> Result<ApiUser, ApiError> {
        self.upload("users/avatar", path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let client = ApiClient::new("http://localhost:8000/").unwrap();
        assert_eq!(client.base_url().as_str(), "http://localhost:8000/api/");
        assert_eq!(
            client.url("/conversations/4/messages").unwrap().as_str(),
            "http://localhost:8000/api/conversations/4/messages"
        );
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            ApiClient::new("::nope::"),
            Err(ApiError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_cookie_jar_is_shared() {
        let jar = Arc::new(Jar::default());
        let client = ApiClient::with_cookie_jar("http://localhost:8000", Arc::clone(&jar)).unwrap();
        assert!(Arc::ptr_eq(&client.cookie_jar(), &jar));
    }

    #[tokio::test]
    async fn test_upload_missing_file() {
        let client = ApiClient::new("http://localhost:8000").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let result = client.upload_file(&dir.path().join("missing.png")).await;
        assert!(matches!(result, Err(ApiError::Io(_))));
    }
}
