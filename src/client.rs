//! Remote Session Client
//!
//! Handles HTTP communication with the CouchDB session and user endpoints.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::{user_doc_id, User, UserMetadata};

/// Error body returned by CouchDB, e.g. `{"error":"conflict","reason":"Document update conflict."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouchError {
    pub error: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl CouchError {
    /// The server's reason, falling back to the error code.
    pub fn message(&self) -> &str {
        self.reason.as_deref().unwrap_or(&self.error)
    }
}

impl std::fmt::Display for CouchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{}: {}", self.error, reason),
            None => write!(f, "{}", self.error),
        }
    }
}

/// A decoded CouchDB response body: either the error shape or the expected one.
///
/// CouchDB reports failures in the body, so the HTTP status is not consulted
/// once the body parses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Reply<T> {
    Failure(CouchError),
    Success(T),
}

impl<T> Reply<T> {
    pub fn into_result(self) -> Result<T, CouchError> {
        match self {
            Reply::Success(value) => Ok(value),
            Reply::Failure(error) => Err(error),
        }
    }

    pub fn failure(&self) -> Option<&CouchError> {
        match self {
            Reply::Failure(error) => Some(error),
            Reply::Success(_) => None,
        }
    }
}

/// API client for the CouchDB session endpoints
#[derive(Clone)]
pub struct SessionClient {
    base_url: String,
    client: reqwest::Client,
}

impl SessionClient {
    /// Create a new client for a base URL that already ends with `/`.
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        // Session cookies ride along on every request, the same client is
        // handed to remote stores so replication shares them.
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            base_url: base_url.to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The underlying HTTP client, cookie jar included.
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Fetch the identity attached to the current session cookie.
    pub async fn get_session(&self) -> Result<Reply<SessionInfo>, ApiError> {
        let url = format!("{}_session", self.base_url);
        debug!("Checking session at: {}", url);
        self.send(self.client.get(&url)).await
    }

    /// Exchange credentials for a session cookie.
    pub async fn post_session(&self, username: &str, password: &str) -> Result<Reply<User>, ApiError> {
        let url = format!("{}_session", self.base_url);
        debug!("Logging in {} at: {}", username, url);
        self.send(self.client.post(&url).json(&LoginRequest { username, password }))
            .await
    }

    /// End the current session.
    pub async fn delete_session(&self) -> Result<Reply<serde_json::Value>, ApiError> {
        let url = format!("{}_session", self.base_url);
        let reply = self.send(self.client.delete(&url)).await?;
        info!("Session ended on server");
        Ok(reply)
    }

    /// Create a user record in `_users`.
    pub async fn put_user(&self, user: &UserDoc) -> Result<Reply<PutResponse>, ApiError> {
        let url = format!("{}_users/{}", self.base_url, user.id);
        info!("Creating user record {}", user.id);
        self.send(self.client.put(&url).json(user)).await
    }

    /// Fetch a user record from `_users`.
    pub async fn get_user(&self, username: &str) -> Result<Reply<User>, ApiError> {
        let url = format!("{}_users/{}", self.base_url, user_doc_id(username));
        self.send(self.client.get(&url)).await
    }

    /// Fetch database metadata from an absolute database URL.
    pub async fn db_info(&self, db_url: &str) -> Result<Reply<serde_json::Value>, ApiError> {
        self.send(self.client.get(db_url)).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Reply<T>, ApiError> {
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        match serde_json::from_slice::<Reply<T>>(&body) {
            Ok(reply) => Ok(reply),
            Err(_) if !status.is_success() => Err(ApiError::Server(format!("Status: {}", status))),
            Err(e) => Err(ApiError::Parse(e.to_string())),
        }
    }
}

// Request/Response types

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Body of `GET /_session`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    #[serde(rename = "userCtx")]
    pub user_ctx: UserCtx,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserCtx {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserCtx {
    /// The logged in user, if the session carries a non-empty name.
    pub fn into_user(self) -> Option<User> {
        match self.name {
            Some(name) if !name.is_empty() => Some(User {
                name,
                roles: self.roles,
                metadata: None,
            }),
            _ => None,
        }
    }
}

/// A new user record as stored in `_users`.
#[derive(Debug, Clone, Serialize)]
pub struct UserDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub password: String,
    pub roles: Vec<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub metadata: UserMetadata,
}

impl UserDoc {
    pub fn new(username: &str, password: &str, email: &str) -> Self {
        Self {
            id: user_doc_id(username),
            name: username.to_string(),
            password: password.to_string(),
            roles: Vec::new(),
            kind: "user".to_string(),
            metadata: UserMetadata {
                email: Some(email.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PutResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub rev: Option<String>,
}

/// API errors
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
