//! Management API client: token authentication plus the handful of typed
//! resources the controller consumes.

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = "probefleet-controller/1.0";
const API_PREFIX: &str = "/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub type ApiFuture<'a, T> = BoxFuture<'a, Result<T, ApiError>>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("management API rejected the credentials ({status}): {body}")]
    Auth { status: u16, body: String },
    #[error("management API call made before authentication")]
    NotAuthenticated,
    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: Method,
        path: String,
        status: u16,
        body: String,
    },
    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("cannot decode response of {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    /// Errors that retrying cannot fix.
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth { .. } | ApiError::NotAuthenticated)
    }
}

/// Activation window of a test exercise. Times are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActivationWindow {
    #[serde(deserialize_with = "flag")]
    pub activated: bool,
    pub start: i64,
    pub end: i64,
    pub updated_at: i64,
}

impl ActivationWindow {
    pub fn is_active(&self, now: i64) -> bool {
        self.activated && self.start <= now && now <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MeasurementTypeRecord {
    pub id: u64,
    pub name: String,
    pub nodelist_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetRecord {
    pub target: String,
    /// 4 or 6.
    #[serde(deserialize_with = "ip_version_digit")]
    pub ipv: u8,
    pub measurement_type_id: u64,
    pub party: String,
    #[serde(default = "enabled_by_default", deserialize_with = "flag")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodelistRecord {
    pub id: u64,
    #[serde(default)]
    pub list: Vec<String>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlagRepr {
    Bool(bool),
    Int(i64),
    Text(String),
}

fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match FlagRepr::deserialize(deserializer)? {
        FlagRepr::Bool(value) => value,
        FlagRepr::Int(value) => value != 0,
        FlagRepr::Text(value) => matches!(value.trim(), "1" | "true" | "True" | "yes"),
    })
}

fn ip_version_digit<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let raw = match FlagRepr::deserialize(deserializer)? {
        FlagRepr::Int(value) => value.to_string(),
        FlagRepr::Text(value) => value.trim().trim_start_matches(['v', 'V']).to_string(),
        FlagRepr::Bool(_) => String::new(),
    };
    match raw.as_str() {
        "4" => Ok(4),
        "6" => Ok(6),
        other => Err(serde::de::Error::custom(format!(
            "ip version must be 4 or 6, got `{other}`"
        ))),
    }
}

pub trait ManagementApi: Send + Sync {
    fn authenticate<'a>(&'a self, login: &'a str, password: &'a str) -> ApiFuture<'a, ()>;

    /// Replaces the reachable node inventory.
    fn put_nodelist<'a>(&'a self, nodes: &'a [String]) -> ApiFuture<'a, ()>;

    fn activation_window(&self, id: u64) -> ApiFuture<'_, ActivationWindow>;

    fn measurement_types(&self) -> ApiFuture<'_, Vec<MeasurementTypeRecord>>;

    fn targets(&self) -> ApiFuture<'_, Vec<TargetRecord>>;

    fn nodelists(&self) -> ApiFuture<'_, Vec<NodelistRecord>>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// `reqwest` implementation of [`ManagementApi`].
pub struct HttpManagementClient {
    client: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpManagementClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| ApiError::Transport {
                path: base_url.to_string(),
                source,
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn bearer(&self) -> Result<String, ApiError> {
        let token = self
            .token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        token.clone().ok_or(ApiError::NotAuthenticated)
    }

    async fn login(&self, login: &str, password: &str) -> Result<(), ApiError> {
        let path = "/authentication".to_string();
        let form = [
            ("grant_type", "password"),
            ("username", login),
            ("login", login),
            ("password", password),
        ];
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .form(&form)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                path: path.clone(),
                source,
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|source| ApiError::Transport {
            path: path.clone(),
            source,
        })?;
        if !status.is_success() {
            return Err(ApiError::Auth {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|source| ApiError::Decode { path, source })?;
        *self
            .token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token.access_token);
        tracing::info!(api = %self.base_url, "management API access authenticated");
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<String, ApiError> {
        let token = self.bearer()?;
        let mut request = self
            .client
            .request(method.clone(), format!("{}{API_PREFIX}{path}", self.base_url))
            .bearer_auth(token)
            .header("Accept", "*/*");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|source| ApiError::Transport {
            path: path.to_string(),
            source,
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|source| ApiError::Transport {
            path: path.to_string(),
            source,
        })?;

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Auth {
                status: status.as_u16(),
                body: text,
            }),
            status if status.is_success() => Ok(text),
            status => Err(ApiError::Status {
                method,
                path: path.to_string(),
                status: status.as_u16(),
                body: text,
            }),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let body = self.send(Method::GET, path, None).await?;
        serde_json::from_str(&body).map_err(|source| ApiError::Decode {
            path: path.to_string(),
            source,
        })
    }
}

impl ManagementApi for HttpManagementClient {
    fn authenticate<'a>(&'a self, login: &'a str, password: &'a str) -> ApiFuture<'a, ()> {
        self.login(login, password).boxed()
    }

    fn put_nodelist<'a>(&'a self, nodes: &'a [String]) -> ApiFuture<'a, ()> {
        async move {
            self.send(Method::PUT, "/nodelists", Some(serde_json::json!(nodes)))
                .await
                .map(|_| ())
        }
        .boxed()
    }

    fn activation_window(&self, id: u64) -> ApiFuture<'_, ActivationWindow> {
        async move { self.get_json(&format!("/ddostests/{id}")).await }.boxed()
    }

    fn measurement_types(&self) -> ApiFuture<'_, Vec<MeasurementTypeRecord>> {
        self.get_json("/measurementtypes").boxed()
    }

    fn targets(&self) -> ApiFuture<'_, Vec<TargetRecord>> {
        self.get_json("/targets").boxed()
    }

    fn nodelists(&self) -> ApiFuture<'_, Vec<NodelistRecord>> {
        self.get_json("/nodelists").boxed()
    }
}
