//! Auth strategies and the per-source token cache.
//!
//! Strategies are built once per source so cached tokens live for the
//! process. Runtime token acquisition holds the cache lock across the fetch,
//! which coalesces concurrent callers onto a single network call.

use super::client::{HttpClient, HttpError, RequestBody, RequestSpec};
use crate::config::{AuthConfig, BodyType, HttpMethod};
use crate::extract;
use base64::Engine;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

/// Refresh this many seconds before the cached token expires.
const REFRESH_MARGIN_SECONDS: i64 = 30;
/// Expiry assumed when the token response carries no `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECONDS: i64 = 55 * 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("environment variable '{0}' is not set")]
    MissingEnv(String),

    #[error("token endpoint request failed: {0}")]
    Http(#[from] HttpError),

    #[error("token endpoint returned status {0}")]
    TokenStatus(u16),

    #[error("token response is not valid JSON: {0}")]
    TokenParse(#[from] serde_json::Error),

    #[error("token not found at '{0}' in token response")]
    TokenMissing(String),
}

#[derive(Default)]
struct TokenCache {
    token: Option<String>,
    expires_at: Option<i64>,
}

impl TokenCache {
    fn fresh_token(&self, now: i64) -> Option<&str> {
        let token = self.token.as_deref()?;
        match self.expires_at {
            Some(expires_at) if now >= expires_at - REFRESH_MARGIN_SECONDS => None,
            _ => Some(token),
        }
    }
}

struct OauthRuntime {
    endpoint: String,
    method: HttpMethod,
    headers: Vec<(String, String)>,
    body: Option<(BodyType, Value)>,
    token_key: String,
    basic: Option<(String, String)>,
}

struct AzureAd {
    token_endpoint: String,
    client_id: String,
    client_secret: String,
    resource: String,
}

enum Kind {
    None,
    Static(Vec<(String, String)>),
    OauthRuntime {
        runtime: OauthRuntime,
        cache: Mutex<TokenCache>,
    },
    AzureAd {
        azure: AzureAd,
        cache: Mutex<TokenCache>,
    },
}

pub struct AuthStrategy {
    kind: Kind,
}

fn env_var(name: &str) -> Result<String, AuthError> {
    std::env::var(name).map_err(|_| AuthError::MissingEnv(name.to_string()))
}

impl AuthStrategy {
    /// Build a strategy from config, reading referenced secrets from the
    /// environment. Missing variables fail here, before any request goes out.
    pub fn build(config: Option<&AuthConfig>) -> Result<Self, AuthError> {
        let kind = match config {
            None => Kind::None,
            Some(AuthConfig::Basic {
                username_env,
                password_env,
            }) => {
                let credentials = format!("{}:{}", env_var(username_env)?, env_var(password_env)?);
                let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
                Kind::Static(vec![(
                    "Authorization".to_string(),
                    format!("Basic {}", encoded),
                )])
            }
            Some(AuthConfig::Apikey {
                key_name,
                key_value_env,
            }) => Kind::Static(vec![(key_name.clone(), env_var(key_value_env)?)]),
            Some(AuthConfig::Oauth {
                token_env,
                username_env,
                password_env,
                get_token_endpoint,
                token_key,
                body_data,
                get_token_method,
                token_headers,
            }) => match (get_token_endpoint, token_key) {
                (Some(endpoint), Some(token_key)) => {
                    let basic = match (username_env, password_env) {
                        (Some(user), Some(pass)) => Some((env_var(user)?, env_var(pass)?)),
                        _ => None,
                    };
                    Kind::OauthRuntime {
                        runtime: OauthRuntime {
                            endpoint: endpoint.clone(),
                            method: *get_token_method,
                            headers: token_headers
                                .iter()
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect(),
                            body: body_data
                                .as_ref()
                                .map(|b| (b.body_type, b.data.clone())),
                            token_key: token_key.clone(),
                            basic,
                        },
                        cache: Mutex::new(TokenCache::default()),
                    }
                }
                _ => {
                    let name = token_env
                        .as_deref()
                        .ok_or_else(|| AuthError::MissingEnv("tokenEnv".to_string()))?;
                    Kind::Static(vec![(
                        "Authorization".to_string(),
                        format!("Bearer {}", env_var(name)?),
                    )])
                }
            },
            Some(AuthConfig::Azuread {
                client_id_env,
                client_secret_env,
                token_endpoint,
                resource,
            }) => Kind::AzureAd {
                azure: AzureAd {
                    token_endpoint: token_endpoint.clone(),
                    client_id: env_var(client_id_env)?,
                    client_secret: env_var(client_secret_env)?,
                    resource: resource.clone(),
                },
                cache: Mutex::new(TokenCache::default()),
            },
        };
        Ok(Self { kind })
    }

    /// Headers to attach to an outgoing request, fetching or refreshing a
    /// bearer token first when needed.
    pub async fn headers(&self, http: &HttpClient) -> Result<Vec<(String, String)>, AuthError> {
        match &self.kind {
            Kind::None => Ok(Vec::new()),
            Kind::Static(headers) => Ok(headers.clone()),
            Kind::OauthRuntime { runtime, cache } => {
                let token = Self::cached_or_fetch(cache, Self::fetch_oauth(runtime, http)).await?;
                Ok(vec![("Authorization".to_string(), format!("Bearer {}", token))])
            }
            Kind::AzureAd { azure, cache } => {
                let token = Self::cached_or_fetch(cache, Self::fetch_azure(azure, http)).await?;
                Ok(vec![("Authorization".to_string(), format!("Bearer {}", token))])
            }
        }
    }

    /// Single-flight token acquisition: the lock is held across the fetch so
    /// concurrent callers wait and then reuse the fresh token. The fetch
    /// future only runs on a cache miss.
    async fn cached_or_fetch<Fut>(
        cache: &Mutex<TokenCache>,
        fetch: Fut,
    ) -> Result<String, AuthError>
    where
        Fut: std::future::Future<Output = Result<(String, Option<i64>), AuthError>>,
    {
        let mut guard = cache.lock().await;
        let now = Utc::now().timestamp();
        if let Some(token) = guard.fresh_token(now) {
            return Ok(token.to_string());
        }
        let (token, expires_in) = fetch.await?;
        guard.token = Some(token.clone());
        guard.expires_at = Some(now + expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECONDS));
        Ok(token)
    }

    async fn fetch_oauth(
        runtime: &OauthRuntime,
        http: &HttpClient,
    ) -> Result<(String, Option<i64>), AuthError> {
        let mut headers = runtime.headers.clone();
        if let Some((user, pass)) = &runtime.basic {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
            headers.push(("Authorization".to_string(), format!("Basic {}", encoded)));
        }

        let mut query = Vec::new();
        let mut body = None;
        match (&runtime.body, runtime.method) {
            (Some((_, data)), HttpMethod::Get) => {
                query = json_object_to_pairs(data);
            }
            (Some((BodyType::Json, data)), HttpMethod::Post) => {
                body = Some(RequestBody::Json(data.clone()));
            }
            (Some((BodyType::Raw, data)), HttpMethod::Post) => {
                body = Some(RequestBody::Form(json_object_to_pairs(data)));
            }
            (None, _) => {}
        }

        let response = http
            .request(RequestSpec {
                method: runtime.method,
                url: runtime.endpoint.clone(),
                headers,
                query,
                raw_query: Vec::new(),
                body,
            })
            .await?;
        if !response.is_success() {
            return Err(AuthError::TokenStatus(response.status));
        }
        let payload: Value = serde_json::from_slice(&response.body)?;
        let token = extract::lookup(&payload, None, &runtime.token_key)
            .and_then(Value::as_str)
            .or_else(|| payload.get("access_token").and_then(Value::as_str))
            .ok_or_else(|| AuthError::TokenMissing(runtime.token_key.clone()))?
            .to_string();
        Ok((token, expires_in_seconds(&payload)))
    }

    async fn fetch_azure(
        azure: &AzureAd,
        http: &HttpClient,
    ) -> Result<(String, Option<i64>), AuthError> {
        let form = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), azure.client_id.clone()),
            ("client_secret".to_string(), azure.client_secret.clone()),
            ("resource".to_string(), azure.resource.clone()),
        ];
        let response = http
            .request(RequestSpec {
                method: HttpMethod::Post,
                url: azure.token_endpoint.clone(),
                headers: Vec::new(),
                query: Vec::new(),
                raw_query: Vec::new(),
                body: Some(RequestBody::Form(form)),
            })
            .await?;
        if !response.is_success() {
            return Err(AuthError::TokenStatus(response.status));
        }
        let payload: Value = serde_json::from_slice(&response.body)?;
        let token = payload
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::TokenMissing("access_token".to_string()))?
            .to_string();
        Ok((token, expires_in_seconds(&payload)))
    }
}

/// `expires_in` may arrive as a number or a numeric string.
fn expires_in_seconds(payload: &Value) -> Option<i64> {
    match payload.get("expires_in") {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn json_object_to_pairs(data: &Value) -> Vec<(String, String)> {
    match data {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), rendered)
            })
            .collect(),
        _ => Vec::new(),
    }
}
