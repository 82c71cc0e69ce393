//! Async HTTP client wrapper.
//!
//! Owns the global in-flight semaphore, the TLS policy, and the
//! response-size cap. Time keys that must reach the API verbatim (for
//! example `created[gte]`) travel as raw query pairs that bypass percent
//! encoding.

use crate::config::HttpMethod;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use url::form_urlencoded;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("TLS enforced but non-HTTPS URL requested: {0}")]
    TlsRequired(String),

    #[error("response body exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("invalid header '{0}'")]
    InvalidHeader(String),
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug)]
pub struct RequestSpec {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Percent-encoded query pairs.
    pub query: Vec<(String, String)>,
    /// Query pairs inserted verbatim.
    pub raw_query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
}

pub struct HttpClient {
    client: reqwest::Client,
    semaphore: Semaphore,
    enforce_tls: bool,
    max_response_bytes: usize,
}

impl HttpClient {
    pub fn new(
        max_global_concurrency: usize,
        enforce_tls: bool,
        max_response_bytes: usize,
    ) -> Result<Self, HttpError> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT);
        if !enforce_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            client: builder.build()?,
            semaphore: Semaphore::new(max_global_concurrency.max(1)),
            enforce_tls,
            max_response_bytes,
        })
    }

    /// Join base URL and endpoint into a full URL.
    pub fn build_url(base_url: &str, endpoint: &str) -> String {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    /// Assemble a query string from encoded and verbatim pairs.
    pub fn build_query_string(query: &[(String, String)], raw_query: &[(String, String)]) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in query {
            serializer.append_pair(key, value);
        }
        let encoded = serializer.finish();
        let raw: Vec<String> = raw_query
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        match (encoded.is_empty(), raw.is_empty()) {
            (true, true) => String::new(),
            (false, true) => encoded,
            (true, false) => raw.join("&"),
            (false, false) => format!("{}&{}", encoded, raw.join("&")),
        }
    }

    /// Execute a request under the global in-flight cap.
    pub async fn request(&self, spec: RequestSpec) -> Result<HttpResponse, HttpError> {
        if self.enforce_tls && spec.url.to_lowercase().starts_with("http://") {
            return Err(HttpError::TlsRequired(spec.url));
        }

        let query_string = Self::build_query_string(&spec.query, &spec.raw_query);
        let full_url = if query_string.is_empty() {
            spec.url.clone()
        } else {
            format!("{}?{}", spec.url, query_string)
        };

        let mut request = match spec.method {
            HttpMethod::Get => self.client.get(&full_url),
            HttpMethod::Post => self.client.post(&full_url),
        };
        for (name, value) in &spec.headers {
            request = request.header(name, value);
        }
        match spec.body {
            Some(RequestBody::Json(json)) => request = request.json(&json),
            Some(RequestBody::Form(pairs)) => request = request.form(&pairs),
            None => {}
        }

        // The permit covers exactly the wire I/O.
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("global semaphore closed");

        tracing::debug!(method = ?spec.method, url = %full_url, "issuing HTTP request");
        let response = request.send().await?;
        let status = response.status().as_u16();

        if let Some(length) = response.content_length() {
            if length as usize > self.max_response_bytes {
                return Err(HttpError::ResponseTooLarge {
                    limit: self.max_response_bytes,
                });
            }
        }
        let body = response.bytes().await?;
        if body.len() > self.max_response_bytes {
            return Err(HttpError::ResponseTooLarge {
                limit: self.max_response_bytes,
            });
        }

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}
