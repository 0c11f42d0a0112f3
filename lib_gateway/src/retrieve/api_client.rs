//! A small asynchronous JSON client around `reqwest`, with middleware retrying
//! transient failures under an exponential backoff.

use std::time::Duration;

use anyhow::Context;
use reqwest::{header::CONTENT_TYPE, Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

/// Transient failures are retried this many times.
const MAX_RETRIES: u32 = 3;

/// The outcome of one request.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized body of a successful response.
    pub data: Option<T>,
    /// The raw body of a failed response.
    pub error_body: Option<String>,
    /// The HTTP status code.
    pub status: u16,
    /// Whether the status was in the 2xx range.
    pub success: bool,
}

/// How a request authenticates.
#[derive(Clone)]
pub enum Credentials {
    /// `Authorization: Bearer <token>`.
    Bearer(String),
    /// HTTP basic authentication.
    Basic {
        /// Account name.
        login: String,
        /// Account password.
        password: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Bearer(_) => f.write_str("Bearer(***)"),
            Credentials::Basic { login, .. } => write!(f, "Basic({login}, ***)"),
        }
    }
}

/// JSON client bound to one base URL.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    timeout: Duration,
}

impl ApiClient {
    /// Creates a client for `base_url` whose requests give up after `timeout`.
    ///
    /// # Errors
    /// Fails when `base_url` is not an absolute URL or the HTTP client cannot
    /// be constructed.
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("Invalid base URL: {base_url}"))?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_RETRIES);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let inner = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Ok(Self {
            inner,
            base_url,
            timeout,
        })
    }

    /// The base URL requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `path` joined onto the base URL. An empty path is the base URL itself.
    pub fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    /// Performs one request and reports its status along with the body.
    ///
    /// # Errors
    /// Network failures, timeouts and undecodable successful bodies.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        credentials: Option<&Credentials>,
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let url = self.endpoint(path)?;
        debug!(%method, url = %url, "Remote request");
        let mut req = self.inner.request(method, url).timeout(self.timeout);
        if !query.is_empty() {
            req = req.query(query);
        }
        match credentials {
            Some(Credentials::Bearer(token)) => req = req.bearer_auth(token),
            Some(Credentials::Basic { login, password }) => req = req.basic_auth(login, Some(password)),
            None => {}
        }
        if let Some(b) = body {
            req = req
                .header(CONTENT_TYPE, "application/json")
                .body(serde_json::to_string(&b)?);
        }

        let response = req.send().await?;
        let status = response.status();
        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
            })
        } else {
            Ok(ApiResponse {
                data: None,
                error_body: response.text().await.ok(),
                status: status.as_u16(),
                success: false,
            })
        }
    }

    /// GETs `path` and fails on any non-2xx status.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        credentials: Option<&Credentials>,
    ) -> anyhow::Result<T> {
        let response = self
            .request::<T, ()>(Method::GET, path, query, credentials, None)
            .await?;
        match response.data {
            Some(data) if response.success => Ok(data),
            _ => anyhow::bail!(
                "HTTP {}: {}",
                response.status,
                response.error_body.unwrap_or_default()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_base_urls() {
        assert!(ApiClient::new("ratings", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn empty_path_is_the_base_url() {
        let client = ApiClient::new("https://catalog.example.net/api/rating", Duration::from_secs(1)).unwrap();
        assert_eq!(client.endpoint("").unwrap().as_str(), "https://catalog.example.net/api/rating");
        assert_eq!(client.endpoint("other").unwrap().as_str(), "https://catalog.example.net/api/other");
    }

    #[test]
    fn credentials_never_print_secrets() {
        let basic = Credentials::Basic {
            login: "me".into(),
            password: "hunter2".into(),
        };
        assert_eq!(format!("{basic:?}"), "Basic(me, ***)");
        assert!(!format!("{:?}", Credentials::Bearer("t0k".into())).contains("t0k"));
    }
}
