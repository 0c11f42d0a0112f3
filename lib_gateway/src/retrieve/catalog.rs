use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::backend::{BackendError, RemoteCatalog};
use crate::configs::RemoteSettings;
use crate::retrieve::api_client::{ApiClient, Credentials};

/// HTTP timeout for the ratings endpoint.
pub const RATINGS_TIMEOUT: Duration = Duration::from_secs(15);
/// HTTP timeout for the licensing endpoint.
pub const LICENSES_TIMEOUT: Duration = Duration::from_secs(4);

/// [`RemoteCatalog`] over the configured ratings and licensing URLs. Either may
/// be missing, in which case the matching call fails.
pub struct HttpCatalog {
    ratings: Option<ApiClient>,
    licenses: Option<ApiClient>,
}

impl HttpCatalog {
    /// Builds clients for whichever endpoints are configured.
    pub fn from_settings(settings: &RemoteSettings) -> anyhow::Result<Self> {
        let ratings = settings
            .ratings_url
            .as_deref()
            .map(|url| ApiClient::new(url, RATINGS_TIMEOUT))
            .transpose()?;
        let licenses = settings
            .licenses_url
            .as_deref()
            .map(|url| ApiClient::new(url, LICENSES_TIMEOUT))
            .transpose()?;
        Ok(Self { ratings, licenses })
    }

    /// Whether at least one endpoint is configured.
    pub fn is_configured(&self) -> bool {
        self.ratings.is_some() || self.licenses.is_some()
    }
}

fn not_configured(what: &str) -> BackendError {
    BackendError::Failure(format!("{what} service is not configured"))
}

/// Timeouts surface as [`BackendError::Timeout`], everything else as a failure.
fn to_backend_error(err: anyhow::Error) -> BackendError {
    let timed_out = err.chain().any(|cause| {
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            return e.is_timeout();
        }
        matches!(
            cause.downcast_ref::<reqwest_middleware::Error>(),
            Some(reqwest_middleware::Error::Reqwest(e)) if e.is_timeout()
        )
    });
    if timed_out {
        BackendError::Timeout
    } else {
        BackendError::Failure(format!("{err:#}"))
    }
}

#[async_trait]
impl RemoteCatalog for HttpCatalog {
    async fn ratings(&self, uuid: &str) -> Result<Value, BackendError> {
        let client = self.ratings.as_ref().ok_or_else(|| not_configured("Ratings"))?;
        client
            .get_json::<Value>("", &[("uuid", uuid)], None)
            .await
            .map_err(|e| {
                warn!(url = %client.base_url(), error = %e, "Ratings request failed");
                to_backend_error(e)
            })
    }

    /// The service answers either a bare list or `{ licenses: [...] }`.
    async fn licenses(&self, login: &str, password: &str) -> Result<Value, BackendError> {
        let client = self.licenses.as_ref().ok_or_else(|| not_configured("License"))?;
        let credentials = Credentials::Basic {
            login: login.to_string(),
            password: password.to_string(),
        };
        let body = client
            .get_json::<Value>("", &[], Some(&credentials))
            .await
            .map_err(|e| {
                warn!(url = %client.base_url(), error = %e, "License request failed");
                to_backend_error(e)
            })?;
        Ok(match body {
            Value::Object(mut map) if map.get("licenses").is_some_and(Value::is_array) => {
                map.remove("licenses").unwrap_or(Value::Null)
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_endpoints_fail_cleanly() {
        let catalog = HttpCatalog::from_settings(&RemoteSettings::default()).unwrap();
        assert!(!catalog.is_configured());
        let err = catalog.ratings("uuid").await.unwrap_err();
        assert_eq!(err, BackendError::Failure("Ratings service is not configured".into()));
        assert!(catalog.licenses("me", "pw").await.is_err());
    }

    #[test]
    fn invalid_urls_are_rejected_up_front() {
        let settings = RemoteSettings {
            ratings_url: Some("not a url".into()),
            licenses_url: None,
        };
        assert!(HttpCatalog::from_settings(&settings).is_err());
    }

    #[test]
    fn plain_errors_map_to_failures() {
        let err = to_backend_error(anyhow::anyhow!("HTTP 500: boom"));
        assert_eq!(err, BackendError::Failure("HTTP 500: boom".into()));
    }
}
