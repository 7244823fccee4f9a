//! Best-effort geo-IP lookup for endpoint metadata.

use async_trait::async_trait;

use crate::status_log::EndpointMetadata;

/// Why a lookup failed. Never fatal to the forwarder.
#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    /// The lookup request could not be completed.
    #[error("geo lookup request failed: {0}")]
    Request(String),

    /// The service answered with something unusable.
    #[error("geo lookup returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Resolves an IP address to location metadata.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    /// Looks up `ip`.
    async fn locate(&self, ip: &str) -> Result<EndpointMetadata, GeoError>;
}

/// Answers every lookup with the same metadata.
#[derive(Debug, Clone, Default)]
pub struct StaticGeoLocator {
    metadata: EndpointMetadata,
}

impl StaticGeoLocator {
    /// Creates a locator returning `metadata`.
    pub fn new(metadata: EndpointMetadata) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl GeoLocator for StaticGeoLocator {
    async fn locate(&self, ip: &str) -> Result<EndpointMetadata, GeoError> {
        let mut metadata = self.metadata.clone();
        metadata.ip_address.get_or_insert_with(|| ip.to_string());
        Ok(metadata)
    }
}

#[cfg(feature = "http-client")]
pub use remote::{HttpGeoLocator, DEFAULT_GEO_URL};

#[cfg(feature = "http-client")]
mod remote {
    use std::time::Duration;

    use async_trait::async_trait;
    use tracing::debug;

    use super::{GeoError, GeoLocator};
    use crate::status_log::EndpointMetadata;

    /// Default lookup service.
    pub const DEFAULT_GEO_URL: &str = "https://ipinfo.io";

    /// Queries `GET {base_url}/{ip}/json`.
    #[derive(Debug, Clone)]
    pub struct HttpGeoLocator {
        client: reqwest::Client,
        base_url: String,
    }

    impl HttpGeoLocator {
        /// Creates a locator against [`DEFAULT_GEO_URL`].
        pub fn new() -> Result<Self, GeoError> {
            Self::with_base_url(DEFAULT_GEO_URL)
        }

        /// Creates a locator against `base_url`.
        pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, GeoError> {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .map_err(|e| GeoError::Request(format!("failed to create HTTP client: {}", e)))?;
            Ok(Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
            })
        }
    }

    #[async_trait]
    impl GeoLocator for HttpGeoLocator {
        async fn locate(&self, ip: &str) -> Result<EndpointMetadata, GeoError> {
            let url = format!("{}/{}/json", self.base_url, ip);
            debug!(%url, "looking up endpoint location");
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| GeoError::Request(e.to_string()))?
                .error_for_status()
                .map_err(|e| GeoError::Request(e.to_string()))?;
            let mut metadata: EndpointMetadata = response
                .json()
                .await
                .map_err(|e| GeoError::InvalidResponse(e.to_string()))?;
            metadata.ip_address.get_or_insert_with(|| ip.to_string());
            Ok(metadata)
        }
    }
}
