//! HTTP ingestion transport

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use super::ingestion::IngestionBatch;
use super::transport::{TransmissionError, Transport};
use crate::config::BackendConfig;
use crate::error::MetricsError;
use crate::record::Envelope;

/// Path of the batch ingestion endpoint below the backend host
pub const INGESTION_PATH: &str = "/api/public/ingestion";

/// Transport posting batches to the backend's ingestion API with HTTP Basic
/// auth
///
/// A batch whose span events expand past `max_events` ingestion events is
/// posted as several sequential requests.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    public_key: String,
    secret_key: String,
    timeout: Duration,
    max_events: usize,
}

impl HttpTransport {
    pub fn new(config: &BackendConfig) -> Result<Self, MetricsError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("convo-metrics/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                MetricsError::configuration_error(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            endpoint: ingestion_url(&config.host),
            public_key: config.public_key.clone(),
            secret_key: config.secret_key.clone(),
            timeout: config.request_timeout,
            max_events: usize::MAX,
        })
    }

    /// Cap the number of ingestion events per request
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events.max(1);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    async fn post(&self, payload: &IngestionBatch) -> Result<(), TransmissionError> {
        let body =
            serde_json::to_vec(payload).map_err(|e| TransmissionError::Serialization(e.to_string()))?;

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransmissionError::Timeout(self.timeout)
                } else {
                    TransmissionError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::MULTI_STATUS {
            debug!(events = payload.len(), "Ingestion returned partial success");
        }
        if status.is_success() {
            return Ok(());
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        classify_status(status, message)
    }
}

/// Join the host and the ingestion path without doubling slashes
pub fn ingestion_url(host: &str) -> String {
    format!("{}{}", host.trim_end_matches('/'), INGESTION_PATH)
}

/// Map a non-success HTTP status onto a transmission error
pub fn classify_status(status: StatusCode, body: String) -> Result<(), TransmissionError> {
    if status.is_success() {
        // 207 reports per-event errors; the batch itself was accepted
        return Ok(());
    }

    match status.as_u16() {
        429 => Err(TransmissionError::RateLimited),
        401 | 403 => Err(TransmissionError::Auth(format!("{}: {}", status, body))),
        code => Err(TransmissionError::Backend {
            status_code: code,
            message: body,
        }),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_batch(&self, batch: &[Envelope]) -> Result<(), TransmissionError> {
        let payload = IngestionBatch::from_envelopes(batch)
            .map_err(|e| TransmissionError::Serialization(e.to_string()))?;

        let requests = payload.split(self.max_events);
        if requests.len() > 1 {
            debug!(
                records = batch.len(),
                requests = requests.len(),
                "Splitting ingestion batch"
            );
        }
        for request in &requests {
            self.post(request).await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingestion_url() {
        assert_eq!(
            ingestion_url("http://localhost:3000"),
            "http://localhost:3000/api/public/ingestion"
        );
        assert_eq!(
            ingestion_url("https://cloud.example.com/"),
            "https://cloud.example.com/api/public/ingestion"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::OK, String::new()).is_ok());
        assert!(classify_status(StatusCode::MULTI_STATUS, String::new()).is_ok());
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            Err(TransmissionError::RateLimited)
        );
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "bad key".into()),
            Err(TransmissionError::Auth(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, String::new()),
            Err(TransmissionError::Auth(_))
        ));
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, "upstream".into()),
            Err(TransmissionError::Backend {
                status_code: 502,
                message: "upstream".into()
            })
        );
    }

    #[test]
    fn test_transport_construction() {
        let config = BackendConfig {
            host: "http://collector:3000/".to_string(),
            public_key: "pk".to_string(),
            secret_key: "sk".to_string(),
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(
            transport.endpoint(),
            "http://collector:3000/api/public/ingestion"
        );
        assert_eq!(transport.name(), "http");
        assert_eq!(transport.max_events(), usize::MAX);
        assert_eq!(transport.with_max_events(20).max_events(), 20);
    }
}
