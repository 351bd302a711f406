//! HTTP client implementing `ReplicaClient`.
//!
//! `HttpReplicaClient` sends replica-internal entity requests to peers and
//! translates status codes back into records and `ReplicaError`s.

use crate::convert::{entity_url, timestamp_from_headers, INTERNAL_HEADER, TIMESTAMP_HEADER};
use ringkv_common::{NodeId, Timestamp};
use ringkv_kv::{ReplicaClient, ReplicaError};
use ringkv_storage::Record;
use std::time::Duration;

/// A reqwest-based replica transport. Connections to peers are pooled by
/// the underlying client.
#[derive(Debug, Clone)]
pub struct HttpReplicaClient {
    client: reqwest::Client,
}

impl HttpReplicaClient {
    /// `timeout` bounds each whole request, connect included.
    pub fn new(timeout: Duration) -> Result<Self, ReplicaError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ReplicaError::Connect(format!("http client: {}", e)))?;
        Ok(Self { client })
    }

    fn url(&self, target: &NodeId, key: &[u8]) -> Result<reqwest::Url, ReplicaError> {
        entity_url(target, key).map_err(ReplicaError::Malformed)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ReplicaError> {
        request
            .header(INTERNAL_HEADER, "true")
            .send()
            .await
            .map_err(transport_error)
    }
}

fn transport_error(error: reqwest::Error) -> ReplicaError {
    if error.is_timeout() {
        ReplicaError::Timeout
    } else {
        ReplicaError::Connect(error.to_string())
    }
}

fn expect_status(
    response: &reqwest::Response,
    expected: reqwest::StatusCode,
) -> Result<(), ReplicaError> {
    if response.status() == expected {
        Ok(())
    } else {
        Err(ReplicaError::Rejected(format!(
            "{} answered {}",
            response.url(),
            response.status()
        )))
    }
}

#[async_trait::async_trait]
impl ReplicaClient for HttpReplicaClient {
    async fn send_put(
        &self,
        target: &NodeId,
        key: &[u8],
        value: &[u8],
        timestamp: Timestamp,
    ) -> Result<(), ReplicaError> {
        let url = self.url(target, key)?;
        let response = self
            .send(
                self.client
                    .put(url)
                    .header(TIMESTAMP_HEADER, timestamp.as_nanos())
                    .body(value.to_vec()),
            )
            .await?;
        expect_status(&response, reqwest::StatusCode::CREATED)
    }

    async fn send_delete(
        &self,
        target: &NodeId,
        key: &[u8],
        timestamp: Timestamp,
    ) -> Result<(), ReplicaError> {
        let url = self.url(target, key)?;
        let response = self
            .send(
                self.client
                    .delete(url)
                    .header(TIMESTAMP_HEADER, timestamp.as_nanos()),
            )
            .await?;
        expect_status(&response, reqwest::StatusCode::ACCEPTED)
    }

    async fn send_get(&self, target: &NodeId, key: &[u8]) -> Result<Option<Record>, ReplicaError> {
        let url = self.url(target, key)?;
        let response = self.send(self.client.get(url)).await?;

        let status = response.status();
        let timestamp =
            timestamp_from_headers(response.headers()).map_err(ReplicaError::Malformed)?;

        match (status, timestamp) {
            (reqwest::StatusCode::OK, Some(timestamp)) => {
                let body = response.bytes().await.map_err(transport_error)?;
                Ok(Some(Record::put(key.to_vec(), body.to_vec(), timestamp)))
            }
            (reqwest::StatusCode::OK, None) => Err(ReplicaError::Malformed(
                "value without timestamp".to_string(),
            )),
            (reqwest::StatusCode::NOT_FOUND, Some(timestamp)) => {
                Ok(Some(Record::tombstone(key.to_vec(), timestamp)))
            }
            (reqwest::StatusCode::NOT_FOUND, None) => Ok(None),
            (status, _) => Err(ReplicaError::Rejected(format!(
                "{} answered {}",
                target, status
            ))),
        }
    }
}
