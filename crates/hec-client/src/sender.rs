// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch submission to a single channel.
//!
//! A successful submission answers with the ack id the collector assigned to
//! the batch:
//!
//! ```json
//! {"text":"Success","code":0,"ackId":42}
//! ```
//!
//! Only then is a pending entry recorded. Every failure path leaves the
//! registry untouched so the caller can retry the batch on another channel.

use crate::ack::{AckId, BatchReceipt};
use crate::endpoint::ChannelSlot;
use crate::error::SubmitError;
use crate::event::{BatchKind, EventBatch};
use crate::registry::{InsertError, PendingBatch, PendingRegistry};
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error};

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(rename = "ackId", default)]
    ack_id: Option<AckId>,
}

/// Parses a submission response body into the assigned ack id.
pub(crate) fn parse_submit_response(body: &[u8]) -> Result<AckId, SubmitError> {
    let response: SubmitResponse = serde_json::from_slice(body)
        .map_err(|e| SubmitError::Malformed(format!("invalid JSON body: {e}")))?;

    if let Some(code) = response.code.filter(|code| *code != 0) {
        return Err(SubmitError::Malformed(format!(
            "collector returned code {code}: {}",
            response.text.unwrap_or_default()
        )));
    }

    // Without an ack id the token does not have indexer acknowledgment enabled.
    response.ack_id.ok_or_else(|| {
        SubmitError::Malformed("response has no ackId, is indexer acknowledgment enabled?".to_string())
    })
}

fn content_type(kind: BatchKind) -> &'static str {
    match kind {
        BatchKind::Json => "application/json",
        BatchKind::Raw => "text/plain",
    }
}

/// Posts batches and records the accepted ones as pending.
#[derive(Debug, Clone)]
pub struct BatchSender {
    client: reqwest::Client,
    registry: Arc<PendingRegistry>,
}

impl BatchSender {
    #[must_use]
    pub fn new(client: reqwest::Client, registry: Arc<PendingRegistry>) -> Self {
        Self { client, registry }
    }

    /// Submits `payload`, the encoded form of `batch`, on the slot's channel.
    pub async fn submit(
        &self,
        slot: &ChannelSlot,
        batch: &Arc<EventBatch>,
        payload: Bytes,
    ) -> Result<BatchReceipt, SubmitError> {
        let endpoint = slot.endpoint();
        let request = self
            .client
            .post(endpoint.url(batch.path()))
            .headers(endpoint.headers().clone())
            .header(CONTENT_TYPE, content_type(batch.kind()))
            .body(payload);
        let request = match batch.kind() {
            BatchKind::Json => request,
            BatchKind::Raw => request.query(&batch.metadata().query_params()),
        };

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&body).into_owned();
            debug!(
                "HEC | Submission to {} rejected with {}: {}",
                endpoint.uri(),
                status,
                body
            );
            return Err(SubmitError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let ack_id = parse_submit_response(&body)?;
        let (pending, receipt) =
            PendingBatch::new(ack_id, endpoint.index(), Instant::now(), Arc::clone(batch));

        match self.registry.insert(pending) {
            Ok(()) => {
                debug!(
                    "HEC | Batch of {} events accepted on channel {} with ack id {}",
                    batch.len(),
                    endpoint.channel(),
                    ack_id
                );
                Ok(receipt)
            }
            Err(InsertError::Closed(_)) => Err(SubmitError::Closed),
            Err(InsertError::Duplicate(_)) => {
                error!(
                    "HEC | Collector {} reissued pending ack id {} on channel {}",
                    endpoint.uri(),
                    ack_id,
                    endpoint.channel()
                );
                Err(SubmitError::Malformed(format!(
                    "ack id {ack_id} is already pending on this channel"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BusyPolicy, HecClientConfig};
    use crate::endpoint::EndpointPool;
    use crate::event::{BatchMetadata, Event};
    use crate::http::build_client;
    use mockito::{Matcher, Server};

    #[test]
    fn test_parse_submit_response() {
        assert_eq!(
            parse_submit_response(br#"{"text":"Success","code":0,"ackId":42}"#),
            Ok(AckId(42))
        );
        assert!(matches!(
            parse_submit_response(br#"{"text":"Success","code":0}"#),
            Err(SubmitError::Malformed(_))
        ));
        assert!(matches!(
            parse_submit_response(br#"{"text":"Invalid token","code":4}"#),
            Err(SubmitError::Malformed(_))
        ));
        assert!(matches!(
            parse_submit_response(b"<html>gateway</html>"),
            Err(SubmitError::Malformed(_))
        ));
    }

    struct Fixture {
        pool: Arc<EndpointPool>,
        registry: Arc<PendingRegistry>,
        sender: BatchSender,
    }

    fn fixture(uri: &str) -> Fixture {
        let config = HecClientConfig::new([uri], "mock-token");
        let pool = Arc::new(EndpointPool::new(&config).unwrap());
        let registry = Arc::new(PendingRegistry::new(pool.len(), None));
        let sender = BatchSender::new(build_client(&config).unwrap(), Arc::clone(&registry));
        Fixture {
            pool,
            registry,
            sender,
        }
    }

    fn json_batch() -> Arc<EventBatch> {
        let mut batch = EventBatch::json();
        batch.add(Event::raw("my message: 0"));
        Arc::new(batch)
    }

    #[tokio::test]
    async fn test_submit_records_pending_batch() {
        let mut server = Server::new_async().await;
        let fixture = fixture(&server.url());
        let channel = fixture.pool.endpoints()[0].channel().to_string();

        let mock = server
            .mock("POST", "/services/collector/event")
            .match_header("Authorization", "Splunk mock-token")
            .match_header("X-Splunk-Request-Channel", channel.as_str())
            .match_header("Content-Type", "application/json")
            .with_status(200)
            .with_body(r#"{"text":"Success","code":0,"ackId":3}"#)
            .create_async()
            .await;

        let batch = json_batch();
        let payload = Bytes::from(batch.serialize().unwrap());
        let slot = fixture.pool.select(BusyPolicy::Reject, &[]).await.unwrap();
        let receipt = fixture
            .sender
            .submit(&slot, &batch, payload)
            .await
            .expect("submission should succeed");

        mock.assert_async().await;
        assert_eq!(receipt.ack_id(), AckId(3));
        assert_eq!(
            fixture.registry.pending_by_channel(),
            vec![(0, vec![AckId(3)])]
        );
    }

    #[tokio::test]
    async fn test_submit_raw_batch_sends_metadata_as_query() {
        let mut server = Server::new_async().await;
        let fixture = fixture(&server.url());

        let mock = server
            .mock("POST", "/services/collector/raw")
            .match_header("Content-Type", "text/plain")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("index".into(), "main".into()),
                Matcher::UrlEncoded("sourcetype".into(), "test-raw-event".into()),
            ]))
            .match_body("my raw message: 0\nmy raw message: 1\n")
            .with_status(200)
            .with_body(r#"{"text":"Success","code":0,"ackId":0}"#)
            .create_async()
            .await;

        let mut batch = EventBatch::raw(
            BatchMetadata::new()
                .with_index("main")
                .with_sourcetype("test-raw-event"),
        );
        batch.add(Event::raw("my raw message: 0\n"));
        batch.add(Event::raw("my raw message: 1\n"));
        let batch = Arc::new(batch);
        let payload = Bytes::from(batch.serialize().unwrap());

        let slot = fixture.pool.select(BusyPolicy::Reject, &[]).await.unwrap();
        let receipt = fixture.sender.submit(&slot, &batch, payload).await.unwrap();

        mock.assert_async().await;
        assert_eq!(receipt.ack_id(), AckId(0));
    }

    #[tokio::test]
    async fn test_submit_failure_leaves_registry_untouched() {
        let mut server = Server::new_async().await;
        let fixture = fixture(&server.url());

        let _mock = server
            .mock("POST", "/services/collector/event")
            .with_status(503)
            .with_body(r#"{"text":"Server is busy","code":9}"#)
            .create_async()
            .await;

        let batch = json_batch();
        let payload = Bytes::from(batch.serialize().unwrap());
        let slot = fixture.pool.select(BusyPolicy::Reject, &[]).await.unwrap();
        let err = fixture
            .sender
            .submit(&slot, &batch, payload)
            .await
            .expect_err("submission should fail");

        assert!(err.is_server_busy());
        assert!(fixture.registry.is_empty());
    }

    #[tokio::test]
    async fn test_submit_without_ack_id_is_malformed() {
        let mut server = Server::new_async().await;
        let fixture = fixture(&server.url());

        let _mock = server
            .mock("POST", "/services/collector/event")
            .with_status(200)
            .with_body(r#"{"text":"Success","code":0}"#)
            .create_async()
            .await;

        let batch = json_batch();
        let payload = Bytes::from(batch.serialize().unwrap());
        let slot = fixture.pool.select(BusyPolicy::Reject, &[]).await.unwrap();
        let err = fixture.sender.submit(&slot, &batch, payload).await.unwrap_err();

        assert!(matches!(err, SubmitError::Malformed(_)));
        assert!(fixture.registry.is_empty());
    }

    #[tokio::test]
    async fn test_submit_after_registry_closed() {
        let mut server = Server::new_async().await;
        let fixture = fixture(&server.url());

        let _mock = server
            .mock("POST", "/services/collector/event")
            .with_status(200)
            .with_body(r#"{"text":"Success","code":0,"ackId":1}"#)
            .create_async()
            .await;

        fixture.registry.close();
        let batch = json_batch();
        let payload = Bytes::from(batch.serialize().unwrap());
        let slot = fixture.pool.select(BusyPolicy::Reject, &[]).await.unwrap();
        let err = fixture.sender.submit(&slot, &batch, payload).await.unwrap_err();

        assert_eq!(err, SubmitError::Closed);
        assert!(fixture.registry.is_empty());
    }

    #[tokio::test]
    async fn test_submit_connection_refused() {
        let fixture = fixture("http://127.0.0.1:1");
        let batch = json_batch();
        let payload = Bytes::from(batch.serialize().unwrap());
        let slot = fixture.pool.select(BusyPolicy::Reject, &[]).await.unwrap();

        let err = fixture.sender.submit(&slot, &batch, payload).await.unwrap_err();
        assert!(matches!(err, SubmitError::Transport(_)));
        assert!(fixture.registry.is_empty());
    }
}
