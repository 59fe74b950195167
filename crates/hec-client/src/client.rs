// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::ack::{AckCallback, BatchReceipt};
use crate::config::HecClientConfig;
use crate::endpoint::EndpointPool;
use crate::error::{HecError, SubmitError};
use crate::event::EventBatch;
use crate::http::build_client;
use crate::poller::{AckPoller, PollerHandle, PollerState, SharedState};
use crate::registry::PendingRegistry;
use crate::sender::BatchSender;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Client submitting event batches to one or more collectors and tracking
/// their acknowledgment.
///
/// Construction spawns the ack poller, so it must happen inside a tokio
/// runtime. Call [`HecClient::close`] to resolve every pending batch before
/// dropping the client; batches still pending at drop resolve as abandoned.
///
/// The HTTP client, and with it every pooled connection, is held by the
/// sender and the poller only, and both let go of it during `close`.
pub struct HecClient {
    config: Arc<HecClientConfig>,
    pool: Arc<EndpointPool>,
    registry: Arc<PendingRegistry>,
    sender: Mutex<Option<BatchSender>>,
    poller: tokio::sync::Mutex<Option<PollerHandle>>,
    poller_state: SharedState,
    closed: AtomicBool,
}

impl std::fmt::Debug for HecClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HecClient")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("registry", &self.registry)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl HecClient {
    pub fn new(config: HecClientConfig) -> Result<Self, HecError> {
        let client = build_client(&config)?;
        Self::from_parts(config, client, None)
    }

    /// Like [`HecClient::new`], reporting every resolved batch to `callback`.
    pub fn with_callback(
        config: HecClientConfig,
        callback: Arc<dyn AckCallback>,
    ) -> Result<Self, HecError> {
        let client = build_client(&config)?;
        Self::from_parts(config, client, Some(callback))
    }

    /// Builds a client around an existing HTTP client. Connections are only
    /// released on close if the caller keeps no clone of `http_client`.
    pub fn from_parts(
        config: HecClientConfig,
        http_client: reqwest::Client,
        callback: Option<Arc<dyn AckCallback>>,
    ) -> Result<Self, HecError> {
        config.validate()?;

        let pool = Arc::new(EndpointPool::new(&config)?);
        let registry = Arc::new(PendingRegistry::new(pool.len(), callback));
        let sender = BatchSender::new(http_client.clone(), Arc::clone(&registry));
        let poller = AckPoller::new(
            &config,
            http_client,
            Arc::clone(&pool),
            Arc::clone(&registry),
        );
        let handle = poller.spawn(CancellationToken::new());
        let poller_state = handle.shared_state();

        info!(
            "HEC | Client started with {} channels over {} endpoints",
            pool.len(),
            config.uris.len()
        );

        Ok(Self {
            config: Arc::new(config),
            pool,
            registry,
            sender: Mutex::new(Some(sender)),
            poller: tokio::sync::Mutex::new(Some(handle)),
            poller_state,
            closed: AtomicBool::new(false),
        })
    }

    /// Submits a batch and returns once a collector has accepted it.
    ///
    /// The returned receipt resolves when the batch is committed, times out,
    /// or the client is closed. A failed submission is retried on a
    /// different channel, up to `max_submit_attempts` channels in total.
    pub async fn send(&self, batch: EventBatch) -> Result<BatchReceipt, HecError> {
        if self.is_closed() {
            return Err(HecError::ClientClosed);
        }
        if batch.is_empty() {
            return Err(HecError::EmptyBatch);
        }
        let Some(sender) = self.sender() else {
            return Err(HecError::ClientClosed);
        };

        let payload = batch
            .serialize()
            .map(Bytes::from)
            .map_err(|e| HecError::Serialization(e.to_string()))?;
        let batch = Arc::new(batch);

        let max_attempts = self.config.max_submit_attempts.min(self.pool.len());
        let mut excluded: Vec<usize> = Vec::new();
        let mut last_error: Option<SubmitError> = None;
        let mut attempts = 0;

        while attempts < max_attempts {
            let slot = match self.pool.select(self.config.busy_policy, &excluded).await {
                Ok(slot) => slot,
                Err(HecError::Busy) if last_error.is_some() => break,
                Err(e) => return Err(e),
            };
            if self.is_closed() {
                return Err(HecError::ClientClosed);
            }
            attempts += 1;

            match sender.submit(&slot, &batch, payload.clone()).await {
                Ok(receipt) => return Ok(receipt),
                Err(SubmitError::Closed) => return Err(HecError::ClientClosed),
                Err(e) => {
                    let endpoint = slot.endpoint();
                    warn!(
                        "HEC | Submission to {} on channel {} failed (attempt {}/{}): {}",
                        endpoint.uri(),
                        endpoint.channel(),
                        attempts,
                        max_attempts,
                        e
                    );
                    if e.is_server_busy() {
                        self.pool.mark_backpressure(slot.index());
                    }
                    match e {
                        // The collector itself is unreachable, skip its other channels too.
                        SubmitError::Transport(_) | SubmitError::Timeout => {
                            excluded.extend(self.pool.siblings(slot.index()));
                        }
                        _ => excluded.push(slot.index()),
                    }
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(last_error) => Err(HecError::NoEndpointAvailable {
                attempts,
                last_error,
            }),
            None => Err(HecError::Busy),
        }
    }

    /// Stops the client. New sends are rejected and in-flight submissions get
    /// up to `close_grace_period` to finish. Then the poller stops, every
    /// batch still pending resolves with `ClientClosed`, and pooled HTTP
    /// connections are closed once the last in-flight request lets go of them.
    ///
    /// Calling `close` again is a no-op.
    pub async fn close(&self) {
        let mut poller = self.poller.lock().await;
        self.closed.store(true, Ordering::Release);
        let Some(handle) = poller.take() else {
            return;
        };

        info!("HEC | Closing client with {} batches pending", self.registry.len());
        if !self.pool.wait_idle(self.config.close_grace_period).await {
            warn!(
                "HEC | {} submissions still in flight after {:?}",
                self.pool.in_flight(),
                self.config.close_grace_period
            );
        }

        // Later sends see no sender; stragglers past the grace period keep
        // their own handle until they return.
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());

        handle.stop().await;
        let failed = self.registry.close();
        if failed > 0 {
            warn!("HEC | {} batches were not acknowledged before close", failed);
        }
        debug!("HEC | Client closed");
    }

    fn sender(&self) -> Option<BatchSender> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Batches accepted by a collector and not yet resolved.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn poller_state(&self) -> PollerState {
        self.poller_state.get()
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    #[must_use]
    pub fn config(&self) -> &HecClientConfig {
        &self.config
    }
}
