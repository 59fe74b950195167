// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Acknowledgment identifiers and per-batch completion signals.
//!
//! Every accepted batch gets exactly one [`AckOutcome`]. The outcome is
//! delivered through the [`BatchReceipt`] returned by `send` and, when
//! configured, through an [`AckCallback`] shared by all batches of a client.

use crate::error::AckFailure;
use crate::event::EventBatch;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Identifier issued by the collector when it accepts a batch. Unique per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckId(pub u64);

impl fmt::Display for AckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal state of a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The collector reported the batch as durably indexed.
    Committed,
    /// The batch will never be committed by this client.
    Failed(AckFailure),
    /// The batch was not reported committed within the event batch timeout.
    TimedOut,
}

impl AckOutcome {
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Observer notified when batches resolve. Called from the poller task and
/// from `close`, so implementations should not block.
pub trait AckCallback: Send + Sync {
    fn on_committed(&self, batches: &[Arc<EventBatch>]);
    fn on_failed(&self, batches: &[Arc<EventBatch>], outcome: &AckOutcome);
}

/// Sending half of a batch's completion signal. Consumed on use, so a batch
/// can be completed at most once.
#[derive(Debug)]
pub(crate) struct Completion {
    tx: oneshot::Sender<AckOutcome>,
}

impl Completion {
    pub(crate) fn new(ack_id: AckId, channel: usize) -> (Self, BatchReceipt) {
        let (tx, rx) = oneshot::channel();
        (
            Self { tx },
            BatchReceipt {
                ack_id,
                channel,
                rx,
            },
        )
    }

    pub(crate) fn complete(self, outcome: AckOutcome) {
        // The caller may have dropped its receipt; the callback still observes the outcome.
        let _ = self.tx.send(outcome);
    }
}

/// Future resolving to the outcome of one accepted batch.
#[derive(Debug)]
pub struct BatchReceipt {
    ack_id: AckId,
    channel: usize,
    rx: oneshot::Receiver<AckOutcome>,
}

impl BatchReceipt {
    #[must_use]
    pub fn ack_id(&self) -> AckId {
        self.ack_id
    }

    /// Index of the channel that accepted the batch.
    #[must_use]
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Returns the outcome if the batch has already resolved.
    pub fn try_outcome(&mut self) -> Option<AckOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(AckOutcome::Failed(AckFailure::Abandoned))
            }
        }
    }
}

impl Future for BatchReceipt {
    type Output = AckOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(AckOutcome::Failed(AckFailure::Abandoned)))
    }
}
