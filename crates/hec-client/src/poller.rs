// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background acknowledgment polling.
//!
//! On every `ack_poll_interval` tick the poller expires entries older than
//! `event_batch_timeout`, then starts an ack query on every channel that has
//! pending ids and no query already outstanding. Queries run as tasks of
//! their own and resolve their commits as they return, so one slow collector
//! never holds back expiry or queries of the other channels.
//!
//! Ack query:
//! ```json
//! {"acks":[1,2,3]}
//! ```
//! Response:
//! ```json
//! {"acks":{"1":true,"2":false,"3":true}}
//! ```

use crate::ack::AckId;
use crate::config::HecClientConfig;
use crate::constants::ACK_PATH;
use crate::endpoint::{Endpoint, EndpointPool};
use crate::error::PollError;
use crate::registry::PendingRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Lifecycle of the poller task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PollerState {
    Stopped = 0,
    Running = 1,
    Stopping = 2,
}

impl PollerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Poller state shared between the task and its observers.
#[derive(Debug, Clone)]
pub(crate) struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new(state: PollerState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub(crate) fn get(&self) -> PollerState {
        PollerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: PollerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

#[derive(Debug, Serialize)]
struct AckRequest<'a> {
    acks: &'a [AckId],
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    acks: HashMap<String, bool>,
}

/// What a single poll cycle resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub committed: usize,
    pub timed_out: usize,
    pub failed_channels: usize,
}

/// Extracts the committed ids among `requested` from an ack response body.
pub(crate) fn parse_ack_response(
    body: &[u8],
    requested: &[AckId],
) -> Result<Vec<AckId>, PollError> {
    let response: AckResponse = serde_json::from_slice(body)
        .map_err(|e| PollError::Malformed(format!("invalid JSON body: {e}")))?;

    let mut committed = Vec::new();
    for (key, is_committed) in response.acks {
        if !is_committed {
            continue;
        }
        let id = key
            .parse::<u64>()
            .map(AckId)
            .map_err(|_| PollError::Malformed(format!("ack id {key:?} is not a number")))?;
        if requested.contains(&id) {
            committed.push(id);
        }
    }
    committed.sort_unstable();
    Ok(committed)
}

async fn query_channel(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    ids: &[AckId],
) -> Result<Vec<AckId>, PollError> {
    let response = client
        .post(endpoint.url(ACK_PATH))
        .headers(endpoint.headers().clone())
        .json(&AckRequest { acks: ids })
        .send()
        .await?;

    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(PollError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    parse_ack_response(&body, ids)
}

/// Marks a channel as having an ack query outstanding until dropped.
#[derive(Debug)]
struct QueryGuard {
    querying: Arc<[AtomicBool]>,
    channel: usize,
}

impl QueryGuard {
    fn acquire(querying: &Arc<[AtomicBool]>, channel: usize) -> Option<Self> {
        querying
            .get(channel)?
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self {
            querying: Arc::clone(querying),
            channel,
        })
    }
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        if let Some(flag) = self.querying.get(self.channel) {
            flag.store(false, Ordering::Release);
        }
    }
}

#[derive(Debug)]
enum QueryOutcome {
    Committed(usize),
    Failed,
}

fn record(summary: &mut PollSummary, joined: Result<QueryOutcome, JoinError>) {
    match joined {
        Ok(QueryOutcome::Committed(count)) => summary.committed += count,
        Ok(QueryOutcome::Failed) => summary.failed_channels += 1,
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            error!("HEC | Ack query task failed: {}", e);
            summary.failed_channels += 1;
        }
    }
}

/// Periodic acknowledgment poller.
#[derive(Debug)]
pub struct AckPoller {
    client: reqwest::Client,
    pool: Arc<EndpointPool>,
    registry: Arc<PendingRegistry>,
    interval: Duration,
    batch_timeout: Duration,
    querying: Arc<[AtomicBool]>,
    state: SharedState,
}

impl AckPoller {
    #[must_use]
    pub fn new(
        config: &HecClientConfig,
        client: reqwest::Client,
        pool: Arc<EndpointPool>,
        registry: Arc<PendingRegistry>,
    ) -> Self {
        let querying = (0..pool.len()).map(|_| AtomicBool::new(false)).collect();
        Self {
            client,
            pool,
            registry,
            interval: config.ack_poll_interval,
            batch_timeout: config.event_batch_timeout,
            querying,
            state: SharedState::new(PollerState::Stopped),
        }
    }

    #[must_use]
    pub fn state(&self) -> PollerState {
        self.state.get()
    }

    /// Starts an ack query on every channel that has pending ids and no
    /// query outstanding. Each query resolves its own commits on return.
    fn dispatch(&self, queries: &mut JoinSet<QueryOutcome>) {
        for (channel, ids) in self.registry.pending_by_channel() {
            let Some(endpoint) = self.pool.get(channel) else {
                continue;
            };
            let Some(guard) = QueryGuard::acquire(&self.querying, channel) else {
                debug!(
                    "HEC | Ack query on channel {} to {} still outstanding",
                    endpoint.channel(),
                    endpoint.uri()
                );
                continue;
            };

            let client = self.client.clone();
            let registry = Arc::clone(&self.registry);
            let endpoint = Arc::clone(endpoint);
            queries.spawn(async move {
                let _guard = guard;
                match query_channel(&client, &endpoint, &ids).await {
                    Ok(committed) => QueryOutcome::Committed(
                        registry.resolve_committed(endpoint.index(), &committed),
                    ),
                    Err(e) => {
                        warn!(
                            "HEC | Ack query on channel {} to {} failed: {}",
                            endpoint.channel(),
                            endpoint.uri(),
                            e
                        );
                        QueryOutcome::Failed
                    }
                }
            });
        }
    }

    /// Runs one complete cycle: queries every channel with pending ids, waits
    /// for all of them, then expires stale entries. A failing channel keeps
    /// its entries pending for the next cycle.
    pub async fn poll_once(&self) -> PollSummary {
        let mut summary = PollSummary::default();
        let mut queries = JoinSet::new();

        self.dispatch(&mut queries);
        while let Some(joined) = queries.join_next().await {
            record(&mut summary, joined);
        }

        summary.timed_out = self.registry.expire(Instant::now(), self.batch_timeout);
        summary
    }

    /// Starts the polling loop on the current runtime.
    pub fn spawn(self, cancel: CancellationToken) -> PollerHandle {
        let state = self.state.clone();
        state.set(PollerState::Running);
        let task = tokio::spawn(self.run(cancel.clone()));
        PollerHandle {
            cancel,
            task: Some(task),
            state,
        }
    }

    // Every tick expires stale entries before dispatching, whatever queries
    // are still outstanding, so a slow collector only delays its own channels.
    async fn run(self, cancel: CancellationToken) {
        debug!("HEC | Ack poller started, polling every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        let mut queries = JoinSet::new();
        let mut summary = PollSummary::default();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(joined) = queries.join_next(), if !queries.is_empty() => {
                    record(&mut summary, joined);
                }
                _ = ticker.tick() => {
                    summary.timed_out += self.registry.expire(Instant::now(), self.batch_timeout);
                    if summary != PollSummary::default() {
                        debug!(
                            "HEC | Poll cycle: {} committed, {} timed out, {} channels failed, {} pending",
                            summary.committed,
                            summary.timed_out,
                            summary.failed_channels,
                            self.registry.len()
                        );
                    }
                    summary = PollSummary::default();
                    self.dispatch(&mut queries);
                }
            }
        }

        self.drain(queries).await;
        self.state.set(PollerState::Stopped);
        debug!("HEC | Ack poller stopped");
    }

    /// Gives outstanding queries one poll interval to land, then aborts them.
    async fn drain(&self, mut queries: JoinSet<QueryOutcome>) {
        if queries.is_empty() {
            return;
        }
        let mut summary = PollSummary::default();
        let landed = tokio::time::timeout(self.interval, async {
            while let Some(joined) = queries.join_next().await {
                record(&mut summary, joined);
            }
        })
        .await;

        if landed.is_err() {
            debug!(
                "HEC | Aborting {} outstanding ack queries",
                queries.len()
            );
            queries.abort_all();
        }
        if summary.committed > 0 {
            debug!("HEC | {} batches committed while stopping", summary.committed);
        }
    }
}

/// Handle to a running poller. Dropping it cancels the loop without waiting.
#[derive(Debug)]
pub struct PollerHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    state: SharedState,
}

impl PollerHandle {
    #[must_use]
    pub fn state(&self) -> PollerState {
        self.state.get()
    }

    /// Cancels the loop and waits for it to exit. Outstanding queries get one
    /// poll interval to land before they are aborted.
    pub async fn stop(mut self) {
        if self.state() == PollerState::Running {
            self.state.set(PollerState::Stopping);
        }
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("HEC | Ack poller task failed: {}", e);
            }
        }
        self.state.set(PollerState::Stopped);
    }

    pub(crate) fn shared_state(&self) -> SharedState {
        self.state.clone()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
