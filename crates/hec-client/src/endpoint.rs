// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Channel selection and per-channel submission caps.
//!
//! The pool is an arena of [`Endpoint`] records, one per channel. A channel
//! is a collector URI plus a channel identifier; with several channels per
//! URI the arena interleaves them (`A0, B0, A1, B1`) so round-robin spreads
//! load across collectors first.
//!
//! # Selection
//!
//! Selection is strict round-robin from a rotating cursor, skipping channels
//! that are at their cap, under back-pressure, or excluded by the caller.
//! Acquiring a slot is a compare-and-swap on the channel's in-flight counter,
//! so the cap holds under any number of concurrent selectors.
//!
//! | Policy  | All channels saturated                                   |
//! |---------|----------------------------------------------------------|
//! | Reject  | `HecError::Busy` immediately                             |
//! | Block   | waits for a released slot, `HecError::Busy` at max_wait |

use crate::config::{BusyPolicy, HecClientConfig};
use crate::constants::SELECT_RECHECK_MILLIS;
use crate::error::HecError;
use crate::http::channel_headers;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// One channel: a collector URI, its channel identifier and its submission counter.
#[derive(Debug)]
pub struct Endpoint {
    index: usize,
    uri: String,
    channel: Uuid,
    headers: HeaderMap,
    in_flight: AtomicUsize,
    max_in_flight: usize,
    backpressure_until: Mutex<Option<Instant>>,
}

impl Endpoint {
    fn new(index: usize, uri: &str, token: &str, max_in_flight: usize) -> Result<Self, HecError> {
        let channel = Uuid::new_v4();
        Ok(Self {
            index,
            uri: uri.trim_end_matches('/').to_string(),
            channel,
            headers: channel_headers(token, &channel)?,
            in_flight: AtomicUsize::new(0),
            max_in_flight,
            backpressure_until: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn channel(&self) -> Uuid {
        self.channel
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub(crate) fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Full URL for a collector path on this channel.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.uri, path)
    }

    fn try_acquire(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_in_flight).then_some(current + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_backpressured(&self, now: Instant) -> bool {
        let guard = self
            .backpressure_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        matches!(*guard, Some(until) if now < until)
    }

    fn set_backpressure(&self, until: Instant) {
        let mut guard = self
            .backpressure_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Some(until);
    }
}

/// The set of channels a client submits to.
#[derive(Debug)]
pub struct EndpointPool {
    endpoints: Vec<Arc<Endpoint>>,
    cursor: AtomicUsize,
    slot_freed: Notify,
    backoff_threshold: Duration,
}

impl EndpointPool {
    pub fn new(config: &HecClientConfig) -> Result<Self, HecError> {
        let mut endpoints = Vec::with_capacity(config.uris.len() * config.channels_per_endpoint);
        for _ in 0..config.channels_per_endpoint {
            for uri in &config.uris {
                let index = endpoints.len();
                endpoints.push(Arc::new(Endpoint::new(
                    index,
                    uri,
                    &config.token,
                    config.max_http_connection_per_channel,
                )?));
            }
        }

        Ok(Self {
            endpoints,
            cursor: AtomicUsize::new(0),
            slot_freed: Notify::new(),
            backoff_threshold: config.backoff_threshold,
        })
    }

    #[must_use]
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<Endpoint>> {
        self.endpoints.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Submissions currently holding a slot, across all channels.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.endpoints.iter().map(|e| e.in_flight()).sum()
    }

    /// Indices of every channel sharing the URI of `index`, itself included.
    #[must_use]
    pub fn siblings(&self, index: usize) -> Vec<usize> {
        let Some(endpoint) = self.endpoints.get(index) else {
            return Vec::new();
        };
        self.endpoints
            .iter()
            .filter(|e| e.uri == endpoint.uri)
            .map(|e| e.index)
            .collect()
    }

    /// Skips the channel until the back-pressure threshold has elapsed.
    pub fn mark_backpressure(&self, index: usize) {
        if let Some(endpoint) = self.endpoints.get(index) {
            warn!(
                "HEC | Channel {} on {} is busy, backing off for {:?}",
                endpoint.channel, endpoint.uri, self.backoff_threshold
            );
            endpoint.set_backpressure(Instant::now() + self.backoff_threshold);
        }
    }

    /// Acquires a slot on the next available channel without waiting.
    pub fn try_select(self: &Arc<Self>, exclude: &[usize]) -> Option<ChannelSlot> {
        let count = self.endpoints.len();
        if count == 0 {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        let now = Instant::now();

        for offset in 0..count {
            let endpoint = &self.endpoints[(start + offset) % count];
            if exclude.contains(&endpoint.index) || endpoint.is_backpressured(now) {
                continue;
            }
            if endpoint.try_acquire() {
                return Some(ChannelSlot {
                    pool: Arc::clone(self),
                    endpoint: Arc::clone(endpoint),
                });
            }
        }
        None
    }

    /// Acquires a slot according to `policy`.
    pub async fn select(
        self: &Arc<Self>,
        policy: BusyPolicy,
        exclude: &[usize],
    ) -> Result<ChannelSlot, HecError> {
        let max_wait = match policy {
            BusyPolicy::Reject => return self.try_select(exclude).ok_or(HecError::Busy),
            BusyPolicy::Block { max_wait } => max_wait,
        };
        let deadline = Instant::now() + max_wait;

        loop {
            // Register interest before checking so a release in between is not missed.
            let notified = self.slot_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(slot) = self.try_select(exclude) {
                return Ok(slot);
            }
            if self.endpoints.iter().all(|e| exclude.contains(&e.index)) {
                return Err(HecError::Busy);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("HEC | No channel freed up within {:?}", max_wait);
                return Err(HecError::Busy);
            }
            let wait = (deadline - now).min(Duration::from_millis(SELECT_RECHECK_MILLIS));
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Waits until no submission holds a slot. Returns `false` if `grace` elapsed first.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.slot_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }
}

/// A held submission slot. Dropping it releases the slot and wakes blocked selectors.
#[derive(Debug)]
pub struct ChannelSlot {
    pool: Arc<EndpointPool>,
    endpoint: Arc<Endpoint>,
}

impl ChannelSlot {
    #[must_use]
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.endpoint.index
    }
}

impl Drop for ChannelSlot {
    fn drop(&mut self) {
        self.endpoint.release();
        self.pool.slot_freed.notify_waiters();
    }
}
