// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire constants for the HTTP Event Collector API and client defaults.
//!
//! # Endpoints
//!
//! - `/services/collector/event`: JSON envelopes, one per event, newline separated
//! - `/services/collector/raw`: raw event text, batch metadata as query parameters
//! - `/services/collector/ack`: acknowledgment status query for a channel

/// Path for JSON event batches.
pub const EVENT_PATH: &str = "/services/collector/event";

/// Path for raw event batches.
pub const RAW_PATH: &str = "/services/collector/raw";

/// Path for acknowledgment status queries.
pub const ACK_PATH: &str = "/services/collector/ack";

/// Header carrying the channel identifier. Ack ids are scoped to this channel
/// on the collector side, so every request of a channel must carry it.
pub const CHANNEL_HEADER: &str = "X-Splunk-Request-Channel";

/// Prefix of the `Authorization` header value, followed by the token.
pub const AUTHORIZATION_SCHEME: &str = "Splunk";

pub const DEFAULT_ACK_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_EVENT_BATCH_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_HTTP_CONNECTION_PER_CHANNEL: usize = 2;
pub const DEFAULT_CHANNELS_PER_ENDPOINT: usize = 1;
pub const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_BUSY_WAIT_SECS: u64 = 30;
pub const DEFAULT_MAX_SUBMIT_ATTEMPTS: usize = 3;
pub const DEFAULT_BACKOFF_THRESHOLD_SECS: u64 = 60;
pub const DEFAULT_CLOSE_GRACE_PERIOD_SECS: u64 = 10;

/// Idle pooled connections are dropped after this long when keep-alive is on.
pub(crate) const POOL_IDLE_TIMEOUT_SECS: u64 = 270;

/// TCP keep-alive interval when keep-alive is on.
pub(crate) const TCP_KEEPALIVE_SECS: u64 = 120;

/// Upper bound on a single wait inside a blocking channel selection, so that
/// channels leaving back-pressure are noticed without a release notification.
pub(crate) const SELECT_RECHECK_MILLIS: u64 = 100;
