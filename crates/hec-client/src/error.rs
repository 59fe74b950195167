// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the HEC client.
//!
//! Errors are split by where they surface:
//! - [`HecError`] is returned synchronously by the client facade and configuration.
//! - [`SubmitError`] describes a single failed submission attempt against one channel.
//! - [`PollError`] describes a failed acknowledgment query against one channel.
//! - [`AckFailure`] is the reason carried by a batch that resolved as failed.

use reqwest::StatusCode;

/// Errors returned to callers of the client.
#[derive(Debug, thiserror::Error)]
pub enum HecError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("Event batch is empty")]
    EmptyBatch,

    #[error("Failed to serialize event batch: {0}")]
    Serialization(String),

    #[error("All channels are busy")]
    Busy,

    #[error("No endpoint accepted the batch after {attempts} attempts: {last_error}")]
    NoEndpointAvailable {
        attempts: usize,
        last_error: SubmitError,
    },

    #[error("Client is closed")]
    ClientClosed,
}

/// A single submission attempt failed. The registry is never touched when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("client is closed")]
    Closed,
}

impl SubmitError {
    /// The collector answered 503, which HEC uses to signal that the indexer queue is full.
    #[must_use]
    pub fn is_server_busy(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status == StatusCode::SERVICE_UNAVAILABLE.as_u16())
    }
}

impl From<reqwest::Error> for SubmitError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// An acknowledgment status query against one channel failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for PollError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Reason attached to a batch that resolved as failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AckFailure {
    #[error("client closed before the batch was acknowledged")]
    ClientClosed,

    #[error("batch was dropped without being resolved")]
    Abandoned,
}
