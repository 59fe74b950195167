// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # HEC Client
//!
//! Client for HTTP Event Collector endpoints with indexer acknowledgment.
//!
//! A batch handed to [`HecClient::send`] is posted to one channel of the
//! endpoint pool. Once a collector accepts it, the batch is tracked as pending
//! under the ack id the collector returned, and a background poller asks each
//! channel which of its pending ids have been committed. Every accepted batch
//! resolves exactly once, as committed, timed out or failed.
//!
//! ## Modules
//!
//! - [`endpoint`]: channel pool with per-channel in-flight caps
//! - [`sender`]: single submission against one channel
//! - [`poller`]: periodic ack status queries and timeout expiry
//! - [`registry`]: pending batches sharded by channel
//! - [`client`]: the `send`/`close` facade

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod ack;
pub mod client;
pub mod config;
pub mod constants;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod http;
pub mod poller;
pub mod registry;
pub mod sender;

pub use ack::{AckCallback, AckId, AckOutcome, BatchReceipt};
pub use client::HecClient;
pub use config::{BusyPolicy, HecClientConfig};
pub use error::{AckFailure, HecError, PollError, SubmitError};
pub use event::{BatchMetadata, Event, EventBatch};
pub use poller::PollerState;
