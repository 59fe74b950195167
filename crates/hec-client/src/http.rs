// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction and per-channel request headers.
//!
//! One `reqwest::Client` is shared by every channel of a client: it owns the
//! connection pool, TLS settings and request timeout. Per-channel state (the
//! channel identifier) travels as headers built once per channel.

use crate::config::HecClientConfig;
use crate::constants::{
    AUTHORIZATION_SCHEME, CHANNEL_HEADER, POOL_IDLE_TIMEOUT_SECS, TCP_KEEPALIVE_SECS,
};
use crate::error::HecError;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Builds the HTTP client shared by submissions and ack queries.
///
/// - TLS verification is skipped when `disable_ssl_cert_verification` is set
/// - With keep-alive, idle connections stay pooled (one per allowed submission)
///   and TCP keep-alive detects dead peers
/// - Without keep-alive, connections are not pooled at all
pub fn build_client(config: &HecClientConfig) -> Result<reqwest::Client, HecError> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(config.socket_timeout);

    if config.disable_ssl_cert_verification {
        warn!("HEC | TLS certificate verification is disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder = if config.http_keep_alive {
        builder
            .pool_max_idle_per_host(
                config.max_http_connection_per_channel * config.channels_per_endpoint,
            )
            .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
            .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
    } else {
        builder.pool_max_idle_per_host(0)
    };

    builder
        .build()
        .map_err(|e| HecError::HttpClient(e.to_string()))
}

/// Headers sent with every request on one channel, whatever its body.
pub(crate) fn channel_headers(token: &str, channel: &Uuid) -> Result<HeaderMap, HecError> {
    let mut headers = HeaderMap::new();

    let mut authorization = HeaderValue::from_str(&format!("{AUTHORIZATION_SCHEME} {token}"))
        .map_err(|_| HecError::InvalidConfig("HEC token is not a valid header value".to_string()))?;
    authorization.set_sensitive(true);
    headers.insert(AUTHORIZATION, authorization);

    let channel_value = HeaderValue::from_str(&channel.to_string())
        .map_err(|e| HecError::InvalidConfig(e.to_string()))?;
    headers.insert(CHANNEL_HEADER, channel_value);
    Ok(headers)
}
