// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Events and event batches, with their HEC wire encodings.
//!
//! A batch is either [`BatchKind::Json`], sent to the event endpoint as a
//! stream of JSON envelopes, or [`BatchKind::Raw`], sent to the raw endpoint
//! as concatenated event text with the batch metadata in the query string.

use crate::constants::{EVENT_PATH, RAW_PATH};
use serde::Serialize;
use serde_json::{Map, Value};

/// Body of a single event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Json(Value),
    Raw(String),
}

/// One log event with optional per-event metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    payload: EventPayload,
    time: Option<f64>,
    host: Option<String>,
    index: Option<String>,
    source: Option<String>,
    sourcetype: Option<String>,
    fields: Option<Map<String, Value>>,
}

impl Event {
    /// Creates an event carrying structured data.
    #[must_use]
    pub fn json(event: impl Into<Value>) -> Self {
        Self::with_payload(EventPayload::Json(event.into()))
    }

    /// Creates an event carrying a raw text line.
    #[must_use]
    pub fn raw(line: impl Into<String>) -> Self {
        Self::with_payload(EventPayload::Raw(line.into()))
    }

    fn with_payload(payload: EventPayload) -> Self {
        Self {
            payload,
            time: None,
            host: None,
            index: None,
            source: None,
            sourcetype: None,
            fields: None,
        }
    }

    /// Event time in epoch seconds.
    #[must_use]
    pub fn with_time(mut self, time: f64) -> Self {
        self.time = Some(time);
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    #[must_use]
    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_sourcetype(mut self, sourcetype: impl Into<String>) -> Self {
        self.sourcetype = Some(sourcetype.into());
        self
    }

    /// Adds an indexed field. Only JSON batches carry fields.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    #[must_use]
    pub fn sourcetype(&self) -> Option<&str> {
        self.sourcetype.as_deref()
    }

    /// Envelope for the event endpoint. Unset fields fall back to the batch metadata.
    fn envelope<'a>(&'a self, defaults: &'a BatchMetadata) -> JsonEnvelope<'a> {
        JsonEnvelope {
            time: self.time.or(defaults.time),
            host: self.host.as_deref().or(defaults.host.as_deref()),
            source: self.source.as_deref().or(defaults.source.as_deref()),
            sourcetype: self
                .sourcetype
                .as_deref()
                .or(defaults.sourcetype.as_deref()),
            index: self.index.as_deref().or(defaults.index.as_deref()),
            event: &self.payload,
            fields: self.fields.as_ref(),
        }
    }

    fn write_raw(&self, out: &mut Vec<u8>) -> Result<(), serde_json::Error> {
        match &self.payload {
            EventPayload::Raw(line) => out.extend_from_slice(line.as_bytes()),
            EventPayload::Json(value) => serde_json::to_writer(&mut *out, value)?,
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonEnvelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sourcetype: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<&'a str>,
    event: &'a EventPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<&'a Map<String, Value>>,
}

/// Batch-level metadata. JSON batches use it as the default for envelope
/// fields an event leaves unset; raw batches send it as query parameters
/// since raw events have no envelope to carry it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchMetadata {
    pub index: Option<String>,
    pub source: Option<String>,
    pub sourcetype: Option<String>,
    pub host: Option<String>,
    pub time: Option<f64>,
}

impl BatchMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_sourcetype(mut self, sourcetype: impl Into<String>) -> Self {
        self.sourcetype = Some(sourcetype.into());
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    #[must_use]
    pub fn with_time(mut self, time: f64) -> Self {
        self.time = Some(time);
        self
    }

    /// Query parameters for the raw endpoint, in a stable order.
    #[must_use]
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(index) = &self.index {
            params.push(("index", index.clone()));
        }
        if let Some(source) = &self.source {
            params.push(("source", source.clone()));
        }
        if let Some(sourcetype) = &self.sourcetype {
            params.push(("sourcetype", sourcetype.clone()));
        }
        if let Some(host) = &self.host {
            params.push(("host", host.clone()));
        }
        if let Some(time) = self.time {
            params.push(("time", time.to_string()));
        }
        params
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Json,
    Raw,
}

/// A group of events submitted together in one request.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    kind: BatchKind,
    events: Vec<Event>,
    metadata: BatchMetadata,
}

impl EventBatch {
    #[must_use]
    pub fn json() -> Self {
        Self {
            kind: BatchKind::Json,
            events: Vec::new(),
            metadata: BatchMetadata::default(),
        }
    }

    #[must_use]
    pub fn raw(metadata: BatchMetadata) -> Self {
        Self {
            kind: BatchKind::Raw,
            events: Vec::new(),
            metadata,
        }
    }

    /// Replaces the batch metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: BatchMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn add(&mut self, event: Event) {
        self.events.push(event);
    }

    #[must_use]
    pub fn kind(&self) -> BatchKind {
        self.kind
    }

    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    #[must_use]
    pub fn metadata(&self) -> &BatchMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Collector path this batch is posted to.
    #[must_use]
    pub fn path(&self) -> &'static str {
        match self.kind {
            BatchKind::Json => EVENT_PATH,
            BatchKind::Raw => RAW_PATH,
        }
    }

    /// Encodes the batch body.
    pub fn serialize(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::new();
        match self.kind {
            BatchKind::Json => {
                for (i, event) in self.events.iter().enumerate() {
                    if i > 0 {
                        out.push(b'\n');
                    }
                    serde_json::to_writer(&mut out, &event.envelope(&self.metadata))?;
                }
            }
            BatchKind::Raw => {
                for event in &self.events {
                    event.write_raw(&mut out)?;
                }
            }
        }
        Ok(out)
    }
}

impl Extend<Event> for EventBatch {
    fn extend<T: IntoIterator<Item = Event>>(&mut self, iter: T) {
        self.events.extend(iter);
    }
}
