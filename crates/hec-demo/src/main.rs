// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{
    env,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    task::JoinSet,
    time::{interval, sleep, Duration},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hec_client::{
    AckCallback, AckOutcome, BatchMetadata, Event, EventBatch, HecClient, HecClientConfig,
};
use serde_json::json;

const EVENTS_PER_BATCH: usize = 100;
const DEFAULT_DEMO_BATCHES: usize = 10;
const DEFAULT_DEMO_DURATION_SECS: u64 = 60;
const PRODUCER_INTERVAL: Duration = Duration::from_millis(500);

/// Tallies resolved batches and logs each resolution.
#[derive(Default)]
struct LoggingCallback {
    committed: AtomicUsize,
    failed: AtomicUsize,
}

impl AckCallback for LoggingCallback {
    fn on_committed(&self, batches: &[Arc<EventBatch>]) {
        let events: usize = batches.iter().map(|b| b.len()).sum();
        self.committed.fetch_add(batches.len(), Ordering::Relaxed);
        info!(
            "{} batches committed ({} events)",
            batches.len(),
            events
        );
    }

    fn on_failed(&self, batches: &[Arc<EventBatch>], outcome: &AckOutcome) {
        self.failed.fetch_add(batches.len(), Ordering::Relaxed);
        warn!("{} batches not committed: {:?}", batches.len(), outcome);
    }
}

#[derive(Clone, Copy)]
enum Producer {
    Json,
    Raw,
}

impl Producer {
    fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Raw => "raw",
        }
    }

    fn batch(self, sequence: usize) -> EventBatch {
        match self {
            Self::Json => {
                let mut batch = EventBatch::json();
                batch.extend((0..EVENTS_PER_BATCH).map(|i| {
                    Event::json(json!({
                        "message": format!("my message: {i}"),
                        "batch": sequence,
                    }))
                    .with_sourcetype("test-json-event")
                }));
                batch
            }
            Self::Raw => {
                let mut batch = EventBatch::raw(
                    BatchMetadata::new()
                        .with_source("hec-demo")
                        .with_sourcetype("test-raw-event"),
                );
                batch.extend(
                    (0..EVENTS_PER_BATCH)
                        .map(|i| Event::raw(format!("batch {sequence} my raw message: {i}\n"))),
                );
                batch
            }
        }
    }
}

async fn produce(
    client: Arc<HecClient>,
    producer: Producer,
    batches: usize,
    cancel: CancellationToken,
) {
    let mut ticker = interval(PRODUCER_INTERVAL);
    for sequence in 0..batches {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match client.send(producer.batch(sequence)).await {
            Ok(receipt) => debug!(
                "{} producer: batch {} accepted with ack id {}",
                producer.name(),
                sequence,
                receipt.ack_id()
            ),
            Err(e) => error!(
                "{} producer: batch {} was not sent: {}",
                producer.name(),
                sequence,
                e
            ),
        }
    }
    debug!("{} producer finished", producer.name());
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var("HEC_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let batches = env::var("HEC_DEMO_BATCHES")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .unwrap_or(DEFAULT_DEMO_BATCHES);
    let duration = env::var("HEC_DEMO_DURATION")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .map_or(
            Duration::from_secs(DEFAULT_DEMO_DURATION_SECS),
            Duration::from_secs,
        );

    let config = match HecClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error reading HEC configuration: {e}");
            return;
        }
    };
    info!("Starting HEC demo with {:?}", config);

    let callback = Arc::new(LoggingCallback::default());
    let client = match HecClient::with_callback(config, Arc::clone(&callback) as Arc<dyn AckCallback>)
    {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Error creating HEC client: {e}");
            return;
        }
    };

    let cancel = CancellationToken::new();
    let mut producers = JoinSet::new();
    for producer in [Producer::Json, Producer::Raw] {
        producers.spawn(produce(
            Arc::clone(&client),
            producer,
            batches,
            cancel.clone(),
        ));
    }

    sleep(duration).await;
    cancel.cancel();
    while let Some(joined) = producers.join_next().await {
        if let Err(e) = joined {
            error!("Producer task failed: {e}");
        }
    }

    client.close().await;
    info!(
        "HEC demo finished: {} batches committed, {} batches failed",
        callback.committed.load(Ordering::Relaxed),
        callback.failed.load(Ordering::Relaxed)
    );
}
