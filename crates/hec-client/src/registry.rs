// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared state of every batch between submission and resolution.
//!
//! The registry has one shard per channel, each behind its own lock, since
//! ack ids are only unique within a channel and the poller works channel by
//! channel. Every transition that resolves a batch removes it from its shard
//! under that shard's lock before signaling it, so a batch can be resolved by
//! exactly one of: a commit, a timeout, or close.

use crate::ack::{AckCallback, AckId, AckOutcome, BatchReceipt, Completion};
use crate::error::AckFailure;
use crate::event::EventBatch;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A batch accepted by a channel and waiting for its commit.
#[derive(Debug)]
pub struct PendingBatch {
    ack_id: AckId,
    channel: usize,
    submitted_at: Instant,
    batch: Arc<EventBatch>,
    completion: Completion,
}

impl PendingBatch {
    /// Creates the entry and the receipt its caller will wait on.
    pub(crate) fn new(
        ack_id: AckId,
        channel: usize,
        submitted_at: Instant,
        batch: Arc<EventBatch>,
    ) -> (Self, BatchReceipt) {
        let (completion, receipt) = Completion::new(ack_id, channel);
        (
            Self {
                ack_id,
                channel,
                submitted_at,
                batch,
                completion,
            },
            receipt,
        )
    }

    #[must_use]
    pub fn ack_id(&self) -> AckId {
        self.ack_id
    }

    #[must_use]
    pub fn channel(&self) -> usize {
        self.channel
    }

    #[must_use]
    pub fn batch(&self) -> &Arc<EventBatch> {
        &self.batch
    }

    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.submitted_at)
    }
}

/// Why an insert was refused. The entry is handed back unresolved.
#[derive(Debug)]
pub(crate) enum InsertError {
    Closed(PendingBatch),
    Duplicate(PendingBatch),
}

#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<AckId, PendingBatch>,
    closed: bool,
}

/// Map from (channel, ack id) to pending batch.
pub struct PendingRegistry {
    shards: Vec<Mutex<Shard>>,
    callback: Option<Arc<dyn AckCallback>>,
}

impl std::fmt::Debug for PendingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRegistry")
            .field("channels", &self.shards.len())
            .field("pending", &self.len())
            .finish()
    }
}

impl PendingRegistry {
    #[must_use]
    pub fn new(channels: usize, callback: Option<Arc<dyn AckCallback>>) -> Self {
        Self {
            shards: (0..channels).map(|_| Mutex::new(Shard::default())).collect(),
            callback,
        }
    }

    fn shard(&self, channel: usize) -> Option<MutexGuard<'_, Shard>> {
        self.shards
            .get(channel)
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn insert(&self, pending: PendingBatch) -> Result<(), InsertError> {
        let Some(mut shard) = self.shard(pending.channel) else {
            return Err(InsertError::Closed(pending));
        };
        if shard.closed {
            return Err(InsertError::Closed(pending));
        }
        if shard.entries.contains_key(&pending.ack_id) {
            return Err(InsertError::Duplicate(pending));
        }
        shard.entries.insert(pending.ack_id, pending);
        Ok(())
    }

    /// Number of unresolved batches.
    #[must_use]
    pub fn len(&self) -> usize {
        (0..self.shards.len())
            .filter_map(|channel| self.shard(channel))
            .map(|shard| shard.entries.len())
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        (0..self.shards.len())
            .filter_map(|channel| self.shard(channel))
            .all(|shard| shard.closed)
    }

    /// Pending ack ids of every channel that has any, sorted per channel.
    #[must_use]
    pub fn pending_by_channel(&self) -> Vec<(usize, Vec<AckId>)> {
        (0..self.shards.len())
            .filter_map(|channel| {
                let shard = self.shard(channel)?;
                if shard.entries.is_empty() {
                    return None;
                }
                let mut ids: Vec<AckId> = shard.entries.keys().copied().collect();
                ids.sort_unstable();
                Some((channel, ids))
            })
            .collect()
    }

    /// Resolves the given ids of one channel as committed. Ids that are no
    /// longer pending are ignored. Returns how many batches resolved.
    pub fn resolve_committed(&self, channel: usize, ids: &[AckId]) -> usize {
        let Some(mut shard) = self.shard(channel) else {
            return 0;
        };
        let committed: Vec<PendingBatch> = ids
            .iter()
            .filter_map(|id| shard.entries.remove(id))
            .collect();
        drop(shard);
        let count = committed.len();
        if count > 0 {
            debug!("HEC | {count} batches committed on channel {channel}");
            self.complete(committed, AckOutcome::Committed);
        }
        count
    }

    /// Resolves every batch older than `timeout` as timed out.
    pub fn expire(&self, now: Instant, timeout: Duration) -> usize {
        let mut expired = Vec::new();
        for mut shard in (0..self.shards.len()).filter_map(|channel| self.shard(channel)) {
            let ids: Vec<AckId> = shard
                .entries
                .values()
                .filter(|pending| pending.age(now) > timeout)
                .map(|pending| pending.ack_id)
                .collect();
            expired.extend(ids.iter().filter_map(|id| shard.entries.remove(id)));
        }

        let count = expired.len();
        if count > 0 {
            warn!("HEC | {count} batches were not acknowledged within {timeout:?}");
            self.complete(expired, AckOutcome::TimedOut);
        }
        count
    }

    /// Refuses further inserts and fails every pending batch with `ClientClosed`.
    /// Returns how many batches were failed.
    pub fn close(&self) -> usize {
        let remaining: Vec<PendingBatch> = (0..self.shards.len())
            .filter_map(|channel| self.shard(channel))
            .flat_map(|mut shard| {
                shard.closed = true;
                std::mem::take(&mut shard.entries).into_values()
            })
            .collect();

        let count = remaining.len();
        if count > 0 {
            self.complete(remaining, AckOutcome::Failed(AckFailure::ClientClosed));
        }
        count
    }

    fn complete(&self, resolved: Vec<PendingBatch>, outcome: AckOutcome) {
        let batches: Vec<Arc<EventBatch>> = match &self.callback {
            Some(_) => resolved.iter().map(|p| Arc::clone(&p.batch)).collect(),
            None => Vec::new(),
        };

        for pending in resolved {
            pending.completion.complete(outcome.clone());
        }

        if let Some(callback) = &self.callback {
            match &outcome {
                AckOutcome::Committed => callback.on_committed(&batches),
                failed => callback.on_failed(&batches, failed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn batch() -> Arc<EventBatch> {
        let mut batch = EventBatch::json();
        batch.add(Event::raw("message"));
        Arc::new(batch)
    }

    fn insert(registry: &PendingRegistry, channel: usize, id: u64) -> BatchReceipt {
        let (pending, receipt) = PendingBatch::new(AckId(id), channel, Instant::now(), batch());
        registry.insert(pending).expect("insert should succeed");
        receipt
    }

    #[derive(Default)]
    struct CountingCallback {
        committed: AtomicUsize,
        failed: AtomicUsize,
    }

    impl AckCallback for CountingCallback {
        fn on_committed(&self, batches: &[Arc<EventBatch>]) {
            self.committed.fetch_add(batches.len(), Ordering::SeqCst);
        }

        fn on_failed(&self, batches: &[Arc<EventBatch>], _outcome: &AckOutcome) {
            self.failed.fetch_add(batches.len(), Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_pending_grouped_by_channel() {
        let registry = PendingRegistry::new(3, None);
        let _r1 = insert(&registry, 0, 5);
        let _r2 = insert(&registry, 0, 2);
        let _r3 = insert(&registry, 2, 2);

        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.pending_by_channel(),
            vec![(0, vec![AckId(2), AckId(5)]), (2, vec![AckId(2)])]
        );
    }

    #[tokio::test]
    async fn test_duplicate_ack_id_is_refused() {
        let registry = PendingRegistry::new(1, None);
        let _first = insert(&registry, 0, 1);

        let (pending, _receipt) = PendingBatch::new(AckId(1), 0, Instant::now(), batch());
        assert!(matches!(
            registry.insert(pending),
            Err(InsertError::Duplicate(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_resolves_exactly_once() {
        let callback = Arc::new(CountingCallback::default());
        let registry = PendingRegistry::new(2, Some(callback.clone() as Arc<dyn AckCallback>));
        let mut receipt = insert(&registry, 1, 10);
        let _other = insert(&registry, 1, 11);

        assert_eq!(registry.resolve_committed(1, &[AckId(10)]), 1);
        assert_eq!(receipt.try_outcome(), Some(AckOutcome::Committed));

        // Reported again in a later cycle, or after close: nothing left to resolve.
        assert_eq!(registry.resolve_committed(1, &[AckId(10)]), 0);
        assert_eq!(registry.close(), 1);
        assert_eq!(callback.committed.load(Ordering::SeqCst), 1);
        assert_eq!(callback.failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_commit_on_other_channel_is_ignored() {
        let registry = PendingRegistry::new(2, None);
        let mut receipt = insert(&registry, 0, 3);

        assert_eq!(registry.resolve_committed(1, &[AckId(3)]), 0);
        assert_eq!(registry.resolve_committed(7, &[AckId(3)]), 0);
        assert_eq!(receipt.try_outcome(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_only_after_timeout() {
        let registry = PendingRegistry::new(1, None);
        let timeout = Duration::from_secs(60);
        let receipt = insert(&registry, 0, 1);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(registry.expire(Instant::now(), timeout), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(registry.expire(Instant::now(), timeout), 1);
        assert_eq!(receipt.await, AckOutcome::TimedOut);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_refuses_inserts() {
        let registry = PendingRegistry::new(2, None);
        let first = insert(&registry, 0, 1);
        let second = insert(&registry, 1, 1);

        assert_eq!(registry.close(), 2);
        assert!(registry.is_closed());
        assert!(registry.is_empty());
        assert_eq!(
            first.await,
            AckOutcome::Failed(AckFailure::ClientClosed)
        );
        assert_eq!(
            second.await,
            AckOutcome::Failed(AckFailure::ClientClosed)
        );

        let (pending, _receipt) = PendingBatch::new(AckId(2), 0, Instant::now(), batch());
        assert!(matches!(
            registry.insert(pending),
            Err(InsertError::Closed(_))
        ));
        assert_eq!(registry.close(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolution_never_doubles() {
        let callback = Arc::new(CountingCallback::default());
        let registry = Arc::new(PendingRegistry::new(1, Some(callback.clone() as Arc<dyn AckCallback>)));
        let ids: Vec<AckId> = (0..200).map(AckId).collect();
        let receipts: Vec<BatchReceipt> = ids.iter().map(|id| insert(&registry, 0, id.0)).collect();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            let ids = ids.clone();
            tasks.push(tokio::spawn(async move {
                registry.resolve_committed(0, &ids)
            }));
        }
        let closer = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.close() })
        };

        let mut resolved = closer.await.expect("task");
        for task in tasks {
            resolved += task.await.expect("task");
        }

        assert_eq!(resolved, 200);
        let signaled = callback.committed.load(Ordering::SeqCst)
            + callback.failed.load(Ordering::SeqCst);
        assert_eq!(signaled, 200);
        for receipt in receipts {
            let outcome = receipt.await;
            assert!(matches!(
                outcome,
                AckOutcome::Committed | AckOutcome::Failed(AckFailure::ClientClosed)
            ));
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(usize, u64),
        Commit(usize, Vec<u64>),
        Expire,
        Close,
    }

    // Channel 2 does not exist in the two-channel registry under test.
    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0usize..3, 0u64..6).prop_map(|(channel, id)| Op::Insert(channel, id)),
            3 => (0usize..3, proptest::collection::vec(0u64..6, 0..4))
                .prop_map(|(channel, ids)| Op::Commit(channel, ids)),
            1 => Just(Op::Expire),
            1 => Just(Op::Close),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn test_every_batch_resolves_exactly_once(ops in proptest::collection::vec(op(), 1..40)) {
            let callback = Arc::new(CountingCallback::default());
            let registry =
                PendingRegistry::new(2, Some(callback.clone() as Arc<dyn AckCallback>));

            // (channel, id) -> index into `receipts` for every batch still pending.
            let mut pending: HashMap<(usize, u64), usize> = HashMap::new();
            let mut receipts: Vec<(BatchReceipt, Option<AckOutcome>)> = Vec::new();
            let mut closed = false;

            for op in ops {
                match op {
                    Op::Insert(channel, id) => {
                        let (entry, receipt) =
                            PendingBatch::new(AckId(id), channel, Instant::now(), batch());
                        match registry.insert(entry) {
                            Ok(()) => {
                                prop_assert!(!closed && channel < 2);
                                prop_assert!(!pending.contains_key(&(channel, id)));
                                pending.insert((channel, id), receipts.len());
                                receipts.push((receipt, None));
                            }
                            Err(InsertError::Closed(_)) => prop_assert!(closed || channel >= 2),
                            Err(InsertError::Duplicate(_)) => {
                                prop_assert!(pending.contains_key(&(channel, id)));
                            }
                        }
                    }
                    Op::Commit(channel, ids) => {
                        let distinct: BTreeSet<u64> = ids.iter().copied().collect();
                        let resolved: Vec<usize> = distinct
                            .iter()
                            .filter_map(|id| pending.remove(&(channel, *id)))
                            .collect();
                        let ack_ids: Vec<AckId> = ids.into_iter().map(AckId).collect();
                        prop_assert_eq!(registry.resolve_committed(channel, &ack_ids), resolved.len());
                        for index in resolved {
                            receipts[index].1 = Some(AckOutcome::Committed);
                        }
                    }
                    Op::Expire => {
                        let later = Instant::now() + Duration::from_secs(1);
                        prop_assert_eq!(registry.expire(later, Duration::ZERO), pending.len());
                        for (_, index) in pending.drain() {
                            receipts[index].1 = Some(AckOutcome::TimedOut);
                        }
                    }
                    Op::Close => {
                        prop_assert_eq!(registry.close(), pending.len());
                        closed = true;
                        for (_, index) in pending.drain() {
                            receipts[index].1 = Some(AckOutcome::Failed(AckFailure::ClientClosed));
                        }
                    }
                }
                prop_assert_eq!(registry.len(), pending.len());
            }

            prop_assert_eq!(registry.close(), pending.len());
            for (_, index) in pending.drain() {
                receipts[index].1 = Some(AckOutcome::Failed(AckFailure::ClientClosed));
            }

            let committed = receipts
                .iter()
                .filter(|(_, expected)| *expected == Some(AckOutcome::Committed))
                .count();
            for (receipt, expected) in &mut receipts {
                prop_assert_eq!(receipt.try_outcome(), expected.clone());
            }
            prop_assert_eq!(callback.committed.load(Ordering::SeqCst), committed);
            prop_assert_eq!(
                callback.committed.load(Ordering::SeqCst) + callback.failed.load(Ordering::SeqCst),
                receipts.len()
            );
        }
    }
}
