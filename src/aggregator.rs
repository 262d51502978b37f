//! Cross-shard read path.
//!
//! Every query fans out one request per shard, awaits them all, and folds the
//! per-shard values with a pure combine function. No accumulator is shared
//! between the per-shard tasks.

use crate::shard::ShardHandle;
use crate::streaming::types::StreamState;
use futures::future::join_all;
use std::future::Future;
use tracing::warn;

/// Ask every shard concurrently and fold the answers in shard order.
///
/// A shard that fails to answer contributes `R::default()`.
pub async fn map_reduce<R, F, Fut>(
    shards: &[ShardHandle],
    map: F,
    reduce: impl Fn(R, R) -> R,
) -> R
where
    R: Default,
    F: Fn(ShardHandle) -> Fut,
    Fut: Future<Output = crate::error::Result<R>>,
{
    let results = join_all(shards.iter().cloned().map(|shard| {
        let shard_id = shard.shard_id();
        let fut = map(shard);
        async move { (shard_id, fut.await) }
    }))
    .await;

    results
        .into_iter()
        .map(|(shard_id, result)| {
            result.unwrap_or_else(|e| {
                warn!(shard = shard_id, "Shard did not answer aggregation query: {}", e);
                R::default()
            })
        })
        .fold(R::default(), reduce)
}

/// Concatenate two shard contributions.
pub fn merge_states(mut acc: Vec<StreamState>, mut next: Vec<StreamState>) -> Vec<StreamState> {
    acc.append(&mut next);
    acc
}

/// Every plan registered on any shard, initiated and receiving.
pub async fn get_current_streams(shards: &[ShardHandle]) -> Vec<StreamState> {
    map_reduce(shards, |shard| async move { shard.snapshot().await }, merge_states).await
}

/// Byte and file counters summed over a set of plans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamTotals {
    pub plans: usize,
    pub sessions: usize,
    pub active_sessions: usize,
    pub failed_sessions: usize,
    pub files_to_send: u64,
    pub files_to_receive: u64,
    pub bytes_to_send: u64,
    pub bytes_to_receive: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl StreamTotals {
    pub fn of_state(state: &StreamState) -> Self {
        let mut totals = StreamTotals {
            plans: 1,
            ..Default::default()
        };
        for s in &state.sessions {
            totals.sessions += 1;
            if !s.is_terminal() {
                totals.active_sessions += 1;
            }
            if s.is_failed() {
                totals.failed_sessions += 1;
            }
            totals.files_to_send = totals.files_to_send.saturating_add(s.total_files_to_send());
            totals.files_to_receive = totals.files_to_receive.saturating_add(s.total_files_to_receive());
            totals.bytes_to_send = totals.bytes_to_send.saturating_add(s.total_size_to_send());
            totals.bytes_to_receive = totals.bytes_to_receive.saturating_add(s.total_size_to_receive());
            totals.bytes_sent = totals.bytes_sent.saturating_add(s.total_size_sent());
            totals.bytes_received = totals.bytes_received.saturating_add(s.total_size_received());
        }
        totals
    }

    pub fn combine(self, other: Self) -> Self {
        Self {
            plans: self.plans.saturating_add(other.plans),
            sessions: self.sessions.saturating_add(other.sessions),
            active_sessions: self.active_sessions.saturating_add(other.active_sessions),
            failed_sessions: self.failed_sessions.saturating_add(other.failed_sessions),
            files_to_send: self.files_to_send.saturating_add(other.files_to_send),
            files_to_receive: self.files_to_receive.saturating_add(other.files_to_receive),
            bytes_to_send: self.bytes_to_send.saturating_add(other.bytes_to_send),
            bytes_to_receive: self.bytes_to_receive.saturating_add(other.bytes_to_receive),
            bytes_sent: self.bytes_sent.saturating_add(other.bytes_sent),
            bytes_received: self.bytes_received.saturating_add(other.bytes_received),
        }
    }
}

impl<'a> std::iter::Sum<&'a StreamState> for StreamTotals {
    fn sum<I: Iterator<Item = &'a StreamState>>(iter: I) -> Self {
        iter.map(StreamTotals::of_state)
            .fold(StreamTotals::default(), StreamTotals::combine)
    }
}

/// Totals over every plan on every shard.
pub async fn progress_totals(shards: &[ShardHandle]) -> StreamTotals {
    map_reduce(
        shards,
        |shard| async move {
            let states = shard.snapshot().await?;
            Ok::<_, crate::error::StreamError>(states.iter().sum::<StreamTotals>())
        },
        StreamTotals::combine,
    )
    .await
}
