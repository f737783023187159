//! At-least-once bookkeeping: unacknowledged envelopes, the offline queue, and inbound dedup.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::envelope::{Envelope, MessageId};
use super::timer::ScheduledTask;

#[derive(Debug)]
struct PendingEntry {
    envelope: Envelope,
    retry: Option<ScheduledTask>,
}

/// Envelopes awaiting acknowledgement, in submission order.
///
/// An entry may still sit in the batch buffer until the next flush; a disconnect moves such
/// entries to the offline queue, so nothing unsent survives into the next connection. Each
/// entry owns its retry timer; removing the entry cancels the timer.
#[derive(Debug, Default)]
pub struct PendingSet {
    next_seq: u64,
    order: BTreeMap<u64, MessageId>,
    entries: HashMap<MessageId, (u64, PendingEntry)>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Envelope> {
        self.entries.get(id).map(|(_, entry)| &entry.envelope)
    }

    pub fn get_mut(&mut self, id: &MessageId) -> Option<&mut Envelope> {
        self.entries.get_mut(id).map(|(_, entry)| &mut entry.envelope)
    }

    /// Track `envelope`. A resubmission under an existing id replaces the old entry but keeps
    /// its place in the order.
    pub fn insert(&mut self, envelope: Envelope) {
        if let Some((_, entry)) = self.entries.get_mut(&envelope.message_id) {
            entry.envelope = envelope;
            entry.retry = None;
            return;
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.order.insert(seq, envelope.message_id.clone());
        self.entries.insert(
            envelope.message_id.clone(),
            (
                seq,
                PendingEntry {
                    envelope,
                    retry: None,
                },
            ),
        );
    }

    /// Attach (or replace) the retry timer; returns false when the id is not tracked.
    pub fn set_timer(&mut self, id: &MessageId, task: ScheduledTask) -> bool {
        match self.entries.get_mut(id) {
            Some((_, entry)) => {
                entry.retry = Some(task);
                true
            }
            None => false,
        }
    }

    pub fn has_timer(&self, id: &MessageId) -> bool {
        self.entries
            .get(id)
            .is_some_and(|(_, entry)| entry.retry.is_some())
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Envelope> {
        let (seq, entry) = self.entries.remove(id)?;
        self.order.remove(&seq);
        Some(entry.envelope)
    }

    /// Cancel every retry timer while keeping the entries (connection lost).
    pub fn cancel_timers(&mut self) {
        for (_, entry) in self.entries.values_mut() {
            entry.retry = None;
        }
    }

    /// Ids in submission order.
    pub fn ids(&self) -> Vec<MessageId> {
        self.order.values().cloned().collect()
    }

    /// Drop everything without reporting (explicit stop).
    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}

#[derive(Debug)]
struct Queued {
    envelope: Envelope,
    queued_at: Instant,
}

/// Outcome of draining the offline queue.
#[derive(Debug, Default)]
pub struct OfflineDrain {
    pub fresh: Vec<Envelope>,
    pub stale: Vec<Envelope>,
}

/// Bounded FIFO of envelopes submitted while the link could not send.
#[derive(Debug)]
pub struct OfflineQueue {
    items: VecDeque<Queued>,
    capacity: usize,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue, returning the oldest envelope when it had to be evicted.
    ///
    /// Staleness counts from submission, so an envelope requeued after a disconnect keeps its age.
    pub fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        let submitted_at = envelope.created_at;
        self.push_at(envelope, submitted_at)
    }

    pub(crate) fn push_at(&mut self, envelope: Envelope, queued_at: Instant) -> Option<Envelope> {
        if self.capacity == 0 {
            return Some(envelope);
        }
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front().map(|q| q.envelope)
        } else {
            None
        };
        self.items.push_back(Queued { envelope, queued_at });
        evicted
    }

    /// Take everything, oldest first, splitting out entries queued longer than `stale_after`.
    pub fn drain(&mut self, stale_after: Duration) -> OfflineDrain {
        self.drain_at(stale_after, Instant::now())
    }

    pub(crate) fn drain_at(&mut self, stale_after: Duration, now: Instant) -> OfflineDrain {
        let mut out = OfflineDrain::default();
        for queued in self.items.drain(..) {
            if now.saturating_duration_since(queued.queued_at) > stale_after {
                out.stale.push(queued.envelope);
            } else {
                out.fresh.push(queued.envelope);
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// TTL and capacity bounded set of inbound message ids.
#[derive(Debug)]
pub struct SeenIds {
    ttl: Duration,
    capacity: usize,
    seen: HashMap<MessageId, Instant>,
    order: VecDeque<(MessageId, Instant)>,
}

impl SeenIds {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `id`; returns `true` the first time it is seen within the TTL.
    pub fn insert(&mut self, id: &MessageId) -> bool {
        self.insert_at(id, Instant::now())
    }

    pub(crate) fn insert_at(&mut self, id: &MessageId, now: Instant) -> bool {
        self.prune(now);
        if self.seen.contains_key(id) {
            return false;
        }
        while self.seen.len() >= self.capacity {
            let Some((old, at)) = self.order.pop_front() else {
                break;
            };
            if self.seen.get(&old) == Some(&at) {
                self.seen.remove(&old);
            }
        }
        self.seen.insert(id.clone(), now);
        self.order.push_back((id.clone(), now));
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        while let Some((id, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.ttl {
                break;
            }
            if self.seen.get(id) == Some(at) {
                self.seen.remove(id);
            }
            self.order.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::OutboundMessage;
    use sonic_rs::Value;

    fn envelope(id: &str) -> Envelope {
        Envelope::from_message(
            OutboundMessage::new("command", Value::default())
                .with_id(id)
                .reliable(),
            3,
        )
    }

    #[test]
    fn pending_set_keeps_submission_order() {
        let mut pending = PendingSet::new();
        for id in ["c", "a", "b"] {
            pending.insert(envelope(id));
        }
        pending.remove(&MessageId::from("a"));
        pending.insert(envelope("c"));

        let ids: Vec<_> = pending.ids().iter().map(|id| id.to_string()).collect();
        assert_eq!(ids, ["c", "b"]);
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_an_entry_cancels_its_timer() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let fired = Arc::new(AtomicBool::new(false));
        let mut pending = PendingSet::new();
        let id = MessageId::from("m-1");
        pending.insert(envelope("m-1"));
        let flag = fired.clone();
        assert!(pending.set_timer(
            &id,
            ScheduledTask::after(Duration::from_millis(10), async move {
                flag.store(true, Ordering::SeqCst);
            }),
        ));
        assert!(pending.has_timer(&id));

        assert!(pending.remove(&id).is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn cancel_timers_keeps_entries() {
        let mut pending = PendingSet::new();
        let id = MessageId::from("m-1");
        pending.insert(envelope("m-1"));
        pending.set_timer(&id, ScheduledTask::after(Duration::from_secs(60), async {}));

        pending.cancel_timers();
        assert!(pending.contains(&id));
        assert!(!pending.has_timer(&id));
    }

    #[test]
    fn offline_queue_evicts_oldest_when_full() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.push(envelope("a")).is_none());
        assert!(queue.push(envelope("b")).is_none());
        let evicted = queue.push(envelope("c")).expect("oldest evicted");
        assert_eq!(evicted.message_id.as_str(), "a");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn offline_drain_preserves_order_and_splits_stale() {
        let mut queue = OfflineQueue::new(10);
        let start = Instant::now();
        queue.push_at(envelope("old"), start);
        queue.push_at(envelope("new-1"), start + Duration::from_secs(290));
        queue.push_at(envelope("new-2"), start + Duration::from_secs(295));

        let drained = queue.drain_at(Duration::from_secs(300), start + Duration::from_secs(301));
        let fresh: Vec<_> = drained.fresh.iter().map(|e| e.message_id.as_str()).collect();
        let stale: Vec<_> = drained.stale.iter().map(|e| e.message_id.as_str()).collect();
        assert_eq!(fresh, ["new-1", "new-2"]);
        assert_eq!(stale, ["old"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn requeued_envelope_keeps_its_submission_age() {
        let mut queue = OfflineQueue::new(10);
        let mut old = envelope("old");
        old.created_at = Instant::now()
            .checked_sub(Duration::from_secs(2))
            .expect("monotonic clock past two seconds");
        queue.push(old);
        queue.push(envelope("young"));

        let drained = queue.drain(Duration::from_secs(1));
        let stale: Vec<_> = drained.stale.iter().map(|e| e.message_id.as_str()).collect();
        let fresh: Vec<_> = drained.fresh.iter().map(|e| e.message_id.as_str()).collect();
        assert_eq!(stale, ["old"]);
        assert_eq!(fresh, ["young"]);
    }

    #[test]
    fn seen_ids_dedup_within_ttl() {
        let mut seen = SeenIds::new(Duration::from_secs(300), 10);
        let id = MessageId::from("in-1");
        let now = Instant::now();
        assert!(seen.insert_at(&id, now));
        assert!(!seen.insert_at(&id, now + Duration::from_secs(10)));
        assert!(seen.insert_at(&id, now + Duration::from_secs(301)));
    }

    #[test]
    fn seen_ids_capacity_evicts_oldest() {
        let mut seen = SeenIds::new(Duration::from_secs(300), 2);
        let now = Instant::now();
        seen.insert_at(&MessageId::from("a"), now);
        seen.insert_at(&MessageId::from("b"), now);
        seen.insert_at(&MessageId::from("c"), now);
        assert_eq!(seen.len(), 2);
        assert!(!seen.contains(&MessageId::from("a")));
        assert!(seen.contains(&MessageId::from("c")));
    }
}
