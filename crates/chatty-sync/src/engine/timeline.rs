//! The conversation timeline.
//!
//! An ordered, deduplicated sequence of messages fed from four sources:
//! the initial history fetch, pushed broker frames, poll deltas, and
//! optimistic local sends. All ordering and reconciliation rules live
//! here, with no async anywhere, so every property is unit-testable.

use uuid::Uuid;

use chatty_protocol::Message;

/// One timeline row: the message plus its local delivery status.
///
/// At most one of `pending`/`failed` is true; a confirmed message has
/// both false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub message: Message,
    /// Sent optimistically, awaiting the server echo. The id is still
    /// the locally generated one.
    pub pending: bool,
    /// Send failed; stays visible until the user explicitly resends.
    pub failed: bool,
}

impl TimelineEntry {
    fn confirmed(message: Message) -> Self {
        Self {
            message,
            pending: false,
            failed: false,
        }
    }
}

/// Ordered conversation timeline, ascending by `created_at`, ties kept in
/// insertion order.
#[derive(Debug, Default)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn snapshot(&self) -> Vec<TimelineEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `created_at` of the newest entry, if any. Seeds the poll cursor.
    pub fn last_created_at(&self) -> Option<i64> {
        self.entries.last().map(|e| e.message.created_at)
    }

    /// Install the initial history fetch, replacing everything.
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.entries = messages.into_iter().map(TimelineEntry::confirmed).collect();
        self.resort();
    }

    /// Merge a batch of authoritative messages (pushed or polled).
    ///
    /// For each incoming message, in order: an entry already carrying the
    /// incoming id means a duplicate delivery and is skipped outright;
    /// otherwise a pending entry with the same `(sender, receiver, text)`
    /// triple is reconciled in place and takes the authoritative id;
    /// anything else is appended. Returns the number of entries added.
    pub fn merge(&mut self, incoming: Vec<Message>) -> usize {
        let mut added = 0;
        for message in incoming {
            // The id check must come first: a duplicate echo would
            // otherwise reconcile a second pending entry with the same
            // triple onto an id the timeline already holds.
            if self.entries.iter().any(|e| e.message.id == message.id) {
                continue;
            }

            if let Some(entry) = self.entries.iter_mut().find(|e| {
                e.pending
                    && e.message.sender == message.sender
                    && e.message.receiver == message.receiver
                    && e.message.text == message.text
            }) {
                entry.message = message;
                entry.pending = false;
                entry.failed = false;
                continue;
            }

            self.entries.push(TimelineEntry::confirmed(message));
            added += 1;
        }
        self.resort();
        added
    }

    /// Append an optimistic local send. The caller synthesizes the
    /// provisional message; it shows up immediately, before any network
    /// activity.
    pub fn push_pending(&mut self, message: Message) {
        self.entries.push(TimelineEntry {
            message,
            pending: true,
            failed: false,
        });
        self.resort();
    }

    /// Mark a provisional entry as failed. Returns whether the id was
    /// found (and still pending).
    pub fn mark_failed(&mut self, id: Uuid) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.pending && e.message.id == id)
        {
            Some(entry) => {
                entry.pending = false;
                entry.failed = true;
                true
            }
            None => false,
        }
    }

    /// Stable re-sort after every mutation: ascending `created_at`,
    /// equal timestamps keep insertion order.
    fn resort(&mut self) {
        self.entries.sort_by_key(|e| e.message.created_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u8) -> Uuid {
        Uuid::from_u128(n as u128)
    }

    fn msg(id: u8, created_at: i64) -> Message {
        Message {
            id: uuid(id),
            sender: uuid(100),
            receiver: uuid(101),
            text: format!("m{id}"),
            created_at,
            is_deleted: false,
        }
    }

    fn ids(timeline: &Timeline) -> Vec<Uuid> {
        timeline.entries().iter().map(|e| e.message.id).collect()
    }

    fn assert_sorted(timeline: &Timeline) {
        let stamps: Vec<i64> = timeline
            .entries()
            .iter()
            .map(|e| e.message.created_at)
            .collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted, "timeline must be non-decreasing");
    }

    #[test]
    fn test_cold_start_sorts_history() {
        let mut timeline = Timeline::new();
        timeline.replace_all(vec![msg(1, 100), msg(2, 50)]);
        assert_eq!(ids(&timeline), vec![uuid(2), uuid(1)]);
        assert_sorted(&timeline);
    }

    #[test]
    fn test_merge_appends_and_sorts() {
        let mut timeline = Timeline::new();
        timeline.replace_all(vec![msg(1, 100)]);
        let added = timeline.merge(vec![msg(3, 150), msg(2, 50)]);
        assert_eq!(added, 2);
        assert_eq!(ids(&timeline), vec![uuid(2), uuid(1), uuid(3)]);
        assert_sorted(&timeline);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut timeline = Timeline::new();
        timeline.merge(vec![msg(3, 150)]);
        let before = timeline.len();
        let added = timeline.merge(vec![msg(3, 150)]);
        assert_eq!(added, 0);
        assert_eq!(timeline.len(), before);
    }

    #[test]
    fn test_equal_timestamps_keep_insertion_order() {
        let mut timeline = Timeline::new();
        timeline.merge(vec![msg(1, 100), msg(2, 100), msg(3, 100)]);
        assert_eq!(ids(&timeline), vec![uuid(1), uuid(2), uuid(3)]);
    }

    #[test]
    fn test_reconcile_pending_with_echo() {
        let mut timeline = Timeline::new();
        let provisional = Message::provisional(uuid(100), uuid(101), "hi", 200);
        let temp_id = provisional.id;
        timeline.push_pending(provisional);
        assert!(timeline.entries()[0].pending);

        // Server echo: same triple, authoritative id and timestamp.
        let mut echo = msg(9, 205);
        echo.text = "hi".into();
        timeline.merge(vec![echo.clone()]);

        assert_eq!(timeline.len(), 1, "echo replaces, never duplicates");
        let entry = &timeline.entries()[0];
        assert!(!entry.pending);
        assert!(!entry.failed);
        assert_eq!(entry.message.id, uuid(9));
        assert_ne!(entry.message.id, temp_id);
        assert_eq!(entry.message.created_at, 205);
    }

    #[test]
    fn test_duplicate_echo_after_reconcile() {
        let mut timeline = Timeline::new();
        timeline.push_pending(Message::provisional(uuid(100), uuid(101), "hi", 200));

        let mut echo = msg(9, 205);
        echo.text = "hi".into();
        timeline.merge(vec![echo.clone()]);
        timeline.merge(vec![echo]);

        assert_eq!(timeline.len(), 1);
        assert_eq!(
            timeline
                .entries()
                .iter()
                .filter(|e| e.message.id == uuid(9))
                .count(),
            1,
            "never two entries with the same authoritative id"
        );
    }

    #[test]
    fn test_duplicate_echo_reconciles_one_of_two_pendings() {
        let mut timeline = Timeline::new();
        // Two identical optimistic sends in flight at once.
        timeline.push_pending(Message::provisional(uuid(100), uuid(101), "hi", 200));
        timeline.push_pending(Message::provisional(uuid(100), uuid(101), "hi", 201));

        let mut echo = msg(9, 205);
        echo.text = "hi".into();
        timeline.merge(vec![echo.clone()]);
        timeline.merge(vec![echo]);

        assert_eq!(
            timeline
                .entries()
                .iter()
                .filter(|e| e.message.id == uuid(9))
                .count(),
            1,
            "a duplicate echo must not claim a second pending entry"
        );
        // The other send is still awaiting its own echo.
        assert_eq!(
            timeline.entries().iter().filter(|e| e.pending).count(),
            1
        );
    }

    #[test]
    fn test_reconcile_matches_only_pending_entries() {
        let mut timeline = Timeline::new();
        // Confirmed entry with the same triple as the incoming message.
        let mut existing = msg(1, 100);
        existing.text = "hi".into();
        timeline.merge(vec![existing]);

        let mut incoming = msg(2, 110);
        incoming.text = "hi".into();
        timeline.merge(vec![incoming]);

        // Same triple but nothing pending: both messages stand.
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn test_mark_failed() {
        let mut timeline = Timeline::new();
        let provisional = Message::provisional(uuid(100), uuid(101), "hi", 200);
        let temp_id = provisional.id;
        timeline.push_pending(provisional);

        assert!(timeline.mark_failed(temp_id));
        let entry = &timeline.entries()[0];
        assert!(entry.failed);
        assert!(!entry.pending);

        // Failed entries stay in the timeline and are not re-marked.
        assert!(!timeline.mark_failed(temp_id));
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn test_failed_entry_not_reconciled() {
        let mut timeline = Timeline::new();
        let provisional = Message::provisional(uuid(100), uuid(101), "hi", 200);
        let temp_id = provisional.id;
        timeline.push_pending(provisional);
        timeline.mark_failed(temp_id);

        // A later echo with the same triple is a different message (an
        // explicit resend); it must append, not resurrect the failure.
        let mut echo = msg(9, 300);
        echo.text = "hi".into();
        timeline.merge(vec![echo]);

        assert_eq!(timeline.len(), 2);
        assert!(timeline.entries()[0].failed);
    }

    #[test]
    fn test_ordering_holds_across_mutations() {
        let mut timeline = Timeline::new();
        timeline.replace_all(vec![msg(1, 300), msg(2, 100)]);
        assert_sorted(&timeline);

        timeline.merge(vec![msg(3, 200)]);
        assert_sorted(&timeline);

        timeline.push_pending(Message::provisional(uuid(100), uuid(101), "x", 150));
        assert_sorted(&timeline);

        timeline.merge(vec![msg(4, 50)]);
        assert_sorted(&timeline);
    }
}
