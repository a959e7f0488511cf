// Bounded history of recent events, binary-searchable by revision.
//
// A reconnecting subscriber hands us the last revision it saw; if that
// revision is still inside the window we replay the tail and the client skips
// a full snapshot. Once the window has rolled past it, the only correct
// answer is "resync", which `get_since` signals with `ok = false`.
use mizuflow_wire::EventMessage;
use std::sync::RwLock;

const DEFAULT_CAPACITY: usize = 1000;

/// Fixed-capacity circular buffer of event messages.
///
/// Single writer (the ingestor), many readers (stream handlers during
/// resume). Insertion order equals revision order because the writer
/// processes watch events in order.
#[derive(Debug)]
pub struct RevisionRing {
    inner: RwLock<RingState>,
}

#[derive(Debug)]
struct RingState {
    messages: Vec<EventMessage>,
    capacity: usize,
    // Next slot to overwrite once the buffer has wrapped.
    head: usize,
    full: bool,
}

impl RevisionRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        Self {
            inner: RwLock::new(RingState {
                messages: Vec::with_capacity(capacity),
                capacity,
                head: 0,
                full: false,
            }),
        }
    }

    /// Appends a message, overwriting the oldest entry once full. O(1).
    pub fn push(&self, msg: EventMessage) {
        let mut state = self.inner.write().expect("ring lock");
        if state.full {
            let head = state.head;
            state.messages[head] = msg;
        } else {
            state.messages.push(msg);
        }
        state.head = (state.head + 1) % state.capacity;
        if !state.full && state.head == 0 {
            state.full = true;
        }
    }

    /// Returns every retained message with revision > `last_rev`, in order.
    ///
    /// The boolean is the gap signal: `(_, false)` means `last_rev` precedes
    /// the oldest retained revision and the caller must do a full resync.
    /// An empty ring, or a `last_rev` at or past the newest entry, is
    /// `(empty, true)`.
    pub fn get_since(&self, last_rev: i64) -> (Vec<EventMessage>, bool) {
        let state = self.inner.read().expect("ring lock");

        let (start, count) = if state.full {
            (state.head, state.capacity)
        } else {
            (0, state.messages.len())
        };

        if count == 0 {
            return (Vec::new(), true);
        }

        let at = |i: usize| &state.messages[(start + i) % state.capacity];

        if last_rev < at(0).revision {
            return (Vec::new(), false);
        }

        // Binary search over logical indices [0, count) for the first
        // message with revision > last_rev.
        let mut lo = 0;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if at(mid).revision > last_rev {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }

        if lo == count {
            return (Vec::new(), true);
        }
        ((lo..count).map(|i| at(i).clone()).collect(), true)
    }

    /// Number of retained messages.
    pub fn len(&self) -> usize {
        let state = self.inner.read().expect("ring lock");
        if state.full {
            state.capacity
        } else {
            state.messages.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RevisionRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mizuflow_wire::{Action, FlagType};

    fn msg(revision: i64) -> EventMessage {
        EventMessage {
            namespace: "default".to_string(),
            env: "dev".to_string(),
            key: format!("k{revision}"),
            value: "v".to_string(),
            flag_type: FlagType::String,
            version: 1,
            revision,
            action: Action::Put,
        }
    }

    #[test]
    fn empty_ring_is_ok_and_empty() {
        let ring = RevisionRing::new(8);
        let (messages, ok) = ring.get_since(0);
        assert!(ok);
        assert!(messages.is_empty());
    }

    #[test]
    fn returns_tail_after_last_rev() {
        let ring = RevisionRing::new(8);
        for rev in 1..=5 {
            ring.push(msg(rev));
        }
        let (messages, ok) = ring.get_since(3);
        assert!(ok);
        let revs: Vec<i64> = messages.iter().map(|m| m.revision).collect();
        assert_eq!(revs, vec![4, 5]);
    }

    #[test]
    fn caught_up_client_gets_nothing() {
        let ring = RevisionRing::new(8);
        for rev in 1..=5 {
            ring.push(msg(rev));
        }
        let (messages, ok) = ring.get_since(5);
        assert!(ok);
        assert!(messages.is_empty());
        let (messages, ok) = ring.get_since(9);
        assert!(ok);
        assert!(messages.is_empty());
    }

    #[test]
    fn last_rev_before_window_signals_resync() {
        let ring = RevisionRing::new(4);
        for rev in 10..=20 {
            ring.push(msg(rev));
        }
        // Retained window is [17, 20].
        let (messages, ok) = ring.get_since(12);
        assert!(!ok);
        assert!(messages.is_empty());
        // One revision before the oldest retained entry is still a gap: the
        // ring cannot prove nothing happened in between.
        let (_, ok) = ring.get_since(16);
        assert!(!ok);
    }

    #[test]
    fn wraps_and_preserves_order() {
        let ring = RevisionRing::new(4);
        for rev in 1..=10 {
            ring.push(msg(rev));
        }
        assert_eq!(ring.len(), 4);
        let (messages, ok) = ring.get_since(7);
        assert!(ok);
        let revs: Vec<i64> = messages.iter().map(|m| m.revision).collect();
        assert_eq!(revs, vec![8, 9, 10]);
    }

    #[test]
    fn oldest_retained_rev_is_replayable() {
        let ring = RevisionRing::new(4);
        for rev in 1..=6 {
            ring.push(msg(rev));
        }
        // Window is [3, 6]; a client at rev 3 resumes without resync.
        let (messages, ok) = ring.get_since(3);
        assert!(ok);
        let revs: Vec<i64> = messages.iter().map(|m| m.revision).collect();
        assert_eq!(revs, vec![4, 5, 6]);
    }
}
