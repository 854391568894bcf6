use tracing::debug;

use crate::config::DEFAULT_MAX_LOCAL_HISTORY_STATES;
use crate::host::{EventBus, HistoryHost, ViewerEvent};
use crate::{HistoryEntry, HistorySnapshot};

/// Back/forward availability, published after every change that can affect it.
#[derive(Debug, Clone, PartialEq)]
pub struct NavEnable {
    pub back: bool,
    pub forward: bool,
    pub history: HistorySnapshot,
}

type NavEnableHandler = Box<dyn Fn(&NavEnable) + Send + Sync>;

/// Moving back or forward dispatches a [`ViewerEvent::PopState`] on the bus.
pub struct HistoryStack {
    bus: EventBus,
    capacity: usize,
    history: Vec<HistoryEntry>,
    ptr: Option<usize>,
    nav_enable_handlers: Vec<NavEnableHandler>,
}

impl HistoryStack {
    pub fn new(bus: EventBus) -> Self {
        Self::with_capacity(bus, DEFAULT_MAX_LOCAL_HISTORY_STATES)
    }

    pub fn with_capacity(bus: EventBus, capacity: usize) -> Self {
        Self {
            bus,
            capacity: capacity.max(1),
            history: Vec::new(),
            ptr: None,
            nav_enable_handlers: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn ptr(&self) -> Option<usize> {
        self.ptr
    }

    /// Replaces the whole stack, keeping at most `capacity` entries around
    /// `ptr`. The pointer is re-based so it still designates the same entry.
    pub fn define_history(&mut self, mut states: Vec<HistoryEntry>, ptr: Option<usize>) {
        let len = states.len();
        let m = self.capacity;
        let ptr = match ptr {
            _ if len == 0 => {
                states.clear();
                None
            }
            Some(ptr) => {
                let ptr = ptr.min(len - 1);
                if len > m {
                    let start = balanced_trim_start(m, len, ptr);
                    states.truncate(start + m);
                    states.drain(..start);
                    Some(ptr - start)
                } else {
                    Some(ptr)
                }
            }
            None => {
                // Without a pointer the window starts at the front.
                states.truncate(m);
                None
            }
        };
        debug!(entries = states.len(), ?ptr, "defined local history");
        self.history = states;
        self.ptr = ptr;
        self.publish_nav_enable();
    }

    pub fn describe_history(&self) -> HistorySnapshot {
        HistorySnapshot {
            states: self.history.clone(),
            ptr: self.ptr,
        }
    }

    pub fn add_nav_enable_handler<F>(&mut self, handler: F)
    where
        F: Fn(&NavEnable) + Send + Sync + 'static,
    {
        self.nav_enable_handlers.push(Box::new(handler));
    }

    fn publish_nav_enable(&self) {
        if self.nav_enable_handlers.is_empty() {
            return;
        }
        let update = NavEnable {
            back: self.can_go_backward(),
            forward: self.can_go_forward(),
            history: self.describe_history(),
        };
        for handler in &self.nav_enable_handlers {
            handler(&update);
        }
    }

    pub fn can_go_backward(&self) -> bool {
        matches!(self.ptr, Some(ptr) if ptr > 0)
    }

    pub fn can_go_forward(&self) -> bool {
        matches!(self.ptr, Some(ptr) if ptr + 1 < self.history.len())
    }

    pub fn state(&self) -> Option<&HistoryEntry> {
        self.ptr.and_then(|ptr| self.history.get(ptr))
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.ptr.and_then(|_| self.history.last())
    }

    pub fn back(&mut self) {
        if let Some(ptr) = self.ptr.filter(|&ptr| ptr > 0) {
            self.move_to(ptr - 1);
        }
    }

    pub fn forward(&mut self) {
        if let Some(ptr) = self.ptr.filter(|&ptr| ptr + 1 < self.history.len()) {
            self.move_to(ptr + 1);
        }
    }

    fn move_to(&mut self, ptr: usize) {
        self.ptr = Some(ptr);
        self.bus.dispatch(ViewerEvent::PopState {
            state: self.state().cloned(),
        });
        self.publish_nav_enable();
    }

    pub fn replace(&mut self, entry: HistoryEntry) {
        match self.ptr.and_then(|ptr| self.history.get_mut(ptr)) {
            Some(slot) => *slot = entry,
            None => {
                self.history.clear();
                self.history.push(entry);
                self.ptr = Some(0);
            }
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        let ptr = match self.ptr {
            Some(ptr) => {
                self.history.truncate(ptr + 1);
                ptr + 1
            }
            None => {
                self.history.clear();
                0
            }
        };
        self.history.push(entry);

        let excess = self.history.len().saturating_sub(self.capacity);
        if excess > 0 {
            self.history.drain(..excess);
        }
        self.ptr = Some(ptr.saturating_sub(excess));
        self.publish_nav_enable();
    }
}

impl HistoryHost for HistoryStack {
    fn state(&self) -> Option<HistoryEntry> {
        HistoryStack::state(self).cloned()
    }

    fn push_state(&mut self, entry: HistoryEntry, _url: Option<String>) {
        self.push(entry);
    }

    fn replace_state(&mut self, entry: HistoryEntry, _url: Option<String>) {
        self.replace(entry);
    }

    fn back(&mut self) {
        HistoryStack::back(self);
    }

    fn forward(&mut self) {
        HistoryStack::forward(self);
    }

    fn latest(&self) -> Option<HistoryEntry> {
        HistoryStack::latest(self).cloned()
    }

    fn describe(&self) -> Option<HistorySnapshot> {
        Some(self.describe_history())
    }

    fn add_nav_enable_handler(&mut self, handler: Box<dyn Fn(&NavEnable) + Send + Sync>) {
        self.nav_enable_handlers.push(handler);
    }
}

/// First index of a window of `m` entries out of `n` that keeps `p` inside,
/// centred on `p` when there is room on both sides and anchored to the
/// nearer edge otherwise.
pub fn balanced_trim_start(m: usize, n: usize, p: usize) -> usize {
    if n <= m {
        return 0;
    }
    let before = m.saturating_sub(1).div_ceil(2);
    let after = m.saturating_sub(1) / 2;
    let behind = p;
    let ahead = n - (p + 1);

    if behind >= before && ahead >= after {
        p - before
    } else if behind < before {
        0
    } else {
        n - m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::host::EventKind;
    use crate::Destination;

    fn entry(uid: i64) -> HistoryEntry {
        HistoryEntry {
            fingerprint: "doc".into(),
            uid,
            destination: Some(Destination {
                page: Some(uid as u32 + 1),
                ..Destination::default()
            }),
        }
    }

    fn uids(stack: &HistoryStack) -> Vec<i64> {
        stack.history.iter().map(|entry| entry.uid).collect()
    }

    #[test]
    fn push_truncates_forward_entries() {
        let mut stack = HistoryStack::new(EventBus::new());
        for uid in 0..4 {
            stack.push(entry(uid));
        }
        stack.back();
        stack.back();
        stack.push(entry(10));

        assert_eq!(uids(&stack), vec![0, 1, 10]);
        assert_eq!(stack.ptr(), Some(2));
        assert!(!stack.can_go_forward());
    }

    #[test]
    fn push_beyond_capacity_drops_oldest() {
        let mut stack = HistoryStack::with_capacity(EventBus::new(), 3);
        for uid in 0..5 {
            stack.push(entry(uid));
        }
        assert_eq!(uids(&stack), vec![2, 3, 4]);
        assert_eq!(stack.ptr(), Some(2));
        assert_eq!(stack.state().map(|e| e.uid), Some(4));
    }

    #[test]
    fn replace_initializes_empty_stack() {
        let mut stack = HistoryStack::new(EventBus::new());
        assert!(stack.state().is_none());
        stack.replace(entry(0));
        assert_eq!(stack.ptr(), Some(0));
        stack.replace(entry(7));
        assert_eq!(uids(&stack), vec![7]);
    }

    #[test]
    fn back_and_forward_respect_edges() {
        let mut stack = HistoryStack::new(EventBus::new());
        stack.back();
        assert_eq!(stack.ptr(), None);

        stack.push(entry(0));
        stack.push(entry(1));
        stack.forward();
        assert_eq!(stack.ptr(), Some(1));
        stack.back();
        stack.back();
        assert_eq!(stack.ptr(), Some(0));
        assert!(!stack.can_go_backward());
        assert!(stack.can_go_forward());
    }

    #[test]
    fn traversal_dispatches_pop_state() {
        let bus = EventBus::new();
        bus.on(EventKind::PopState);
        let mut stack = HistoryStack::new(bus.clone());
        stack.push(entry(0));
        stack.push(entry(1));

        stack.back();
        match bus.next() {
            Some(ViewerEvent::PopState { state: Some(state) }) => assert_eq!(state.uid, 0),
            other => panic!("unexpected event: {:?}", other),
        }

        stack.back();
        assert_eq!(bus.next(), None);
    }

    #[test]
    fn nav_enable_handlers_see_each_push_and_move() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut stack = HistoryStack::new(EventBus::new());
        let sink = Arc::clone(&seen);
        stack.add_nav_enable_handler(move |update: &NavEnable| {
            sink.lock().push((update.back, update.forward));
        });

        stack.push(entry(0));
        stack.push(entry(1));
        stack.back();
        stack.replace(entry(2));

        assert_eq!(
            *seen.lock(),
            vec![(false, false), (true, false), (false, true)]
        );
    }

    #[test]
    fn define_history_keeps_pointer_entry_when_trimming() {
        let mut stack = HistoryStack::with_capacity(EventBus::new(), 25);
        let states: Vec<_> = (0..30).map(entry).collect();
        stack.define_history(states, Some(20));

        assert_eq!(stack.len(), 25);
        assert_eq!(stack.state().map(|e| e.uid), Some(20));
        assert_eq!(uids(&stack), (5..30).collect::<Vec<_>>());
    }

    #[test]
    fn define_history_centres_window_when_room_on_both_sides() {
        let mut stack = HistoryStack::with_capacity(EventBus::new(), 5);
        let states: Vec<_> = (0..20).map(entry).collect();
        stack.define_history(states, Some(10));

        assert_eq!(uids(&stack), vec![8, 9, 10, 11, 12]);
        assert_eq!(stack.ptr(), Some(2));
    }

    #[test]
    fn define_history_anchors_at_start_near_front() {
        let mut stack = HistoryStack::with_capacity(EventBus::new(), 5);
        let states: Vec<_> = (0..20).map(entry).collect();
        stack.define_history(states, Some(1));

        assert_eq!(uids(&stack), vec![0, 1, 2, 3, 4]);
        assert_eq!(stack.ptr(), Some(1));
    }

    #[test]
    fn define_history_clamps_pointer_and_handles_empty_input() {
        let mut stack = HistoryStack::new(EventBus::new());
        stack.define_history((0..3).map(entry).collect(), Some(9));
        assert_eq!(stack.ptr(), Some(2));

        stack.define_history(Vec::new(), Some(0));
        assert_eq!(stack.ptr(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn define_history_without_pointer_keeps_oldest_entries() {
        let mut stack = HistoryStack::with_capacity(EventBus::new(), 5);
        stack.define_history((0..8).map(entry).collect(), None);

        assert_eq!(uids(&stack), vec![0, 1, 2, 3, 4]);
        assert_eq!(stack.ptr(), None);
    }

    #[test]
    fn balanced_window_matches_reference_cases() {
        assert_eq!(balanced_trim_start(25, 20, 3), 0);
        assert_eq!(balanced_trim_start(25, 30, 20), 5);
        assert_eq!(balanced_trim_start(25, 60, 30), 18);
        assert_eq!(balanced_trim_start(25, 60, 5), 0);
        assert_eq!(balanced_trim_start(4, 10, 5), 3);
    }

    #[test]
    fn latest_requires_a_pointer() {
        let mut stack = HistoryStack::new(EventBus::new());
        assert!(stack.latest().is_none());
        stack.push(entry(0));
        stack.push(entry(1));
        stack.back();
        assert_eq!(stack.latest().map(|e| e.uid), Some(1));
    }
}
