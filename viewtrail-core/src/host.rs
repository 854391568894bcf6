use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::stack::NavEnable;
use crate::{HistoryEntry, HistorySnapshot, ViewareaLocation};

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    PagesInit,
    PagesLoaded {
        pages_count: u32,
    },
    PresentationModeChanged {
        active: bool,
        switch_in_progress: bool,
    },
    UpdateViewarea {
        location: ViewareaLocation,
    },
    /// `state` is `None` when only the URL hash was edited.
    PopState {
        state: Option<HistoryEntry>,
    },
    PageHide,
    HashChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PagesInit,
    PagesLoaded,
    PresentationModeChanged,
    UpdateViewarea,
    PopState,
    PageHide,
    HashChange,
}

impl ViewerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ViewerEvent::PagesInit => EventKind::PagesInit,
            ViewerEvent::PagesLoaded { .. } => EventKind::PagesLoaded,
            ViewerEvent::PresentationModeChanged { .. } => EventKind::PresentationModeChanged,
            ViewerEvent::UpdateViewarea { .. } => EventKind::UpdateViewarea,
            ViewerEvent::PopState { .. } => EventKind::PopState,
            ViewerEvent::PageHide => EventKind::PageHide,
            ViewerEvent::HashChange => EventKind::HashChange,
        }
    }
}

// Events nobody listens to are dropped at dispatch time.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

#[derive(Default)]
struct BusInner {
    listeners: HashMap<EventKind, usize>,
    queue: VecDeque<ViewerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, kind: EventKind) {
        *self.inner.lock().listeners.entry(kind).or_insert(0) += 1;
    }

    pub fn off(&self, kind: EventKind) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.listeners.get_mut(&kind) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.listeners.remove(&kind);
            }
        }
    }

    pub fn is_listening(&self, kind: EventKind) -> bool {
        self.inner.lock().listeners.contains_key(&kind)
    }

    pub fn dispatch(&self, event: ViewerEvent) -> bool {
        let mut inner = self.inner.lock();
        if !inner.listeners.contains_key(&event.kind()) {
            return false;
        }
        inner.queue.push_back(event);
        true
    }

    pub fn next(&self) -> Option<ViewerEvent> {
        self.inner.lock().queue.pop_front()
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryTimer {
    FlushPosition,
    ClearPopState,
    HashChangeSettled,
}

pub trait Scheduler: Send + Sync {
    /// A zero delay means "at the end of the current turn".
    fn schedule(&self, delay: Duration, timer: HistoryTimer) -> TimerId;
    fn cancel(&self, id: TimerId);
}

/// Zero-delay tasks are always drained before any timed task.
#[derive(Default)]
pub struct ManualClock {
    inner: Mutex<ClockInner>,
}

#[derive(Default)]
struct ClockInner {
    now: Duration,
    next_id: u64,
    immediate: VecDeque<(TimerId, HistoryTimer)>,
    timed: BTreeMap<(Duration, TimerId), HistoryTimer>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.inner.lock().now
    }

    pub fn pop_immediate(&self) -> Option<(TimerId, HistoryTimer)> {
        self.inner.lock().immediate.pop_front()
    }

    pub fn pop_due(&self, until: Duration) -> Option<(TimerId, HistoryTimer)> {
        let mut inner = self.inner.lock();
        let (&(deadline, id), _) = inner.timed.iter().next()?;
        if deadline > until {
            return None;
        }
        let timer = inner.timed.remove(&(deadline, id))?;
        inner.now = inner.now.max(deadline);
        Some((id, timer))
    }

    pub fn set_now(&self, now: Duration) {
        let mut inner = self.inner.lock();
        inner.now = inner.now.max(now);
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.inner.lock().timed.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn pending(&self) -> usize {
        let inner = self.inner.lock();
        inner.immediate.len() + inner.timed.len()
    }
}

impl Scheduler for ManualClock {
    fn schedule(&self, delay: Duration, timer: HistoryTimer) -> TimerId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = TimerId(inner.next_id);
        if delay.is_zero() {
            inner.immediate.push_back((id, timer));
        } else {
            let deadline = inner.now + delay;
            inner.timed.insert((deadline, id), timer);
        }
        id
    }

    fn cancel(&self, id: TimerId) {
        let mut inner = self.inner.lock();
        inner.immediate.retain(|(pending, _)| *pending != id);
        inner.timed.retain(|(_, pending), _| *pending != id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationType {
    Navigate,
    Reload,
    BackForward,
    Prerender,
}

pub trait HostEnvironment: Send + Sync {
    fn href(&self) -> String;

    fn navigation_type(&self) -> Option<NavigationType>;

    /// The fragment including its `#`, or an empty string when there is none.
    fn hash(&self) -> String {
        let href = self.href();
        match href.find('#') {
            Some(index) if index + 1 < href.len() => href[index..].to_string(),
            _ => String::new(),
        }
    }
}

pub struct MemoryEnvironment {
    href: Mutex<String>,
    navigation_type: Mutex<Option<NavigationType>>,
}

impl MemoryEnvironment {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: Mutex::new(href.into()),
            navigation_type: Mutex::new(Some(NavigationType::Navigate)),
        }
    }

    pub fn set_href(&self, href: impl Into<String>) {
        *self.href.lock() = href.into();
    }

    pub fn set_hash(&self, hash: &str) {
        let mut href = self.href.lock();
        let base = href.split('#').next().unwrap_or_default().to_string();
        let hash = hash.strip_prefix('#').unwrap_or(hash);
        *href = if hash.is_empty() {
            base
        } else {
            format!("{base}#{hash}")
        };
    }

    pub fn set_navigation_type(&self, navigation_type: Option<NavigationType>) {
        *self.navigation_type.lock() = navigation_type;
    }
}

impl Default for MemoryEnvironment {
    fn default() -> Self {
        Self::new("https://viewer.invalid/document")
    }
}

impl HostEnvironment for MemoryEnvironment {
    fn href(&self) -> String {
        self.href.lock().clone()
    }

    fn navigation_type(&self) -> Option<NavigationType> {
        *self.navigation_type.lock()
    }
}

pub trait HistoryHost: Send {
    fn state(&self) -> Option<HistoryEntry>;
    fn push_state(&mut self, entry: HistoryEntry, url: Option<String>);
    fn replace_state(&mut self, entry: HistoryEntry, url: Option<String>);
    fn back(&mut self);
    fn forward(&mut self);

    /// The newest entry, for hosts that can see past the current position.
    fn latest(&self) -> Option<HistoryEntry> {
        None
    }

    fn describe(&self) -> Option<HistorySnapshot> {
        None
    }

    /// Hosts without back/forward controls may ignore the handler.
    fn add_nav_enable_handler(&mut self, _handler: Box<dyn Fn(&NavEnable) + Send + Sync>) {}
}
