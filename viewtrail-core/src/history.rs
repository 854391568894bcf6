use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, instrument, trace};

use crate::config::HistoryConfig;
use crate::dest::{
    is_dest_arrays_equal, is_dest_hashes_equal, is_valid_rotation, page_from_hash, unescape_hash,
};
use crate::error::{HistoryError, HistoryResult};
use crate::host::{
    EventBus, EventKind, HistoryHost, HistoryTimer, HostEnvironment, NavigationType, Scheduler,
    TimerId, ViewerEvent,
};
use crate::link::LinkService;
use crate::stack::{HistoryStack, NavEnable};
use crate::{
    Destination, Fingerprint, HistoryEntry, HistorySnapshot, Position, PushRequest,
    ViewareaLocation,
};

type SharedNavEnableHandler = Arc<dyn Fn(&NavEnable) + Send + Sync>;

pub struct NavigationHistory {
    link_service: Arc<dyn LinkService>,
    bus: EventBus,
    scheduler: Arc<dyn Scheduler>,
    environment: Arc<dyn HostEnvironment>,
    config: HistoryConfig,
    history: Box<dyn HistoryHost>,
    nav_enable_handlers: Vec<SharedNavEnableHandler>,

    initialized: bool,
    fingerprint: Fingerprint,
    update_url: bool,
    events_bound: bool,

    pop_state_in_progress: bool,
    block_hash_change: u32,
    hash_change_waits: Vec<TimerId>,
    current_hash: String,
    num_position_updates: u32,

    uid: i64,
    max_uid: i64,
    destination: Option<Destination>,
    position: Option<Position>,
    update_viewarea_timer: Option<TimerId>,

    initial_bookmark: Option<String>,
    initial_rotation: Option<i32>,

    is_presentation_mode: bool,
    is_pages_loaded: bool,
    awaiting_pages_loaded: bool,
}

impl NavigationHistory {
    pub fn new(
        link_service: Arc<dyn LinkService>,
        bus: EventBus,
        scheduler: Arc<dyn Scheduler>,
        environment: Arc<dyn HostEnvironment>,
        history: Box<dyn HistoryHost>,
        config: HistoryConfig,
    ) -> Self {
        bus.on(EventKind::PagesInit);
        bus.on(EventKind::PresentationModeChanged);
        Self {
            link_service,
            bus,
            scheduler,
            environment,
            config,
            history,
            nav_enable_handlers: Vec::new(),
            initialized: false,
            fingerprint: String::new(),
            update_url: false,
            events_bound: false,
            pop_state_in_progress: false,
            block_hash_change: 0,
            hash_change_waits: Vec::new(),
            current_hash: String::new(),
            num_position_updates: 0,
            uid: 0,
            max_uid: 0,
            destination: None,
            position: None,
            update_viewarea_timer: None,
            initial_bookmark: None,
            initial_rotation: None,
            is_presentation_mode: false,
            is_pages_loaded: false,
            awaiting_pages_loaded: false,
        }
    }

    pub fn local(
        link_service: Arc<dyn LinkService>,
        bus: EventBus,
        scheduler: Arc<dyn Scheduler>,
        environment: Arc<dyn HostEnvironment>,
        config: HistoryConfig,
    ) -> Self {
        let stack = HistoryStack::with_capacity(bus.clone(), config.capacity());
        Self::new(
            link_service,
            bus,
            scheduler,
            environment,
            Box::new(stack),
            config,
        )
    }

    /// Adopts the host's stored entry for this document, or starts over from
    /// the URL hash.
    #[instrument(skip(self))]
    pub fn initialize(
        &mut self,
        fingerprint: &str,
        reset_history: bool,
        update_url: bool,
    ) -> HistoryResult<()> {
        if fingerprint.is_empty() {
            error!("the fingerprint must be a non-empty string");
            return Err(HistoryError::InvalidFingerprint);
        }
        if self.initialized {
            self.reset();
        }
        let re_initialized = !self.fingerprint.is_empty() && self.fingerprint != fingerprint;
        self.fingerprint = fingerprint.to_string();
        self.update_url = update_url;
        self.initialized = true;
        self.bind_events();

        let state = self.history.state();
        self.pop_state_in_progress = false;
        self.clear_hash_change_waits();
        self.current_hash = self.environment.hash();
        self.num_position_updates = 0;
        self.uid = 0;
        self.max_uid = 0;
        self.destination = None;
        self.position = None;

        let adopted = if reset_history {
            None
        } else {
            self.validate_state(state.as_ref(), true)
                .map(|(destination, uid)| (destination.clone(), uid))
        };

        let Some((destination, uid)) = adopted else {
            let parsed = self.parse_current_hash();
            if reset_history || parsed.hash().is_none() {
                debug!(reset_history, "starting an empty timeline");
                self.push_or_replace_state(None, true);
            } else if re_initialized {
                debug!(hash = ?parsed.hash, "new document, pushing the URL hash");
                self.initial_bookmark = parsed.hash.clone();
                self.push_new_document_state(parsed);
            } else {
                debug!(hash = ?parsed.hash, "starting from the URL hash");
                self.initial_bookmark = parsed.hash.clone();
                self.push_or_replace_state(Some(parsed), true);
            }
            return Ok(());
        };

        self.update_internal_state(Some(destination), uid, true);
        self.max_uid = match self.history.latest() {
            Some(latest) => latest.uid.max(self.uid),
            None => self.max_uid.max(self.uid),
        };

        if let Some(current) = self.destination.as_mut() {
            if let Some(rotation) = current.rotation {
                self.initial_rotation = Some(rotation);
            }
            if let Some(dest) = &current.dest {
                self.initial_bookmark = serde_json::to_string(dest).ok();
                current.page = None;
            } else if let Some(hash) = current.hash() {
                self.initial_bookmark = Some(hash.to_string());
            } else if let Some(page) = current.page() {
                self.initial_bookmark = Some(format!("page={page}"));
            }
        }
        debug!(uid = self.uid, max_uid = self.max_uid, "adopted stored history entry");
        Ok(())
    }

    pub fn reset(&mut self) {
        if self.initialized {
            self.page_hide();
            self.initialized = false;
            self.unbind_events();
        }
        self.cancel_update_viewarea_timer();
        self.initial_bookmark = None;
        self.initial_rotation = None;
    }

    pub fn define_history(
        &mut self,
        states: Vec<HistoryEntry>,
        ptr: Option<usize>,
        reinit: bool,
    ) -> HistoryResult<()> {
        let mut stack = HistoryStack::with_capacity(self.bus.clone(), self.config.capacity());
        for handler in &self.nav_enable_handlers {
            stack.add_nav_enable_handler(forward_to(handler));
        }
        stack.define_history(states, ptr);
        self.history = Box::new(stack);
        if reinit {
            let fingerprint = self.fingerprint.clone();
            self.initialize(&fingerprint, false, false)?;
        }
        Ok(())
    }

    // Handlers are kept so a later `define_history` can carry them over.
    pub fn add_nav_enable_handler<F>(&mut self, handler: F)
    where
        F: Fn(&NavEnable) + Send + Sync + 'static,
    {
        let handler: SharedNavEnableHandler = Arc::new(handler);
        self.history
            .add_nav_enable_handler(Box::new(forward_to(&handler)));
        self.nav_enable_handlers.push(handler);
    }

    pub fn push(&mut self, request: PushRequest) -> HistoryResult<()> {
        if !self.initialized {
            return Ok(());
        }
        let PushRequest {
            named_dest,
            explicit_dest,
            page_number,
        } = request;

        let Some(explicit_dest) = explicit_dest else {
            error!("push requires an explicit destination array");
            return Err(HistoryError::MissingExplicitDest);
        };
        let pages_count = i64::from(self.link_service.pages_count());
        let page = page_number
            .filter(|&page| page > 0 && page <= pages_count)
            .and_then(|page| u32::try_from(page).ok());
        if page.is_none() && (page_number.is_some() || self.destination.is_some()) {
            error!(?page_number, pages_count, "push received an invalid page number");
            return Err(HistoryError::InvalidPageNumber(page_number));
        }

        let hash = match named_dest.filter(|named| !named.is_empty()) {
            Some(named) => named,
            None => serde_json::to_string(&explicit_dest).unwrap_or_default(),
        };
        if hash.is_empty() {
            return Ok(());
        }

        let mut force_replace = false;
        if let Some(current) = &self.destination {
            if is_dest_hashes_equal(current.hash.as_deref(), &hash)
                || is_dest_arrays_equal(current.dest.as_deref(), Some(explicit_dest.as_slice()))
            {
                if current.page().is_some() {
                    trace!(%hash, "destination already recorded");
                    return Ok(());
                }
                force_replace = true;
            }
        }
        if self.pop_state_in_progress && !force_replace {
            debug!(%hash, "ignoring push during history traversal");
            return Ok(());
        }

        let rotation = self.link_service.rotation();
        self.push_or_replace_state(
            Some(Destination {
                dest: Some(explicit_dest),
                hash: Some(hash),
                page,
                first: None,
                rotation: Some(rotation),
                temporary: false,
            }),
            force_replace,
        );

        if !self.pop_state_in_progress {
            self.pop_state_in_progress = true;
            self.scheduler
                .schedule(Duration::ZERO, HistoryTimer::ClearPopState);
        }
        Ok(())
    }

    pub fn push_current_position(&mut self) {
        if !self.initialized || self.pop_state_in_progress {
            return;
        }
        self.try_push_current_position(false);
    }

    pub fn back(&mut self) {
        if !self.initialized || self.pop_state_in_progress {
            return;
        }
        let state = self.history.state();
        if let Some((_, uid)) = self.validate_state(state.as_ref(), false) {
            if uid > 0 {
                self.history.back();
            }
        }
    }

    pub fn forward(&mut self) {
        if !self.initialized || self.pop_state_in_progress {
            return;
        }
        let state = self.history.state();
        if let Some((_, uid)) = self.validate_state(state.as_ref(), false) {
            if uid < self.max_uid {
                self.history.forward();
            }
        }
    }

    pub fn handle_event(&mut self, event: ViewerEvent) {
        match event {
            ViewerEvent::PresentationModeChanged {
                active,
                switch_in_progress,
            } => {
                self.is_presentation_mode = active || switch_in_progress;
            }
            ViewerEvent::PagesInit => {
                self.is_pages_loaded = false;
                if !self.awaiting_pages_loaded {
                    self.awaiting_pages_loaded = true;
                    self.bus.on(EventKind::PagesLoaded);
                }
            }
            ViewerEvent::PagesLoaded { pages_count } => {
                if self.awaiting_pages_loaded {
                    self.awaiting_pages_loaded = false;
                    self.bus.off(EventKind::PagesLoaded);
                    self.is_pages_loaded = pages_count > 0;
                }
            }
            ViewerEvent::UpdateViewarea { location } if self.events_bound => {
                self.update_viewarea(location);
            }
            ViewerEvent::PopState { state } if self.events_bound => {
                self.pop_state(state);
            }
            ViewerEvent::PageHide if self.events_bound => {
                self.page_hide();
            }
            ViewerEvent::HashChange => self.resolve_hash_change_waits(),
            ViewerEvent::UpdateViewarea { .. }
            | ViewerEvent::PopState { .. }
            | ViewerEvent::PageHide => {}
        }
    }

    pub fn on_timer(&mut self, id: TimerId, timer: HistoryTimer) {
        match timer {
            HistoryTimer::FlushPosition => {
                if self.update_viewarea_timer != Some(id) {
                    return;
                }
                self.update_viewarea_timer = None;
                if !self.pop_state_in_progress {
                    self.try_push_current_position(true);
                }
            }
            HistoryTimer::ClearPopState => {
                self.pop_state_in_progress = false;
            }
            HistoryTimer::HashChangeSettled => self.settle_hash_change(id),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn pop_state_in_progress(&self) -> bool {
        self.initialized && (self.pop_state_in_progress || self.block_hash_change > 0)
    }

    pub fn initial_bookmark(&self) -> Option<&str> {
        if self.initialized {
            self.initial_bookmark.as_deref()
        } else {
            None
        }
    }

    pub fn initial_rotation(&self) -> Option<i32> {
        if self.initialized {
            self.initial_rotation
        } else {
            None
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn max_uid(&self) -> i64 {
        self.max_uid
    }

    pub fn is_pages_loaded(&self) -> bool {
        self.is_pages_loaded
    }

    pub fn is_presentation_mode(&self) -> bool {
        self.is_presentation_mode
    }

    pub fn history(&self) -> &dyn HistoryHost {
        self.history.as_ref()
    }

    pub fn history_mut(&mut self) -> &mut dyn HistoryHost {
        self.history.as_mut()
    }

    pub fn describe_history(&self) -> Option<HistorySnapshot> {
        self.history.describe()
    }

    fn push_or_replace_state(&mut self, destination: Option<Destination>, force_replace: bool) {
        let should_replace = force_replace || self.destination.is_none();
        let uid = if should_replace { self.uid } else { self.uid + 1 };
        let entry = HistoryEntry {
            fingerprint: self.fingerprint.clone(),
            uid,
            destination: destination.clone(),
        };
        let url = self.candidate_url(destination.as_ref());

        self.update_internal_state(destination, uid, false);

        if should_replace {
            debug!(uid, ?url, "replacing history entry");
            self.history.replace_state(entry, url);
        } else {
            self.max_uid = self.uid;
            debug!(uid, ?url, "pushing history entry");
            self.history.push_state(entry, url);
        }
    }

    fn push_new_document_state(&mut self, destination: Destination) {
        let entry = HistoryEntry {
            fingerprint: self.fingerprint.clone(),
            uid: self.uid,
            destination: Some(destination.clone()),
        };
        let url = self.candidate_url(Some(&destination));
        self.update_internal_state(Some(destination), entry.uid, false);
        debug!(uid = entry.uid, ?url, "pushing history entry for new document");
        self.history.push_state(entry, url);
    }

    fn candidate_url(&self, destination: Option<&Destination>) -> Option<String> {
        if !self.update_url {
            return None;
        }
        let hash = destination?.hash()?;
        let href = self.environment.href();
        let base = href.split('#').next().unwrap_or_default();
        if base.starts_with("file://") {
            return None;
        }
        Some(format!("{base}#{hash}"))
    }

    /// With `check_reload`, a foreign fingerprint of the same UTF-16 length is
    /// accepted on a reload. This is approximate: nothing proves the document
    /// is actually the same.
    fn validate_state<'a>(
        &self,
        state: Option<&'a HistoryEntry>,
        check_reload: bool,
    ) -> Option<(&'a Destination, i64)> {
        let state = state?;
        if state.fingerprint != self.fingerprint {
            if !check_reload
                || state.fingerprint.encode_utf16().count()
                    != self.fingerprint.encode_utf16().count()
                || self.environment.navigation_type() != Some(NavigationType::Reload)
            {
                return None;
            }
        }
        if state.uid < 0 {
            return None;
        }
        let destination = state.destination.as_ref()?;
        Some((destination, state.uid))
    }

    fn update_internal_state(
        &mut self,
        mut destination: Option<Destination>,
        uid: i64,
        remove_temporary: bool,
    ) {
        self.cancel_update_viewarea_timer();
        if remove_temporary {
            if let Some(destination) = destination.as_mut() {
                destination.temporary = false;
            }
        }
        self.destination = destination;
        self.uid = uid;
        self.num_position_updates = 0;
    }

    fn parse_current_hash(&self) -> Destination {
        let hash = unescape_hash(&self.environment.hash());
        let page = page_from_hash(&hash);
        let pages_count = i64::from(self.link_service.pages_count());
        let page = if page > 0 && page <= pages_count {
            u32::try_from(page).ok()
        } else {
            None
        };
        Destination {
            hash: Some(hash),
            page,
            rotation: Some(self.link_service.rotation()),
            ..Destination::default()
        }
    }

    fn try_push_current_position(&mut self, temporary: bool) {
        let Some(position) = self.position.as_ref() else {
            return;
        };
        let (first, page) = (position.first, position.page);
        let candidate = position.to_destination(temporary);

        let Some(current) = self.destination.as_ref() else {
            self.push_or_replace_state(Some(candidate), false);
            return;
        };
        if current.temporary {
            self.push_or_replace_state(Some(candidate), true);
            return;
        }
        if current.hash == candidate.hash {
            return;
        }

        let threshold = self.config.position_updated_threshold;
        if current.page().is_none()
            && (threshold == 0 || self.num_position_updates <= threshold)
        {
            trace!(
                updates = self.num_position_updates,
                "position not recorded before the destination has a page"
            );
            return;
        }

        let mut force_replace = false;
        if let Some(current_page) = current.page() {
            if current_page >= first && current_page <= page {
                // The destination is still on screen. Keep an explicit
                // navigation as is; a recorded position is refreshed in place.
                if current.dest.is_some() || current.first.is_none() {
                    return;
                }
                force_replace = true;
            }
        }
        self.push_or_replace_state(Some(candidate), force_replace);
    }

    fn update_viewarea(&mut self, location: ViewareaLocation) {
        self.cancel_update_viewarea_timer();

        let hash = if self.is_presentation_mode {
            format!("page={}", location.page_number)
        } else {
            let params = location.pdf_open_params.as_str();
            params.strip_prefix('#').unwrap_or(params).to_string()
        };
        self.position = Some(Position {
            hash,
            page: self.link_service.page(),
            first: location.page_number,
            rotation: location.rotation,
        });
        trace!(position = ?self.position, "captured view position");

        if self.pop_state_in_progress {
            return;
        }

        if self.config.position_updated_threshold > 0
            && self.is_pages_loaded
            && !self.is_presentation_mode
            && self
                .destination
                .as_ref()
                .map_or(false, |destination| destination.page().is_none())
        {
            self.num_position_updates += 1;
        }

        let timeout = self.config.update_viewarea_timeout();
        if !timeout.is_zero() {
            self.update_viewarea_timer = Some(
                self.scheduler
                    .schedule(timeout, HistoryTimer::FlushPosition),
            );
        }
    }

    fn pop_state(&mut self, state: Option<HistoryEntry>) {
        let new_hash = self.environment.hash();
        let hash_changed = self.current_hash != new_hash;
        self.current_hash = new_hash;

        let Some(state) = state else {
            // A hash edit without history state starts a new entry in place.
            self.uid += 1;
            let destination = self.parse_current_hash();
            debug!(uid = self.uid, hash = ?destination.hash, "recording edited hash");
            self.push_or_replace_state(Some(destination), true);
            return;
        };

        let Some((destination, uid)) = self
            .validate_state(Some(&state), false)
            .map(|(destination, uid)| (destination.clone(), uid))
        else {
            debug!(uid = state.uid, "ignoring history entry of another document");
            return;
        };

        self.pop_state_in_progress = true;

        if hash_changed {
            self.block_hash_change += 1;
            let id = self.scheduler.schedule(
                self.config.hash_change_timeout(),
                HistoryTimer::HashChangeSettled,
            );
            self.hash_change_waits.push(id);
            self.bus.on(EventKind::HashChange);
        }

        self.update_internal_state(Some(destination.clone()), uid, true);
        if self.uid > self.max_uid {
            self.max_uid = self.uid;
        }
        debug!(uid, max_uid = self.max_uid, "applying history traversal");

        if let Some(rotation) = destination.rotation.filter(|&r| is_valid_rotation(r)) {
            self.link_service.set_rotation(rotation);
        }
        if let Some(dest) = &destination.dest {
            self.link_service.navigate_to(dest);
        } else if let Some(hash) = destination.hash() {
            self.link_service.set_hash(hash);
        } else if let Some(page) = destination.page() {
            self.link_service.set_page(page);
        }

        self.scheduler
            .schedule(Duration::ZERO, HistoryTimer::ClearPopState);
    }

    fn page_hide(&mut self) {
        let flush = self
            .destination
            .as_ref()
            .map_or(true, |destination| destination.temporary);
        if flush {
            self.try_push_current_position(false);
        }
    }

    fn settle_hash_change(&mut self, id: TimerId) {
        if let Some(index) = self.hash_change_waits.iter().position(|wait| *wait == id) {
            self.hash_change_waits.swap_remove(index);
            self.block_hash_change = self.block_hash_change.saturating_sub(1);
            self.bus.off(EventKind::HashChange);
        }
    }

    fn resolve_hash_change_waits(&mut self) {
        for id in std::mem::take(&mut self.hash_change_waits) {
            self.scheduler.cancel(id);
            self.block_hash_change = self.block_hash_change.saturating_sub(1);
            self.bus.off(EventKind::HashChange);
        }
    }

    fn clear_hash_change_waits(&mut self) {
        self.resolve_hash_change_waits();
        self.block_hash_change = 0;
    }

    fn cancel_update_viewarea_timer(&mut self) {
        if let Some(id) = self.update_viewarea_timer.take() {
            self.scheduler.cancel(id);
        }
    }

    fn bind_events(&mut self) {
        if self.events_bound {
            return;
        }
        self.bus.on(EventKind::UpdateViewarea);
        self.bus.on(EventKind::PopState);
        self.bus.on(EventKind::PageHide);
        self.events_bound = true;
    }

    fn unbind_events(&mut self) {
        if !self.events_bound {
            return;
        }
        self.bus.off(EventKind::UpdateViewarea);
        self.bus.off(EventKind::PopState);
        self.bus.off(EventKind::PageHide);
        self.events_bound = false;
    }
}

fn forward_to(handler: &SharedNavEnableHandler) -> impl Fn(&NavEnable) + Send + Sync + 'static {
    let handler = Arc::clone(handler);
    move |update: &NavEnable| handler(update)
}
