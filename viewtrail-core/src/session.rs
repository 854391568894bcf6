use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{instrument, trace};

use crate::config::HistoryConfig;
use crate::history::NavigationHistory;
use crate::host::{EventBus, HistoryHost, HostEnvironment, ManualClock, Scheduler, ViewerEvent};
use crate::link::LinkService;
use crate::{HistorySnapshot, PushRequest};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Initialize {
        fingerprint: String,
        reset_history: bool,
        update_url: bool,
    },
    Reset,
    Push(PushRequest),
    PushCurrentPosition,
    Back,
    Forward,
    DefineHistory {
        snapshot: HistorySnapshot,
        reinit: bool,
    },
    Emit(ViewerEvent),
    Advance {
        duration: Duration,
    },
}

pub struct Session {
    history: NavigationHistory,
    bus: EventBus,
    clock: Arc<ManualClock>,
}

impl Session {
    pub fn new(
        link_service: Arc<dyn LinkService>,
        environment: Arc<dyn HostEnvironment>,
        config: HistoryConfig,
    ) -> Self {
        let bus = EventBus::new();
        let clock = Arc::new(ManualClock::new());
        let scheduler: Arc<dyn Scheduler> = clock.clone();
        let history =
            NavigationHistory::local(link_service, bus.clone(), scheduler, environment, config);
        Self {
            history,
            bus,
            clock,
        }
    }

    pub fn with_host(
        link_service: Arc<dyn LinkService>,
        environment: Arc<dyn HostEnvironment>,
        bus: EventBus,
        host: Box<dyn HistoryHost>,
        config: HistoryConfig,
    ) -> Self {
        let clock = Arc::new(ManualClock::new());
        let scheduler: Arc<dyn Scheduler> = clock.clone();
        let history = NavigationHistory::new(
            link_service,
            bus.clone(),
            scheduler,
            environment,
            host,
            config,
        );
        Self {
            history,
            bus,
            clock,
        }
    }

    #[instrument(skip(self))]
    pub fn apply(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Initialize {
                fingerprint,
                reset_history,
                update_url,
            } => {
                self.history
                    .initialize(&fingerprint, reset_history, update_url)?;
            }
            Command::Reset => self.history.reset(),
            Command::Push(request) => self.history.push(request)?,
            Command::PushCurrentPosition => self.history.push_current_position(),
            Command::Back => self.history.back(),
            Command::Forward => self.history.forward(),
            Command::DefineHistory { snapshot, reinit } => {
                self.history
                    .define_history(snapshot.states, snapshot.ptr, reinit)?;
            }
            Command::Emit(event) => {
                if !self.bus.dispatch(event) {
                    trace!("event dropped without listeners");
                }
            }
            Command::Advance { duration } => {
                self.advance(duration);
                return Ok(());
            }
        }
        self.run_until_idle();
        Ok(())
    }

    pub fn deliver_events(&mut self) {
        while let Some(event) = self.bus.next() {
            self.history.handle_event(event);
        }
    }

    pub fn run_until_idle(&mut self) {
        loop {
            self.deliver_events();
            match self.clock.pop_immediate() {
                Some((id, timer)) => self.history.on_timer(id, timer),
                None => break,
            }
        }
    }

    /// Fires due timers in deadline order, with a full turn after each.
    pub fn advance(&mut self, duration: Duration) {
        self.run_until_idle();
        let until = self.clock.now() + duration;
        while let Some((id, timer)) = self.clock.pop_due(until) {
            self.history.on_timer(id, timer);
            self.run_until_idle();
        }
        self.clock.set_now(until);
    }

    pub fn history(&self) -> &NavigationHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut NavigationHistory {
        &mut self.history
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn describe(&self) -> Option<HistorySnapshot> {
        self.history.describe_history()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::host::MemoryEnvironment;
    use crate::link::{LinkCommand, MemoryLinkService};
    use crate::{Destination, HistoryEntry, ViewareaLocation};

    fn session(pages: u32) -> (Session, Arc<MemoryLinkService>) {
        let link = Arc::new(MemoryLinkService::new(pages));
        let env = Arc::new(MemoryEnvironment::default());
        let session = Session::new(link.clone(), env, HistoryConfig::default());
        (session, link)
    }

    fn initialize(session: &mut Session) {
        session
            .apply(Command::Initialize {
                fingerprint: "doc".into(),
                reset_history: false,
                update_url: false,
            })
            .unwrap();
    }

    fn viewarea(page: u32) -> ViewerEvent {
        ViewerEvent::UpdateViewarea {
            location: ViewareaLocation {
                page_number: page,
                pdf_open_params: format!("#page={page}&zoom=auto"),
                rotation: 0,
            },
        }
    }

    #[test]
    fn commands_before_initialize_are_ignored() {
        let (mut session, _) = session(10);
        session
            .apply(Command::Push(PushRequest::new(vec![json!(1)], Some(2))))
            .unwrap();
        session.apply(Command::Back).unwrap();
        assert_eq!(session.describe().map(|s| s.states.len()), Some(0));
    }

    #[test]
    fn invalid_push_surfaces_as_error() {
        let (mut session, _) = session(10);
        initialize(&mut session);
        session
            .apply(Command::Push(PushRequest::new(vec![json!(1)], Some(2))))
            .unwrap();
        let err = session
            .apply(Command::Push(PushRequest::new(vec![json!(2)], Some(40))))
            .unwrap_err();
        assert!(err.to_string().contains("page number"));
    }

    #[test]
    fn push_guard_clears_at_end_of_turn() {
        let (mut session, _) = session(10);
        initialize(&mut session);
        session
            .history_mut()
            .push(PushRequest::new(vec![json!(1)], Some(2)))
            .unwrap();
        assert!(session.history().pop_state_in_progress());

        session.run_until_idle();
        assert!(!session.history().pop_state_in_progress());
    }

    #[test]
    fn advance_fires_debounced_flush() {
        let (mut session, link) = session(10);
        initialize(&mut session);
        session.apply(Command::Emit(ViewerEvent::PagesInit)).unwrap();
        session
            .apply(Command::Emit(ViewerEvent::PagesLoaded { pages_count: 10 }))
            .unwrap();
        link.scroll_to(3);
        session.apply(Command::Emit(viewarea(3))).unwrap();

        session
            .apply(Command::Advance {
                duration: Duration::from_millis(999),
            })
            .unwrap();
        assert!(session.history().destination().is_none());

        session
            .apply(Command::Advance {
                duration: Duration::from_millis(1),
            })
            .unwrap();
        let destination = session.history().destination().cloned().unwrap();
        assert!(destination.temporary);
        assert_eq!(destination.hash.as_deref(), Some("page=3&zoom=auto"));
        assert_eq!(session.clock().now(), Duration::from_millis(1000));
    }

    #[test]
    fn define_history_with_reinit_adopts_pointer_entry() {
        let (mut session, _) = session(10);
        initialize(&mut session);

        let states = (0..3)
            .map(|uid| HistoryEntry {
                fingerprint: "doc".into(),
                uid,
                destination: Some(Destination {
                    hash: Some(format!("page={}", uid + 1)),
                    page: Some(uid as u32 + 1),
                    ..Destination::default()
                }),
            })
            .collect();
        session
            .apply(Command::DefineHistory {
                snapshot: HistorySnapshot {
                    states,
                    ptr: Some(1),
                },
                reinit: true,
            })
            .unwrap();

        assert_eq!(session.history().uid(), 1);
        assert_eq!(session.history().max_uid(), 2);
        assert_eq!(session.history().initial_bookmark(), Some("page=2"));
    }

    #[test]
    fn back_and_forward_drive_the_link_service() {
        let (mut session, link) = session(10);
        initialize(&mut session);
        session
            .apply(Command::Push(PushRequest::new(vec![json!({ "num": 1 })], Some(1))))
            .unwrap();
        session
            .apply(Command::Push(PushRequest::new(vec![json!({ "num": 5 })], Some(5))))
            .unwrap();
        link.take_commands();

        session.apply(Command::Back).unwrap();
        assert_eq!(
            link.take_commands(),
            vec![
                LinkCommand::SetRotation(0),
                LinkCommand::NavigateTo(vec![json!({ "num": 1 })]),
            ]
        );

        session.apply(Command::Forward).unwrap();
        assert_eq!(
            link.take_commands(),
            vec![
                LinkCommand::SetRotation(0),
                LinkCommand::NavigateTo(vec![json!({ "num": 5 })]),
            ]
        );
    }
}
