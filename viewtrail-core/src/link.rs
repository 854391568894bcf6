use parking_lot::Mutex;
use serde_json::Value;

use crate::dest::page_from_hash;

/// The viewer's navigation capability, as seen by the history engine.
pub trait LinkService: Send + Sync {
    fn pages_count(&self) -> u32;
    fn page(&self) -> u32;
    fn set_page(&self, page: u32);
    fn rotation(&self) -> i32;
    fn set_rotation(&self, rotation: i32);
    fn navigate_to(&self, dest: &[Value]);
    fn set_hash(&self, hash: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    NavigateTo(Vec<Value>),
    SetHash(String),
    SetPage(u32),
    SetRotation(i32),
}

#[derive(Debug, Clone, Copy)]
struct LinkState {
    pages_count: u32,
    page: u32,
    rotation: i32,
}

/// Link service that keeps page and rotation in memory and records every
/// command it receives. `set_hash` follows a `page=` parameter when the page
/// exists.
pub struct MemoryLinkService {
    state: Mutex<LinkState>,
    commands: Mutex<Vec<LinkCommand>>,
}

impl MemoryLinkService {
    pub fn new(pages_count: u32) -> Self {
        Self {
            state: Mutex::new(LinkState {
                pages_count,
                page: 1,
                rotation: 0,
            }),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn set_pages_count(&self, pages_count: u32) {
        self.state.lock().pages_count = pages_count;
    }

    /// Moves the viewer without recording a command, as scrolling would.
    pub fn scroll_to(&self, page: u32) {
        self.state.lock().page = page;
    }

    pub fn commands(&self) -> Vec<LinkCommand> {
        self.commands.lock().clone()
    }

    pub fn take_commands(&self) -> Vec<LinkCommand> {
        std::mem::take(&mut *self.commands.lock())
    }

    fn record(&self, command: LinkCommand) {
        self.commands.lock().push(command);
    }
}

impl Default for MemoryLinkService {
    fn default() -> Self {
        Self::new(0)
    }
}

impl LinkService for MemoryLinkService {
    fn pages_count(&self) -> u32 {
        self.state.lock().pages_count
    }

    fn page(&self) -> u32 {
        self.state.lock().page
    }

    fn set_page(&self, page: u32) {
        self.state.lock().page = page;
        self.record(LinkCommand::SetPage(page));
    }

    fn rotation(&self) -> i32 {
        self.state.lock().rotation
    }

    fn set_rotation(&self, rotation: i32) {
        self.state.lock().rotation = rotation;
        self.record(LinkCommand::SetRotation(rotation));
    }

    fn navigate_to(&self, dest: &[Value]) {
        self.record(LinkCommand::NavigateTo(dest.to_vec()));
    }

    fn set_hash(&self, hash: &str) {
        {
            let mut state = self.state.lock();
            let page = page_from_hash(hash);
            if page > 0 && page <= i64::from(state.pages_count) {
                state.page = page as u32;
            }
        }
        self.record(LinkCommand::SetHash(hash.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_commands_in_order() {
        let link = MemoryLinkService::new(10);
        link.set_rotation(90);
        link.navigate_to(&[json!({ "num": 1 }), json!("XYZ")]);
        link.set_page(4);

        assert_eq!(
            link.take_commands(),
            vec![
                LinkCommand::SetRotation(90),
                LinkCommand::NavigateTo(vec![json!({ "num": 1 }), json!("XYZ")]),
                LinkCommand::SetPage(4),
            ]
        );
        assert!(link.commands().is_empty());
        assert_eq!(link.rotation(), 90);
        assert_eq!(link.page(), 4);
    }

    #[test]
    fn set_hash_follows_existing_pages_only() {
        let link = MemoryLinkService::new(5);
        link.set_hash("page=3&zoom=auto");
        assert_eq!(link.page(), 3);
        link.set_hash("page=30");
        assert_eq!(link.page(), 3);
    }

    #[test]
    fn scrolling_is_not_a_command() {
        let link = MemoryLinkService::new(5);
        link.scroll_to(2);
        assert_eq!(link.page(), 2);
        assert!(link.commands().is_empty());
    }
}
