use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use uuid::Uuid;

pub mod config;
pub mod dest;
pub mod error;
pub mod history;
pub mod host;
pub mod link;
pub mod session;
pub mod stack;

pub use config::HistoryConfig;
pub use dest::{is_dest_arrays_equal, is_dest_hashes_equal, is_valid_rotation, parse_query_string};
pub use error::{HistoryError, HistoryResult};
pub use history::NavigationHistory;
pub use host::{
    EventBus, EventKind, HistoryHost, HistoryTimer, HostEnvironment, ManualClock,
    MemoryEnvironment, NavigationType, Scheduler, TimerId, ViewerEvent,
};
pub use link::{LinkCommand, LinkService, MemoryLinkService};
pub use session::{Command, Session};
pub use stack::{HistoryStack, NavEnable};

pub type Fingerprint = String;

static FINGERPRINT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0d9c1e-5b7a-5e42-9c61-8d2b4a7e10f3").expect("valid namespace UUID")
});

/// Derives a fingerprint from the canonical form of `path`, so the same file
/// always maps to the same history timeline.
pub fn fingerprint_for_path(path: &Path) -> Fingerprint {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&*FINGERPRINT_NAMESPACE, rendered.as_bytes())
        .simple()
        .to_string()
}

/// A target view within the document.
///
/// Destinations recorded from the live view carry `first`; destinations from
/// explicit navigation carry `dest`. `temporary` marks an opportunistic
/// recording that any newer position may overwrite.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub dest: Option<Vec<Value>>,
    pub hash: Option<String>,
    pub page: Option<u32>,
    pub first: Option<u32>,
    pub rotation: Option<i32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub temporary: bool,
}

impl Destination {
    /// The hash, if it is present and non-empty.
    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref().filter(|hash| !hash.is_empty())
    }

    /// The page, if it is a real 1-based page.
    pub fn page(&self) -> Option<u32> {
        self.page.filter(|&page| page > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub fingerprint: Fingerprint,
    pub uid: i64,
    pub destination: Option<Destination>,
}

/// The viewer's live reading location, captured from view-area updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub hash: String,
    pub page: u32,
    pub first: u32,
    pub rotation: i32,
}

impl Position {
    pub fn to_destination(&self, temporary: bool) -> Destination {
        Destination {
            dest: None,
            hash: Some(self.hash.clone()),
            page: Some(self.page),
            first: Some(self.first),
            rotation: Some(self.rotation),
            temporary,
        }
    }
}

/// Payload of a view-area update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewareaLocation {
    pub page_number: u32,
    /// Open-parameters string describing the view, with its leading `#`.
    pub pdf_open_params: String,
    pub rotation: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub states: Vec<HistoryEntry>,
    pub ptr: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushRequest {
    pub named_dest: Option<String>,
    pub explicit_dest: Option<Vec<Value>>,
    pub page_number: Option<i64>,
}

impl PushRequest {
    pub fn new(explicit_dest: Vec<Value>, page_number: Option<i64>) -> Self {
        Self {
            named_dest: None,
            explicit_dest: Some(explicit_dest),
            page_number,
        }
    }

    pub fn named(mut self, named_dest: impl Into<String>) -> Self {
        self.named_dest = Some(named_dest.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use tempfile::tempdir;

    #[test]
    fn fingerprint_is_stable_for_same_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("sample.pdf");
        std::fs::write(&file_path, b"dummy").unwrap();

        let first = fingerprint_for_path(&file_path);
        let second = fingerprint_for_path(&file_path);

        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn fingerprint_differs_between_documents() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.pdf");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        assert_ne!(fingerprint_for_path(&a), fingerprint_for_path(&b));
    }

    #[test]
    fn destination_serializes_without_empty_fields() {
        let destination = Destination {
            hash: Some("page=3".into()),
            page: Some(3),
            ..Destination::default()
        };
        let encoded = serde_json::to_value(&destination).unwrap();
        assert_eq!(encoded, json!({ "hash": "page=3", "page": 3 }));
    }

    #[test]
    fn entry_with_fractional_uid_is_rejected() {
        let raw = json!({ "fingerprint": "abc", "uid": 1.5, "destination": {} });
        assert!(serde_json::from_value::<HistoryEntry>(raw).is_err());
    }

    #[test]
    fn entry_with_null_destination_decodes_as_none() {
        let raw = json!({ "fingerprint": "abc", "uid": 0, "destination": null });
        let entry: HistoryEntry = serde_json::from_value(raw).unwrap();
        assert!(entry.destination.is_none());
    }
}
