//! The models module defines the entities we sync (notebooks, tags, saved
//! searches, notes, resources, linked notebooks) and the common interface the
//! sync system uses to talk about any of them without caring which one it's
//! holding.
//!
//! The same structs are used on both sides of the wire: the remote side hands
//! them to us with a guid/USN, the local side gives them a local id and tracks
//! whether they're dirty.

use std::fmt::Debug;

#[macro_use]
pub mod model;
pub mod scope;
pub mod notebook;
pub mod tag;
pub mod saved_search;
pub mod note;
pub mod resource;
pub mod linked_notebook;

pub use self::scope::{Scope, SyncCursor};
pub use self::notebook::Notebook;
pub use self::tag::Tag;
pub use self::saved_search::SavedSearch;
pub use self::note::Note;
pub use self::resource::Resource;
pub use self::linked_notebook::LinkedNotebook;

/// Names the kinds of things we sync.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    #[serde(rename = "notebook")]
    Notebook,
    #[serde(rename = "tag")]
    Tag,
    #[serde(rename = "saved_search")]
    SavedSearch,
    #[serde(rename = "note")]
    Note,
    #[serde(rename = "resource")]
    Resource,
    #[serde(rename = "linked_notebook")]
    LinkedNotebook,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match *self {
            EntityType::Notebook => "notebook",
            EntityType::Tag => "tag",
            EntityType::SavedSearch => "saved_search",
            EntityType::Note => "note",
            EntityType::Resource => "resource",
            EntityType::LinkedNotebook => "linked_notebook",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The interface every synchronizable entity exposes. Most of this is
/// generated by `make_sync_entity!`, the optional bits (name, scope, parent
/// references) are overridden by the entities that have them.
pub trait SyncEntity: Clone + Debug + Send + Sync + 'static {
    /// What kind of entity this is
    fn entity_type() -> EntityType;

    /// The local id. Always present once the entity is in the local store.
    fn local_id(&self) -> &str;
    fn set_local_id(&mut self, id: String);

    /// The remote id. Present once the entity has been synced.
    fn guid(&self) -> Option<&str>;
    fn set_guid(&mut self, guid: Option<String>);

    /// The update sequence number the remote side gave us
    fn usn(&self) -> Option<i32>;
    fn set_usn(&mut self, usn: Option<i32>);

    /// Whether this entity has local edits the remote side hasn't seen
    fn is_dirty(&self) -> bool;
    fn set_dirty(&mut self, dirty: bool);

    /// Local-only entities never leave this machine
    fn is_local_only(&self) -> bool {
        false
    }

    /// The unique (case-insensitive, per-scope) name, for entities that have one
    fn name(&self) -> Option<&str> {
        None
    }

    /// The linked notebook this entity lives in (None means primary account)
    fn linked_notebook_guid(&self) -> Option<&str> {
        None
    }

    fn set_linked_notebook_guid(&mut self, _guid: Option<String>) {}

    /// The local id of the notebook holding this entity, if that makes sense
    fn notebook_local_id(&self) -> Option<&str> {
        None
    }

    /// The local id of the note holding this entity, if that makes sense
    fn note_local_id(&self) -> Option<&str> {
        None
    }

    /// Something to print in logs/warnings: the guid if we have one, the local
    /// id otherwise.
    fn label(&self) -> String {
        match self.guid() {
            Some(guid) => String::from(guid),
            None => String::from(self.local_id()),
        }
    }

    /// The scope this entity syncs in
    fn scope(&self) -> Scope {
        match self.linked_notebook_guid() {
            Some(guid) => Scope::Linked(String::from(guid)),
            None => Scope::Primary,
        }
    }
}

/// Compare two names the way the service does (case-insensitive)
pub fn names_match(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_case_insensitive() {
        assert!(names_match("Work", "wORK"));
        assert!(!names_match("Work", "Works"));
    }

    #[test]
    fn entity_scope_and_label() {
        let mut tag = Tag::default();
        tag.local_id = String::from("local-1");
        assert_eq!(tag.label(), "local-1");
        assert_eq!(tag.scope(), Scope::Primary);
        tag.guid = Some(String::from("g1"));
        tag.linked_notebook_guid = Some(String::from("ln1"));
        assert_eq!(tag.label(), "g1");
        assert_eq!(tag.scope(), Scope::Linked(String::from("ln1")));
        assert_eq!(EntityType::SavedSearch.to_string(), "saved_search");
    }
}
