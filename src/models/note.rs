use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::models::{EntityType, Resource};

/// A note. Notes don't have unique names, so they get their own conflict
/// handling (see `sync::conflict::resolve_note()`).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Note {
    #[serde(default)]
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usn: Option<i32>,
    #[serde(default)]
    pub title: Option<String>,
    /// The body. Sync chunks only carry metadata, so this is None until the
    /// full note is fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<i64>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_local_id: Option<String>,
    #[serde(default)]
    pub tag_guids: Vec<String>,
    #[serde(default)]
    pub tag_local_ids: Vec<String>,
    /// Only used on the wire. Locally, resources live in their own table.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_notebook_guid: Option<String>,
    /// Set when this note lost a conflict and got moved out of the way
    #[serde(default)]
    pub conflicting: bool,
    #[serde(default)]
    pub dirty: bool,
}

fn default_active() -> bool { true }

/// Hash a note body the same way on both sides of the wire
pub fn content_hash(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

impl Note {
    /// Make a fresh, unsynced note living in the given (local) notebook
    pub fn new(title: &str, content: &str, notebook_local_id: &str) -> Note {
        let mut note = Note {
            title: Some(String::from(title)),
            notebook_local_id: Some(String::from(notebook_local_id)),
            active: true,
            dirty: true,
            ..Default::default()
        };
        note.set_content(content);
        note
    }

    /// Set the body and keep the hash/length in line with it
    pub fn set_content(&mut self, content: &str) {
        self.content_hash = Some(content_hash(content));
        self.content_length = Some(content.len() as i32);
        self.content = Some(String::from(content));
    }

    /// Compare the parts of two notes that the remote side versions
    pub fn content_eq(&self, other: &Note) -> bool {
        let mut tags1 = self.tag_guids.clone();
        let mut tags2 = other.tag_guids.clone();
        tags1.sort();
        tags2.sort();
        self.title == other.title &&
            self.content_hash == other.content_hash &&
            self.notebook_guid == other.notebook_guid &&
            self.deleted == other.deleted &&
            self.active == other.active &&
            tags1 == tags2
    }
}

make_sync_entity!{ Note, EntityType::Note,
    fn linked_notebook_guid(&self) -> Option<&str> {
        self.linked_notebook_guid.as_ref().map(|x| x.as_str())
    }

    fn set_linked_notebook_guid(&mut self, guid: Option<String>) {
        self.linked_notebook_guid = guid;
    }

    fn notebook_local_id(&self) -> Option<&str> {
        self.notebook_local_id.as_ref().map(|x| x.as_str())
    }
}
