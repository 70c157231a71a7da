use crate::models::EntityType;
use crate::sync::conflict::Conflictable;

/// A tag. Tags form a hierarchy through their parent reference, and a tag's
/// parent always has to exist before the tag does (on either side).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Tag {
    #[serde(default)]
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usn: Option<i32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_notebook_guid: Option<String>,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub local_only: bool,
}

impl Tag {
    /// Make a fresh, unsynced tag
    pub fn new(name: &str) -> Tag {
        Tag {
            name: Some(String::from(name)),
            dirty: true,
            ..Default::default()
        }
    }
}

make_sync_entity!{ Tag, EntityType::Tag,
    fn is_local_only(&self) -> bool {
        self.local_only
    }

    fn name(&self) -> Option<&str> {
        self.name.as_ref().map(|x| x.as_str())
    }

    fn linked_notebook_guid(&self) -> Option<&str> {
        self.linked_notebook_guid.as_ref().map(|x| x.as_str())
    }

    fn set_linked_notebook_guid(&mut self, guid: Option<String>) {
        self.linked_notebook_guid = guid;
    }
}

impl Conflictable for Tag {
    fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }

    fn content_eq(&self, other: &Tag) -> bool {
        self.name == other.name && self.parent_guid == other.parent_guid
    }
}
