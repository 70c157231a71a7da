use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::models::EntityType;

/// A file attached to a note.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Resource {
    #[serde(default)]
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usn: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_size: Option<i32>,
    /// The body. None until the full resource is fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_notebook_guid: Option<String>,
    #[serde(default)]
    pub dirty: bool,
}

/// Hash a resource body
pub fn data_hash(data: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

impl Resource {
    /// Make a fresh, unsynced resource
    pub fn new(mime: &str, data: Vec<u8>) -> Resource {
        let mut res = Resource {
            mime: Some(String::from(mime)),
            dirty: true,
            ..Default::default()
        };
        res.set_data(data);
        res
    }

    /// Set the body and keep the hash/size in line with it
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data_hash = Some(data_hash(&data));
        self.data_size = Some(data.len() as i32);
        self.data = Some(data);
    }
}

make_sync_entity!{ Resource, EntityType::Resource,
    fn linked_notebook_guid(&self) -> Option<&str> {
        self.linked_notebook_guid.as_ref().map(|x| x.as_str())
    }

    fn set_linked_notebook_guid(&mut self, guid: Option<String>) {
        self.linked_notebook_guid = guid;
    }

    fn note_local_id(&self) -> Option<&str> {
        self.note_local_id.as_ref().map(|x| x.as_str())
    }
}
