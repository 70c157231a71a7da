use crate::models::EntityType;
use crate::sync::conflict::Conflictable;

/// A saved search. Only lives in the primary account.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SavedSearch {
    #[serde(default)]
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usn: Option<i32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub local_only: bool,
}

impl SavedSearch {
    pub fn new(name: &str, query: &str) -> SavedSearch {
        SavedSearch {
            name: Some(String::from(name)),
            query: Some(String::from(query)),
            dirty: true,
            ..Default::default()
        }
    }
}

make_sync_entity!{ SavedSearch, EntityType::SavedSearch,
    fn is_local_only(&self) -> bool {
        self.local_only
    }

    fn name(&self) -> Option<&str> {
        self.name.as_ref().map(|x| x.as_str())
    }
}

impl Conflictable for SavedSearch {
    fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }

    fn content_eq(&self, other: &SavedSearch) -> bool {
        self.name == other.name && self.query == other.query
    }
}
