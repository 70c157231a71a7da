use crate::models::EntityType;
use crate::sync::conflict::Conflictable;

/// A notebook. Its name is unique (case-insensitively) within its scope.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Notebook {
    #[serde(default)]
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usn: Option<i32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub default_notebook: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i64>,
    #[serde(default)]
    pub published: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_notebook_guid: Option<String>,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub local_only: bool,
}

impl Notebook {
    /// Make a fresh, unsynced notebook
    pub fn new(name: &str) -> Notebook {
        Notebook {
            name: Some(String::from(name)),
            dirty: true,
            ..Default::default()
        }
    }
}

make_sync_entity!{ Notebook, EntityType::Notebook,
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

impl Conflictable for Notebook {
    fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }

    fn content_eq(&self, other: &Notebook) -> bool {
        self.name == other.name &&
            self.stack == other.stack &&
            self.default_notebook == other.default_notebook &&
            self.published == other.published
    }
}
