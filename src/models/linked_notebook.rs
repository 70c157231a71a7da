use crate::models::{EntityType, Scope};

/// Maps a notebook owned by someone else into our namespace. Each one of these
/// gets its own sync scope, endpoint and credentials.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LinkedNotebook {
    #[serde(default)]
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usn: Option<i32>,
    #[serde(default)]
    pub share_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_id: Option<String>,
    /// Used to exchange our token for one that works on the owner's shard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_notebook_global_id: Option<String>,
    /// Public notebooks are reached by uri instead, no token exchange needed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_store_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_api_url_prefix: Option<String>,
    #[serde(default)]
    pub dirty: bool,
}

impl LinkedNotebook {
    /// The scope everything inside this linked notebook syncs in. Linked
    /// notebooks without a guid haven't been synced and don't have one.
    pub fn inner_scope(&self) -> Option<Scope> {
        self.guid.as_ref().map(|guid| Scope::Linked(guid.clone()))
    }

    /// Whether this is a public notebook (reached by uri, no share key)
    pub fn is_public(&self) -> bool {
        self.shared_notebook_global_id.is_none() && self.uri.is_some()
    }
}

make_sync_entity!{ LinkedNotebook, EntityType::LinkedNotebook }
