use std::fmt;

/// A sync scope: the primary account's namespace, or one linked notebook's.
/// Each scope has its own cursor, credentials and remote endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    #[serde(rename = "primary")]
    Primary,
    #[serde(rename = "linked")]
    Linked(String),
}

impl Scope {
    /// Grab the linked notebook guid for this scope, if it's a linked scope
    pub fn linked_notebook_guid(&self) -> Option<&str> {
        match *self {
            Scope::Primary => None,
            Scope::Linked(ref guid) => Some(guid.as_str()),
        }
    }

    pub fn is_primary(&self) -> bool {
        *self == Scope::Primary
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Scope::Primary => write!(f, "primary"),
            Scope::Linked(ref guid) => write!(f, "linked:{}", guid),
        }
    }
}

/// Marks how far the local side has gotten through a scope's remote changes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCursor {
    /// The highest USN we've absorbed
    pub update_count: i32,
    /// The remote's clock (ms) when we last finished a download for the scope.
    /// Compared against the remote's "full sync before" marker.
    pub last_sync_time: i64,
}

impl SyncCursor {
    pub fn new(update_count: i32, last_sync_time: i64) -> SyncCursor {
        SyncCursor {
            update_count: update_count,
            last_sync_time: last_sync_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_scopes() {
        assert_eq!(Scope::Primary.to_string(), "primary");
        assert_eq!(Scope::Linked(String::from("abc")).to_string(), "linked:abc");
        assert_eq!(Scope::Linked(String::from("abc")).linked_notebook_guid(), Some("abc"));
        assert!(Scope::Primary.is_primary());
    }
}
