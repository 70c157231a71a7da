//! The remote side of things: the note store contract the sync engine talks
//! to, the errors it can throw at us, and the hooks used to get a client (and
//! a token) for a given endpoint.
//!
//! Transport is somebody else's problem. Anything that can speak this trait
//! (a thrift client, an http shim, the in-memory service in `memory`) works.

use std::sync::Arc;

use crate::error::NResult;
use crate::models::{Notebook, Tag, SavedSearch, Note, Resource, LinkedNotebook};

pub mod memory;

/// Error codes the remote side hands back with user/system errors.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unknown,
    BadDataFormat,
    PermissionDenied,
    InternalError,
    DataRequired,
    LimitReached,
    QuotaReached,
    InvalidAuth,
    AuthExpired,
    DataConflict,
    EnmlValidation,
    ShardUnavailable,
    LenTooShort,
    LenTooLong,
    TooFew,
    TooMany,
    UnsupportedOperation,
    TakenDown,
    RateLimitReached,
}

quick_error! {
    #[derive(Debug, Clone, PartialEq)]
    /// What a remote call can fail with.
    pub enum RemoteError {
        /// The request was bad (or our auth is).
        User(code: ErrorCode, parameter: Option<String>) {
            display("user error: {:?} ({})", code, parameter.as_ref().map(|x| x.as_str()).unwrap_or("-"))
        }
        /// The service is unhappy. Rate limits come with a wait (seconds).
        System(code: ErrorCode, rate_limit_duration: Option<i32>) {
            display("system error: {:?} (wait {:?})", code, rate_limit_duration)
        }
        NotFound(identifier: String) {
            display("not found: {}", identifier)
        }
        /// The call never made it (connection reset, timeout, ...)
        Transport(msg: String) {
            display("transport error: {}", msg)
        }
    }
}

impl RemoteError {
    pub fn is_auth_error(&self) -> bool {
        match *self {
            RemoteError::User(ErrorCode::AuthExpired, _) | RemoteError::User(ErrorCode::InvalidAuth, _) => true,
            _ => false,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        match *self {
            RemoteError::System(ErrorCode::RateLimitReached, _) => true,
            _ => false,
        }
    }
}

pub type RResult<T> = Result<T, RemoteError>;

/// Where a scope stands on the remote side
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct SyncState {
    /// The remote clock, ms
    pub current_time: i64,
    /// Clients that last synced before this (ms) have to start from scratch
    pub full_sync_before: i64,
    /// The highest USN in the scope
    pub update_count: i32,
}

/// One batch of changes
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SyncChunk {
    pub current_time: i64,
    /// The highest USN in this chunk. None if the chunk is empty.
    #[serde(default)]
    pub chunk_high_usn: Option<i32>,
    pub update_count: i32,
    #[serde(default)]
    pub notebooks: Vec<Notebook>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub searches: Vec<SavedSearch>,
    /// Metadata only: no content, no resources
    #[serde(default)]
    pub notes: Vec<Note>,
    /// Metadata only: no data
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub linked_notebooks: Vec<LinkedNotebook>,
    #[serde(default)]
    pub expunged_notebooks: Vec<String>,
    #[serde(default)]
    pub expunged_tags: Vec<String>,
    #[serde(default)]
    pub expunged_searches: Vec<String>,
    #[serde(default)]
    pub expunged_notes: Vec<String>,
    #[serde(default)]
    pub expunged_linked_notebooks: Vec<String>,
}

impl SyncChunk {
    /// How many entities (changes + expunges) ride in this chunk
    pub fn len(&self) -> usize {
        self.notebooks.len() + self.tags.len() + self.searches.len() +
            self.notes.len() + self.resources.len() + self.linked_notebooks.len() +
            self.expunged_notebooks.len() + self.expunged_tags.len() +
            self.expunged_searches.len() + self.expunged_notes.len() +
            self.expunged_linked_notebooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a successful authentication gets us
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuthResult {
    pub auth_token: String,
    /// ms since epoch
    pub expiration: i64,
    #[serde(default)]
    pub shard_id: Option<String>,
    #[serde(default)]
    pub note_store_url: Option<String>,
}

/// A client for one note store endpoint. Every call is synchronous and takes
/// the auth token to use.
pub trait NoteStore: Send + Sync {
    /// The endpoint this client talks to
    fn url(&self) -> &str;

    fn get_sync_state(&self, token: &str) -> RResult<SyncState>;
    fn get_sync_chunk(&self, token: &str, after_usn: i32, max_entries: i32, full_sync_only: bool) -> RResult<SyncChunk>;
    fn get_linked_notebook_sync_state(&self, token: &str, linked: &LinkedNotebook) -> RResult<SyncState>;
    fn get_linked_notebook_sync_chunk(&self, token: &str, linked: &LinkedNotebook, after_usn: i32, max_entries: i32, full_sync_only: bool) -> RResult<SyncChunk>;

    fn get_note(&self, token: &str, guid: &str, with_content: bool, with_resources_data: bool) -> RResult<Note>;
    fn get_resource(&self, token: &str, guid: &str, with_data: bool) -> RResult<Resource>;

    fn create_notebook(&self, token: &str, notebook: &Notebook) -> RResult<Notebook>;
    fn update_notebook(&self, token: &str, notebook: &Notebook) -> RResult<Notebook>;
    fn create_tag(&self, token: &str, tag: &Tag) -> RResult<Tag>;
    fn update_tag(&self, token: &str, tag: &Tag) -> RResult<Tag>;
    fn create_search(&self, token: &str, search: &SavedSearch) -> RResult<SavedSearch>;
    fn update_search(&self, token: &str, search: &SavedSearch) -> RResult<SavedSearch>;
    fn create_note(&self, token: &str, note: &Note) -> RResult<Note>;
    fn update_note(&self, token: &str, note: &Note) -> RResult<Note>;

    /// Trade our token for one that works on a shared notebook's shard
    fn authenticate_to_shared_notebook(&self, share_key: &str, token: &str) -> RResult<AuthResult>;
}

/// Hands out note store clients by endpoint url
pub trait NoteStoreFactory: Send + Sync {
    fn note_store(&self, url: &str) -> NResult<Arc<dyn NoteStore>>;
}

/// Gets (or refreshes) the primary account's token
pub trait Authenticator: Send + Sync {
    fn authenticate(&self) -> NResult<AuthResult>;
}
