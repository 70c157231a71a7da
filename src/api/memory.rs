//! An in-process note store. It hands out guids and USNs, serves sync state
//! and chunks, keeps track of expunges, checks tokens and lets you script
//! failures for any call. Good for tests and for running the engine without a
//! network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use crate::api::{
    AuthResult, ErrorCode, NoteStore, NoteStoreFactory, RemoteError, RResult,
    SyncChunk, SyncState,
};
use crate::error::{NError, NResult};
use crate::models::{
    self, EntityType, LinkedNotebook, Note, Notebook, Resource, SavedSearch,
    SyncEntity, Tag,
};
use crate::util;

/// How long tokens handed out by `authenticate_to_shared_notebook()` live
const SHARE_TOKEN_LIFETIME_MS: i64 = 1000 * 60 * 60;

/// What a token lets you do
#[derive(Debug, Clone)]
struct Grant {
    expires: i64,
    /// Tokens from a share exchange only work on that notebook
    notebook_guid: Option<String>,
}

#[derive(Debug, Clone)]
struct Expunged {
    usn: i32,
    ty: EntityType,
    guid: String,
    /// Set for notes, so linked chunks can filter them
    notebook_guid: Option<String>,
}

#[derive(Default)]
struct ServiceState {
    /// Keeps guids from different services apart
    namespace: String,
    update_count: i32,
    full_sync_before: i64,
    guid_counter: u64,
    token_counter: u64,
    notebooks: BTreeMap<String, Notebook>,
    tags: BTreeMap<String, Tag>,
    searches: BTreeMap<String, SavedSearch>,
    notes: BTreeMap<String, Note>,
    resources: BTreeMap<String, Resource>,
    linked_notebooks: BTreeMap<String, LinkedNotebook>,
    expunged: Vec<Expunged>,
    tokens: HashMap<String, Grant>,
    /// share key -> notebook guid
    shares: HashMap<String, String>,
    /// public uri -> notebook guid
    public_uris: HashMap<String, String>,
    failures: HashMap<String, VecDeque<RemoteError>>,
    strip_usn: HashMap<String, usize>,
    calls: Vec<String>,
}

impl ServiceState {
    fn next_usn(&mut self) -> i32 {
        self.update_count += 1;
        self.update_count
    }

    fn next_guid(&mut self, prefix: &str) -> String {
        self.guid_counter += 1;
        format!("{}:{}-{:04}", self.namespace, prefix, self.guid_counter)
    }

    fn name_taken<'a, T, I>(items: I, name: &str, except_guid: Option<&str>) -> bool
        where T: SyncEntity + 'a,
              I: Iterator<Item = &'a T>
    {
        items
            .filter(|x| x.guid() != except_guid)
            .any(|x| x.name().map(|n| models::names_match(n, name)).unwrap_or(false))
    }
}

/// Decides whether an item from a chunk belongs in a (possibly linked) chunk
enum ChunkScope {
    Account,
    Notebook(String),
}

/// The in-memory note store
pub struct MemoryService {
    url: String,
    state: RwLock<ServiceState>,
}

fn require_name(name: &Option<String>, field: &str) -> RResult<String> {
    match name {
        Some(ref x) if !x.trim().is_empty() => Ok(x.clone()),
        _ => Err(RemoteError::User(ErrorCode::DataRequired, Some(String::from(field)))),
    }
}

impl MemoryService {
    pub fn new(url: &str) -> MemoryService {
        let namespace = url.rsplit('/').next().unwrap_or(url);
        MemoryService {
            url: String::from(url),
            state: RwLock::new(ServiceState {
                namespace: String::from(namespace),
                ..Default::default()
            }),
        }
    }

    /// Make a token valid on this service
    pub fn add_token(&self, token: &str, expires: i64) {
        let mut state = lockw!(self.state);
        state.tokens.insert(String::from(token), Grant { expires: expires, notebook_guid: None });
    }

    /// Make a token invalid on this service
    pub fn revoke_token(&self, token: &str) {
        let mut state = lockw!(self.state);
        state.tokens.remove(token);
    }

    /// Queue an error for the next call of `op` (ie "getSyncChunk"). Queued
    /// errors are handed out in order, one per call.
    pub fn fail_next(&self, op: &str, err: RemoteError) {
        let mut state = lockw!(self.state);
        state.failures.entry(String::from(op)).or_insert_with(VecDeque::new).push_back(err);
    }

    /// Make the next `times` successful writes of `op` come back without a USN
    pub fn strip_usn_next(&self, op: &str, times: usize) {
        let mut state = lockw!(self.state);
        *state.strip_usn.entry(String::from(op)).or_insert(0) += times;
    }

    /// How many times `op` has been called (failed calls included)
    pub fn calls(&self, op: &str) -> usize {
        let state = lockr!(self.state);
        state.calls.iter().filter(|x| x.as_str() == op).count()
    }

    pub fn update_count(&self) -> i32 {
        lockr!(self.state).update_count
    }

    /// Pretend another client changed something we can't see
    pub fn bump_update_count(&self) -> i32 {
        lockw!(self.state).next_usn()
    }

    /// Force clients that synced before `when` (ms) into a full resync
    pub fn set_full_sync_before(&self, when: i64) {
        lockw!(self.state).full_sync_before = when;
    }

    /// Share a notebook, returning the share key others use to reach it
    pub fn share_notebook(&self, notebook_guid: &str) -> String {
        let mut state = lockw!(self.state);
        let key = state.next_guid("share");
        state.shares.insert(key.clone(), String::from(notebook_guid));
        key
    }

    /// Publish a notebook under a public uri
    pub fn publish_notebook(&self, notebook_guid: &str, uri: &str) {
        let mut state = lockw!(self.state);
        state.public_uris.insert(String::from(uri), String::from(notebook_guid));
    }

    /// Link someone else's notebook into this account
    pub fn add_linked_notebook(&self, linked: &LinkedNotebook) -> LinkedNotebook {
        let mut state = lockw!(self.state);
        let mut linked = linked.clone();
        linked.guid = Some(state.next_guid("linked"));
        linked.usn = Some(state.next_usn());
        linked.dirty = false;
        linked.local_id = String::new();
        state.linked_notebooks.insert(linked.guid.clone().unwrap_or_default(), linked.clone());
        linked
    }

    /// Grab a stored note as the service sees it
    pub fn note(&self, guid: &str) -> Option<Note> {
        lockr!(self.state).notes.get(guid).cloned()
    }

    /// All the notebooks the service holds
    pub fn notebooks(&self) -> Vec<Notebook> {
        lockr!(self.state).notebooks.values().cloned().collect()
    }

    /// All the tags the service holds
    pub fn tags(&self) -> Vec<Tag> {
        lockr!(self.state).tags.values().cloned().collect()
    }

    /// All the notes the service holds
    pub fn notes(&self) -> Vec<Note> {
        lockr!(self.state).notes.values().cloned().collect()
    }

    /// Expunge an entity by type/guid, recording it so clients hear about it.
    /// Expunging a notebook takes its notes (and their resources) with it.
    pub fn expunge(&self, ty: EntityType, guid: &str) -> NResult<()> {
        let mut state = lockw!(self.state);
        let found = match ty {
            EntityType::Notebook => {
                let note_guids = state.notes.values()
                    .filter(|n| n.notebook_guid.as_ref().map(|x| x.as_str()) == Some(guid))
                    .filter_map(|n| n.guid.clone())
                    .collect::<Vec<_>>();
                for note_guid in note_guids {
                    state.notes.remove(&note_guid);
                    state.resources.retain(|_, r| r.note_guid.as_ref() != Some(&note_guid));
                }
                state.notebooks.remove(guid).is_some()
            }
            EntityType::Tag => {
                for note in state.notes.values_mut() {
                    note.tag_guids.retain(|x| x != guid);
                }
                state.tags.remove(guid).is_some()
            }
            EntityType::SavedSearch => state.searches.remove(guid).is_some(),
            EntityType::Note => {
                state.resources.retain(|_, r| r.note_guid.as_ref().map(|x| x.as_str()) != Some(guid));
                state.notes.remove(guid).is_some()
            }
            EntityType::LinkedNotebook => state.linked_notebooks.remove(guid).is_some(),
            EntityType::Resource => state.resources.remove(guid).is_some(),
        };
        if !found {
            return Err(NError::NotFound(format!("MemoryService.expunge() -- {} {}", ty, guid)));
        }
        let usn = state.next_usn();
        state.expunged.push(Expunged {
            usn: usn,
            ty: ty,
            guid: String::from(guid),
            notebook_guid: None,
        });
        Ok(())
    }

    /// Like `expunge()` for notes, but remembers which notebook the note was
    /// in so linked-notebook chunks carry the expunge too.
    pub fn expunge_note(&self, guid: &str) -> NResult<()> {
        let notebook_guid = lockr!(self.state).notes.get(guid).and_then(|x| x.notebook_guid.clone());
        self.expunge(EntityType::Note, guid)?;
        let mut state = lockw!(self.state);
        if let Some(last) = state.expunged.last_mut() {
            last.notebook_guid = notebook_guid;
        }
        Ok(())
    }

    /// Log the call, hand out any scripted failure, and check the token
    fn start_call(&self, op: &str, token: &str, allow_anonymous: bool) -> RResult<Option<String>> {
        let mut state = lockw!(self.state);
        state.calls.push(String::from(op));
        let scripted = state.failures.get_mut(op).and_then(|queue| queue.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }
        if allow_anonymous && token.is_empty() {
            return Ok(None);
        }
        match state.tokens.get(token) {
            Some(grant) => {
                if grant.expires <= util::now_ms() {
                    return Err(RemoteError::User(ErrorCode::AuthExpired, Some(String::from("authenticationToken"))));
                }
                Ok(grant.notebook_guid.clone())
            }
            None => Err(RemoteError::User(ErrorCode::InvalidAuth, Some(String::from("authenticationToken")))),
        }
    }

    /// Whether the next write of `op` should lose its USN
    fn take_strip(&self, op: &str) -> bool {
        let mut state = lockw!(self.state);
        match state.strip_usn.get_mut(op) {
            Some(x) if *x > 0 => {
                *x -= 1;
                true
            }
            _ => false,
        }
    }

    /// Make sure a share-restricted token is only used inside its notebook
    fn check_grant(restricted: &Option<String>, notebook_guid: Option<&str>) -> RResult<()> {
        match restricted {
            Some(ref allowed) => {
                if notebook_guid == Some(allowed.as_str()) {
                    Ok(())
                } else {
                    Err(RemoteError::User(ErrorCode::PermissionDenied, Some(String::from("Notebook.guid"))))
                }
            }
            None => Ok(()),
        }
    }

    fn linked_notebook_guid(&self, linked: &LinkedNotebook) -> RResult<String> {
        let state = lockr!(self.state);
        if let Some(ref key) = linked.shared_notebook_global_id {
            return state.shares.get(key).cloned().ok_or_else(|| RemoteError::NotFound(String::from("SharedNotebook.globalId")));
        }
        if let Some(ref uri) = linked.uri {
            return state.public_uris.get(uri).cloned().ok_or_else(|| RemoteError::NotFound(String::from("Publishing.uri")));
        }
        Err(RemoteError::User(ErrorCode::DataRequired, Some(String::from("LinkedNotebook.sharedNotebookGlobalId"))))
    }

    fn sync_state(&self) -> SyncState {
        let state = lockr!(self.state);
        SyncState {
            current_time: util::now_ms(),
            full_sync_before: state.full_sync_before,
            update_count: state.update_count,
        }
    }

    /// Build a chunk of everything above `after_usn` (in the given scope),
    /// stopping around `max_entries`. Items sharing a USN never get split
    /// across chunks.
    fn build_chunk(&self, scope: ChunkScope, after_usn: i32, max_entries: i32, full_sync_only: bool) -> SyncChunk {
        enum Item {
            Notebook(Notebook),
            Tag(Tag),
            Search(SavedSearch),
            Note(Note),
            Resource(Resource),
            Linked(LinkedNotebook),
            Expunged(Expunged),
        }
        let state = lockr!(self.state);
        let in_scope_nb = |nb_guid: Option<&str>| -> bool {
            match scope {
                ChunkScope::Account => true,
                ChunkScope::Notebook(ref guid) => nb_guid == Some(guid.as_str()),
            }
        };
        let mut items: Vec<(i32, Item)> = Vec::new();
        let newer = |usn: Option<i32>| usn.unwrap_or(0) > after_usn;
        for nb in state.notebooks.values() {
            if newer(nb.usn) && in_scope_nb(nb.guid.as_ref().map(|x| x.as_str())) {
                items.push((nb.usn.unwrap_or(0), Item::Notebook(nb.clone())));
            }
        }
        let scoped_notes = state.notes.values()
            .filter(|n| in_scope_nb(n.notebook_guid.as_ref().map(|x| x.as_str())))
            .collect::<Vec<_>>();
        for tag in state.tags.values() {
            let visible = match scope {
                ChunkScope::Account => true,
                ChunkScope::Notebook(_) => {
                    let guid = tag.guid.clone().unwrap_or_default();
                    scoped_notes.iter().any(|n| n.tag_guids.contains(&guid))
                }
            };
            if newer(tag.usn) && visible {
                items.push((tag.usn.unwrap_or(0), Item::Tag(tag.clone())));
            }
        }
        if let ChunkScope::Account = scope {
            for search in state.searches.values() {
                if newer(search.usn) {
                    items.push((search.usn.unwrap_or(0), Item::Search(search.clone())));
                }
            }
            for linked in state.linked_notebooks.values() {
                if newer(linked.usn) {
                    items.push((linked.usn.unwrap_or(0), Item::Linked(linked.clone())));
                }
            }
        }
        for note in &scoped_notes {
            if newer(note.usn) {
                let mut meta = (*note).clone();
                meta.content = None;
                meta.resources = Vec::new();
                items.push((note.usn.unwrap_or(0), Item::Note(meta)));
            }
        }
        for res in state.resources.values() {
            let note_visible = scoped_notes.iter().any(|n| n.guid.is_some() && n.guid == res.note_guid);
            if newer(res.usn) && note_visible {
                let mut meta = res.clone();
                meta.data = None;
                items.push((res.usn.unwrap_or(0), Item::Resource(meta)));
            }
        }
        if !full_sync_only {
            for exp in &state.expunged {
                if exp.usn <= after_usn { continue; }
                let visible = match scope {
                    ChunkScope::Account => true,
                    ChunkScope::Notebook(ref guid) => {
                        exp.notebook_guid.as_ref() == Some(guid) ||
                            (exp.ty == EntityType::Notebook && &exp.guid == guid)
                    }
                };
                if visible {
                    items.push((exp.usn, Item::Expunged(exp.clone())));
                }
            }
        }
        items.sort_by_key(|x| x.0);

        let mut chunk = SyncChunk {
            current_time: util::now_ms(),
            chunk_high_usn: None,
            update_count: state.update_count,
            ..Default::default()
        };
        let max = if max_entries < 1 { 1 } else { max_entries as usize };
        let mut taken = 0;
        for (usn, item) in items {
            if taken >= max && chunk.chunk_high_usn != Some(usn) { break; }
            taken += 1;
            chunk.chunk_high_usn = Some(usn);
            match item {
                Item::Notebook(x) => chunk.notebooks.push(x),
                Item::Tag(x) => chunk.tags.push(x),
                Item::Search(x) => chunk.searches.push(x),
                Item::Note(x) => chunk.notes.push(x),
                Item::Resource(x) => chunk.resources.push(x),
                Item::Linked(x) => chunk.linked_notebooks.push(x),
                Item::Expunged(x) => {
                    match x.ty {
                        EntityType::Notebook => chunk.expunged_notebooks.push(x.guid),
                        EntityType::Tag => chunk.expunged_tags.push(x.guid),
                        EntityType::SavedSearch => chunk.expunged_searches.push(x.guid),
                        EntityType::Note => chunk.expunged_notes.push(x.guid),
                        EntityType::LinkedNotebook => chunk.expunged_linked_notebooks.push(x.guid),
                        EntityType::Resource => {}
                    }
                }
            }
        }
        chunk
    }

    /// Stamp a written entity with its new USN, or hand it back without one if
    /// we've been told to misbehave.
    fn finish_write<T: SyncEntity>(&self, op: &str, mut entity: T) -> T {
        if self.take_strip(op) {
            entity.set_usn(None);
        }
        entity
    }

    fn save_notebook(&self, token: &str, notebook: &Notebook, create: bool) -> RResult<Notebook> {
        let op = if create { "createNotebook" } else { "updateNotebook" };
        let restricted = self.start_call(op, token, false)?;
        let name = require_name(&notebook.name, "Notebook.name")?;
        let mut state = lockw!(self.state);
        let guid = if create {
            if restricted.is_some() {
                return Err(RemoteError::User(ErrorCode::PermissionDenied, Some(String::from("Notebook"))));
            }
            state.next_guid("nb")
        } else {
            let guid = notebook.guid.clone().ok_or_else(|| RemoteError::User(ErrorCode::DataRequired, Some(String::from("Notebook.guid"))))?;
            if !state.notebooks.contains_key(&guid) {
                return Err(RemoteError::NotFound(String::from("Notebook.guid")));
            }
            MemoryService::check_grant(&restricted, Some(guid.as_str()))?;
            guid
        };
        if ServiceState::name_taken(state.notebooks.values(), &name, Some(guid.as_str())) {
            return Err(RemoteError::User(ErrorCode::DataConflict, Some(String::from("Notebook.name"))));
        }
        let mut saved = notebook.clone();
        saved.local_id = String::new();
        saved.dirty = false;
        saved.linked_notebook_guid = None;
        saved.guid = Some(guid.clone());
        saved.usn = Some(state.next_usn());
        saved.updated = Some(util::now_ms());
        if saved.default_notebook {
            for nb in state.notebooks.values_mut() {
                nb.default_notebook = false;
            }
        }
        state.notebooks.insert(guid, saved.clone());
        drop(state);
        Ok(self.finish_write(op, saved))
    }

    fn save_tag(&self, token: &str, tag: &Tag, create: bool) -> RResult<Tag> {
        let op = if create { "createTag" } else { "updateTag" };
        self.start_call(op, token, false)?;
        let name = require_name(&tag.name, "Tag.name")?;
        let mut state = lockw!(self.state);
        let guid = if create {
            state.next_guid("tag")
        } else {
            let guid = tag.guid.clone().ok_or_else(|| RemoteError::User(ErrorCode::DataRequired, Some(String::from("Tag.guid"))))?;
            if !state.tags.contains_key(&guid) {
                return Err(RemoteError::NotFound(String::from("Tag.guid")));
            }
            guid
        };
        if let Some(ref parent) = tag.parent_guid {
            if !state.tags.contains_key(parent) {
                return Err(RemoteError::NotFound(String::from("Tag.parentGuid")));
            }
        }
        if ServiceState::name_taken(state.tags.values(), &name, Some(guid.as_str())) {
            return Err(RemoteError::User(ErrorCode::DataConflict, Some(String::from("Tag.name"))));
        }
        let mut saved = tag.clone();
        saved.local_id = String::new();
        saved.parent_local_id = None;
        saved.linked_notebook_guid = None;
        saved.dirty = false;
        saved.guid = Some(guid.clone());
        saved.usn = Some(state.next_usn());
        state.tags.insert(guid, saved.clone());
        drop(state);
        Ok(self.finish_write(op, saved))
    }

    fn save_search(&self, token: &str, search: &SavedSearch, create: bool) -> RResult<SavedSearch> {
        let op = if create { "createSearch" } else { "updateSearch" };
        let restricted = self.start_call(op, token, false)?;
        if restricted.is_some() {
            return Err(RemoteError::User(ErrorCode::PermissionDenied, Some(String::from("SavedSearch"))));
        }
        let name = require_name(&search.name, "SavedSearch.name")?;
        let mut state = lockw!(self.state);
        let guid = if create {
            state.next_guid("search")
        } else {
            let guid = search.guid.clone().ok_or_else(|| RemoteError::User(ErrorCode::DataRequired, Some(String::from("SavedSearch.guid"))))?;
            if !state.searches.contains_key(&guid) {
                return Err(RemoteError::NotFound(String::from("SavedSearch.guid")));
            }
            guid
        };
        if ServiceState::name_taken(state.searches.values(), &name, Some(guid.as_str())) {
            return Err(RemoteError::User(ErrorCode::DataConflict, Some(String::from("SavedSearch.name"))));
        }
        let mut saved = search.clone();
        saved.local_id = String::new();
        saved.dirty = false;
        saved.guid = Some(guid.clone());
        saved.usn = Some(state.next_usn());
        state.searches.insert(guid, saved.clone());
        drop(state);
        Ok(self.finish_write(op, saved))
    }

    fn save_note(&self, token: &str, note: &Note, create: bool) -> RResult<Note> {
        let op = if create { "createNote" } else { "updateNote" };
        let restricted = self.start_call(op, token, false)?;
        let mut state = lockw!(self.state);
        let notebook_guid = note.notebook_guid.clone().ok_or_else(|| RemoteError::User(ErrorCode::DataRequired, Some(String::from("Note.notebookGuid"))))?;
        if !state.notebooks.contains_key(&notebook_guid) {
            return Err(RemoteError::NotFound(String::from("Note.notebookGuid")));
        }
        MemoryService::check_grant(&restricted, Some(notebook_guid.as_str()))?;
        for tag_guid in &note.tag_guids {
            if !state.tags.contains_key(tag_guid) {
                return Err(RemoteError::NotFound(String::from("Note.tagGuids")));
            }
        }
        let guid = if create {
            state.next_guid("note")
        } else {
            let guid = note.guid.clone().ok_or_else(|| RemoteError::User(ErrorCode::DataRequired, Some(String::from("Note.guid"))))?;
            if !state.notes.contains_key(&guid) {
                return Err(RemoteError::NotFound(String::from("Note.guid")));
            }
            guid
        };
        let usn = state.next_usn();
        let mut saved = note.clone();
        saved.local_id = String::new();
        saved.notebook_local_id = None;
        saved.tag_local_ids = Vec::new();
        saved.linked_notebook_guid = None;
        saved.conflicting = false;
        saved.dirty = false;
        saved.guid = Some(guid.clone());
        saved.usn = Some(usn);
        if let Some(ref content) = saved.content.clone() {
            saved.set_content(content);
        }
        let now = util::now_ms();
        if create { saved.created = Some(saved.created.unwrap_or(now)); }
        saved.updated = Some(now);
        let mut resources = Vec::with_capacity(saved.resources.len());
        for res in &note.resources {
            let mut res = res.clone();
            if res.guid.is_none() {
                res.guid = Some(state.next_guid("res"));
            }
            if let Some(data) = res.data.clone() {
                res.set_data(data);
            }
            res.local_id = String::new();
            res.note_local_id = None;
            res.linked_notebook_guid = None;
            res.dirty = false;
            res.note_guid = Some(guid.clone());
            res.usn = Some(usn);
            state.resources.insert(res.guid.clone().unwrap_or_default(), res.clone());
            resources.push(res);
        }
        saved.resources = resources;
        let mut stored = saved.clone();
        stored.resources = Vec::new();
        state.notes.insert(guid, stored);
        drop(state);
        let mut returned = self.finish_write(op, saved);
        for res in &mut returned.resources {
            res.data = None;
        }
        Ok(returned)
    }
}

impl NoteStore for MemoryService {
    fn url(&self) -> &str {
        &self.url
    }

    fn get_sync_state(&self, token: &str) -> RResult<SyncState> {
        self.start_call("getSyncState", token, false)?;
        Ok(self.sync_state())
    }

    fn get_sync_chunk(&self, token: &str, after_usn: i32, max_entries: i32, full_sync_only: bool) -> RResult<SyncChunk> {
        self.start_call("getSyncChunk", token, false)?;
        Ok(self.build_chunk(ChunkScope::Account, after_usn, max_entries, full_sync_only))
    }

    fn get_linked_notebook_sync_state(&self, token: &str, linked: &LinkedNotebook) -> RResult<SyncState> {
        self.start_call("getLinkedNotebookSyncState", token, linked.is_public())?;
        self.linked_notebook_guid(linked)?;
        Ok(self.sync_state())
    }

    fn get_linked_notebook_sync_chunk(&self, token: &str, linked: &LinkedNotebook, after_usn: i32, max_entries: i32, full_sync_only: bool) -> RResult<SyncChunk> {
        let restricted = self.start_call("getLinkedNotebookSyncChunk", token, linked.is_public())?;
        let notebook_guid = self.linked_notebook_guid(linked)?;
        MemoryService::check_grant(&restricted, Some(notebook_guid.as_str()))?;
        Ok(self.build_chunk(ChunkScope::Notebook(notebook_guid), after_usn, max_entries, full_sync_only))
    }

    fn get_note(&self, token: &str, guid: &str, with_content: bool, with_resources_data: bool) -> RResult<Note> {
        let restricted = self.start_call("getNote", token, true)?;
        let state = lockr!(self.state);
        let mut note = state.notes.get(guid).cloned().ok_or_else(|| RemoteError::NotFound(String::from("Note.guid")))?;
        MemoryService::check_grant(&restricted, note.notebook_guid.as_ref().map(|x| x.as_str()))?;
        if !with_content {
            note.content = None;
        }
        note.resources = state.resources.values()
            .filter(|r| r.note_guid.as_ref().map(|x| x.as_str()) == Some(guid))
            .map(|r| {
                let mut r = r.clone();
                if !with_resources_data { r.data = None; }
                r
            })
            .collect();
        Ok(note)
    }

    fn get_resource(&self, token: &str, guid: &str, with_data: bool) -> RResult<Resource> {
        self.start_call("getResource", token, true)?;
        let state = lockr!(self.state);
        let mut res = state.resources.get(guid).cloned().ok_or_else(|| RemoteError::NotFound(String::from("Resource.guid")))?;
        if !with_data {
            res.data = None;
        }
        Ok(res)
    }

    fn create_notebook(&self, token: &str, notebook: &Notebook) -> RResult<Notebook> {
        self.save_notebook(token, notebook, true)
    }

    fn update_notebook(&self, token: &str, notebook: &Notebook) -> RResult<Notebook> {
        self.save_notebook(token, notebook, false)
    }

    fn create_tag(&self, token: &str, tag: &Tag) -> RResult<Tag> {
        self.save_tag(token, tag, true)
    }

    fn update_tag(&self, token: &str, tag: &Tag) -> RResult<Tag> {
        self.save_tag(token, tag, false)
    }

    fn create_search(&self, token: &str, search: &SavedSearch) -> RResult<SavedSearch> {
        self.save_search(token, search, true)
    }

    fn update_search(&self, token: &str, search: &SavedSearch) -> RResult<SavedSearch> {
        self.save_search(token, search, false)
    }

    fn create_note(&self, token: &str, note: &Note) -> RResult<Note> {
        self.save_note(token, note, true)
    }

    fn update_note(&self, token: &str, note: &Note) -> RResult<Note> {
        self.save_note(token, note, false)
    }

    fn authenticate_to_shared_notebook(&self, share_key: &str, token: &str) -> RResult<AuthResult> {
        {
            let mut state = lockw!(self.state);
            state.calls.push(String::from("authenticateToSharedNotebook"));
            let scripted = state.failures.get_mut("authenticateToSharedNotebook").and_then(|queue| queue.pop_front());
            if let Some(err) = scripted {
                return Err(err);
            }
        }
        if token.is_empty() {
            return Err(RemoteError::User(ErrorCode::InvalidAuth, Some(String::from("authenticationToken"))));
        }
        let mut state = lockw!(self.state);
        let notebook_guid = state.shares.get(share_key).cloned().ok_or_else(|| RemoteError::NotFound(String::from("SharedNotebook.globalId")))?;
        state.token_counter += 1;
        let new_token = format!("{}/share/{}", self.url, state.token_counter);
        let expiration = util::now_ms() + SHARE_TOKEN_LIFETIME_MS;
        state.tokens.insert(new_token.clone(), Grant {
            expires: expiration,
            notebook_guid: Some(notebook_guid),
        });
        Ok(AuthResult {
            auth_token: new_token,
            expiration: expiration,
            shard_id: None,
            note_store_url: Some(self.url.clone()),
        })
    }
}

/// Maps note store urls to in-memory services
#[derive(Default)]
pub struct MemoryServiceFactory {
    services: RwLock<HashMap<String, Arc<MemoryService>>>,
}

impl MemoryServiceFactory {
    pub fn new() -> MemoryServiceFactory {
        Default::default()
    }

    /// Add (or replace) the service living at `service.url()`
    pub fn add(&self, service: Arc<MemoryService>) {
        let mut guard = lockw!(self.services);
        guard.insert(String::from(service.url()), service);
    }

    /// Grab the service at `url`
    pub fn get(&self, url: &str) -> Option<Arc<MemoryService>> {
        lockr!(self.services).get(url).cloned()
    }
}

impl NoteStoreFactory for MemoryServiceFactory {
    fn note_store(&self, url: &str) -> NResult<Arc<dyn NoteStore>> {
        match self.get(url) {
            Some(x) => Ok(x as Arc<dyn NoteStore>),
            None => Err(NError::Remote(RemoteError::Transport(format!("no route to note store at {}", url)))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MemoryService {
        let svc = MemoryService::new("mem://primary");
        svc.add_token("t0ken", util::now_ms() + 100000);
        svc
    }

    #[test]
    fn assigns_usns_and_checks_names() {
        let svc = service();
        let nb = svc.create_notebook("t0ken", &Notebook::new("Work")).unwrap();
        assert_eq!(nb.usn, Some(1));
        assert!(nb.guid.is_some());
        let err = svc.create_notebook("t0ken", &Notebook::new("wORK")).unwrap_err();
        assert_eq!(err, RemoteError::User(ErrorCode::DataConflict, Some(String::from("Notebook.name"))));
        let mut tag = Tag::new("child");
        tag.parent_guid = Some(String::from("nope"));
        assert_eq!(svc.create_tag("t0ken", &tag).unwrap_err(), RemoteError::NotFound(String::from("Tag.parentGuid")));
        assert_eq!(svc.update_count(), 1);
    }

    #[test]
    fn chunks_respect_max_and_strip_content() {
        let svc = service();
        let nb = svc.create_notebook("t0ken", &Notebook::new("Work")).unwrap();
        let mut note = Note::new("hi", "<en-note>yo</en-note>", "");
        note.notebook_guid = nb.guid.clone();
        note.resources.push(Resource::new("image/png", vec![1, 2, 3]));
        svc.create_note("t0ken", &note).unwrap();
        svc.create_tag("t0ken", &Tag::new("a")).unwrap();

        let chunk = svc.get_sync_chunk("t0ken", 0, 1, false).unwrap();
        assert_eq!(chunk.chunk_high_usn, Some(1));
        assert_eq!(chunk.notebooks.len(), 1);
        assert_eq!(chunk.update_count, 3);
        // note and resource share a usn, so they come together
        let chunk = svc.get_sync_chunk("t0ken", 1, 1, false).unwrap();
        assert_eq!(chunk.chunk_high_usn, Some(2));
        assert_eq!(chunk.notes.len(), 1);
        assert_eq!(chunk.resources.len(), 1);
        assert!(chunk.notes[0].content.is_none());
        assert!(chunk.resources[0].data.is_none());
        let chunk = svc.get_sync_chunk("t0ken", 3, 10, false).unwrap();
        assert_eq!(chunk.chunk_high_usn, None);
        assert!(chunk.is_empty());
    }

    #[test]
    fn tokens_and_scripted_failures() {
        let svc = service();
        assert_eq!(svc.get_sync_state("nope").unwrap_err(), RemoteError::User(ErrorCode::InvalidAuth, Some(String::from("authenticationToken"))));
        svc.add_token("old", util::now_ms() - 1);
        assert!(svc.get_sync_state("old").unwrap_err().is_auth_error());
        svc.fail_next("getSyncState", RemoteError::System(ErrorCode::RateLimitReached, Some(2)));
        assert!(svc.get_sync_state("t0ken").unwrap_err().is_rate_limit());
        assert!(svc.get_sync_state("t0ken").is_ok());
        assert_eq!(svc.calls("getSyncState"), 4);
    }

    #[test]
    fn shares_notebooks() {
        let svc = service();
        let nb = svc.create_notebook("t0ken", &Notebook::new("Shared")).unwrap();
        let other = svc.create_notebook("t0ken", &Notebook::new("Private")).unwrap();
        let key = svc.share_notebook(nb.guid.as_ref().unwrap());
        let auth = svc.authenticate_to_shared_notebook(&key, "whatever").unwrap();
        let linked = LinkedNotebook {
            shared_notebook_global_id: Some(key.clone()),
            ..Default::default()
        };
        let chunk = svc.get_linked_notebook_sync_chunk(&auth.auth_token, &linked, 0, 100, false).unwrap();
        assert_eq!(chunk.notebooks.len(), 1);
        assert_eq!(chunk.notebooks[0].guid, nb.guid);
        let mut note = Note::new("nope", "", "");
        note.notebook_guid = other.guid.clone();
        let err = svc.create_note(&auth.auth_token, &note).unwrap_err();
        assert_eq!(err, RemoteError::User(ErrorCode::PermissionDenied, Some(String::from("Notebook.guid"))));
    }
}
