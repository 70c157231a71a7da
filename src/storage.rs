//! The storage module stores things. Specifically, it defines the contract the
//! sync engine needs from the local store (find/list/count/add/update/expunge
//! per entity type, plus a cursor per scope) and an in-memory implementation
//! of it.
//!
//! The real local store (schema, SQL, whatever) lives elsewhere: anything that
//! implements `LocalStore` can be synced.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{NError, NResult};
use crate::models::{
    self, model, LinkedNotebook, Note, Notebook, Resource, SavedSearch, Scope,
    SyncCursor, SyncEntity, Tag,
};

/// Narrows a listing/count down. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListFilter {
    pub dirty: Option<bool>,
    /// Only entities that do (or don't) have a guid yet
    pub synced: Option<bool>,
    pub scope: Option<Scope>,
    pub notebook_local_id: Option<String>,
    pub note_local_id: Option<String>,
}

impl ListFilter {
    pub fn all() -> ListFilter {
        Default::default()
    }

    pub fn dirty() -> ListFilter {
        ListFilter { dirty: Some(true), ..Default::default() }
    }

    pub fn in_scope(mut self, scope: &Scope) -> ListFilter {
        self.scope = Some(scope.clone());
        self
    }

    pub fn in_notebook(mut self, notebook_local_id: &str) -> ListFilter {
        self.notebook_local_id = Some(String::from(notebook_local_id));
        self
    }

    pub fn in_note(mut self, note_local_id: &str) -> ListFilter {
        self.note_local_id = Some(String::from(note_local_id));
        self
    }

    pub fn synced(mut self, synced: bool) -> ListFilter {
        self.synced = Some(synced);
        self
    }

    /// Does the given entity pass this filter?
    pub fn matches<T: SyncEntity>(&self, entity: &T) -> bool {
        if let Some(dirty) = self.dirty {
            if entity.is_dirty() != dirty { return false; }
        }
        if let Some(synced) = self.synced {
            if entity.guid().is_some() != synced { return false; }
        }
        if let Some(ref scope) = self.scope {
            if &entity.scope() != scope { return false; }
        }
        if let Some(ref nb) = self.notebook_local_id {
            if entity.notebook_local_id() != Some(nb.as_str()) { return false; }
        }
        if let Some(ref note) = self.note_local_id {
            if entity.note_local_id() != Some(note.as_str()) { return false; }
        }
        true
    }
}

/// CRUD over one entity type, keyed by local id (with lookups by guid and by
/// name).
pub trait EntityStore<T: SyncEntity>: Send + Sync {
    fn find(&self, local_id: &str) -> NResult<Option<T>>;
    fn find_by_guid(&self, guid: &str) -> NResult<Option<T>>;
    /// Case-insensitive name lookup within a scope
    fn find_by_name(&self, name: &str, scope: &Scope) -> NResult<Option<T>>;
    fn list(&self, filter: &ListFilter) -> NResult<Vec<T>>;
    fn count(&self, filter: &ListFilter) -> NResult<usize>;
    /// Add an entity, giving it a local id if it doesn't have one. Returns the
    /// local id.
    fn add(&self, entity: T) -> NResult<String>;
    fn update(&self, entity: &T) -> NResult<()>;
    /// Remove an entity. Returns whether it existed.
    fn expunge(&self, local_id: &str) -> NResult<bool>;

    fn exists(&self, local_id: &str) -> NResult<bool> {
        Ok(self.find(local_id)?.is_some())
    }

    fn mark_dirty(&self, local_id: &str) -> NResult<()> {
        self.set_dirty(local_id, true)
    }

    fn clear_dirty(&self, local_id: &str) -> NResult<()> {
        self.set_dirty(local_id, false)
    }

    fn set_dirty(&self, local_id: &str, dirty: bool) -> NResult<()> {
        let mut entity = match self.find(local_id)? {
            Some(x) => x,
            None => return Err(NError::NotFound(format!("EntityStore.set_dirty() -- {} {}", T::entity_type(), local_id))),
        };
        entity.set_dirty(dirty);
        self.update(&entity)
    }
}

/// The whole local store: one table per entity type and a cursor per scope.
pub trait LocalStore: Send + Sync {
    fn notebooks(&self) -> &dyn EntityStore<Notebook>;
    fn tags(&self) -> &dyn EntityStore<Tag>;
    fn searches(&self) -> &dyn EntityStore<SavedSearch>;
    fn notes(&self) -> &dyn EntityStore<Note>;
    fn resources(&self) -> &dyn EntityStore<Resource>;
    fn linked_notebooks(&self) -> &dyn EntityStore<LinkedNotebook>;

    /// The scope's cursor. None means we've never synced it.
    fn cursor(&self, scope: &Scope) -> NResult<Option<SyncCursor>>;
    fn set_cursor(&self, scope: &Scope, cursor: &SyncCursor) -> NResult<()>;
    fn delete_cursor(&self, scope: &Scope) -> NResult<()>;

    /// Errors out (StorageUnavailable) if the store can't be reached
    fn ping(&self) -> NResult<()>;
}

/// Lets generic code find the right table for an entity type
pub trait Stored: SyncEntity {
    fn table(store: &dyn LocalStore) -> &dyn EntityStore<Self>;
}

macro_rules! make_stored {
    ($n:ty, $table:ident) => {
        impl Stored for $n {
            fn table(store: &dyn LocalStore) -> &dyn EntityStore<Self> {
                store.$table()
            }
        }
    }
}

make_stored!(Notebook, notebooks);
make_stored!(Tag, tags);
make_stored!(SavedSearch, searches);
make_stored!(Note, notes);
make_stored!(Resource, resources);
make_stored!(LinkedNotebook, linked_notebooks);

/// Bookkeeping shared by all of a MemoryStore's tables
#[derive(Default)]
struct Health {
    available: AtomicBool,
    mutations: AtomicUsize,
}

impl Health {
    fn check(&self) -> NResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NError::StorageUnavailable(String::from("memory store switched off")))
        }
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

/// One in-memory table. Rows keep insertion order.
pub struct MemoryTable<T> {
    rows: RwLock<Vec<T>>,
    health: Arc<Health>,
}

impl<T: SyncEntity> MemoryTable<T> {
    fn new(health: Arc<Health>) -> MemoryTable<T> {
        MemoryTable {
            rows: RwLock::new(Vec::new()),
            health: health,
        }
    }
}

impl<T: SyncEntity> EntityStore<T> for MemoryTable<T> {
    fn find(&self, local_id: &str) -> NResult<Option<T>> {
        self.health.check()?;
        Ok(lockr!(self.rows).iter().find(|x| x.local_id() == local_id).cloned())
    }

    fn find_by_guid(&self, guid: &str) -> NResult<Option<T>> {
        self.health.check()?;
        Ok(lockr!(self.rows).iter().find(|x| x.guid() == Some(guid)).cloned())
    }

    fn find_by_name(&self, name: &str, scope: &Scope) -> NResult<Option<T>> {
        self.health.check()?;
        let rows = lockr!(self.rows);
        let found = rows.iter()
            .filter(|x| &x.scope() == scope)
            .find(|x| x.name().map(|n| models::names_match(n, name)).unwrap_or(false))
            .cloned();
        Ok(found)
    }

    fn list(&self, filter: &ListFilter) -> NResult<Vec<T>> {
        self.health.check()?;
        Ok(lockr!(self.rows).iter().filter(|x| filter.matches(*x)).cloned().collect())
    }

    fn count(&self, filter: &ListFilter) -> NResult<usize> {
        self.health.check()?;
        Ok(lockr!(self.rows).iter().filter(|x| filter.matches(*x)).count())
    }

    fn add(&self, mut entity: T) -> NResult<String> {
        self.health.check()?;
        if entity.local_id().is_empty() {
            entity.set_local_id(model::cid());
        }
        let local_id = String::from(entity.local_id());
        let mut rows = lockw!(self.rows);
        if rows.iter().any(|x| x.local_id() == local_id) {
            return Err(NError::BadValue(format!("MemoryTable.add() -- {} {} already exists", T::entity_type(), local_id)));
        }
        rows.push(entity);
        self.health.mutated();
        Ok(local_id)
    }

    fn update(&self, entity: &T) -> NResult<()> {
        self.health.check()?;
        let mut rows = lockw!(self.rows);
        match rows.iter_mut().find(|x| x.local_id() == entity.local_id()) {
            Some(row) => {
                *row = entity.clone();
                self.health.mutated();
                Ok(())
            }
            None => Err(NError::NotFound(format!("MemoryTable.update() -- {} {}", T::entity_type(), entity.local_id()))),
        }
    }

    fn expunge(&self, local_id: &str) -> NResult<bool> {
        self.health.check()?;
        let mut rows = lockw!(self.rows);
        let len = rows.len();
        rows.retain(|x| x.local_id() != local_id);
        let removed = rows.len() != len;
        if removed { self.health.mutated(); }
        Ok(removed)
    }
}

/// An in-memory, thread-safe local store
pub struct MemoryStore {
    notebooks: MemoryTable<Notebook>,
    tags: MemoryTable<Tag>,
    searches: MemoryTable<SavedSearch>,
    notes: MemoryTable<Note>,
    resources: MemoryTable<Resource>,
    linked_notebooks: MemoryTable<LinkedNotebook>,
    cursors: RwLock<HashMap<Scope, SyncCursor>>,
    health: Arc<Health>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        let health = Arc::new(Health::default());
        health.available.store(true, Ordering::SeqCst);
        MemoryStore {
            notebooks: MemoryTable::new(health.clone()),
            tags: MemoryTable::new(health.clone()),
            searches: MemoryTable::new(health.clone()),
            notes: MemoryTable::new(health.clone()),
            resources: MemoryTable::new(health.clone()),
            linked_notebooks: MemoryTable::new(health.clone()),
            cursors: RwLock::new(HashMap::new()),
            health: health,
        }
    }

    /// Flip the store on/off. An unavailable store fails every call.
    pub fn set_available(&self, available: bool) {
        self.health.available.store(available, Ordering::SeqCst);
    }

    /// How many writes (entities and cursors) this store has taken
    pub fn mutations(&self) -> usize {
        self.health.mutations.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> MemoryStore {
        MemoryStore::new()
    }
}

impl LocalStore for MemoryStore {
    fn notebooks(&self) -> &dyn EntityStore<Notebook> { &self.notebooks }
    fn tags(&self) -> &dyn EntityStore<Tag> { &self.tags }
    fn searches(&self) -> &dyn EntityStore<SavedSearch> { &self.searches }
    fn notes(&self) -> &dyn EntityStore<Note> { &self.notes }
    fn resources(&self) -> &dyn EntityStore<Resource> { &self.resources }
    fn linked_notebooks(&self) -> &dyn EntityStore<LinkedNotebook> { &self.linked_notebooks }

    fn cursor(&self, scope: &Scope) -> NResult<Option<SyncCursor>> {
        self.health.check()?;
        Ok(lockr!(self.cursors).get(scope).cloned())
    }

    fn set_cursor(&self, scope: &Scope, cursor: &SyncCursor) -> NResult<()> {
        self.health.check()?;
        lockw!(self.cursors).insert(scope.clone(), *cursor);
        self.health.mutated();
        Ok(())
    }

    fn delete_cursor(&self, scope: &Scope) -> NResult<()> {
        self.health.check()?;
        if lockw!(self.cursors).remove(scope).is_some() {
            self.health.mutated();
        }
        Ok(())
    }

    fn ping(&self) -> NResult<()> {
        self.health.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crud_and_lookups() {
        let store = MemoryStore::new();
        let mut tag = Tag::new("Work");
        tag.guid = Some(String::from("g1"));
        let id = store.tags().add(tag).unwrap();
        assert_eq!(id.len(), 28);
        assert!(store.tags().exists(&id).unwrap());
        assert_eq!(store.tags().find_by_guid("g1").unwrap().unwrap().local_id, id);
        assert!(store.tags().find_by_name("wORK", &Scope::Primary).unwrap().is_some());
        assert!(store.tags().find_by_name("work", &Scope::Linked(String::from("ln"))).unwrap().is_none());

        assert_eq!(store.tags().count(&ListFilter::dirty()).unwrap(), 1);
        store.tags().clear_dirty(&id).unwrap();
        assert_eq!(store.tags().count(&ListFilter::dirty()).unwrap(), 0);
        assert_eq!(store.tags().count(&ListFilter::all().synced(true)).unwrap(), 1);

        assert!(store.tags().expunge(&id).unwrap());
        assert!(!store.tags().expunge(&id).unwrap());
        assert_eq!(store.tags().count(&ListFilter::all()).unwrap(), 0);
    }

    #[test]
    fn tracks_mutations_and_availability() {
        let store = MemoryStore::new();
        assert_eq!(store.mutations(), 0);
        let id = store.notebooks().add(Notebook::new("Inbox")).unwrap();
        store.set_cursor(&Scope::Primary, &SyncCursor::new(4, 100)).unwrap();
        assert_eq!(store.mutations(), 2);
        assert_eq!(store.cursor(&Scope::Primary).unwrap(), Some(SyncCursor::new(4, 100)));
        // reads don't count
        store.notebooks().find(&id).unwrap();
        assert_eq!(store.mutations(), 2);

        store.set_available(false);
        match store.notebooks().find(&id) {
            Err(NError::StorageUnavailable(_)) => {}
            x => panic!("expected unavailable store, got {:?}", x),
        }
        assert!(store.ping().is_err());
    }

    #[test]
    fn lists_by_parent() {
        let store = MemoryStore::new();
        let nb = store.notebooks().add(Notebook::new("Inbox")).unwrap();
        store.notes().add(Note::new("one", "", &nb)).unwrap();
        store.notes().add(Note::new("two", "", "elsewhere")).unwrap();
        let notes = store.notes().list(&ListFilter::all().in_notebook(&nb)).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, Some(String::from("one")));
    }
}
