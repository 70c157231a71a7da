extern crate jedi;
extern crate notesync_core;
#[macro_use]
extern crate serde_json;

use ::std::env;
use ::std::sync::{Arc, Mutex};
use ::std::time::Duration;
use ::jedi::Value;
use notesync_core::{NError, NResult, SyncEngine, SyncReport, SyncSettings};
use notesync_core::api::{AuthResult, Authenticator, ErrorCode, NoteStore, RemoteError};
use notesync_core::api::memory::{MemoryService, MemoryServiceFactory};
use notesync_core::credentials::{CredentialStore, MemoryCredentials, StoredToken};
use notesync_core::messaging;
use notesync_core::models::{
    EntityType, LinkedNotebook, Note, Notebook, Resource, SavedSearch, Scope,
    SyncCursor, Tag,
};
use notesync_core::storage::{EntityStore, ListFilter, LocalStore, MemoryStore};
use notesync_core::sync::report::{Direction, ScopeStatus};
use notesync_core::sync::scheduler::{NoWaitTimer, Timer};
use notesync_core::util;
use notesync_core::util::event::Emitter;
use notesync_core::util::stopper::Stopper;

pub const PRIMARY_URL: &str = "mem://primary";
pub const TOKEN: &str = "t0ken";
pub const OWNER_TOKEN: &str = "owner";
const HOUR: i64 = 1000 * 60 * 60;

/// Every event the engine fires, tests bind to these
const EVENTS: &[&str] = &[
    messaging::EV_STARTED,
    messaging::EV_SCOPE_STARTED,
    messaging::EV_CHUNK_DOWNLOADED,
    messaging::EV_ENTITY_APPLIED,
    messaging::EV_ENTITY_SKIPPED,
    messaging::EV_SCOPE_FINISHED,
    messaging::EV_RATE_LIMIT,
    messaging::EV_FINISHED,
];

#[allow(dead_code)]
pub fn sleep(millis: u64) {
    util::sleep(millis);
}

/// Load the test config and quiet the logs
pub fn init() {
    if env::var("NOTESYNC_CONFIG_FILE").is_err() {
        env::set_var("NOTESYNC_CONFIG_FILE", "config.yaml");
    }
    notesync_core::init(r#"{"loglevel":"off"}"#).unwrap();
}

/// Waits out a fraction of whatever it's asked to, so rate limits still
/// block a scope without slowing the suite down.
#[allow(dead_code)]
pub struct ScaledTimer(pub u32);

impl Timer for ScaledTimer {
    fn wait(&self, duration: Duration, stopper: &Stopper) -> bool {
        stopper.wait(duration / self.0)
    }
}

/// Hands out the same token every time
#[allow(dead_code)]
pub struct FixedAuth {
    pub token: String,
}

impl Authenticator for FixedAuth {
    fn authenticate(&self) -> NResult<AuthResult> {
        Ok(AuthResult {
            auth_token: self.token.clone(),
            expiration: util::now_ms() + HOUR,
            shard_id: None,
            note_store_url: Some(String::from(PRIMARY_URL)),
        })
    }
}

/// One account: a local store, its remote service, and a token for it
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub factory: Arc<MemoryServiceFactory>,
    pub creds: Arc<MemoryCredentials>,
    pub primary: Arc<MemoryService>,
    pub events: Arc<Mutex<Vec<(String, Value)>>>,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Harness {
        init();
        let primary = Arc::new(MemoryService::new(PRIMARY_URL));
        primary.add_token(TOKEN, util::now_ms() + HOUR);
        let factory = Arc::new(MemoryServiceFactory::new());
        factory.add(primary.clone());
        let creds = Arc::new(MemoryCredentials::new());
        creds.write_token(&Scope::Primary, &StoredToken::new(TOKEN, util::now_ms() + HOUR)).unwrap();
        Harness {
            store: Arc::new(MemoryStore::new()),
            factory: factory,
            creds: creds,
            primary: primary,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            note_store_url: String::from(PRIMARY_URL),
            transport_backoff_ms: 1,
            ..Default::default()
        }
    }

    /// An engine that never actually waits, with every event recorded
    pub fn engine_with(&self, settings: SyncSettings) -> SyncEngine {
        let engine = SyncEngine::new(settings, self.store.clone(), self.factory.clone(), self.creds.clone())
            .with_timer(Arc::new(NoWaitTimer));
        self.record(&engine);
        engine
    }

    pub fn engine(&self) -> SyncEngine {
        self.engine_with(self.settings())
    }

    pub fn record(&self, engine: &SyncEngine) {
        let messenger = engine.messenger();
        for ev in EVENTS {
            let events = self.events.clone();
            let name = String::from(*ev);
            messenger.bind(ev, move |val: &Value| {
                events.lock().unwrap().push((name.clone(), val.clone()));
            }, "harness");
        }
    }

    pub fn sync(&self) -> SyncReport {
        self.engine().run().unwrap()
    }

    /// Download only
    pub fn pull(&self) -> SyncReport {
        let settings = SyncSettings { enable_outgoing: false, ..self.settings() };
        self.engine_with(settings).run().unwrap()
    }

    pub fn events_named(&self, name: &str) -> Vec<Value> {
        self.events.lock().unwrap().iter()
            .filter(|x| x.0 == name)
            .map(|x| x.1.clone())
            .collect()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn cursor(&self, scope: &Scope) -> Option<SyncCursor> {
        self.store.cursor(scope).unwrap()
    }

    /// Spin up another account's service (reachable by the factory)
    pub fn owner(&self, url: &str) -> Arc<MemoryService> {
        let service = Arc::new(MemoryService::new(url));
        service.add_token(OWNER_TOKEN, util::now_ms() + HOUR);
        self.factory.add(service.clone());
        service
    }

    /// Share one of `owner`'s notebooks with our account
    pub fn link(&self, owner: &MemoryService, notebook_guid: &str, share_name: &str) -> LinkedNotebook {
        let key = owner.share_notebook(notebook_guid);
        let linked = LinkedNotebook {
            share_name: Some(String::from(share_name)),
            username: Some(String::from("owner")),
            shared_notebook_global_id: Some(key),
            note_store_url: Some(String::from(owner.url())),
            ..Default::default()
        };
        self.primary.add_linked_notebook(&linked)
    }

    pub fn local_notebook(&self, name: &str, scope: &Scope) -> Option<Notebook> {
        self.store.notebooks().find_by_name(name, scope).unwrap()
    }

    pub fn local_tag(&self, name: &str) -> Option<Tag> {
        self.store.tags().find_by_name(name, &Scope::Primary).unwrap()
    }

    pub fn local_note(&self, guid: &str) -> Option<Note> {
        self.store.notes().find_by_guid(guid).unwrap()
    }

    pub fn notes(&self) -> Vec<Note> {
        self.store.notes().list(&ListFilter::all()).unwrap()
    }

    pub fn tags(&self) -> Vec<Tag> {
        self.store.tags().list(&ListFilter::all()).unwrap()
    }
}

/// Somebody else (another client, another account) writing to a service
#[allow(dead_code)]
pub fn remote_notebook(service: &MemoryService, token: &str, name: &str) -> Notebook {
    service.create_notebook(token, &Notebook::new(name)).unwrap()
}

#[allow(dead_code)]
pub fn remote_tag(service: &MemoryService, token: &str, name: &str, parent: Option<&Tag>) -> Tag {
    let mut tag = Tag::new(name);
    tag.parent_guid = parent.and_then(|x| x.guid.clone());
    service.create_tag(token, &tag).unwrap()
}

#[allow(dead_code)]
pub fn remote_note(service: &MemoryService, token: &str, notebook: &Notebook, title: &str, content: &str) -> Note {
    let mut note = Note::new(title, content, "");
    note.notebook_local_id = None;
    note.notebook_guid = notebook.guid.clone();
    service.create_note(token, &note).unwrap()
}

#[allow(dead_code)]
pub fn rate_limit(seconds: i32) -> RemoteError {
    RemoteError::System(ErrorCode::RateLimitReached, Some(seconds))
}

/// The status a scope/direction ended with
#[allow(dead_code)]
pub fn status(report: &SyncReport, scope: &Scope, direction: Direction) -> ScopeStatus {
    report.scope(scope, direction).map(|x| x.status.clone()).unwrap()
}

#[allow(dead_code)]
pub fn is_failed(status: &ScopeStatus) -> bool {
    match *status {
        ScopeStatus::Failed(_) => true,
        _ => false,
    }
}
