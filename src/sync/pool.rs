//! Caches a note store client and a working token per scope. The primary
//! account's token comes from the credential store (or the authenticator),
//! linked notebooks trade the primary token for their own.
//!
//! Each scope has its own slot with its own lock, so fetching a token for one
//! linked notebook never holds up another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::api::{Authenticator, NoteStore, NoteStoreFactory};
use crate::credentials::{CredentialStore, StoredToken};
use crate::error::{NError, NResult};
use crate::models::{LinkedNotebook, Scope};
use crate::sync::scheduler::RetryScheduler;
use crate::util;

/// Everything needed to make calls in a scope
#[derive(Clone)]
pub struct AuthContext {
    pub scope: Scope,
    pub token: String,
    /// ms since epoch
    pub expires: i64,
    pub shard_id: Option<String>,
    pub note_store: Arc<dyn NoteStore>,
}

impl AuthContext {
    fn is_expired(&self, now: i64, margin_ms: i64) -> bool {
        self.expires - margin_ms <= now
    }
}

type Slot = Arc<Mutex<Option<AuthContext>>>;

pub struct NoteStorePool {
    factory: Arc<dyn NoteStoreFactory>,
    credentials: Arc<dyn CredentialStore>,
    authenticator: Option<Arc<dyn Authenticator>>,
    /// Where the primary account lives (unless its token says otherwise)
    primary_url: String,
    expiry_margin_ms: i64,
    linked: RwLock<HashMap<String, LinkedNotebook>>,
    slots: RwLock<HashMap<Scope, Slot>>,
}

impl NoteStorePool {
    pub fn new(factory: Arc<dyn NoteStoreFactory>, credentials: Arc<dyn CredentialStore>, primary_url: &str, expiry_margin_ms: i64) -> NoteStorePool {
        NoteStorePool {
            factory: factory,
            credentials: credentials,
            authenticator: None,
            primary_url: String::from(primary_url),
            expiry_margin_ms: expiry_margin_ms,
            linked: RwLock::new(HashMap::new()),
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_authenticator(&mut self, authenticator: Arc<dyn Authenticator>) {
        self.authenticator = Some(authenticator);
    }

    /// Let the pool know about a linked notebook (or an updated version of
    /// one). A changed endpoint or share key drops the cached client.
    pub fn register_linked(&self, linked: &LinkedNotebook) {
        let guid = match linked.guid {
            Some(ref x) => x.clone(),
            None => return,
        };
        let changed = {
            let mut guard = lockw!(self.linked);
            let changed = match guard.get(&guid) {
                Some(old) => {
                    old.note_store_url != linked.note_store_url ||
                        old.shared_notebook_global_id != linked.shared_notebook_global_id ||
                        old.uri != linked.uri
                }
                None => false,
            };
            guard.insert(guid.clone(), linked.clone());
            changed
        };
        if changed {
            debug!("NoteStorePool.register_linked() -- {} changed, dropping cached client", guid);
            lockw!(self.slots).remove(&Scope::Linked(guid));
        }
    }

    /// Forget everything about a linked notebook, stored token included
    pub fn forget_linked(&self, guid: &str) -> NResult<()> {
        let scope = Scope::Linked(String::from(guid));
        lockw!(self.linked).remove(guid);
        lockw!(self.slots).remove(&scope);
        self.credentials.delete_token(&scope)
    }

    fn slot(&self, scope: &Scope) -> Slot {
        if let Some(slot) = lockr!(self.slots).get(scope) {
            return slot.clone();
        }
        let mut guard = lockw!(self.slots);
        guard.entry(scope.clone()).or_insert_with(|| Arc::new(Mutex::new(None))).clone()
    }

    /// Get a working client/token for a scope, authenticating if the cached
    /// (or stored) token is missing or about to expire.
    pub fn acquire(&self, scope: &Scope, scheduler: &RetryScheduler) -> NResult<AuthContext> {
        let slot = self.slot(scope);
        let mut guard = lock!(slot);
        let now = util::now_ms();
        if let Some(ref ctx) = *guard {
            if !ctx.is_expired(now, self.expiry_margin_ms) {
                return Ok(ctx.clone());
            }
            debug!("NoteStorePool.acquire() -- {}: cached token expired", scope);
        }
        let ctx = match *scope {
            Scope::Primary => self.auth_primary(now)?,
            Scope::Linked(ref guid) => self.auth_linked(guid, now, scheduler)?,
        };
        *guard = Some(ctx.clone());
        Ok(ctx)
    }

    /// Drop a scope's cached and stored token, so the next `acquire()` gets a
    /// fresh one.
    pub fn invalidate(&self, scope: &Scope) -> NResult<()> {
        info!("NoteStorePool.invalidate() -- {}", scope);
        let slot = self.slot(scope);
        *lock!(slot) = None;
        self.credentials.delete_token(scope)
    }

    fn auth_primary(&self, now: i64) -> NResult<AuthContext> {
        let stored = match self.credentials.read_token(&Scope::Primary)? {
            Some(ref token) if !token.is_expired(now, self.expiry_margin_ms) => token.clone(),
            _ => {
                let authenticator = match self.authenticator {
                    Some(ref x) => x,
                    None => return Err(NError::AuthFailed(Scope::Primary.to_string(), String::from("no valid token and no way to get one"))),
                };
                info!("NoteStorePool.auth_primary() -- authenticating");
                let auth = authenticator.authenticate()
                    .map_err(|e| NError::AuthFailed(Scope::Primary.to_string(), e.to_string()))?;
                let token = StoredToken {
                    token: auth.auth_token,
                    expires: auth.expiration,
                    shard_id: auth.shard_id,
                    note_store_url: auth.note_store_url,
                };
                self.credentials.write_token(&Scope::Primary, &token)?;
                token
            }
        };
        let url = stored.note_store_url.clone().unwrap_or_else(|| self.primary_url.clone());
        Ok(AuthContext {
            scope: Scope::Primary,
            token: stored.token,
            expires: stored.expires,
            shard_id: stored.shard_id,
            note_store: self.factory.note_store(&url)?,
        })
    }

    fn auth_linked(&self, guid: &str, now: i64, scheduler: &RetryScheduler) -> NResult<AuthContext> {
        let scope = Scope::Linked(String::from(guid));
        let cannot = |msg: String| NError::CannotAuthenticate(String::from(guid), msg);
        let linked = match lockr!(self.linked).get(guid) {
            Some(x) => x.clone(),
            None => return Err(cannot(String::from("unknown linked notebook"))),
        };
        let url = match linked.note_store_url {
            Some(ref x) => x.clone(),
            None => return Err(cannot(String::from("linked notebook has no note store url"))),
        };
        let note_store = self.factory.note_store(&url)?;

        if linked.is_public() {
            return Ok(AuthContext {
                scope: scope,
                token: String::new(),
                expires: i64::max_value(),
                shard_id: linked.shard_id.clone(),
                note_store: note_store,
            });
        }

        if let Some(token) = self.credentials.read_token(&scope)? {
            if !token.is_expired(now, self.expiry_margin_ms) {
                return Ok(AuthContext {
                    scope: scope,
                    token: token.token,
                    expires: token.expires,
                    shard_id: token.shard_id,
                    note_store: note_store,
                });
            }
        }

        let share_key = match linked.shared_notebook_global_id {
            Some(ref x) => x.clone(),
            None => return Err(cannot(String::from("linked notebook has no share key"))),
        };
        let primary = self.acquire(&Scope::Primary, scheduler)
            .map_err(|e| cannot(format!("no primary token: {}", e)))?;
        info!("NoteStorePool.auth_linked() -- {}: exchanging token", guid);
        let auth = scheduler.call(&scope, "authenticateToSharedNotebook", || {
            note_store.authenticate_to_shared_notebook(&share_key, &primary.token)
        }).map_err(|e| {
            match e {
                NError::Cancelled | NError::BrokenContract(..) => e,
                _ => cannot(e.to_string()),
            }
        })?;
        let token = StoredToken {
            token: auth.auth_token,
            expires: auth.expiration,
            shard_id: auth.shard_id.or_else(|| linked.shard_id.clone()),
            note_store_url: Some(url),
        };
        self.credentials.write_token(&scope, &token)?;
        Ok(AuthContext {
            scope: scope,
            token: token.token,
            expires: token.expires,
            shard_id: token.shard_id,
            note_store: note_store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AuthResult, ErrorCode, RemoteError};
    use crate::api::memory::{MemoryService, MemoryServiceFactory};
    use crate::credentials::MemoryCredentials;
    use crate::messaging::Messenger;
    use crate::models::Notebook;
    use crate::util::stopper::Stopper;
    use crate::sync::scheduler::NoWaitTimer;

    struct StaticAuth {
        token: String,
    }

    impl Authenticator for StaticAuth {
        fn authenticate(&self) -> NResult<AuthResult> {
            Ok(AuthResult {
                auth_token: self.token.clone(),
                expiration: util::now_ms() + 100000,
                shard_id: Some(String::from("s1")),
                note_store_url: None,
            })
        }
    }

    fn scheduler() -> RetryScheduler {
        RetryScheduler::new(Arc::new(NoWaitTimer), Arc::new(Stopper::new()), Arc::new(Messenger::new()), 0, 0)
    }

    fn setup() -> (Arc<MemoryService>, Arc<MemoryService>, Arc<MemoryCredentials>, NoteStorePool) {
        let primary = Arc::new(MemoryService::new("mem://primary"));
        let shard = Arc::new(MemoryService::new("mem://shard2"));
        primary.add_token("primary-token", util::now_ms() + 100000);
        shard.add_token("owner-token", util::now_ms() + 100000);
        let factory = Arc::new(MemoryServiceFactory::new());
        factory.add(primary.clone());
        factory.add(shard.clone());
        let creds = Arc::new(MemoryCredentials::new());
        let mut pool = NoteStorePool::new(factory, creds.clone(), "mem://primary", 1000);
        pool.set_authenticator(Arc::new(StaticAuth { token: String::from("primary-token") }));
        (primary, shard, creds, pool)
    }

    #[test]
    fn authenticates_primary_and_caches() {
        let (_primary, _shard, creds, pool) = setup();
        let sched = scheduler();
        let ctx = pool.acquire(&Scope::Primary, &sched).unwrap();
        assert_eq!(ctx.token, "primary-token");
        assert_eq!(ctx.note_store.url(), "mem://primary");
        assert_eq!(creds.read_token(&Scope::Primary).unwrap().unwrap().shard_id, Some(String::from("s1")));
        pool.invalidate(&Scope::Primary).unwrap();
        assert_eq!(creds.read_token(&Scope::Primary).unwrap(), None);
        assert_eq!(pool.acquire(&Scope::Primary, &sched).unwrap().token, "primary-token");
    }

    #[test]
    fn exchanges_tokens_for_linked_notebooks() {
        let (_primary, shard, creds, pool) = setup();
        let sched = scheduler();
        let nb = shard.create_notebook("owner-token", &Notebook::new("Shared")).unwrap();
        let key = shard.share_notebook(nb.guid.as_ref().unwrap());
        let linked = LinkedNotebook {
            guid: Some(String::from("ln1")),
            shared_notebook_global_id: Some(key),
            note_store_url: Some(String::from("mem://shard2")),
            shard_id: Some(String::from("s2")),
            ..Default::default()
        };
        pool.register_linked(&linked);
        let scope = Scope::Linked(String::from("ln1"));
        let ctx = pool.acquire(&scope, &sched).unwrap();
        assert_eq!(ctx.note_store.url(), "mem://shard2");
        assert_eq!(ctx.shard_id, Some(String::from("s2")));
        assert!(creds.read_token(&scope).unwrap().is_some());
        // cached now
        pool.acquire(&scope, &sched).unwrap();
        assert_eq!(shard.calls("authenticateToSharedNotebook"), 1);

        pool.forget_linked("ln1").unwrap();
        assert_eq!(creds.read_token(&scope).unwrap(), None);
        match pool.acquire(&scope, &sched) {
            Err(NError::CannotAuthenticate(ref guid, _)) => assert_eq!(guid, "ln1"),
            x => panic!("expected auth failure, got {:?}", x.map(|c| c.token)),
        }
    }

    #[test]
    fn rejected_exchange_cannot_authenticate() {
        let (_primary, shard, _creds, pool) = setup();
        let sched = scheduler();
        shard.fail_next("authenticateToSharedNotebook", RemoteError::User(ErrorCode::PermissionDenied, None));
        pool.register_linked(&LinkedNotebook {
            guid: Some(String::from("ln1")),
            shared_notebook_global_id: Some(String::from("whatever")),
            note_store_url: Some(String::from("mem://shard2")),
            ..Default::default()
        });
        match pool.acquire(&Scope::Linked(String::from("ln1")), &sched) {
            Err(NError::CannotAuthenticate(..)) => {}
            x => panic!("expected auth failure, got {:?}", x.map(|c| c.token)),
        }
        // the primary scope is unaffected
        assert!(pool.acquire(&Scope::Primary, &sched).is_ok());
    }
}
