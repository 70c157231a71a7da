//! The sync system keeps the local store and the remote note store in line
//! with each other, for the primary account and for every notebook other
//! accounts have shared with us (linked notebooks).
//!
//! A run is a download (remote -> local) for the primary scope, then for each
//! linked notebook on a small worker pool, followed by an upload (local ->
//! remote) of everything dirty. Every remote call goes through the
//! `RetryScheduler` and every client/token comes out of the `NoteStorePool`.
//!
//! Runs can be kicked off by hand (`SyncEngine::run()`) or periodically from
//! a background thread (`start()`).

pub mod report;
pub mod deps;
pub mod conflict;
pub mod scheduler;
pub mod pool;
mod incoming;
mod outgoing;

use std::cmp;
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread;

use jedi::DeserializeOwned;

use crate::api::{Authenticator, NoteStoreFactory};
use crate::credentials::CredentialStore;
use crate::error::{NError, NResult, ErrorClass};
use crate::messaging::{self, Messenger};
use crate::models::{self, EntityType, Notebook, Scope};
use crate::storage::{ListFilter, LocalStore};
use crate::sync::pool::NoteStorePool;
use crate::sync::report::{ScopeRun, ScopeStatus, SyncReport};
use crate::sync::scheduler::{RetryScheduler, ThreadTimer, Timer};
use crate::util;
use crate::util::stopper::Stopper;
use crate::util::thredder::Thredder;

/// Linked notebooks syncing side by side when the config doesn't say
const DEFAULT_LINKED_WORKERS: usize = 4;

/// Grab a config value, falling back to a default if it isn't set (or is
/// garbage).
fn conf<T: DeserializeOwned>(keys: &[&str], default: T) -> T {
    config::get_opt(keys).unwrap_or(default)
}

/// Knobs for the sync engine
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// maxEntries for each chunk request
    pub max_chunk_entries: i32,
    /// How many linked notebooks work at once (ones waiting out a rate limit
    /// don't count). 0 means the default of 4.
    pub linked_notebook_workers: usize,
    pub transport_retries: u32,
    pub transport_backoff_ms: u64,
    /// The (local-only) notebook conflicting notes get moved into
    pub conflict_notebook: String,
    /// Download again if an upload saw USNs it didn't expect
    pub resync_after_upload: bool,
    pub enable_incoming: bool,
    pub enable_outgoing: bool,
    /// How often the background runner syncs
    pub interval_ms: u64,
    /// Tokens this close to expiring count as expired
    pub expiry_margin_secs: i64,
    /// Where the primary account lives, if the token doesn't say
    pub note_store_url: String,
}

impl Default for SyncSettings {
    fn default() -> SyncSettings {
        SyncSettings {
            max_chunk_entries: 50,
            linked_notebook_workers: 0,
            transport_retries: 3,
            transport_backoff_ms: 1000,
            conflict_notebook: String::from("Conflicting notes"),
            resync_after_upload: true,
            enable_incoming: true,
            enable_outgoing: true,
            interval_ms: 300000,
            expiry_margin_secs: 300,
            note_store_url: String::new(),
        }
    }
}

impl SyncSettings {
    /// Build our settings from the app config
    pub fn from_config() -> SyncSettings {
        let def = SyncSettings::default();
        SyncSettings {
            max_chunk_entries: conf(&["sync", "max_chunk_entries"], def.max_chunk_entries),
            linked_notebook_workers: conf(&["sync", "linked_notebook_workers"], def.linked_notebook_workers),
            transport_retries: conf(&["sync", "transport_retries"], def.transport_retries),
            transport_backoff_ms: conf(&["sync", "transport_backoff_ms"], def.transport_backoff_ms),
            conflict_notebook: conf(&["sync", "conflict_notebook"], def.conflict_notebook),
            resync_after_upload: conf(&["sync", "resync_after_upload"], def.resync_after_upload),
            enable_incoming: conf(&["sync", "enable_incoming"], def.enable_incoming),
            enable_outgoing: conf(&["sync", "enable_outgoing"], def.enable_outgoing),
            interval_ms: conf(&["sync", "interval_ms"], def.interval_ms),
            expiry_margin_secs: conf(&["auth", "expiry_margin_secs"], def.expiry_margin_secs),
            note_store_url: conf(&["api", "note_store_url"], def.note_store_url),
        }
    }

    /// The real size of the linked notebook worker pool
    pub fn linked_workers(&self) -> usize {
        match self.linked_notebook_workers {
            0 => DEFAULT_LINKED_WORKERS,
            x => x,
        }
    }
}

/// Everything the coordinators share for the length of a run (and between
/// runs: the pool keeps its clients/tokens).
pub struct SyncContext {
    pub settings: SyncSettings,
    pub store: Arc<dyn LocalStore>,
    pub pool: NoteStorePool,
    pub scheduler: RetryScheduler,
    pub messenger: Arc<Messenger>,
    pub stopper: Arc<Stopper>,
    /// Keeps two scopes from creating the conflict notebook at once
    conflict_lock: Mutex<()>,
}

impl SyncContext {
    /// Bail out if somebody cancelled the run
    pub fn check_cancel(&self) -> NResult<()> {
        if self.stopper.running() { Ok(()) } else { Err(NError::Cancelled) }
    }

    /// Let listeners know an entity got written on one side or the other
    pub fn applied(&self, run: &ScopeRun, ty: EntityType, id: &str, action: &str) {
        debug!("SyncContext.applied() -- {}: {} {} {}", run.scope, action, ty, id);
        self.messenger.event(messaging::EV_ENTITY_APPLIED, json!({
            "scope": run.scope.to_string(),
            "direction": run.direction.as_str(),
            "type": ty,
            "id": id,
            "action": action,
        }));
    }

    /// Sort out an error that happened while working on a single entity.
    /// Entity-level problems get recorded and swallowed, anything bigger goes
    /// back up to kill the scope (or the run).
    pub fn entity_error(&self, run: &mut ScopeRun, ty: EntityType, id: &str, err: NError) -> NResult<()> {
        if err.class() != ErrorClass::EntityFatal {
            return Err(err);
        }
        warn!("SyncContext.entity_error() -- {}: {} skipping {} {}: {}", run.scope, run.direction.as_str(), ty, id, err);
        self.messenger.event(messaging::EV_ENTITY_SKIPPED, json!({
            "scope": run.scope.to_string(),
            "direction": run.direction.as_str(),
            "type": ty,
            "id": id,
            "error": err.to_string(),
        }));
        run.skip(ty, id, &err);
        Ok(())
    }

    /// Find (or make) the local-only notebook conflicting notes live in,
    /// returning its local id.
    pub fn conflict_notebook(&self) -> NResult<String> {
        let _guard = lock!(self.conflict_lock);
        let name = &self.settings.conflict_notebook;
        let existing = self.store.notebooks().list(&ListFilter::all().in_scope(&Scope::Primary))?
            .into_iter()
            .find(|nb| nb.local_only && nb.name.as_ref().map(|x| models::names_match(x, name)).unwrap_or(false));
        if let Some(nb) = existing {
            return Ok(nb.local_id);
        }
        info!("SyncContext.conflict_notebook() -- creating {}", name);
        let mut notebook = Notebook::new(name);
        notebook.local_only = true;
        notebook.dirty = false;
        self.store.notebooks().add(notebook)
    }

    /// Wrap up a scope: log it, tell listeners, and turn its result into a
    /// status. Errors that only kill the scope are swallowed here, the rest
    /// are passed back.
    pub fn finish_scope(&self, run: &ScopeRun, res: NResult<()>) -> (ScopeStatus, NResult<()>) {
        let (status, ret) = match res {
            Ok(_) => (ScopeStatus::Success, Ok(())),
            Err(NError::Cancelled) => (ScopeStatus::Cancelled, Err(NError::Cancelled)),
            Err(e) => {
                error!("SyncContext.finish_scope() -- {}: {} failed: {}", run.scope, run.direction.as_str(), e);
                let status = ScopeStatus::Failed(e.to_string());
                if e.is_run_fatal() { (status, Err(e)) } else { (status, Ok(())) }
            }
        };
        info!("SyncContext.finish_scope() -- {}: {} done: {:?}", run.scope, run.direction.as_str(), run.stats);
        let (status_str, err_str) = match status {
            ScopeStatus::Success => ("success", None),
            ScopeStatus::Cancelled => ("cancelled", None),
            ScopeStatus::Failed(ref e) => ("error", Some(e.clone())),
        };
        self.messenger.event(messaging::EV_SCOPE_FINISHED, json!({
            "scope": run.scope.to_string(),
            "direction": run.direction.as_str(),
            "status": status_str,
            "error": err_str,
        }));
        (status, ret)
    }

    /// `finish_scope()` and file the result in the report
    pub fn file_scope(&self, report: &mut SyncReport, run: ScopeRun, res: NResult<()>) -> NResult<()> {
        let (status, ret) = self.finish_scope(&run, res);
        report.add_scope(run, status);
        ret
    }

    /// Run a batch of independent scopes on the linked notebook pool and
    /// file each one. Every scope gets to finish. If any of them hit a
    /// run-fatal error (or got cancelled) that comes back once they're done.
    pub fn fan_out<I, F>(&self, report: &mut SyncReport, name: &str, items: Vec<I>, run_one: F) -> NResult<()>
        where I: Send,
              F: Fn(I) -> (ScopeRun, NResult<()>) + Sync
    {
        if items.is_empty() { return Ok(()); }
        let thredder = Thredder::new(name, self.settings.linked_workers());
        info!("SyncContext.fan_out() -- {}: {} scopes ({} at a time)", name, items.len(), thredder.workers());
        let results = thredder.map(items, |item| {
            let (run, res) = run_one(item);
            let (status, ret) = self.finish_scope(&run, res);
            (run, status, ret)
        })?;
        let mut fatal: Option<NError> = None;
        for (run, status, ret) in results {
            report.add_scope(run, status);
            if let Err(e) = ret {
                // a run-fatal error beats a cancellation
                fatal = match fatal {
                    None | Some(NError::Cancelled) => Some(e),
                    x => x,
                };
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Runs syncs. Build one per account, hook up an authenticator (if the
/// credential store might not have a good token) and call `run()`.
pub struct SyncEngine {
    ctx: SyncContext,
}

impl SyncEngine {
    pub fn new(settings: SyncSettings, store: Arc<dyn LocalStore>, factory: Arc<dyn NoteStoreFactory>, credentials: Arc<dyn CredentialStore>) -> SyncEngine {
        let messenger = Arc::new(Messenger::new());
        let stopper = Arc::new(Stopper::new());
        let scheduler = RetryScheduler::new(Arc::new(ThreadTimer), stopper.clone(), messenger.clone(), settings.transport_retries, settings.transport_backoff_ms);
        let pool = NoteStorePool::new(factory, credentials, &settings.note_store_url, settings.expiry_margin_secs * 1000);
        SyncEngine {
            ctx: SyncContext {
                settings: settings,
                store: store,
                pool: pool,
                scheduler: scheduler,
                messenger: messenger,
                stopper: stopper,
                conflict_lock: Mutex::new(()),
            },
        }
    }

    /// Give the engine a way to get a primary token when it has none
    pub fn set_authenticator(&mut self, authenticator: Arc<dyn Authenticator>) {
        self.ctx.pool.set_authenticator(authenticator);
    }

    /// Swap out the timer used to wait out rate limits/backoff
    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> SyncEngine {
        let settings = &self.ctx.settings;
        self.ctx.scheduler = RetryScheduler::new(timer, self.ctx.stopper.clone(), self.ctx.messenger.clone(), settings.transport_retries, settings.transport_backoff_ms);
        self
    }

    /// Bind to this to hear about progress
    pub fn messenger(&self) -> Arc<Messenger> {
        self.ctx.messenger.clone()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.ctx.settings
    }

    /// Ask the current run to wind down at its next step. A cancelled engine
    /// stays cancelled until `reset()`.
    pub fn cancel(&self) {
        info!("SyncEngine.cancel() -- cancelling");
        self.ctx.stopper.stop();
    }

    /// Undo a `cancel()` so the engine can run again
    pub fn reset(&self) {
        debug!("SyncEngine.reset() -- ready to run");
        self.ctx.stopper.set(true);
    }

    /// A handle other threads can use to cancel the engine
    pub fn cancel_handle(&self) -> Arc<Stopper> {
        self.ctx.stopper.clone()
    }

    /// Run a full sync: download everything, upload everything, and download
    /// again if the upload says we missed something. Only run-fatal errors
    /// come back as errors, everything else is in the report.
    pub fn run(&self) -> NResult<SyncReport> {
        let ctx = &self.ctx;
        ctx.store.ping()?;
        info!("SyncEngine.run() -- starting sync");
        ctx.messenger.event(messaging::EV_STARTED, json!({}));
        let mut report = SyncReport::new();
        match self.run_steps(&mut report) {
            Ok(_) => {}
            Err(NError::Cancelled) => {
                info!("SyncEngine.run() -- cancelled");
                report.cancelled = true;
            }
            Err(e) => {
                error!("SyncEngine.run() -- run failed: {}", e);
                ctx.messenger.event(messaging::EV_FINISHED, json!({
                    "success": false,
                    "cancelled": false,
                    "error": e.to_string(),
                }));
                return Err(e);
            }
        }
        info!("SyncEngine.run() -- done ({} scopes, {} warnings)", report.scopes.len(), report.warnings.len());
        ctx.messenger.event(messaging::EV_FINISHED, json!({
            "success": report.is_success(),
            "cancelled": report.cancelled,
            "warnings": report.warnings.len(),
        }));
        Ok(report)
    }

    fn run_steps(&self, report: &mut SyncReport) -> NResult<()> {
        let ctx = &self.ctx;
        if ctx.settings.enable_incoming {
            incoming::download(ctx, report)?;
        }
        if !ctx.settings.enable_outgoing {
            return Ok(());
        }
        ctx.check_cancel()?;
        outgoing::upload(ctx, report)?;
        if report.resync_needed() && ctx.settings.resync_after_upload && ctx.settings.enable_incoming {
            info!("SyncEngine.run_steps() -- upload saw a usn gap, downloading again");
            ctx.check_cancel()?;
            report.resynced = true;
            incoming::download(ctx, report)?;
        }
        Ok(())
    }
}

/// Shared between the background runner and whoever started it. Flip these to
/// control the runner.
pub struct SyncConfig {
    /// Whether or not to quit the sync thread
    pub quit: bool,
    /// Whether or not to run syncing
    pub enabled: bool,
}

impl SyncConfig {
    pub fn new() -> SyncConfig {
        SyncConfig {
            quit: false,
            enabled: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig::new()
    }
}

/// A structure that tracks some state for a running sync system.
pub struct SyncState {
    pub join_handles: Vec<thread::JoinHandle<()>>,
    pub shutdown: Box<dyn Fn() + 'static + Sync + Send>,
    pub pause: Box<dyn Fn() + 'static + Sync + Send>,
    pub resume: Box<dyn Fn() + 'static + Sync + Send>,
}

/// Defines some common functions for things that sync in a loop
pub trait Syncer {
    /// Get this syncer's name
    fn get_name(&self) -> &'static str;

    /// Get a copy of the current sync config
    fn get_config(&self) -> Arc<RwLock<SyncConfig>>;

    /// Run the sync operation for this syncer.
    fn run_sync(&self) -> NResult<()>;

    /// Run any initialization this Syncer needs.
    fn init(&self) -> NResult<()> {
        Ok(())
    }

    /// Get the delay (in ms) between calls to run_sync() for this Syncer
    fn get_delay(&self) -> u64 {
        1000
    }

    /// Check to see if we should quit the thread
    fn should_quit(&self) -> bool {
        let local_config = self.get_config();
        let guard = lockr!(local_config);
        guard.quit
    }

    /// Check to see if we're enabled
    fn is_enabled(&self) -> bool {
        let local_config = self.get_config();
        let guard = lockr!(local_config);
        guard.enabled
    }

    /// Runs our syncer, with some quick checks on run status.
    fn runner(&self, init_tx: mpsc::Sender<NResult<()>>) {
        info!("sync::runner() -- {} init", self.get_name());
        let init_res = self.init();
        let init_failed = init_res.is_err();
        if let Err(ref e) = init_res {
            error!("sync::runner() -- {}: init: {}", self.get_name(), e);
        }
        if let Err(e) = init_tx.send(init_res) {
            error!("sync::runner() -- {}: problem sending init signal: {}", self.get_name(), e);
        }
        if init_failed { return; }

        info!("sync::runner() -- {} main loop", self.get_name());
        while !self.should_quit() {
            if self.is_enabled() {
                if let Err(e) = self.run_sync() {
                    error!("sync::runner() -- {}: main loop: {}", self.get_name(), e);
                }
            }
            // sleep in slices so a shutdown doesn't have to wait out the
            // whole delay
            let mut remaining = self.get_delay();
            while remaining > 0 && !self.should_quit() {
                let slice = cmp::min(remaining, 100);
                util::sleep(slice);
                remaining -= slice;
            }
        }
    }
}

/// Runs the engine over and over
pub struct SyncRunner {
    name: &'static str,
    config: Arc<RwLock<SyncConfig>>,
    engine: Arc<SyncEngine>,
}

impl SyncRunner {
    pub fn new(config: Arc<RwLock<SyncConfig>>, engine: Arc<SyncEngine>) -> SyncRunner {
        SyncRunner {
            name: "runner",
            config: config,
            engine: engine,
        }
    }
}

impl Syncer for SyncRunner {
    fn get_name(&self) -> &'static str {
        self.name
    }

    fn get_config(&self) -> Arc<RwLock<SyncConfig>> {
        self.config.clone()
    }

    fn init(&self) -> NResult<()> {
        self.engine.ctx.store.ping()
    }

    fn get_delay(&self) -> u64 {
        self.engine.settings().interval_ms
    }

    fn run_sync(&self) -> NResult<()> {
        let report = self.engine.run()?;
        for failed in report.failed_scopes() {
            warn!("SyncRunner.run_sync() -- {} {} failed: {:?}", failed.scope, failed.direction.as_str(), failed.status);
        }
        Ok(())
    }
}

/// Start syncing in the background. Returns once the sync thread has
/// initialized (or failed to).
pub fn start(config: Arc<RwLock<SyncConfig>>, engine: Arc<SyncEngine>) -> NResult<SyncState> {
    // enable syncing (set phasers to stun)
    {
        let mut config_guard = lockw!(config);
        config_guard.enabled = true;
        config_guard.quit = false;
    }
    engine.reset();

    let (tx, rx) = mpsc::channel::<NResult<()>>();
    let runner = SyncRunner::new(config.clone(), engine.clone());
    let handle = thread::Builder::new().name(format!("sync:{}", runner.get_name())).spawn(move || {
        runner.runner(tx);
        info!("sync::start() -- {} shut down", runner.get_name());
    })?;
    match rx.recv() {
        Ok(x) => x?,
        Err(e) => return Err(NError::Msg(format!("sync::start() -- runner never reported in: {}", e))),
    }

    let config1 = config.clone();
    let engine1 = engine.clone();
    let shutdown = move || {
        {
            let mut guard = lockw!(config1);
            guard.enabled = false;
            guard.quit = true;
        }
        // wake up anything waiting out a rate limit
        engine1.cancel();
    };
    let config2 = config.clone();
    let pause = move || {
        let mut guard = lockw!(config2);
        guard.enabled = false;
    };
    let config3 = config.clone();
    let resume = move || {
        let mut guard = lockw!(config3);
        guard.enabled = true;
    };

    Ok(SyncState {
        join_handles: vec![handle],
        shutdown: Box::new(shutdown),
        pause: Box::new(pause),
        resume: Box::new(resume),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use crate::api::memory::{MemoryService, MemoryServiceFactory};
    use crate::credentials::{MemoryCredentials, StoredToken};
    use crate::storage::MemoryStore;
    use crate::util::event::Emitter;

    fn engine(store: Arc<MemoryStore>) -> SyncEngine {
        let service = Arc::new(MemoryService::new("mem://primary"));
        service.add_token("t0ken", util::now_ms() + 1000000);
        let factory = Arc::new(MemoryServiceFactory::new());
        factory.add(service);
        let creds = Arc::new(MemoryCredentials::new());
        creds.write_token(&Scope::Primary, &StoredToken::new("t0ken", util::now_ms() + 1000000)).unwrap();
        let settings = SyncSettings {
            note_store_url: String::from("mem://primary"),
            interval_ms: 50,
            ..Default::default()
        };
        SyncEngine::new(settings, store, factory, creds)
    }

    #[test]
    fn settings_have_sane_defaults() {
        let settings = SyncSettings::default();
        assert_eq!(settings.max_chunk_entries, 50);
        assert!(settings.linked_workers() >= 1 && settings.linked_workers() <= 4);
        let settings = SyncSettings { linked_notebook_workers: 7, ..Default::default() };
        assert_eq!(settings.linked_workers(), 7);
    }

    #[test]
    fn makes_one_conflict_notebook() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let id1 = engine.ctx.conflict_notebook().unwrap();
        let id2 = engine.ctx.conflict_notebook().unwrap();
        assert_eq!(id1, id2);
        let nb = store.notebooks().find(&id1).unwrap().unwrap();
        assert!(nb.local_only);
        assert!(!nb.dirty);
        assert_eq!(nb.name, Some(String::from("Conflicting notes")));
    }

    #[test]
    fn starts_and_quits() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(engine(store));
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        engine.messenger().bind(messaging::EV_FINISHED, move |_| { runs2.fetch_add(1, Ordering::SeqCst); }, "test");
        let config = Arc::new(RwLock::new(SyncConfig::new()));
        let mut state = start(config, engine).unwrap();
        let started = Instant::now();
        while runs.load(Ordering::SeqCst) < 2 && started.elapsed() < Duration::from_secs(10) {
            util::sleep(10);
        }
        assert!(runs.load(Ordering::SeqCst) >= 2);
        (state.shutdown)();
        while let Some(handle) = state.join_handles.pop() {
            handle.join().unwrap();
        }
    }
}
