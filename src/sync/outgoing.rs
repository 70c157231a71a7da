//! Local -> remote. Everything dirty (that's allowed to leave this machine)
//! gets created or updated on the remote side of the scope it lives in, and
//! the guid/USN the remote hands back gets written into the local store.
//!
//! Parents have to exist remotely before their children: a tag waits for its
//! parent tag, a note waits for its notebook and tags. Anything still waiting
//! when a pass makes no more progress is left dirty for the next sync.

use std::collections::{BTreeSet, HashSet};

use crate::api::RResult;
use crate::error::{NError, NResult};
use crate::messaging;
use crate::models::{
    EntityType, Note, Notebook, SavedSearch, Scope, SyncCursor, SyncEntity, Tag,
};
use crate::storage::{ListFilter, Stored};
use crate::sync::SyncContext;
use crate::sync::deps;
use crate::sync::pool::AuthContext;
use crate::sync::report::{Direction, ScopeRun, ScopeStatus, SyncReport};

/// What happened when we tried to send an entity
enum Step {
    Uploaded,
    /// Still waiting on the named dependency to get a guid
    Deferred(String),
}

/// Follows the USNs an upload gets back. If every one of them is exactly one
/// above the last, nobody else touched the scope and the cursor can move
/// along with us. Anything else means we missed somebody's changes.
struct UsnTracker {
    last: Option<i32>,
    moved: bool,
    gap: bool,
}

impl UsnTracker {
    fn new(cursor: Option<&SyncCursor>) -> UsnTracker {
        UsnTracker {
            last: cursor.map(|x| x.update_count),
            moved: false,
            gap: false,
        }
    }

    fn saw(&mut self, usn: i32) {
        match self.last {
            Some(last) if usn == last + 1 => {
                self.last = Some(usn);
                self.moved = true;
            }
            Some(last) => {
                if !self.gap {
                    debug!("UsnTracker.saw() -- expected usn {}, got {}", last + 1, usn);
                }
                self.gap = true;
            }
            // no cursor, nothing to compare against
            None => {}
        }
    }
}

/// One trip through a scope's dirty entities
#[derive(Default)]
struct Pass {
    uploaded: usize,
    deferred: Vec<(EntityType, String, String)>,
}

/// Upload every scope that has something dirty: the primary account first,
/// then the linked notebooks in parallel. Scopes whose download failed earlier
/// in the run stay put until a download gets through.
pub fn upload(ctx: &SyncContext, report: &mut SyncReport) -> NResult<()> {
    let linked = ctx.store.linked_notebooks().list(&ListFilter::all().synced(true))?;
    for ln in &linked {
        ctx.pool.register_linked(ln);
    }
    let scopes = pending_scopes(ctx)?;
    let held = report.scopes.iter()
        .filter(|x| x.direction == Direction::Download && x.status != ScopeStatus::Success)
        .map(|x| x.scope.clone())
        .collect::<HashSet<_>>();

    let mut run = ScopeRun::new(&Scope::Primary, Direction::Upload);
    let res = upload_or_hold(ctx, &Scope::Primary, &held, &mut run);
    ctx.file_scope(report, run, res)?;

    ctx.check_cancel()?;
    let linked_scopes = scopes.into_iter()
        .filter(|x| !x.is_primary())
        .collect::<Vec<_>>();
    ctx.fan_out(report, "sync:linked:up", linked_scopes, |scope| {
        let mut run = ScopeRun::new(&scope, Direction::Upload);
        let res = upload_or_hold(ctx, &scope, &held, &mut run);
        (run, res)
    })
}

/// Upload a scope, unless it's in `held` (its download failed). Updating
/// entities we haven't pulled the remote side of would overwrite it.
fn upload_or_hold(ctx: &SyncContext, scope: &Scope, held: &HashSet<Scope>, run: &mut ScopeRun) -> NResult<()> {
    if held.contains(scope) {
        warn!("outgoing::upload_or_hold() -- {}: download failed, not uploading", scope);
        return Err(NError::NotDownloaded(scope.to_string()));
    }
    upload_scope(ctx, scope, run)
}

/// The scope a note uploads in is its notebook's
fn note_scope(ctx: &SyncContext, note: &Note) -> NResult<Option<Scope>> {
    let notebook = match note.notebook_local_id {
        Some(ref id) => ctx.store.notebooks().find(id)?,
        None => None,
    };
    match notebook {
        Some(ref nb) if nb.is_local_only() => Ok(None),
        Some(nb) => Ok(Some(nb.scope())),
        // lost its notebook. let the upload complain about it.
        None => Ok(Some(note.scope())),
    }
}

/// Notes that need sending: dirty ones, plus ones with dirty resources
fn dirty_notes(ctx: &SyncContext) -> NResult<Vec<Note>> {
    let mut notes = ctx.store.notes().list(&ListFilter::dirty())?;
    let mut seen = notes.iter().map(|x| x.local_id.clone()).collect::<HashSet<_>>();
    for res in ctx.store.resources().list(&ListFilter::dirty())? {
        let note_id = match res.note_local_id {
            Some(x) => x,
            None => continue,
        };
        if seen.contains(&note_id) { continue; }
        if let Some(note) = ctx.store.notes().find(&note_id)? {
            seen.insert(note_id);
            notes.push(note);
        }
    }
    Ok(notes)
}

/// Every scope with something to upload. The primary scope is always there.
fn pending_scopes(ctx: &SyncContext) -> NResult<BTreeSet<Scope>> {
    let mut scopes = BTreeSet::new();
    scopes.insert(Scope::Primary);
    for nb in ctx.store.notebooks().list(&ListFilter::dirty())? {
        if !nb.is_local_only() { scopes.insert(nb.scope()); }
    }
    for tag in ctx.store.tags().list(&ListFilter::dirty())? {
        if !tag.is_local_only() { scopes.insert(tag.scope()); }
    }
    for note in dirty_notes(ctx)? {
        if let Some(scope) = note_scope(ctx, &note)? {
            scopes.insert(scope);
        }
    }
    Ok(scopes)
}

/// Upload one scope, pass after pass, until nothing else can go
fn upload_scope(ctx: &SyncContext, scope: &Scope, run: &mut ScopeRun) -> NResult<()> {
    info!("outgoing::upload_scope() -- {}: starting upload", scope);
    ctx.messenger.event(messaging::EV_SCOPE_STARTED, json!({
        "scope": scope.to_string(),
        "direction": Direction::Upload.as_str(),
    }));
    ctx.check_cancel()?;

    let cursor = ctx.store.cursor(scope)?;
    let mut tracker = UsnTracker::new(cursor.as_ref());
    let mut attempted: HashSet<String> = HashSet::new();
    let dirty_in_scope = ListFilter::dirty().in_scope(scope);
    let mut passes = 0;
    let deferred = loop {
        passes += 1;
        let mut pass = Pass::default();

        let notebooks = ctx.store.notebooks().list(&dirty_in_scope)?
            .into_iter()
            .filter(|x| !x.is_local_only())
            .collect::<Vec<_>>();
        push_each(ctx, run, &mut pass, &mut attempted, notebooks, |run, nb| {
            push_notebook(ctx, scope, run, &mut tracker, nb)
        })?;

        let tags = ctx.store.tags().list(&dirty_in_scope)?
            .into_iter()
            .filter(|x| !x.is_local_only())
            .collect::<Vec<_>>();
        push_each(ctx, run, &mut pass, &mut attempted, deps::sort_tags(tags)?, |run, tag| {
            push_tag(ctx, scope, run, &mut tracker, tag)
        })?;

        if scope.is_primary() {
            let searches = ctx.store.searches().list(&ListFilter::dirty())?
                .into_iter()
                .filter(|x| !x.is_local_only())
                .collect::<Vec<_>>();
            push_each(ctx, run, &mut pass, &mut attempted, searches, |run, search| {
                push_search(ctx, scope, run, &mut tracker, search)
            })?;
        }

        let mut notes = Vec::new();
        for note in dirty_notes(ctx)? {
            if note_scope(ctx, &note)?.as_ref() == Some(scope) {
                notes.push(note);
            }
        }
        push_each(ctx, run, &mut pass, &mut attempted, notes, |run, note| {
            push_note(ctx, scope, run, &mut tracker, note)
        })?;

        if pass.deferred.is_empty() || pass.uploaded == 0 {
            break pass.deferred;
        }
        debug!("outgoing::upload_scope() -- {}: pass {} sent {}, {} still waiting", scope, passes, pass.uploaded, pass.deferred.len());
    };
    for (ty, id, waiting_on) in deferred {
        warn!("outgoing::upload_scope() -- {}: {} {} can't go yet (waiting on {})", scope, ty, id, waiting_on);
        run.defer(ty, &id, &waiting_on);
    }

    if tracker.gap {
        info!("outgoing::upload_scope() -- {}: remote changed under us, needs another download", scope);
        run.stats.resync_needed = true;
    } else if tracker.moved {
        if let (Some(cur), Some(usn)) = (cursor, tracker.last) {
            ctx.store.set_cursor(scope, &SyncCursor::new(usn, cur.last_sync_time))?;
        }
    }
    info!("outgoing::upload_scope() -- {}: sent {} entities", scope, run.stats.uploaded);
    Ok(())
}

/// Try to send each entity that hasn't been tried yet this run. Failures
/// that only concern the entity get recorded and we move on.
fn push_each<T, F>(ctx: &SyncContext, run: &mut ScopeRun, pass: &mut Pass, attempted: &mut HashSet<String>, items: Vec<T>, mut push: F) -> NResult<()>
    where T: SyncEntity,
          F: FnMut(&mut ScopeRun, T) -> NResult<Step>
{
    for item in items {
        if attempted.contains(item.local_id()) { continue; }
        ctx.check_cancel()?;
        let local_id = String::from(item.local_id());
        let label = item.label();
        match push(run, item) {
            Ok(Step::Uploaded) => {
                attempted.insert(local_id);
                pass.uploaded += 1;
            }
            Ok(Step::Deferred(waiting_on)) => pass.deferred.push((T::entity_type(), label, waiting_on)),
            Err(e) => {
                attempted.insert(local_id);
                ctx.entity_error(run, T::entity_type(), &label, e)?;
            }
        }
    }
    Ok(())
}

/// Run a create (no guid yet) or update call for an entity
fn send<T, C, U>(ctx: &SyncContext, scope: &Scope, entity: &T, create: C, update: U) -> NResult<T>
    where T: SyncEntity,
          C: Fn(&AuthContext, &T) -> RResult<T>,
          U: Fn(&AuthContext, &T) -> RResult<T>
{
    let (op, is_create) = match entity.guid() {
        Some(_) => (format!("update{}", op_name::<T>()), false),
        None => (format!("create{}", op_name::<T>()), true),
    };
    ctx.scheduler.call_with_auth(&ctx.pool, scope, &op, |auth| {
        if is_create { create(auth, entity) } else { update(auth, entity) }
    })
}

fn op_name<T: SyncEntity>() -> &'static str {
    match T::entity_type() {
        EntityType::Notebook => "Notebook",
        EntityType::Tag => "Tag",
        EntityType::SavedSearch => "Search",
        EntityType::Note => "Note",
        EntityType::Resource => "Resource",
        EntityType::LinkedNotebook => "LinkedNotebook",
    }
}

/// Write what the remote gave back into the local entity. No USN in the
/// response breaks the remote's contract: we keep the guid (so the next try
/// is an update) but the entity stays dirty and fails.
fn write_back<T: Stored>(ctx: &SyncContext, run: &ScopeRun, tracker: &mut UsnTracker, mut local: T, guid: Option<&str>, usn: Option<i32>) -> NResult<T> {
    let table = T::table(&*ctx.store);
    let guid = match guid {
        Some(x) => String::from(x),
        None => return Err(NError::Internal(format!("outgoing::write_back() -- {}: {} {} came back without a guid", run.scope, T::entity_type(), local.local_id()))),
    };
    local.set_guid(Some(guid.clone()));
    let usn = match usn {
        Some(x) => x,
        None => {
            table.update(&local)?;
            return Err(NError::Internal(format!("outgoing::write_back() -- {}: {} {} came back without a usn", run.scope, T::entity_type(), guid)));
        }
    };
    local.set_usn(Some(usn));
    local.set_dirty(false);
    table.update(&local)?;
    tracker.saw(usn);
    ctx.applied(run, T::entity_type(), &guid, "upload");
    Ok(local)
}

fn push_notebook(ctx: &SyncContext, scope: &Scope, run: &mut ScopeRun, tracker: &mut UsnTracker, notebook: Notebook) -> NResult<Step> {
    let sent = send(ctx, scope, &notebook,
        |auth, nb| auth.note_store.create_notebook(&auth.token, nb),
        |auth, nb| auth.note_store.update_notebook(&auth.token, nb))?;
    write_back(ctx, run, tracker, notebook, sent.guid(), sent.usn)?;
    run.stats.uploaded += 1;
    Ok(Step::Uploaded)
}

fn push_tag(ctx: &SyncContext, scope: &Scope, run: &mut ScopeRun, tracker: &mut UsnTracker, mut tag: Tag) -> NResult<Step> {
    if let Some(parent_id) = tag.parent_local_id.clone() {
        match ctx.store.tags().find(&parent_id)? {
            Some(Tag { guid: Some(guid), .. }) => tag.parent_guid = Some(guid),
            Some(parent) => return Ok(Step::Deferred(format!("parent tag {}", parent.local_id))),
            None => {
                warn!("outgoing::push_tag() -- {}: tag {} lost its parent {}, sending it as a root", scope, tag.label(), parent_id);
                tag.parent_local_id = None;
                tag.parent_guid = None;
            }
        }
    }
    let sent = send(ctx, scope, &tag,
        |auth, tag| auth.note_store.create_tag(&auth.token, tag),
        |auth, tag| auth.note_store.update_tag(&auth.token, tag))?;
    write_back(ctx, run, tracker, tag, sent.guid(), sent.usn)?;
    run.stats.uploaded += 1;
    Ok(Step::Uploaded)
}

fn push_search(ctx: &SyncContext, scope: &Scope, run: &mut ScopeRun, tracker: &mut UsnTracker, search: SavedSearch) -> NResult<Step> {
    let sent = send(ctx, scope, &search,
        |auth, search| auth.note_store.create_search(&auth.token, search),
        |auth, search| auth.note_store.update_search(&auth.token, search))?;
    write_back(ctx, run, tracker, search, sent.guid(), sent.usn)?;
    run.stats.uploaded += 1;
    Ok(Step::Uploaded)
}

/// Send a note along with its resources, then match the resources that came
/// back to ours by their data hash.
fn push_note(ctx: &SyncContext, scope: &Scope, run: &mut ScopeRun, tracker: &mut UsnTracker, mut note: Note) -> NResult<Step> {
    let notebook_id = match note.notebook_local_id {
        Some(ref x) => x.clone(),
        None => return Err(NError::MissingField(format!("note {}: notebook", note.label()))),
    };
    let notebook = match ctx.store.notebooks().find(&notebook_id)? {
        Some(x) => x,
        None => return Err(NError::NotFound(format!("outgoing::push_note() -- notebook {} (for note {})", notebook_id, note.label()))),
    };
    note.notebook_guid = match notebook.guid {
        Some(x) => Some(x),
        None => return Ok(Step::Deferred(format!("notebook {}", notebook.local_id))),
    };
    let mut tag_guids = Vec::with_capacity(note.tag_local_ids.len());
    for tag_id in &note.tag_local_ids {
        match ctx.store.tags().find(tag_id)? {
            Some(Tag { guid: Some(guid), .. }) => tag_guids.push(guid),
            Some(tag) => return Ok(Step::Deferred(format!("tag {}", tag.local_id))),
            None => debug!("outgoing::push_note() -- {}: note {} has a dangling tag {}", scope, note.label(), tag_id),
        }
    }
    note.tag_guids = tag_guids;
    note.linked_notebook_guid = scope.linked_notebook_guid().map(String::from);

    let resources = ctx.store.resources().list(&ListFilter::all().in_note(&note.local_id))?;
    let mut wire = note.clone();
    wire.resources = resources.iter()
        .cloned()
        .map(|mut res| {
            res.note_guid = note.guid.clone();
            res
        })
        .collect();
    let sent = send(ctx, scope, &wire,
        |auth, note| auth.note_store.create_note(&auth.token, note),
        |auth, note| auth.note_store.update_note(&auth.token, note))?;

    if sent.content_hash.is_some() {
        note.content_hash = sent.content_hash.clone();
        note.content_length = sent.content_length;
    }
    note.conflicting = false;
    let note = write_back(ctx, run, tracker, note, sent.guid.as_ref().map(|x| x.as_str()), sent.usn)?;
    run.stats.uploaded += 1;

    for mut res in resources {
        let remote = sent.resources.iter()
            .find(|x| x.data_hash.is_some() && x.data_hash == res.data_hash);
        let remote = match remote {
            Some(x) => x,
            None => {
                warn!("outgoing::push_note() -- {}: resource {} of note {} didn't come back", scope, res.local_id, note.label());
                continue;
            }
        };
        res.guid = remote.guid.clone();
        res.usn = remote.usn;
        res.note_guid = note.guid.clone();
        res.linked_notebook_guid = note.linked_notebook_guid.clone();
        res.dirty = false;
        ctx.store.resources().update(&res)?;
    }
    Ok(Step::Uploaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_consecutive_usns() {
        let cursor = SyncCursor::new(10, 0);
        let mut tracker = UsnTracker::new(Some(&cursor));
        tracker.saw(11);
        tracker.saw(12);
        assert!(tracker.moved);
        assert!(!tracker.gap);
        assert_eq!(tracker.last, Some(12));
        tracker.saw(14);
        assert!(tracker.gap);
        assert_eq!(tracker.last, Some(12));

        let mut blind = UsnTracker::new(None);
        blind.saw(3);
        assert!(!blind.moved);
        assert!(!blind.gap);
    }
}
