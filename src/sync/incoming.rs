//! Remote -> local. For each scope: check the remote sync state, pull chunks
//! from our cursor until we're caught up, apply everything (parents first,
//! resolving collisions), fetch the note bodies/resource data the chunks
//! left out, apply expunges, and only then move the cursor.
//!
//! The primary scope goes first since that's where we learn about linked
//! notebooks. The linked notebooks then sync side by side on a small pool.

use std::cmp;
use std::collections::HashSet;

use crate::api::SyncChunk;
use crate::error::{NError, NResult};
use crate::messaging;
use crate::models::{
    EntityType, LinkedNotebook, Note, Notebook, Resource, SavedSearch, Scope,
    SyncCursor, SyncEntity, Tag,
};
use crate::storage::{ListFilter, Stored};
use crate::sync::SyncContext;
use crate::sync::conflict::{self, Conflictable, NoteResolution, Resolution};
use crate::sync::deps;
use crate::sync::report::{Direction, ScopeRun, SyncReport};
use crate::util;

/// What applying one remote entity did locally
#[derive(Debug, Clone, Copy, PartialEq)]
enum Applied {
    Added,
    Updated,
    /// Both sides changed it, we kept both
    Conflict,
    Unchanged,
}

impl Applied {
    fn action(&self) -> Option<&'static str> {
        match *self {
            Applied::Added => Some("add"),
            Applied::Updated => Some("update"),
            Applied::Conflict => Some("conflict"),
            Applied::Unchanged => None,
        }
    }
}

/// Everything a scope's chunks brought down
#[derive(Default)]
struct Batch {
    notebooks: Vec<Notebook>,
    tags: Vec<Tag>,
    searches: Vec<SavedSearch>,
    notes: Vec<Note>,
    resources: Vec<Resource>,
    linked_notebooks: Vec<LinkedNotebook>,
    expunged_notebooks: Vec<String>,
    expunged_tags: Vec<String>,
    expunged_searches: Vec<String>,
    expunged_notes: Vec<String>,
    expunged_linked_notebooks: Vec<String>,
    /// The last chunk's end USN
    high_usn: Option<i32>,
    /// The last chunk's update count
    update_count: i32,
}

impl Batch {
    fn absorb(&mut self, chunk: SyncChunk) {
        self.high_usn = chunk.chunk_high_usn.or(self.high_usn);
        self.update_count = chunk.update_count;
        self.notebooks.extend(chunk.notebooks);
        self.tags.extend(chunk.tags);
        self.searches.extend(chunk.searches);
        self.notes.extend(chunk.notes);
        self.resources.extend(chunk.resources);
        self.linked_notebooks.extend(chunk.linked_notebooks);
        self.expunged_notebooks.extend(chunk.expunged_notebooks);
        self.expunged_tags.extend(chunk.expunged_tags);
        self.expunged_searches.extend(chunk.expunged_searches);
        self.expunged_notes.extend(chunk.expunged_notes);
        self.expunged_linked_notebooks.extend(chunk.expunged_linked_notebooks);
    }

    /// Mark everything as living in a linked notebook
    fn stamp(&mut self, linked_guid: &str) {
        let guid = Some(String::from(linked_guid));
        for x in &mut self.notebooks { x.linked_notebook_guid = guid.clone(); }
        for x in &mut self.tags { x.linked_notebook_guid = guid.clone(); }
        for x in &mut self.notes { x.linked_notebook_guid = guid.clone(); }
        for x in &mut self.resources { x.linked_notebook_guid = guid.clone(); }
    }

    /// Every guid the batch brought down
    fn seen(&self) -> HashSet<String> {
        fn guids<T: SyncEntity>(items: &[T]) -> Vec<String> {
            items.iter().filter_map(|x| x.guid().map(String::from)).collect()
        }
        let mut seen = HashSet::new();
        seen.extend(guids(&self.notebooks));
        seen.extend(guids(&self.tags));
        seen.extend(guids(&self.searches));
        seen.extend(guids(&self.notes));
        seen.extend(guids(&self.resources));
        seen.extend(guids(&self.linked_notebooks));
        seen
    }
}

/// An entity changed twice while we were downloading shows up twice. Keep the
/// newest copy, at the spot the newest copy came in.
fn dedupe<T: SyncEntity>(items: Vec<T>) -> Vec<T> {
    let mut seen: HashSet<String> = HashSet::with_capacity(items.len());
    let mut deduped: Vec<T> = items.into_iter().rev()
        .filter(|x| match x.guid() {
            Some(guid) => seen.insert(String::from(guid)),
            None => true,
        })
        .collect();
    deduped.reverse();
    deduped
}

/// Count an applied entity and tell listeners about it
fn record(ctx: &SyncContext, run: &mut ScopeRun, ty: EntityType, id: &str, applied: Applied) {
    match applied {
        Applied::Added => run.stats.added += 1,
        Applied::Updated => run.stats.updated += 1,
        Applied::Conflict => run.stats.conflicts += 1,
        Applied::Unchanged => {}
    }
    if let Some(action) = applied.action() {
        ctx.applied(run, ty, id, action);
    }
}

/// Run `apply` over a list of remote entities, skipping (and reporting) the
/// ones that blow up on their own.
fn apply_each<T, F>(ctx: &SyncContext, run: &mut ScopeRun, items: Vec<T>, mut apply: F) -> NResult<()>
    where T: SyncEntity,
          F: FnMut(T) -> NResult<Applied>
{
    for item in items {
        let label = item.label();
        match apply(item) {
            Ok(applied) => record(ctx, run, T::entity_type(), &label, applied),
            Err(e) => ctx.entity_error(run, T::entity_type(), &label, e)?,
        }
    }
    Ok(())
}

/// Run `expunge` over a list of expunged guids. `expunge` returns whether it
/// found anything to remove.
fn expunge_each<F>(ctx: &SyncContext, run: &mut ScopeRun, ty: EntityType, guids: Vec<String>, mut expunge: F) -> NResult<()>
    where F: FnMut(&str) -> NResult<bool>
{
    for guid in guids {
        match expunge(&guid) {
            Ok(true) => {
                run.stats.expunged += 1;
                ctx.applied(run, ty, &guid, "expunge");
            }
            Ok(false) => debug!("incoming::expunge_each() -- {}: {} {} isn't here", run.scope, ty, guid),
            Err(e) => ctx.entity_error(run, ty, &guid, e)?,
        }
    }
    Ok(())
}

/// Download every scope: primary first, then the linked notebooks in
/// parallel. A scope failing doesn't stop the others, unless the failure is
/// bad enough to end the run.
pub fn download(ctx: &SyncContext, report: &mut SyncReport) -> NResult<()> {
    let mut run = ScopeRun::new(&Scope::Primary, Direction::Download);
    let res = sync_scope(ctx, &Scope::Primary, None, &mut run);
    ctx.file_scope(report, run, res)?;

    ctx.check_cancel()?;
    let linked = ctx.store.linked_notebooks().list(&ListFilter::all().synced(true))?;
    for ln in &linked {
        ctx.pool.register_linked(ln);
    }
    ctx.fan_out(report, "sync:linked:down", linked, |ln| {
        let scope = Scope::Linked(ln.guid.clone().unwrap_or_default());
        let mut run = ScopeRun::new(&scope, Direction::Download);
        let res = sync_scope(ctx, &scope, Some(&ln), &mut run);
        (run, res)
    })
}

/// Download one scope
fn sync_scope(ctx: &SyncContext, scope: &Scope, linked: Option<&LinkedNotebook>, run: &mut ScopeRun) -> NResult<()> {
    info!("incoming::sync_scope() -- {}: starting download", scope);
    ctx.messenger.event(messaging::EV_SCOPE_STARTED, json!({
        "scope": scope.to_string(),
        "direction": Direction::Download.as_str(),
    }));
    ctx.check_cancel()?;

    let state = ctx.scheduler.call_with_auth(&ctx.pool, scope, "getSyncState", |auth| {
        match linked {
            Some(ln) => auth.note_store.get_linked_notebook_sync_state(&auth.token, ln),
            None => auth.note_store.get_sync_state(&auth.token),
        }
    })?;
    let cursor = ctx.store.cursor(scope)?;
    let full = match cursor {
        None => true,
        Some(ref cur) if cur.last_sync_time < state.full_sync_before => {
            info!("incoming::sync_scope() -- {}: last sync predates the full sync marker, starting over", scope);
            run.stats.full_resync = true;
            true
        }
        Some(ref cur) if state.update_count < cur.update_count => {
            warn!("incoming::sync_scope() -- {}: remote update count went backwards ({} -> {}), starting over", scope, cur.update_count, state.update_count);
            run.stats.full_resync = true;
            true
        }
        Some(ref cur) if state.update_count == cur.update_count => {
            debug!("incoming::sync_scope() -- {}: nothing new (usn {})", scope, cur.update_count);
            return Ok(());
        }
        Some(_) => false,
    };
    let after_usn = match cursor {
        Some(ref cur) if !full => cur.update_count,
        _ => 0,
    };

    let mut batch = download_chunks(ctx, scope, linked, after_usn, full, run)?;
    if let Some(guid) = scope.linked_notebook_guid() {
        batch.stamp(guid);
    }
    ctx.check_cancel()?;
    let seen = if run.stats.full_resync { Some(batch.seen()) } else { None };
    let high_usn = batch.high_usn;
    let update_count = batch.update_count;
    apply_batch(ctx, scope, batch, run)?;
    if let Some(ref seen) = seen {
        ctx.check_cancel()?;
        clean_up(ctx, scope, seen, run)?;
    }

    // an empty chunk means we've seen everything up to its update count
    let reached = cmp::max(high_usn.unwrap_or(after_usn), update_count);
    let usn = match cursor {
        Some(ref cur) if !full => cmp::max(cur.update_count, reached),
        _ => reached,
    };
    let new_cursor = SyncCursor::new(usn, state.current_time);
    if cursor != Some(new_cursor) {
        ctx.store.set_cursor(scope, &new_cursor)?;
    }
    info!("incoming::sync_scope() -- {}: caught up to usn {}", scope, usn);
    Ok(())
}

/// Pull chunks until the remote says we've got everything
fn download_chunks(ctx: &SyncContext, scope: &Scope, linked: Option<&LinkedNotebook>, after_usn: i32, full: bool, run: &mut ScopeRun) -> NResult<Batch> {
    let max_entries = ctx.settings.max_chunk_entries;
    let op = if linked.is_some() { "getLinkedNotebookSyncChunk" } else { "getSyncChunk" };
    let mut batch = Batch::default();
    let mut after = after_usn;
    loop {
        ctx.check_cancel()?;
        let chunk = ctx.scheduler.call_with_auth(&ctx.pool, scope, op, |auth| {
            match linked {
                Some(ln) => auth.note_store.get_linked_notebook_sync_chunk(&auth.token, ln, after, max_entries, full),
                None => auth.note_store.get_sync_chunk(&auth.token, after, max_entries, full),
            }
        })?;
        let high = match chunk.chunk_high_usn {
            Some(x) => x,
            None => {
                batch.update_count = chunk.update_count;
                break;
            }
        };
        if high <= after {
            return Err(NError::Protocol(format!("{}: chunk after usn {} ends at usn {}", scope, after, high)));
        }
        let count = chunk.len();
        let update_count = chunk.update_count;
        run.stats.chunks += 1;
        debug!("incoming::download_chunks() -- {}: got {} entries ({} -> {} of {})", scope, count, after, high, update_count);
        batch.absorb(chunk);
        ctx.messenger.event(messaging::EV_CHUNK_DOWNLOADED, json!({
            "scope": scope.to_string(),
            "count": count,
            "high_usn": high,
            "update_count": update_count,
        }));
        after = high;
        if high >= update_count { break; }
    }
    Ok(batch)
}

/// Apply a downloaded batch: changes (parents first), full content, expunges.
fn apply_batch(ctx: &SyncContext, scope: &Scope, batch: Batch, run: &mut ScopeRun) -> NResult<()> {
    let Batch {
        notebooks, tags, searches, notes, resources, linked_notebooks,
        expunged_notebooks, expunged_tags, expunged_searches, expunged_notes,
        expunged_linked_notebooks, ..
    } = batch;

    // sort before touching anything, so a bad hierarchy applies nothing
    let tags = deps::sort_tags(dedupe(tags))?;
    let notes = dedupe(notes);
    let resources = dedupe(resources);
    let note_guids = notes.iter().filter_map(|x| x.guid.clone()).collect::<Vec<_>>();
    let resource_guids = resources.iter().filter_map(|x| x.guid.clone()).collect::<Vec<_>>();

    if scope.is_primary() {
        apply_each(ctx, run, dedupe(linked_notebooks), |x| apply_linked_notebook(ctx, x))?;
    } else if !linked_notebooks.is_empty() || !searches.is_empty() {
        debug!("incoming::apply_batch() -- {}: ignoring account-level entities in a linked chunk", scope);
    }
    apply_each(ctx, run, dedupe(notebooks), |x| apply_named(ctx, scope, x))?;
    apply_each(ctx, run, tags, |mut tag: Tag| {
        tag.parent_local_id = match tag.parent_guid {
            Some(ref parent) => ctx.store.tags().find_by_guid(parent)?.map(|x| x.local_id),
            None => None,
        };
        apply_named(ctx, scope, tag)
    })?;
    if scope.is_primary() {
        apply_each(ctx, run, dedupe(searches), |x| apply_named(ctx, scope, x))?;
    }
    apply_each(ctx, run, notes, |x| apply_note(ctx, scope, x))?;
    apply_each(ctx, run, resources, |x| apply_resource(ctx, x))?;

    ctx.check_cancel()?;
    fetch_content(ctx, scope, &note_guids, &resource_guids, run)?;

    ctx.check_cancel()?;
    expunge_each(ctx, run, EntityType::Notebook, expunged_notebooks, |guid| {
        match ctx.store.notebooks().find_by_guid(guid)? {
            Some(nb) => { expunge_notebook(ctx, &nb)?; Ok(true) }
            None => Ok(false),
        }
    })?;
    expunge_each(ctx, run, EntityType::Tag, expunged_tags, |guid| {
        match ctx.store.tags().find_by_guid(guid)? {
            Some(tag) => { expunge_tag(ctx, &tag)?; Ok(true) }
            None => Ok(false),
        }
    })?;
    expunge_each(ctx, run, EntityType::SavedSearch, expunged_searches, |guid| {
        match ctx.store.searches().find_by_guid(guid)? {
            Some(search) => ctx.store.searches().expunge(&search.local_id),
            None => Ok(false),
        }
    })?;
    expunge_each(ctx, run, EntityType::Note, expunged_notes, |guid| {
        match ctx.store.notes().find_by_guid(guid)? {
            Some(note) => { expunge_note(ctx, &note)?; Ok(true) }
            None => Ok(false),
        }
    })?;
    if scope.is_primary() {
        expunge_each(ctx, run, EntityType::LinkedNotebook, expunged_linked_notebooks, |guid| {
            expunge_linked_notebook(ctx, guid)
        })?;
    }
    Ok(())
}

/// Build the name a losing local entity gets renamed to
fn conflict_name<T: Stored>(ctx: &SyncContext, scope: &Scope, name: &str) -> NResult<String> {
    let timestamp = util::timestamp()?;
    let table = T::table(&*ctx.store);
    conflict::conflict_name(name, &timestamp, |candidate| Ok(table.find_by_name(candidate, scope)?.is_some()))
}

/// Apply a remote notebook/tag/saved search
fn apply_named<T: Conflictable + Stored>(ctx: &SyncContext, scope: &Scope, remote: T) -> NResult<Applied> {
    let table = T::table(&*ctx.store);
    let guid = match remote.guid() {
        Some(x) => String::from(x),
        None => return Err(NError::Internal(format!("incoming::apply_named() -- remote {} has no guid", T::entity_type()))),
    };
    if remote.usn().is_none() {
        return Err(NError::Internal(format!("incoming::apply_named() -- remote {} {} has no usn", T::entity_type(), guid)));
    }
    let name = match remote.name() {
        Some(x) => String::from(x),
        None => return Err(NError::Internal(format!("incoming::apply_named() -- remote {} {} has no name", T::entity_type(), guid))),
    };

    let local = match table.find_by_guid(&guid)? {
        Some(x) => Some(x),
        // local-only entities can share a name with anything
        None => table.find_by_name(&name, scope)?.filter(|x| !x.is_local_only()),
    };
    let local = match local {
        Some(x) => x,
        None => {
            let mut entity = remote;
            entity.set_local_id(String::new());
            entity.set_dirty(false);
            table.add(entity)?;
            return Ok(Applied::Added);
        }
    };
    match conflict::resolve(&remote, &local, |name| conflict_name::<T>(ctx, scope, name))? {
        Resolution::AcceptAsUpdate(entity) => {
            table.update(&entity)?;
            Ok(Applied::Updated)
        }
        Resolution::Split { renamed_local, remote } => {
            info!("incoming::apply_named() -- {}: {} {} collides with local {}, keeping both (local renamed to {:?})", scope, T::entity_type(), guid, local.local_id(), renamed_local.name());
            table.update(&renamed_local)?;
            table.add(remote)?;
            Ok(Applied::Conflict)
        }
        Resolution::NoOp => Ok(Applied::Unchanged),
    }
}

/// Apply a remote linked notebook, and let the pool know about it
fn apply_linked_notebook(ctx: &SyncContext, mut remote: LinkedNotebook) -> NResult<Applied> {
    let guid = match remote.guid {
        Some(ref x) => x.clone(),
        None => return Err(NError::Internal(String::from("incoming::apply_linked_notebook() -- remote linked notebook has no guid"))),
    };
    if remote.usn.is_none() {
        return Err(NError::Internal(format!("incoming::apply_linked_notebook() -- remote linked notebook {} has no usn", guid)));
    }
    let table = ctx.store.linked_notebooks();
    remote.dirty = false;
    let applied = match table.find_by_guid(&guid)? {
        Some(local) => {
            remote.local_id = local.local_id.clone();
            if remote == local {
                Applied::Unchanged
            } else {
                table.update(&remote)?;
                Applied::Updated
            }
        }
        None => {
            remote.local_id = String::new();
            table.add(remote.clone())?;
            Applied::Added
        }
    };
    ctx.pool.register_linked(&remote);
    Ok(applied)
}

/// Apply a remote note's metadata
fn apply_note(ctx: &SyncContext, scope: &Scope, mut remote: Note) -> NResult<Applied> {
    let guid = match remote.guid {
        Some(ref x) => x.clone(),
        None => return Err(NError::Internal(String::from("incoming::apply_note() -- remote note has no guid"))),
    };
    let notebook_guid = match remote.notebook_guid {
        Some(ref x) => x.clone(),
        None => return Err(NError::Internal(format!("incoming::apply_note() -- remote note {} has no notebook", guid))),
    };
    let notebook = match ctx.store.notebooks().find_by_guid(&notebook_guid)? {
        Some(x) => x,
        None => return Err(NError::NotFound(format!("incoming::apply_note() -- notebook {} (for note {})", notebook_guid, guid))),
    };
    remote.notebook_local_id = Some(notebook.local_id);
    let mut tag_local_ids = Vec::with_capacity(remote.tag_guids.len());
    for tag_guid in &remote.tag_guids {
        match ctx.store.tags().find_by_guid(tag_guid)? {
            Some(tag) => tag_local_ids.push(tag.local_id),
            None => debug!("incoming::apply_note() -- {}: note {} has unknown tag {}", scope, guid, tag_guid),
        }
    }
    remote.tag_local_ids = tag_local_ids;
    remote.resources = Vec::new();

    let table = ctx.store.notes();
    let local = match table.find_by_guid(&guid)? {
        Some(x) => x,
        None => {
            if remote.usn.is_none() {
                return Err(NError::Internal(format!("incoming::apply_note() -- remote note {} has no usn", guid)));
            }
            remote.local_id = String::new();
            remote.dirty = false;
            remote.conflicting = false;
            table.add(remote)?;
            return Ok(Applied::Added);
        }
    };
    match conflict::resolve_note(&remote, &local)? {
        NoteResolution::AcceptAsUpdate(note) => {
            table.update(&note)?;
            Ok(Applied::Updated)
        }
        NoteResolution::Conflict { local, remote } => {
            info!("incoming::apply_note() -- {}: note {} changed on both sides, moving local copy {} aside", scope, guid, local.local_id);
            park_note(ctx, local)?;
            table.add(remote)?;
            Ok(Applied::Conflict)
        }
        NoteResolution::NoOp => Ok(Applied::Unchanged),
    }
}

/// Apply a remote resource's metadata
fn apply_resource(ctx: &SyncContext, mut remote: Resource) -> NResult<Applied> {
    let guid = match remote.guid {
        Some(ref x) => x.clone(),
        None => return Err(NError::Internal(String::from("incoming::apply_resource() -- remote resource has no guid"))),
    };
    if remote.usn.is_none() {
        return Err(NError::Internal(format!("incoming::apply_resource() -- remote resource {} has no usn", guid)));
    }
    let note_guid = match remote.note_guid {
        Some(ref x) => x.clone(),
        None => return Err(NError::Internal(format!("incoming::apply_resource() -- remote resource {} has no note", guid))),
    };
    let note = match ctx.store.notes().find_by_guid(&note_guid)? {
        Some(x) => x,
        None => return Err(NError::NotFound(format!("incoming::apply_resource() -- note {} (for resource {})", note_guid, guid))),
    };
    remote.note_local_id = Some(note.local_id);
    remote.dirty = false;

    let table = ctx.store.resources();
    match table.find_by_guid(&guid)? {
        Some(local) if local.dirty && local.data_hash != remote.data_hash => {
            info!("incoming::apply_resource() -- resource {} changed on both sides, moving local copy {} aside", guid, local.local_id);
            park_resource(ctx, local)?;
            remote.local_id = String::new();
            table.add(remote)?;
            Ok(Applied::Conflict)
        }
        Some(local) => {
            remote.local_id = local.local_id.clone();
            if remote.data.is_none() && remote.data_hash == local.data_hash {
                remote.data = local.data.clone();
            }
            if remote == local {
                Ok(Applied::Unchanged)
            } else {
                table.update(&remote)?;
                Ok(Applied::Updated)
            }
        }
        None => {
            remote.local_id = String::new();
            table.add(remote)?;
            Ok(Applied::Added)
        }
    }
}

/// Grab the bodies/data the chunks left out for anything we just applied
fn fetch_content(ctx: &SyncContext, scope: &Scope, note_guids: &[String], resource_guids: &[String], run: &mut ScopeRun) -> NResult<()> {
    for guid in note_guids {
        if let Err(e) = fetch_note(ctx, scope, guid) {
            ctx.entity_error(run, EntityType::Note, guid, e)?;
        }
    }
    for guid in resource_guids {
        if let Err(e) = fetch_resource(ctx, scope, guid) {
            ctx.entity_error(run, EntityType::Resource, guid, e)?;
        }
    }
    Ok(())
}

fn fetch_note(ctx: &SyncContext, scope: &Scope, guid: &str) -> NResult<()> {
    let mut note = match ctx.store.notes().find_by_guid(guid)? {
        Some(ref x) if x.content.is_some() => return Ok(()),
        Some(x) => x,
        // skipped or moved on
        None => return Ok(()),
    };
    ctx.check_cancel()?;
    let full = ctx.scheduler.call_with_auth(&ctx.pool, scope, "getNote", |auth| {
        auth.note_store.get_note(&auth.token, guid, true, false)
    })?;
    debug!("incoming::fetch_note() -- {}: got content for {}", scope, guid);
    note.content = full.content;
    if full.content_hash.is_some() {
        note.content_hash = full.content_hash;
        note.content_length = full.content_length;
    }
    ctx.store.notes().update(&note)
}

fn fetch_resource(ctx: &SyncContext, scope: &Scope, guid: &str) -> NResult<()> {
    let mut res = match ctx.store.resources().find_by_guid(guid)? {
        Some(ref x) if x.data.is_some() => return Ok(()),
        Some(x) => x,
        None => return Ok(()),
    };
    ctx.check_cancel()?;
    let full = ctx.scheduler.call_with_auth(&ctx.pool, scope, "getResource", |auth| {
        auth.note_store.get_resource(&auth.token, guid, true)
    })?;
    debug!("incoming::fetch_resource() -- {}: got data for {}", scope, guid);
    res.data = full.data;
    if full.data_hash.is_some() {
        res.data_hash = full.data_hash;
        res.data_size = full.data_size;
    }
    ctx.store.resources().update(&res)
}

/// Move a local note out of the way (into the conflict notebook) so its edits
/// survive whatever happens to its remote counterpart. Its resources go with
/// it as local copies.
fn park_note(ctx: &SyncContext, mut note: Note) -> NResult<()> {
    note.notebook_local_id = Some(ctx.conflict_notebook()?);
    note.notebook_guid = None;
    note.linked_notebook_guid = None;
    note.guid = None;
    note.usn = None;
    note.conflicting = true;
    note.dirty = true;
    for mut res in ctx.store.resources().list(&ListFilter::all().in_note(&note.local_id))? {
        res.guid = None;
        res.usn = None;
        res.note_guid = None;
        res.linked_notebook_guid = None;
        res.dirty = true;
        ctx.store.resources().update(&res)?;
    }
    ctx.store.notes().update(&note)
}

/// Move a locally edited resource out of the way. It goes into a copy of its
/// note, parked in the conflict notebook, and the original note is left for
/// the remote version of the resource.
fn park_resource(ctx: &SyncContext, mut res: Resource) -> NResult<()> {
    let note = match res.note_local_id {
        Some(ref id) => ctx.store.notes().find(id)?,
        None => None,
    };
    let mut copy = match note {
        Some(x) => x,
        None => return Err(NError::NotFound(format!("incoming::park_resource() -- note for resource {}", res.local_id))),
    };
    copy.local_id = String::new();
    copy.notebook_local_id = Some(ctx.conflict_notebook()?);
    copy.notebook_guid = None;
    copy.linked_notebook_guid = None;
    copy.guid = None;
    copy.usn = None;
    copy.resources = Vec::new();
    copy.conflicting = true;
    copy.dirty = true;
    let copy_id = ctx.store.notes().add(copy)?;
    res.note_local_id = Some(copy_id);
    res.guid = None;
    res.usn = None;
    res.note_guid = None;
    res.linked_notebook_guid = None;
    ctx.store.resources().update(&res)
}

fn expunge_note(ctx: &SyncContext, note: &Note) -> NResult<()> {
    for res in ctx.store.resources().list(&ListFilter::all().in_note(&note.local_id))? {
        ctx.store.resources().expunge(&res.local_id)?;
    }
    ctx.store.notes().expunge(&note.local_id)?;
    Ok(())
}

/// Remove a notebook and its notes. Notes with unsynced edits get parked in
/// the conflict notebook instead.
fn expunge_notebook(ctx: &SyncContext, notebook: &Notebook) -> NResult<()> {
    for note in ctx.store.notes().list(&ListFilter::all().in_notebook(&notebook.local_id))? {
        if note.dirty {
            info!("incoming::expunge_notebook() -- notebook {} is gone, parking dirty note {}", notebook.label(), note.local_id);
            park_note(ctx, note)?;
        } else {
            expunge_note(ctx, &note)?;
        }
    }
    ctx.store.notebooks().expunge(&notebook.local_id)?;
    Ok(())
}

/// Remove a tag, taking it off any notes and orphaning its children
fn expunge_tag(ctx: &SyncContext, tag: &Tag) -> NResult<()> {
    let guid = tag.guid.as_ref();
    for mut note in ctx.store.notes().list(&ListFilter::all())? {
        let before = note.tag_local_ids.len() + note.tag_guids.len();
        note.tag_local_ids.retain(|x| x != &tag.local_id);
        note.tag_guids.retain(|x| Some(x) != guid);
        if note.tag_local_ids.len() + note.tag_guids.len() != before {
            ctx.store.notes().update(&note)?;
        }
    }
    for mut child in ctx.store.tags().list(&ListFilter::all())? {
        let is_child = child.parent_local_id.as_ref() == Some(&tag.local_id) ||
            (guid.is_some() && child.parent_guid.as_ref() == guid);
        if is_child {
            child.parent_local_id = None;
            child.parent_guid = None;
            ctx.store.tags().update(&child)?;
        }
    }
    ctx.store.tags().expunge(&tag.local_id)?;
    Ok(())
}

/// Forget a linked notebook entirely: its entities, cursor, and token
fn expunge_linked_notebook(ctx: &SyncContext, guid: &str) -> NResult<bool> {
    let linked = match ctx.store.linked_notebooks().find_by_guid(guid)? {
        Some(x) => x,
        None => return Ok(false),
    };
    let scope = Scope::Linked(String::from(guid));
    info!("incoming::expunge_linked_notebook() -- {}: removing", scope);
    let in_scope = ListFilter::all().in_scope(&scope);
    for nb in ctx.store.notebooks().list(&in_scope)? {
        expunge_notebook(ctx, &nb)?;
    }
    for note in ctx.store.notes().list(&in_scope)? {
        expunge_note(ctx, &note)?;
    }
    for tag in ctx.store.tags().list(&in_scope)? {
        ctx.store.tags().expunge(&tag.local_id)?;
    }
    for res in ctx.store.resources().list(&in_scope)? {
        ctx.store.resources().expunge(&res.local_id)?;
    }
    ctx.store.delete_cursor(&scope)?;
    ctx.pool.forget_linked(guid)?;
    ctx.store.linked_notebooks().expunge(&linked.local_id)?;
    Ok(true)
}

/// After a full resync, anything clean and synced that the remote didn't send
/// us is gone on the remote side.
fn clean_up(ctx: &SyncContext, scope: &Scope, seen: &HashSet<String>, run: &mut ScopeRun) -> NResult<()> {
    let filter = ListFilter {
        dirty: Some(false),
        synced: Some(true),
        scope: Some(scope.clone()),
        ..Default::default()
    };
    fn stale<T: SyncEntity>(items: Vec<T>, seen: &HashSet<String>) -> Vec<String> {
        items.into_iter()
            .filter(|x| !x.is_local_only())
            .filter_map(|x| x.guid().map(String::from))
            .filter(|x| !seen.contains(x))
            .collect()
    }

    let notes = stale(ctx.store.notes().list(&filter)?, seen);
    let notebooks = stale(ctx.store.notebooks().list(&filter)?, seen);
    let tags = stale(ctx.store.tags().list(&filter)?, seen);
    let count = notes.len() + notebooks.len() + tags.len();
    if count > 0 {
        info!("incoming::clean_up() -- {}: removing {} entities the resync didn't mention", scope, count);
    }
    expunge_each(ctx, run, EntityType::Note, notes, |guid| {
        match ctx.store.notes().find_by_guid(guid)? {
            Some(note) => { expunge_note(ctx, &note)?; Ok(true) }
            None => Ok(false),
        }
    })?;
    expunge_each(ctx, run, EntityType::Notebook, notebooks, |guid| {
        match ctx.store.notebooks().find_by_guid(guid)? {
            Some(nb) => { expunge_notebook(ctx, &nb)?; Ok(true) }
            None => Ok(false),
        }
    })?;
    expunge_each(ctx, run, EntityType::Tag, tags, |guid| {
        match ctx.store.tags().find_by_guid(guid)? {
            Some(tag) => { expunge_tag(ctx, &tag)?; Ok(true) }
            None => Ok(false),
        }
    })?;
    if scope.is_primary() {
        let searches = stale(ctx.store.searches().list(&filter)?, seen);
        expunge_each(ctx, run, EntityType::SavedSearch, searches, |guid| {
            match ctx.store.searches().find_by_guid(guid)? {
                Some(search) => ctx.store.searches().expunge(&search.local_id),
                None => Ok(false),
            }
        })?;
        let linked_filter = ListFilter { scope: None, ..filter.clone() };
        let linked = stale(ctx.store.linked_notebooks().list(&linked_filter)?, seen);
        expunge_each(ctx, run, EntityType::LinkedNotebook, linked, |guid| expunge_linked_notebook(ctx, guid))?;
    }
    Ok(())
}
