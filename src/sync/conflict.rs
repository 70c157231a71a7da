//! Decides what to do when a remote entity and a local entity claim to be the
//! same thing. One algorithm covers every name-bearing type (notebooks, tags,
//! saved searches): the types only have to say how to compare and rename
//! themselves. Notes get their own, simpler rule since they have no unique
//! names to fight over.

use crate::error::{NError, NResult};
use crate::models::{Note, SyncEntity};

/// How many " (n)" suffixes we'll try before giving up on finding a free
/// conflict name
const MAX_CONFLICT_SUFFIX: usize = 1000;

/// What the resolver needs from an entity type
pub trait Conflictable: SyncEntity {
    fn set_name(&mut self, name: String);

    /// Whether the synced parts of two entities are the same
    fn content_eq(&self, other: &Self) -> bool;

    /// The key remote and local copies are matched on
    fn identity_key(&self) -> Option<&str> {
        self.guid()
    }

    fn name_of(&self) -> Option<&str> {
        self.name()
    }

    /// A copy with a new name, flagged for upload
    fn rename_copy(&self, name: String) -> Self {
        let mut copy = self.clone();
        copy.set_name(name);
        copy.set_dirty(true);
        copy
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    /// Overwrite the local entity with this (remote content, local id)
    AcceptAsUpdate(T),
    /// Keep both: update the local entity with `renamed_local` (same local id,
    /// new name, dirty) and add `remote` as a new local entity.
    Split { renamed_local: T, remote: T },
    /// Nothing to do
    NoOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NoteResolution {
    AcceptAsUpdate(Note),
    /// Keep both: `local` is flagged as conflicting and detached from the
    /// remote guid (the caller moves it to the conflict notebook), `remote`
    /// gets added as a new local note.
    Conflict { local: Note, remote: Note },
    NoOp,
}

/// Build the name a losing local entity gets renamed to. `taken` reports
/// whether a candidate name is already used in the scope.
pub fn conflict_name<F>(name: &str, timestamp: &str, taken: F) -> NResult<String>
    where F: Fn(&str) -> NResult<bool>
{
    let base = format!("{} - conflicting {}", name, timestamp);
    if !taken(&base)? {
        return Ok(base);
    }
    for n in 2..MAX_CONFLICT_SUFFIX {
        let candidate = format!("{} ({})", base, n);
        if !taken(&candidate)? {
            return Ok(candidate);
        }
    }
    Err(NError::Internal(format!("conflict::conflict_name() -- ran out of names for {}", name)))
}

/// Take the remote entity, but keep our local id and mark it clean
fn merge_remote<T: Conflictable>(remote: &T, local: &T) -> T {
    let mut merged = remote.clone();
    merged.set_local_id(String::from(local.local_id()));
    merged.set_linked_notebook_guid(local.linked_notebook_guid().map(String::from));
    merged.set_dirty(false);
    merged
}

/// Resolve a remote entity against the local entity it collided with (same
/// guid, or no guid match but the same name). `new_name` builds the name for
/// a losing local copy and is only called if one is needed.
pub fn resolve<T, F>(remote: &T, local: &T, new_name: F) -> NResult<Resolution<T>>
    where T: Conflictable,
          F: FnOnce(&str) -> NResult<String>
{
    let remote_guid = match remote.identity_key() {
        Some(x) => x,
        None => return Err(NError::Internal(format!("conflict::resolve() -- remote {} has no guid", T::entity_type()))),
    };
    if remote.name_of().is_none() {
        return Err(NError::Internal(format!("conflict::resolve() -- remote {} {} has no name", T::entity_type(), remote_guid)));
    }

    if local.identity_key() == Some(remote_guid) {
        if local.content_eq(remote) {
            if local.usn() == remote.usn() && !local.is_dirty() {
                return Ok(Resolution::NoOp);
            }
            // same content, both sides agree. take the usn, drop the dirty flag
            return Ok(Resolution::AcceptAsUpdate(merge_remote(remote, local)));
        }
        if !local.is_dirty() {
            return Ok(Resolution::AcceptAsUpdate(merge_remote(remote, local)));
        }
        // both sides changed it. the local copy loses the guid (it belongs to
        // the remote version now) and gets uploaded as a new entity later.
        let local_name = local.name_of().unwrap_or_default();
        let mut renamed_local = local.rename_copy(new_name(local_name)?);
        renamed_local.set_guid(None);
        renamed_local.set_usn(None);
        let mut remote = remote.clone();
        remote.set_local_id(String::new());
        remote.set_linked_notebook_guid(local.linked_notebook_guid().map(String::from));
        remote.set_dirty(false);
        return Ok(Resolution::Split { renamed_local: renamed_local, remote: remote });
    }

    // matched by name only: two different entities want the same name. the
    // local one moves aside (keeping its guid if it has one) and the rename
    // gets uploaded.
    let local_name = local.name_of().unwrap_or_default();
    let renamed_local = local.rename_copy(new_name(local_name)?);
    let mut remote = remote.clone();
    remote.set_local_id(String::new());
    remote.set_linked_notebook_guid(local.linked_notebook_guid().map(String::from));
    remote.set_dirty(false);
    Ok(Resolution::Split { renamed_local: renamed_local, remote: remote })
}

/// Resolve a remote note's metadata against the local note with its guid.
pub fn resolve_note(remote: &Note, local: &Note) -> NResult<NoteResolution> {
    let remote_guid = match remote.guid {
        Some(ref x) => x.clone(),
        None => return Err(NError::Internal(String::from("conflict::resolve_note() -- remote note has no guid"))),
    };
    if remote.usn.is_none() {
        return Err(NError::Internal(format!("conflict::resolve_note() -- remote note {} has no usn", remote_guid)));
    }

    let merged = || {
        let mut merged = remote.clone();
        merged.local_id = local.local_id.clone();
        merged.linked_notebook_guid = local.linked_notebook_guid.clone();
        merged.dirty = false;
        merged.conflicting = false;
        // chunks don't carry bodies. keep ours if it's still the right one,
        // otherwise leave it empty so it gets fetched.
        merged.content = if remote.content.is_some() {
            remote.content.clone()
        } else if local.content_hash == remote.content_hash {
            local.content.clone()
        } else {
            None
        };
        merged
    };

    if local.content_eq(remote) {
        if local.usn == remote.usn && !local.dirty {
            return Ok(NoteResolution::NoOp);
        }
        return Ok(NoteResolution::AcceptAsUpdate(merged()));
    }
    if !local.dirty {
        return Ok(NoteResolution::AcceptAsUpdate(merged()));
    }
    let mut conflicting = local.clone();
    conflicting.guid = None;
    conflicting.usn = None;
    conflicting.conflicting = true;
    conflicting.dirty = true;
    let mut remote = remote.clone();
    remote.local_id = String::new();
    remote.linked_notebook_guid = local.linked_notebook_guid.clone();
    remote.dirty = false;
    Ok(NoteResolution::Conflict { local: conflicting, remote: remote })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Notebook, SavedSearch, Tag};

    fn remote_tag(name: &str, guid: &str, usn: i32) -> Tag {
        Tag {
            name: Some(String::from(name)),
            guid: Some(String::from(guid)),
            usn: Some(usn),
            ..Default::default()
        }
    }

    fn namer(name: &str) -> NResult<String> {
        conflict_name(name, "2019-03-01 14:02:59", |_| Ok(false))
    }

    #[test]
    fn name_collision_splits() {
        let mut local = Tag::new("Work");
        local.local_id = String::from("l1");
        let remote = remote_tag("Work", "g1", 42);
        match resolve(&remote, &local, namer).unwrap() {
            Resolution::Split { renamed_local, remote } => {
                assert_eq!(renamed_local.local_id, "l1");
                assert_eq!(renamed_local.name, Some(String::from("Work - conflicting 2019-03-01 14:02:59")));
                assert!(renamed_local.dirty);
                assert_eq!(renamed_local.guid, None);
                assert_eq!(remote.local_id, "");
                assert_eq!(remote.guid, Some(String::from("g1")));
                assert_eq!(remote.usn, Some(42));
                assert_eq!(remote.name, Some(String::from("Work")));
                assert!(!remote.dirty);
            }
            x => panic!("expected split, got {:?}", x),
        }
    }

    #[test]
    fn clean_local_accepts_update() {
        let mut local = remote_tag("Work", "g1", 10);
        local.local_id = String::from("l1");
        let mut remote = remote_tag("Work stuff", "g1", 11);
        remote.parent_guid = Some(String::from("g0"));
        match resolve(&remote, &local, namer).unwrap() {
            Resolution::AcceptAsUpdate(x) => {
                assert_eq!(x.local_id, "l1");
                assert_eq!(x.name, Some(String::from("Work stuff")));
                assert_eq!(x.usn, Some(11));
                assert!(!x.dirty);
            }
            x => panic!("expected update, got {:?}", x),
        }
        let same = resolve(&local.clone(), &local, |_| panic!("no rename needed")).unwrap();
        assert_eq!(same, Resolution::NoOp);
    }

    #[test]
    fn dirty_local_same_guid_splits_and_detaches() {
        let mut local = Notebook::new("Recipes (mine)");
        local.local_id = String::from("l1");
        local.guid = Some(String::from("g1"));
        local.usn = Some(3);
        let mut remote = Notebook::new("Recipes (theirs)");
        remote.dirty = false;
        remote.guid = Some(String::from("g1"));
        remote.usn = Some(9);
        match resolve(&remote, &local, namer).unwrap() {
            Resolution::Split { renamed_local, remote } => {
                assert_eq!(renamed_local.guid, None);
                assert_eq!(renamed_local.usn, None);
                assert!(renamed_local.name.unwrap().starts_with("Recipes (mine) - conflicting "));
                assert_eq!(remote.guid, Some(String::from("g1")));
                assert_eq!(remote.name, Some(String::from("Recipes (theirs)")));
            }
            x => panic!("expected split, got {:?}", x),
        }
    }

    #[test]
    fn dirty_but_identical_is_an_update() {
        let mut local = SavedSearch::new("todo", "tag:todo");
        local.local_id = String::from("l1");
        local.guid = Some(String::from("g1"));
        let mut remote = local.clone();
        remote.local_id = String::new();
        remote.dirty = false;
        remote.usn = Some(5);
        match resolve(&remote, &local, namer).unwrap() {
            Resolution::AcceptAsUpdate(x) => {
                assert!(!x.dirty);
                assert_eq!(x.usn, Some(5));
                assert_eq!(x.local_id, "l1");
            }
            x => panic!("expected update, got {:?}", x),
        }
    }

    #[test]
    fn missing_guid_or_name_is_internal() {
        let local = Tag::new("a");
        let mut remote = Tag::new("a");
        match resolve(&remote, &local, namer) {
            Err(NError::Internal(_)) => {}
            x => panic!("expected internal error, got {:?}", x),
        }
        remote.guid = Some(String::from("g"));
        remote.name = None;
        match resolve(&remote, &local, namer) {
            Err(NError::Internal(_)) => {}
            x => panic!("expected internal error, got {:?}", x),
        }
    }

    #[test]
    fn conflict_names_get_suffixes() {
        let name = conflict_name("Work", "ts", |x| Ok(x == "Work - conflicting ts" || x == "Work - conflicting ts (2)")).unwrap();
        assert_eq!(name, "Work - conflicting ts (3)");
    }

    #[test]
    fn notes_conflict_by_flagging() {
        let mut local = Note::new("mine", "<en-note>mine</en-note>", "nb-local");
        local.local_id = String::from("l1");
        local.guid = Some(String::from("n1"));
        local.usn = Some(1);
        let mut remote = Note::new("theirs", "<en-note>theirs</en-note>", "");
        remote.guid = Some(String::from("n1"));
        remote.usn = Some(2);
        remote.content = None;
        match resolve_note(&remote, &local).unwrap() {
            NoteResolution::Conflict { local, remote } => {
                assert!(local.conflicting);
                assert!(local.dirty);
                assert_eq!(local.guid, None);
                assert_eq!(local.title, Some(String::from("mine")));
                assert_eq!(remote.guid, Some(String::from("n1")));
                assert_eq!(remote.local_id, "");
            }
            x => panic!("expected conflict, got {:?}", x),
        }

        local.dirty = false;
        match resolve_note(&remote, &local).unwrap() {
            NoteResolution::AcceptAsUpdate(x) => {
                assert_eq!(x.local_id, "l1");
                assert_eq!(x.title, Some(String::from("theirs")));
                // hash changed, so the body has to be fetched
                assert_eq!(x.content, None);
            }
            x => panic!("expected update, got {:?}", x),
        }
    }
}
