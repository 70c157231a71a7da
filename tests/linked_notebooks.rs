include!("./lib/util.rs");

#[cfg(test)]
mod tests {
    use super::*;

    fn linked_scope(linked: &LinkedNotebook) -> Scope {
        Scope::Linked(linked.guid.clone().unwrap())
    }

    /// The order scopes finished a direction in
    fn finish_order(h: &Harness, direction: &str) -> Vec<String> {
        h.events_named(messaging::EV_SCOPE_FINISHED).iter()
            .filter(|x| x["direction"] == json!(direction))
            .map(|x| String::from(x["scope"].as_str().unwrap()))
            .collect()
    }

    #[test]
    fn syncs_a_shared_notebook_both_ways() {
        let h = Harness::new();
        let owner = h.owner("mem://shard2");
        let shared = remote_notebook(&owner, OWNER_TOKEN, "Recipes");
        remote_note(&owner, OWNER_TOKEN, &shared, "soup", "<en-note>water, stones</en-note>");
        let linked = h.link(&owner, shared.guid.as_ref().unwrap(), "Recipes");
        let scope = linked_scope(&linked);

        let report = h.sync();
        assert!(report.is_success());
        assert_eq!(status(&report, &scope, Direction::Download), ScopeStatus::Success);
        assert!(h.store.linked_notebooks().find_by_guid(linked.guid.as_ref().unwrap()).unwrap().is_some());
        let local_nb = h.local_notebook("Recipes", &scope).unwrap();
        assert_eq!(local_nb.linked_notebook_guid, linked.guid);
        let notes = h.store.notes().list(&ListFilter::all().in_scope(&scope)).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].content, Some(String::from("<en-note>water, stones</en-note>")));
        assert_eq!(h.cursor(&scope).unwrap().update_count, owner.update_count());
        // we got a token for the share and kept it
        let token = h.creds.read_token(&scope).unwrap().unwrap();
        assert!(token.token.starts_with("mem://shard2/share/"));
        assert_eq!(owner.calls("authenticateToSharedNotebook"), 1);

        // a new note in the shared notebook goes to the owner's service
        h.store.notes().add(Note::new("bread", "<en-note>flour</en-note>", &local_nb.local_id)).unwrap();
        let report = h.sync();
        assert!(report.is_success());
        assert_eq!(report.scope(&scope, Direction::Upload).unwrap().stats.uploaded, 1);
        assert_eq!(owner.notes().len(), 2);
        assert!(h.primary.notes().is_empty());
        assert_eq!(h.cursor(&scope).unwrap().update_count, owner.update_count());
        // the stored token got reused
        assert_eq!(owner.calls("authenticateToSharedNotebook"), 1);
    }

    #[test]
    fn public_notebooks_need_no_token() {
        let h = Harness::new();
        let owner = h.owner("mem://shard3");
        let shared = remote_notebook(&owner, OWNER_TOKEN, "Public");
        remote_note(&owner, OWNER_TOKEN, &shared, "hello", "<en-note>world</en-note>");
        owner.publish_notebook(shared.guid.as_ref().unwrap(), "owner/public");
        let linked = h.primary.add_linked_notebook(&LinkedNotebook {
            share_name: Some(String::from("Public")),
            uri: Some(String::from("owner/public")),
            note_store_url: Some(String::from(owner.url())),
            ..Default::default()
        });
        let scope = linked_scope(&linked);

        let report = h.sync();
        assert!(report.is_success());
        assert!(h.local_notebook("Public", &scope).is_some());
        assert_eq!(h.store.notes().count(&ListFilter::all().in_scope(&scope)).unwrap(), 1);
        assert_eq!(h.creds.read_token(&scope).unwrap(), None);
        assert_eq!(owner.calls("authenticateToSharedNotebook"), 0);
    }

    #[test]
    fn one_rate_limited_notebook_does_not_hold_up_another() {
        let h = Harness::new();
        let slow_owner = h.owner("mem://slow");
        let fast_owner = h.owner("mem://fast");
        let slow_nb = remote_notebook(&slow_owner, OWNER_TOKEN, "Slow");
        let fast_nb = remote_notebook(&fast_owner, OWNER_TOKEN, "Fast");
        let slow = h.link(&slow_owner, slow_nb.guid.as_ref().unwrap(), "Slow");
        let fast = h.link(&fast_owner, fast_nb.guid.as_ref().unwrap(), "Fast");
        slow_owner.fail_next("getLinkedNotebookSyncState", rate_limit(3));

        let settings = SyncSettings { linked_notebook_workers: 2, enable_outgoing: false, ..h.settings() };
        let engine = SyncEngine::new(settings, h.store.clone(), h.factory.clone(), h.creds.clone())
            .with_timer(Arc::new(ScaledTimer(10)));
        h.record(&engine);
        let report = engine.run().unwrap();
        assert!(report.is_success());

        let order = finish_order(&h, "download");
        assert_eq!(order, vec![
            String::from("primary"),
            linked_scope(&fast).to_string(),
            linked_scope(&slow).to_string(),
        ]);
        let limits = h.events_named(messaging::EV_RATE_LIMIT);
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0]["scope"], json!(linked_scope(&slow).to_string()));
        assert!(h.local_notebook("Slow", &linked_scope(&slow)).is_some());
        assert!(h.local_notebook("Fast", &linked_scope(&fast)).is_some());
    }

    #[test]
    fn waiting_out_a_rate_limit_frees_the_worker() {
        let h = Harness::new();
        let slow_owner = h.owner("mem://slow1");
        let fast_owner = h.owner("mem://fast1");
        let slow_nb = remote_notebook(&slow_owner, OWNER_TOKEN, "Slow");
        let fast_nb = remote_notebook(&fast_owner, OWNER_TOKEN, "Fast");
        let slow = h.link(&slow_owner, slow_nb.guid.as_ref().unwrap(), "Slow");
        let fast = h.link(&fast_owner, fast_nb.guid.as_ref().unwrap(), "Fast");
        slow_owner.fail_next("getLinkedNotebookSyncState", rate_limit(3));

        // a single worker: the fast notebook only gets ahead if the slow one
        // lets go of it while it waits
        let settings = SyncSettings { linked_notebook_workers: 1, enable_outgoing: false, ..h.settings() };
        let engine = SyncEngine::new(settings, h.store.clone(), h.factory.clone(), h.creds.clone())
            .with_timer(Arc::new(ScaledTimer(10)));
        h.record(&engine);
        let report = engine.run().unwrap();
        assert!(report.is_success());

        let order = finish_order(&h, "download");
        assert_eq!(order, vec![
            String::from("primary"),
            linked_scope(&fast).to_string(),
            linked_scope(&slow).to_string(),
        ]);
        assert!(h.local_notebook("Slow", &linked_scope(&slow)).is_some());
        assert!(h.local_notebook("Fast", &linked_scope(&fast)).is_some());
    }

    #[test]
    fn bad_share_fails_only_its_scope() {
        let h = Harness::new();
        let owner = h.owner("mem://shard4");
        let good_nb = remote_notebook(&owner, OWNER_TOKEN, "Good");
        let good = h.link(&owner, good_nb.guid.as_ref().unwrap(), "Good");
        let broken = h.primary.add_linked_notebook(&LinkedNotebook {
            share_name: Some(String::from("Revoked")),
            shared_notebook_global_id: Some(String::from("no-such-share")),
            note_store_url: Some(String::from(owner.url())),
            ..Default::default()
        });
        remote_notebook(&h.primary, TOKEN, "Mine");

        let report = h.sync();
        assert!(!report.is_success());
        assert_eq!(status(&report, &Scope::Primary, Direction::Download), ScopeStatus::Success);
        assert_eq!(status(&report, &linked_scope(&good), Direction::Download), ScopeStatus::Success);
        match status(&report, &linked_scope(&broken), Direction::Download) {
            ScopeStatus::Failed(msg) => assert!(msg.contains("cannot authenticate")),
            x => panic!("expected a failure, got {:?}", x),
        }
        assert_eq!(report.failed_scopes().len(), 1);
        assert!(h.local_notebook("Mine", &Scope::Primary).is_some());
        assert!(h.local_notebook("Good", &linked_scope(&good)).is_some());
    }

    #[test]
    fn unlinking_removes_everything_in_the_scope() {
        let h = Harness::new();
        let owner = h.owner("mem://shard5");
        let shared = remote_notebook(&owner, OWNER_TOKEN, "Team");
        remote_note(&owner, OWNER_TOKEN, &shared, "standup", "<en-note>notes</en-note>");
        let linked = h.link(&owner, shared.guid.as_ref().unwrap(), "Team");
        let scope = linked_scope(&linked);
        h.sync();
        assert!(h.cursor(&scope).is_some());
        assert!(h.creds.read_token(&scope).unwrap().is_some());
        assert_eq!(h.store.notes().count(&ListFilter::all().in_scope(&scope)).unwrap(), 1);

        h.primary.expunge(EntityType::LinkedNotebook, linked.guid.as_ref().unwrap()).unwrap();
        let report = h.sync();
        assert!(report.is_success());
        assert!(report.scope(&scope, Direction::Download).is_none());
        assert_eq!(h.store.linked_notebooks().count(&ListFilter::all()).unwrap(), 0);
        assert!(h.local_notebook("Team", &scope).is_none());
        assert_eq!(h.store.notes().count(&ListFilter::all().in_scope(&scope)).unwrap(), 0);
        assert_eq!(h.cursor(&scope), None);
        assert_eq!(h.creds.read_token(&scope).unwrap(), None);
    }

    #[test]
    fn notes_removed_by_the_owner_go_away() {
        let h = Harness::new();
        let owner = h.owner("mem://shard6");
        let shared = remote_notebook(&owner, OWNER_TOKEN, "Team");
        let note = remote_note(&owner, OWNER_TOKEN, &shared, "old", "<en-note>stale</en-note>");
        let linked = h.link(&owner, shared.guid.as_ref().unwrap(), "Team");
        let scope = linked_scope(&linked);
        h.sync();
        assert!(h.local_note(note.guid.as_ref().unwrap()).is_some());

        owner.expunge_note(note.guid.as_ref().unwrap()).unwrap();
        let report = h.sync();
        assert!(report.is_success());
        assert_eq!(report.scope(&scope, Direction::Download).unwrap().stats.expunged, 1);
        assert!(h.local_note(note.guid.as_ref().unwrap()).is_none());
    }
}
