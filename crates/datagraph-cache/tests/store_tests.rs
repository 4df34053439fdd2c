use async_trait::async_trait;
use datagraph_cache::{SharedStore, Store};
use datagraph_core::{
    Attributes, CollectingSink, DataGraphError, Document, DocumentData, Identifier, InMemorySchema,
    NotificationKind, RelationshipDef, RelationshipPayload, ResourceDocument, ResourceRef,
    StoreConfig, TypeSchema, ValidationError,
};
use datagraph_graph::{
    FetchRequest, FetchTarget, FetchedRelationship, LoadCompletion, LoadDecision, LoadTicket,
    RelationshipFetcher,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn schema() -> InMemorySchema {
    InMemorySchema::new()
        .with_type(
            TypeSchema::new("user")
                .attribute("name")
                .attribute("age")
                .attribute_with_default("role", json!("member"))
                .relationship(
                    RelationshipDef::has_many("posts", "post")
                        .inverse("author")
                        .asynchronous(),
                ),
        )
        .with_type(
            TypeSchema::new("post")
                .attribute("title")
                .relationship(RelationshipDef::belongs_to("author", "user").inverse("posts"))
                .relationship(RelationshipDef::has_many("comments", "comment").inverse("target")),
        )
        .with_type(
            TypeSchema::new("comment").attribute("body").relationship(
                RelationshipDef::belongs_to("target", "commentable")
                    .inverse("comments")
                    .polymorphic(),
            ),
        )
        .with_type(TypeSchema::new("tag"))
        .with_type(
            TypeSchema::new("node")
                .relationship(RelationshipDef::belongs_to("parent", "node").inverse("children"))
                .relationship(RelationshipDef::has_many("children", "node").inverse("parent")),
        )
        .with_polymorphic("commentable", "post")
}

fn store() -> Store {
    Store::new(Arc::new(schema()))
}

fn store_with(config: StoreConfig) -> Store {
    Store::with_config(Arc::new(schema()), config)
}

fn attrs(value: Value) -> Attributes {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

fn user(id: &str, name: &str) -> ResourceDocument {
    ResourceDocument::new("user", id).with_attribute("name", json!(name))
}

fn post_refs(ids: &[&str]) -> RelationshipPayload {
    RelationshipPayload::many(ids.iter().map(|id| ResourceRef::new("post", *id)).collect())
}

/// user 1 with posts 1 and 2, both posts loaded.
fn seeded() -> (Store, Identifier, Identifier, Identifier) {
    let mut store = store();
    let user = store
        .push(user("1", "Chris").with_relationship("posts", post_refs(&["1", "2"])))
        .unwrap();
    let p1 = store.push(ResourceDocument::new("post", "1")).unwrap();
    let p2 = store.push(ResourceDocument::new("post", "2")).unwrap();
    (store, user, p1, p2)
}

#[test]
fn test_chris_scenario() {
    let mut store = store();
    let chris = store.push(user("1", "Chris")).unwrap();
    assert_eq!(store.get_attr(&chris, "name").unwrap(), json!("Chris"));

    store.set_attr(&chris, "name", json!("James")).unwrap();
    assert_eq!(store.get_attr(&chris, "name").unwrap(), json!("James"));
    assert!(store.has_changed_attrs(&chris));

    let dirty = store.rollback_attrs(&chris).unwrap();
    assert_eq!(dirty, vec!["name".to_string()]);
    assert_eq!(store.get_attr(&chris, "name").unwrap(), json!("Chris"));
    assert!(!store.has_changed_attrs(&chris));
}

#[test]
fn test_identity_is_stable() {
    let mut store = store();
    let a = store.identifier_for(&ResourceRef::new("user", "1")).unwrap();
    let b = store.push(user("1", "Chris")).unwrap();
    let c = store
        .identifier_for(&ResourceRef::new("user", "1").with_lid(a.lid()))
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(
        store.peek_identifier(&ResourceRef::new("user", "1")).unwrap(),
        Some(a)
    );
    assert_eq!(store.peek_identifier(&ResourceRef::new("user", "2")).unwrap(), None);
}

#[test]
fn test_local_edit_wins_over_push() {
    let mut store = store();
    let sink = CollectingSink::new();
    store.add_sink(sink.clone());
    let chris = store.push(user("1", "Chris")).unwrap();
    store.set_attr(&chris, "name", json!("James")).unwrap();
    sink.take();

    store
        .push(user("1", "Thomas").with_attribute("age", json!(30)))
        .unwrap();
    assert_eq!(store.get_attr(&chris, "name").unwrap(), json!("James"));
    assert_eq!(store.get_attr(&chris, "age").unwrap(), json!(30));

    let fields: Vec<Option<String>> = sink
        .take()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::Attributes)
        .map(|n| n.field)
        .collect();
    assert_eq!(fields, vec![Some("age".to_string())]);
}

#[test]
fn test_round_trip_clears_local_edit() {
    let mut store = store();
    let chris = store.push(user("1", "Chris")).unwrap();
    store.set_attr(&chris, "name", json!("James")).unwrap();
    store.set_attr(&chris, "name", json!("Chris")).unwrap();
    assert!(!store.has_changed_attrs(&chris));
    assert!(store.changed_attrs(&chris).is_empty());
}

#[test]
fn test_schema_default_and_strict_attributes() {
    let mut store = store();
    let chris = store.push(user("1", "Chris")).unwrap();
    assert_eq!(store.get_attr(&chris, "role").unwrap(), json!("member"));
    assert_eq!(store.get_attr(&chris, "age").unwrap(), Value::Null);

    let err = store.set_attr(&chris, "nickname", json!("C")).unwrap_err();
    assert!(matches!(err, DataGraphError::UnknownField { .. }));
    assert!(err.is_schema_violation());

    let mut lenient = store_with(StoreConfig {
        strict_attributes: false,
        ..Default::default()
    });
    let chris = lenient.push(user("1", "Chris")).unwrap();
    lenient.set_attr(&chris, "nickname", json!("C")).unwrap();
    assert_eq!(lenient.get_attr(&chris, "nickname").unwrap(), json!("C"));
}

#[test]
fn test_unknown_type_is_rejected() {
    let mut store = store();
    let err = store.push(ResourceDocument::new("planet", "1")).unwrap_err();
    assert!(matches!(err, DataGraphError::UnknownType(t) if t == "planet"));
}

#[test]
fn test_commit_cycle_assigns_id() {
    let mut store = store();
    let draft = store
        .create_record("user", None, attrs(json!({ "name": "Draft" })))
        .unwrap();
    assert!(store.is_new(&draft));
    assert!(draft.lid().starts_with("@lid:"));
    assert_eq!(store.get_attr(&draft, "name").unwrap(), json!("Draft"));

    store.will_commit(&draft).unwrap();
    let saved = store
        .did_commit(
            &draft,
            Some(user("10", "Draft").with_attribute("age", json!(3))),
        )
        .unwrap();
    assert_eq!(saved, draft);
    assert_eq!(saved.id().as_deref(), Some("10"));
    assert!(!store.is_new(&saved));
    assert!(!store.has_changed_attrs(&saved));
    assert_eq!(store.get_attr(&saved, "age").unwrap(), json!(3));
    assert_eq!(
        store.peek_identifier(&ResourceRef::new("user", "10")).unwrap(),
        Some(saved)
    );
}

#[test]
fn test_commit_rejection_keeps_newer_edits() {
    let mut store = store();
    let sink = CollectingSink::new();
    store.add_sink(sink.clone());
    let chris = store.push(user("1", "Chris")).unwrap();
    store.set_attr(&chris, "name", json!("James")).unwrap();
    store.set_attr(&chris, "age", json!(31)).unwrap();
    store.will_commit(&chris).unwrap();
    store.set_attr(&chris, "name", json!("Thomas")).unwrap();

    store
        .commit_was_rejected(&chris, vec![ValidationError::on("name", "is taken")])
        .unwrap();
    assert_eq!(store.get_attr(&chris, "name").unwrap(), json!("Thomas"));
    assert_eq!(store.get_attr(&chris, "age").unwrap(), json!(31));
    assert_eq!(store.errors(&chris), vec![ValidationError::on("name", "is taken")]);
    assert_eq!(sink.count(NotificationKind::Errors), 1);

    let changed: Vec<String> = store
        .changed_attrs(&chris)
        .into_iter()
        .map(|c| c.key)
        .collect();
    assert_eq!(changed, vec!["name".to_string(), "age".to_string()]);
}

#[test]
fn test_inverse_symmetry_on_local_edits() {
    let (mut store, user, p1, p2) = seeded();
    let other = store.push(user_doc("2")).unwrap();

    store
        .replace_related_record(&p1, "author", Some(other.clone()))
        .unwrap();
    assert_eq!(store.get_relationship_data(&other, "posts").unwrap().members(), vec![p1.clone()]);
    assert_eq!(store.get_relationship_data(&user, "posts").unwrap().members(), vec![p2.clone()]);

    store
        .remove_from_related_records(&other, "posts", vec![p1.clone()])
        .unwrap();
    assert!(store.get_relationship_data(&p1, "author").unwrap().members().is_empty());

    store
        .add_to_related_records(&user, "posts", vec![p1.clone()], Some(0))
        .unwrap();
    assert_eq!(
        store.get_relationship_data(&user, "posts").unwrap().members(),
        vec![p1.clone(), p2]
    );
    assert_eq!(store.get_relationship_data(&p1, "author").unwrap().members(), vec![user]);
}

fn user_doc(id: &str) -> ResourceDocument {
    ResourceDocument::new("user", id)
}

#[test]
fn test_canonical_flush_retains_pending_new_members() {
    let (mut store, user, p1, p2) = seeded();
    let draft = store
        .create_record("post", None, attrs(json!({ "title": "Draft" })))
        .unwrap();
    store
        .add_to_related_records(&user, "posts", vec![draft.clone()], None)
        .unwrap();

    store
        .update_relationship(&user, "posts", post_refs(&["1", "2"]))
        .unwrap();
    assert_eq!(
        store.get_relationship_data(&user, "posts").unwrap().members(),
        vec![p1, p2, draft]
    );
}

#[test]
fn test_belongs_to_null_then_canonical_scenario() {
    let mut store = store();
    let a = store
        .push(ResourceDocument::new("node", "a").with_relationship(
            "parent",
            RelationshipPayload::one(Some(ResourceRef::new("node", "b"))),
        ))
        .unwrap();
    let b = store.identifier_for(&ResourceRef::new("node", "b")).unwrap();
    let c = store.identifier_for(&ResourceRef::new("node", "c")).unwrap();

    store.replace_related_record(&a, "parent", None).unwrap();
    assert!(store.get_relationship_data(&b, "children").unwrap().members().is_empty());

    store
        .update_relationship(
            &a,
            "parent",
            RelationshipPayload::one(Some(ResourceRef::new("node", "c"))),
        )
        .unwrap();
    assert_eq!(store.get_relationship_data(&a, "parent").unwrap().members(), vec![c.clone()]);
    assert!(store.get_relationship_data(&b, "children").unwrap().members().is_empty());
    assert_eq!(store.get_relationship_data(&c, "children").unwrap().members(), vec![a]);
}

#[test]
fn test_rollback_relationships_restores_canonical() {
    let (mut store, user, p1, p2) = seeded();
    store
        .replace_related_records(&user, "posts", vec![p2.clone()])
        .unwrap();
    assert!(store.get_relationship_data(&p1, "author").unwrap().members().is_empty());

    store.rollback_relationships(&user).unwrap();
    assert_eq!(
        store.get_relationship_data(&user, "posts").unwrap().members(),
        vec![p1.clone(), p2]
    );
    assert_eq!(store.get_relationship_data(&p1, "author").unwrap().members(), vec![user]);
}

#[test]
fn test_delete_and_rollback_restores_membership() {
    let (mut store, user, p1, p2) = seeded();
    store.delete_record(&p1).unwrap();
    assert!(store.is_deleted(&p1));
    assert_eq!(
        store.get_relationship_data(&user, "posts").unwrap().members(),
        vec![p2.clone()]
    );

    store.rollback_attrs(&p1).unwrap();
    assert!(!store.is_deleted(&p1));
    assert_eq!(
        store.get_relationship_data(&user, "posts").unwrap().members(),
        vec![p2, p1]
    );
}

#[test]
fn test_deleted_record_rejects_attribute_edits() {
    let (mut store, _user, p1, _p2) = seeded();
    store.set_attr(&p1, "title", json!("Draft")).unwrap();
    store.delete_record(&p1).unwrap();
    assert!(matches!(
        store.set_attr(&p1, "title", json!("Final")),
        Err(DataGraphError::InvariantViolation(_))
    ));
    assert_eq!(store.get_attr(&p1, "title").unwrap(), json!("Draft"));

    store.rollback_attrs(&p1).unwrap();
    assert!(!store.is_deleted(&p1));
    store.set_attr(&p1, "title", json!("Final")).unwrap();
    assert_eq!(store.get_attr(&p1, "title").unwrap(), json!("Final"));
}

#[test]
fn test_rollback_discards_new_record() {
    let (mut store, user, p1, p2) = seeded();
    let draft = store.create_record("post", None, Attributes::new()).unwrap();
    store
        .replace_related_record(&draft, "author", Some(user.clone()))
        .unwrap();
    assert_eq!(store.get_relationship_data(&user, "posts").unwrap().members().len(), 3);

    store.rollback_attrs(&draft).unwrap();
    assert!(store.is_new(&draft) && store.is_deleted(&draft));
    assert_eq!(
        store.get_relationship_data(&user, "posts").unwrap().members(),
        vec![p1, p2]
    );
}

#[test]
fn test_committed_delete_is_terminal() {
    let (mut store, user, p1, p2) = seeded();
    store.delete_record(&p1).unwrap();
    store.will_commit(&p1).unwrap();
    store.did_commit(&p1, None).unwrap();
    assert!(store.is_deletion_committed(&p1));
    assert!(matches!(
        store.set_attr(&p1, "title", json!("x")),
        Err(DataGraphError::InvariantViolation(_))
    ));

    store
        .update_relationship(&user, "posts", post_refs(&["2"]))
        .unwrap();
    assert_eq!(store.get_relationship_data(&user, "posts").unwrap().members(), vec![p2]);
}

#[test]
fn test_polymorphic_mismatch_fails_fast() {
    let mut store = store();
    let comment = store
        .push(ResourceDocument::new("comment", "1").with_relationship(
            "target",
            RelationshipPayload::one(Some(ResourceRef::new("post", "1"))),
        ))
        .unwrap();
    let post = store.identifier_for(&ResourceRef::new("post", "1")).unwrap();
    assert_eq!(
        store.get_relationship_data(&post, "comments").unwrap().members(),
        vec![comment]
    );

    let err = store
        .push(ResourceDocument::new("comment", "2").with_relationship(
            "target",
            RelationshipPayload::one(Some(ResourceRef::new("tag", "1"))),
        ))
        .unwrap_err();
    assert!(matches!(err, DataGraphError::PolymorphicTypeMismatch { .. }));
}

#[test]
fn test_merge_moves_state_to_survivor() {
    let mut store = store();
    let sink = CollectingSink::new();
    store.add_sink(sink.clone());
    let existing = store.identifier_for(&ResourceRef::new("user", "5")).unwrap();
    let draft = store
        .create_record("user", None, attrs(json!({ "name": "Draft" })))
        .unwrap();
    let post = store.push(ResourceDocument::new("post", "9")).unwrap();
    store
        .replace_related_record(&post, "author", Some(draft.clone()))
        .unwrap();

    let kept = store
        .update_identifier(&draft, &ResourceRef::new("user", "5"))
        .unwrap();
    assert_eq!(kept, existing);
    assert!(draft.is_forgotten());
    assert!(!existing.is_forgotten());
    assert_eq!(sink.count(NotificationKind::Identity), 1);

    assert_eq!(store.get_attr(&existing, "name").unwrap(), json!("Draft"));
    assert_eq!(
        store.get_relationship_data(&post, "author").unwrap().members(),
        vec![existing.clone()]
    );
    assert_eq!(
        store.get_relationship_data(&existing, "posts").unwrap().members(),
        vec![post]
    );
    assert!(matches!(
        store.get_attr(&draft, "name"),
        Err(DataGraphError::IdentifierForgotten(_))
    ));
    assert_eq!(
        store.peek_identifier(&ResourceRef::from_lid("user", draft.lid())).unwrap(),
        Some(existing)
    );
}

#[test]
fn test_unload_releases_unreferenced_component() {
    let (mut store, user, p1, p2) = seeded();
    let sink = CollectingSink::new();
    store.add_sink(sink.clone());

    assert!(!store.unload(&p1).unwrap().released);
    assert!(!store.unload(&p2).unwrap().released);
    let report = store.unload(&user).unwrap();
    assert!(report.released);
    assert_eq!(report.component.first(), Some(&user));
    assert_eq!(report.component.len(), 3);
    for identifier in [&user, &p1, &p2] {
        assert!(identifier.is_forgotten());
    }
    assert_eq!(sink.count(NotificationKind::Identity), 3);
    assert_eq!(store.graph().node_count(), 0);
    assert!(store.identifiers().is_empty());

    assert!(matches!(
        store.unload(&p1),
        Err(DataGraphError::InvariantViolation(_))
    ));
}

#[test]
fn test_unload_keeps_loaded_neighbours() {
    let (mut store, user, p1, p2) = seeded();

    let report = store.unload(&p1).unwrap();
    assert!(!report.released);
    assert_eq!(report.component, vec![p1.clone(), user.clone(), p2.clone()]);
    assert_eq!(report.blocked_by, vec![user.clone(), p2.clone()]);

    assert!(!p1.is_forgotten() && !p2.is_forgotten() && !user.is_forgotten());
    assert!(store.is_empty(&p1));
    assert_eq!(store.get_attr(&user, "name").unwrap(), json!("Chris"));
    assert_eq!(
        store.get_relationship_data(&user, "posts").unwrap().members(),
        vec![p1, p2]
    );
}

#[test]
fn test_unload_releases_reference_only_neighbours() {
    let mut store = store();
    let post = store
        .push(ResourceDocument::new("post", "1").with_relationship(
            "author",
            RelationshipPayload::one(Some(ResourceRef::new("user", "7"))),
        ))
        .unwrap();
    let author = store.identifier_for(&ResourceRef::new("user", "7")).unwrap();

    let report = store.unload(&post).unwrap();
    assert!(report.released);
    assert_eq!(report.component, vec![post.clone(), author.clone()]);
    assert!(post.is_forgotten() && author.is_forgotten());
}

#[test]
fn test_live_handle_blocks_teardown_until_released() {
    let (mut store, user, p1, p2) = seeded();
    store.retain(&user).unwrap();

    store.unload(&p1).unwrap();
    store.unload(&p2).unwrap();
    let report = store.unload(&user).unwrap();
    assert!(!report.released);
    assert_eq!(report.blocked_by, vec![user.clone()]);
    assert!(!p1.is_forgotten() && !user.is_forgotten());
    assert!(store.is_empty(&p1) && store.is_empty(&user));
    assert_eq!(store.get_relationship_data(&user, "posts").unwrap().members().len(), 2);

    let retried = store.release(&user).unwrap().expect("teardown retried");
    assert!(retried.released);
    assert!(p1.is_forgotten() && p2.is_forgotten() && user.is_forgotten());
    assert!(matches!(
        store.release(&user),
        Err(DataGraphError::InvariantViolation(_))
    ));
}

#[test]
fn test_unload_marks_async_inverse_for_refetch() {
    let (mut store, user, p1, _p2) = seeded();
    store.retain(&user).unwrap();
    store.unload(&p1).unwrap();
    let state = store.get_relationship_data(&user, "posts").unwrap().state;
    assert!(state.has_dematerialized_inverse);
}

#[test]
fn test_destroyed_entry_grace_period() {
    let mut store = store_with(StoreConfig {
        destroyed_retention_turns: 1,
        ..Default::default()
    });
    let chris = store.push(user("1", "Chris")).unwrap();
    store.set_attr(&chris, "name", json!("James")).unwrap();
    store.unload(&chris).unwrap();
    assert!(chris.is_forgotten());

    // unload clears the buckets before the entry is retired
    assert!(store.peek_destroyed(&chris).is_some_and(|entry| entry.is_empty()));
    store.flush().unwrap();
    assert!(store.peek_destroyed(&chris).is_none());

    let mut immediate = store_with(StoreConfig::default());
    let chris = immediate.push(user("1", "Chris")).unwrap();
    immediate.unload(&chris).unwrap();
    assert!(immediate.peek_destroyed(&chris).is_none());
}

#[test]
fn test_batch_defers_relationship_notifications() {
    let mut store = store();
    let sink = CollectingSink::new();
    store.add_sink(sink.clone());

    let before = store.flush_stats();
    store
        .batch(|s| {
            s.push(user("1", "Chris").with_relationship("posts", post_refs(&["1"])))?;
            let u = s.identifier_for(&ResourceRef::new("user", "1"))?;
            s.update_relationship(&u, "posts", post_refs(&["1", "2"]))?;
            s.update_relationship(&u, "posts", post_refs(&["2"]))?;
            assert_eq!(sink.count(NotificationKind::Attributes), 1);
            assert_eq!(sink.count(NotificationKind::Relationships), 0);
            Ok(())
        })
        .unwrap();
    let after = store.flush_stats();

    assert_eq!(after.flushes - before.flushes, 1);
    assert!(after.coalesced > before.coalesced);
    assert!(sink.count(NotificationKind::Relationships) > 0);

    let u = store.identifier_for(&ResourceRef::new("user", "1")).unwrap();
    let p2 = store.identifier_for(&ResourceRef::new("post", "2")).unwrap();
    assert_eq!(store.get_relationship_data(&u, "posts").unwrap().members(), vec![p2]);
}

#[test]
fn test_manual_flush_mode() {
    let mut store = store_with(StoreConfig {
        auto_flush: false,
        ..Default::default()
    });
    let u = store
        .push(user("1", "Chris").with_relationship("posts", post_refs(&["1"])))
        .unwrap();
    assert!(store.get_relationship_data(&u, "posts").unwrap().members().is_empty());
    assert!(store.graph().pending_flushes() > 0);

    let stats = store.flush().unwrap();
    assert_eq!(stats.failed, 0);
    let p1 = store.identifier_for(&ResourceRef::new("post", "1")).unwrap();
    assert_eq!(store.get_relationship_data(&u, "posts").unwrap().members(), vec![p1]);
}

#[test]
fn test_push_document_returns_primary_identifiers() {
    let mut store = store();
    let document: Document = serde_json::from_value(json!({
        "data": [
            { "type": "user", "id": "1", "attributes": { "name": "Chris" },
              "relationships": { "posts": { "data": [{ "type": "post", "id": "7" }] } } }
        ],
        "included": [
            { "type": "post", "id": "7", "attributes": { "title": "Hello" } }
        ]
    }))
    .unwrap();
    assert!(matches!(document.data, DocumentData::Many(_)));

    let primary = store.push_document(document).unwrap();
    assert_eq!(primary.len(), 1);
    let post = store.peek_identifier(&ResourceRef::new("post", "7")).unwrap().unwrap();
    assert_eq!(store.get_attr(&post, "title").unwrap(), json!("Hello"));
    assert_eq!(
        store.get_relationship_data(&post, "author").unwrap().members(),
        primary
    );
}

// ---- loading ----

fn linked_user(store: &mut Store) -> Identifier {
    store
        .push(user("1", "Chris").with_relationship(
            "posts",
            RelationshipPayload::link("/users/1/posts"),
        ))
        .unwrap()
}

fn expect_ticket(decision: LoadDecision) -> LoadTicket {
    match decision {
        LoadDecision::Fetch(ticket) => ticket,
        other => panic!("expected a fetch, got {:?}", other),
    }
}

fn fetched(ids: &[&str]) -> FetchedRelationship {
    FetchedRelationship {
        relationship: post_refs(ids),
        included: ids
            .iter()
            .map(|id| ResourceDocument::new("post", *id))
            .collect(),
    }
}

#[test]
fn test_stale_load_is_ignored() {
    let mut store = store();
    let u = linked_user(&mut store);

    let first = expect_ticket(store.begin_relationship_load(&u, "posts", false).unwrap());
    assert_eq!(first.request.target, FetchTarget::Link("/users/1/posts".into()));
    let second = expect_ticket(store.begin_relationship_load(&u, "posts", true).unwrap());

    assert_eq!(
        store.complete_relationship_load(&first, Ok(fetched(&["1"]))).unwrap(),
        LoadCompletion::Stale
    );
    assert!(store.get_relationship_data(&u, "posts").unwrap().data.is_none());

    assert_eq!(
        store.complete_relationship_load(&second, Ok(fetched(&["2"]))).unwrap(),
        LoadCompletion::Applied
    );
    let p2 = store.peek_identifier(&ResourceRef::new("post", "2")).unwrap().unwrap();
    assert_eq!(store.get_relationship_data(&u, "posts").unwrap().members(), vec![p2]);
}

#[test]
fn test_local_edit_supersedes_pending_load() {
    let (mut store, user, p1, _p2) = seeded();
    store.force_reload(&user, "posts").unwrap();
    let ticket = expect_ticket(store.begin_relationship_load(&user, "posts", false).unwrap());

    store
        .replace_related_records(&user, "posts", vec![p1.clone()])
        .unwrap();
    assert_eq!(
        store.complete_relationship_load(&ticket, Ok(fetched(&["3"]))).unwrap(),
        LoadCompletion::Stale
    );
    assert_eq!(store.get_relationship_data(&user, "posts").unwrap().members(), vec![p1]);
}

#[test]
fn test_failed_load_suppresses_refetch() {
    let mut store = store();
    let u = linked_user(&mut store);
    let ticket = expect_ticket(store.begin_relationship_load(&u, "posts", false).unwrap());

    let err = store
        .complete_relationship_load(&ticket, Err(anyhow::anyhow!("connection reset")))
        .unwrap_err();
    assert!(matches!(err, DataGraphError::LoadFailed { ref field, .. } if field == "posts"));
    assert!(store.get_relationship_data(&u, "posts").unwrap().state.has_failed_load_attempt);
    assert_eq!(
        store.begin_relationship_load(&u, "posts", false).unwrap(),
        LoadDecision::Suppressed
    );

    store.force_reload(&u, "posts").unwrap();
    let retry = expect_ticket(store.begin_relationship_load(&u, "posts", false).unwrap());
    assert_eq!(
        store.complete_relationship_load(&retry, Ok(fetched(&["1"]))).unwrap(),
        LoadCompletion::Applied
    );
    assert!(!store.get_relationship_data(&u, "posts").unwrap().state.has_failed_load_attempt);
}

struct CountingFetcher {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl RelationshipFetcher for CountingFetcher {
    async fn fetch(&self, request: FetchRequest) -> anyhow::Result<FetchedRelationship> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match request.target {
            FetchTarget::Link(link) if link == "/users/1/posts" => Ok(fetched(&["1", "2"])),
            other => anyhow::bail!("unexpected target {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_load_relationship_fetches_once() {
    let mut store = store();
    let u = linked_user(&mut store);
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = CountingFetcher {
        calls: calls.clone(),
    };

    let loaded = store
        .load_relationship(&u, "posts", false, &fetcher)
        .await
        .unwrap();
    assert_eq!(loaded.members().len(), 2);
    assert!(loaded.state.has_received_data);

    let again = store
        .load_relationship(&u, "posts", false, &fetcher)
        .await
        .unwrap();
    assert_eq!(again, loaded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_subscribers_receive_notifications() {
    let mut store = store();
    let mut rx = store.subscribe();
    let chris = store.push(user("1", "Chris")).unwrap();

    let notification = rx.recv().await.unwrap();
    assert_eq!(notification.identifier, chris);
    assert_eq!(notification.kind, NotificationKind::Attributes);
    assert_eq!(notification.field.as_deref(), Some("name"));
}

#[test]
fn test_shared_store() {
    let shared: SharedStore = store().into_shared();
    let chris = shared.lock().push(user("1", "Chris")).unwrap();
    let reader = shared.clone();
    assert_eq!(reader.lock().get_attr(&chris, "name").unwrap(), json!("Chris"));
}

#[test]
fn test_custom_lid_prefix() {
    let mut store = store_with(StoreConfig {
        lid_prefix: "tmp:".to_string(),
        ..Default::default()
    });
    let draft = store.create_record("user", None, Attributes::new()).unwrap();
    assert!(draft.lid().starts_with("tmp:"));
    let chris = store.push(user("1", "Chris")).unwrap();
    assert_eq!(chris.lid(), "tmp:user-1");
}
