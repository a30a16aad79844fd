mod common;

use aideon_theoria::prelude::*;
use aideon_theoria::{Op, Related, TheoriaError, Value, Violation};
use indexmap::IndexMap;

use common::{attrs, count_rows, fixture};

fn violation(err: TheoriaError) -> (String, Violation) {
    match err {
        TheoriaError::Violation { model, violation } => (model, violation),
        other => panic!("expected a violation, got {other}"),
    }
}

#[tokio::test]
async fn record_writes_are_refused() {
    let fx = fixture().await;
    let alice = fx.store.model("User").expect("User").find_or_fail(1).await.expect("alice");
    let before = alice.to_array();

    let (model, refused) = violation(
        alice
            .set_attribute("name", Value::from("mallory"))
            .expect_err("set"),
    );
    assert_eq!(model, "User");
    assert_eq!(refused, Violation::SetAttribute("name".to_string()));
    assert_eq!(refused.operation(), "set");
    assert_eq!(refused.subject(), Some("name"));

    let refused = violation(alice.unset_attribute("name").expect_err("unset")).1;
    assert_eq!(refused.operation(), "unset");
    let refused = violation(alice.offset_set("name", Value::Null).expect_err("offset")).1;
    assert_eq!(refused, Violation::SetAttribute("name".to_string()));
    let refused = violation(
        alice
            .set_relation("posts", Related::Many(Default::default()))
            .expect_err("relation"),
    )
    .1;
    assert_eq!(refused.operation(), "setRelation");

    for (operation, err) in [
        ("save", alice.save().expect_err("save")),
        ("update", alice.update(IndexMap::new()).expect_err("update")),
        ("delete", alice.delete().expect_err("delete")),
        ("touch", alice.touch().expect_err("touch")),
        ("push", alice.push().expect_err("push")),
        ("increment", alice.increment("is_admin", 1).expect_err("increment")),
        ("force_delete", alice.force_delete().expect_err("force delete")),
        ("restore", alice.restore().expect_err("restore")),
        ("fill", alice.fill(IndexMap::new()).expect_err("fill")),
    ] {
        let (model, refused) = violation(err);
        assert_eq!(model, "User");
        assert_eq!(refused.operation(), operation);
    }

    assert_eq!(alice.to_array(), before);
    assert_eq!(alice.get("name"), Value::from("alice"));
}

#[tokio::test]
async fn builder_writes_are_refused_without_touching_rows() {
    let fx = fixture().await;
    let posts = fx.store.model("Post").expect("Post").query().where_eq("id", 1);
    let statements = fx.store.statement_count();

    let row = attrs([("title", Value::from("Injected")), ("user_id", Value::Int(1))]);
    let errors = [
        ("insert", posts.insert(vec![row.clone()]).await.expect_err("insert")),
        ("insert_get_id", posts.insert_get_id(row.clone()).await.expect_err("insert id")),
        ("update", posts.update(row.clone()).await.expect_err("update")),
        ("delete", posts.delete().await.expect_err("delete")),
        ("force_delete", posts.force_delete().await.expect_err("force delete")),
        ("truncate", posts.truncate().await.expect_err("truncate")),
        ("increment", posts.increment("views", 1).await.expect_err("increment")),
        ("decrement", posts.decrement("views", 1).await.expect_err("decrement")),
        ("restore", posts.restore().await.expect_err("restore")),
        (
            "insert_or_ignore",
            posts.insert_or_ignore(vec![row.clone()]).await.expect_err("insert or ignore"),
        ),
        (
            "update_or_insert",
            posts
                .update_or_insert(attrs([("id", Value::Int(1))]), row.clone())
                .await
                .expect_err("update or insert"),
        ),
        ("upsert", posts.upsert(vec![row.clone()], &["id"]).await.expect_err("upsert")),
    ];
    for (operation, err) in errors {
        assert!(err.is_violation(), "{operation}: {err}");
        assert_eq!(violation(err).1.operation(), operation);
    }

    assert_eq!(fx.store.statement_count(), statements);
    assert_eq!(count_rows(&fx.store, "posts").await, 4);
    let first = posts.first().await.expect("first").expect("post");
    assert_eq!(first.get("title"), Value::from("First"));
    assert_eq!(first.get("views"), Value::Int(10));
}

#[tokio::test]
async fn collection_writes_are_refused() {
    let fx = fixture().await;
    let users = fx.store.model("User").expect("User").all().await.expect("users");

    assert!(users.save().expect_err("save").is_violation());
    assert!(users.delete().expect_err("delete").is_violation());
    assert!(users.touch().expect_err("touch").is_violation());
    assert!(users.restore().expect_err("restore").is_violation());

    let query = users.to_query().expect("query");
    assert!(query.delete().await.expect_err("delete").is_violation());
    assert_eq!(query.count().await.expect("count"), 2);
    assert_eq!(count_rows(&fx.store, "users").await, 3);
}

#[tokio::test]
async fn relation_writes_from_read_only_owners_are_refused() {
    let fx = fixture().await;
    let alice = fx.store.model("User").expect("User").find_or_fail(1).await.expect("alice");
    let log = fx
        .store
        .native("AuditLog")
        .expect("AuditLog")
        .find_or_fail(3)
        .await
        .expect("log");
    let row = attrs([("title", Value::from("Nope"))]);
    let posts = alice.relation_query("posts").expect("posts");
    let roles = alice.relation_query("roles").expect("roles");
    let country = alice.relation_query("country").expect("country");
    let logs = alice.relation_query("audit_logs").expect("audit logs");
    let statements = fx.store.statement_count();

    let errors = [
        ("create", posts.create(row.clone()).await.expect_err("create")),
        ("create_many", posts.create_many(vec![row.clone()]).await.expect_err("create many")),
        ("update", posts.update(row.clone()).await.expect_err("update")),
        ("delete", posts.delete().await.expect_err("delete")),
        ("save", logs.save(log.clone()).await.expect_err("save")),
        ("save_many", logs.save_many(vec![log.clone()]).await.expect_err("save many")),
        (
            "create",
            logs.create(attrs([("action", Value::from("sneaky"))]))
                .await
                .expect_err("native target"),
        ),
        ("associate", country.associate(&log).expect_err("associate")),
        ("associate", country.associate_record(&alice).expect_err("associate record")),
        ("dissociate", country.dissociate().expect_err("dissociate")),
        ("attach", roles.attach([2], IndexMap::new()).await.expect_err("attach")),
        ("detach", roles.detach(None::<Vec<Value>>).await.expect_err("detach")),
        ("sync", roles.sync([1]).await.expect_err("sync")),
        (
            "sync_without_detaching",
            roles.sync_without_detaching([1]).await.expect_err("sync without detaching"),
        ),
        ("toggle", roles.toggle([1, 2]).await.expect_err("toggle")),
        (
            "update_existing_pivot",
            roles
                .update_existing_pivot(1, attrs([("assigned_by", Value::from("mallory"))]))
                .await
                .expect_err("update pivot"),
        ),
    ];
    for (operation, err) in errors {
        let (model, refused) = violation(err);
        assert_eq!(model, "User", "{operation}");
        assert_eq!(refused.operation(), operation);
    }

    assert_eq!(fx.store.statement_count(), statements);
    assert_eq!(count_rows(&fx.store, "posts").await, 4);
    assert_eq!(count_rows(&fx.store, "role_user").await, 3);
    assert_eq!(count_rows(&fx.store, "audit_logs").await, 3);
    let roles = alice.relation("roles").await.expect("roles");
    let admin = roles.as_collection().and_then(|roles| roles.first()).expect("role");
    let pivot = admin.pivot().expect("pivot");
    assert_eq!(pivot.get_raw("assigned_by"), Value::from("root"));
}

#[tokio::test]
async fn relation_method_filters_narrow_the_children() {
    let fx = fixture().await;
    let alice = fx.store.model("User").expect("User").find_or_fail(1).await.expect("alice");
    let posts = alice.relation_query("posts").expect("posts");

    assert_eq!(posts.count().await.expect("all"), 2);
    let popular = posts.clone().where_op("views", Op::Gt, 20);
    assert_eq!(popular.count().await.expect("filtered"), 1);
    assert_eq!(popular.pluck("title").await.expect("titles"), vec![Value::from("Second")]);
    assert!(popular.delete().await.expect_err("delete").is_violation());
    assert_eq!(count_rows(&fx.store, "posts").await, 4);
}

#[tokio::test]
async fn relation_cache_is_append_only() {
    let fx = fixture().await;
    let alice = fx.store.model("User").expect("User").find_or_fail(1).await.expect("alice");

    let err = alice.get_relation("posts").expect_err("not loaded");
    assert!(matches!(err, TheoriaError::RelationNotLoaded { .. }));
    let err = alice.relation("followers").await.expect_err("undefined");
    assert!(matches!(err, TheoriaError::UndefinedRelation { .. }));

    let posts = alice.relation("posts").await.expect("posts");
    assert!(alice.set_relation("posts", Related::Many(Default::default())).is_err());
    assert!(alice.unset_relation("posts").is_err());
    let again = alice.get_relation("posts").expect("cached");
    assert_eq!(again.len(), posts.len());
    assert_eq!(again.len(), 2);
}
