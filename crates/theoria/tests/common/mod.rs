#![allow(dead_code)]

use aideon_theoria::prelude::*;
use aideon_theoria::{Cast, ModelBuilder, Op, Registry, RelationDecl, TheoriaStore, Value};
use indexmap::IndexMap;
use sea_orm::ConnectionTrait;
use tempfile::{TempDir, tempdir};

const SCHEMA: &[&str] = &[
    "CREATE TABLE countries (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
    "CREATE TABLE users (
        id INTEGER PRIMARY KEY,
        country_id INTEGER,
        name TEXT NOT NULL,
        email TEXT NOT NULL,
        is_admin INTEGER NOT NULL DEFAULT 0,
        settings TEXT,
        deleted_at TEXT
    )",
    "CREATE TABLE profiles (id INTEGER PRIMARY KEY, user_id INTEGER NOT NULL, bio TEXT)",
    "CREATE TABLE posts (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        views INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE comments (id INTEGER PRIMARY KEY, post_id INTEGER NOT NULL, body TEXT)",
    "CREATE TABLE roles (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
    "CREATE TABLE role_user (user_id INTEGER NOT NULL, role_id INTEGER NOT NULL, assigned_by TEXT)",
    "CREATE TABLE images (
        id INTEGER PRIMARY KEY,
        imageable_type TEXT,
        imageable_id INTEGER,
        url TEXT NOT NULL
    )",
    "CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
    "CREATE TABLE taggables (
        tag_id INTEGER NOT NULL,
        taggable_type TEXT NOT NULL,
        taggable_id INTEGER NOT NULL
    )",
    "CREATE TABLE audit_logs (
        id INTEGER PRIMARY KEY,
        user_id INTEGER,
        action TEXT NOT NULL,
        created_at TEXT,
        updated_at TEXT
    )",
    "CREATE TABLE labels (id INTEGER PRIMARY KEY, audit_log_id INTEGER, name TEXT NOT NULL)",
    "CREATE TABLE audit_log_label (
        audit_log_id INTEGER NOT NULL,
        label_id INTEGER NOT NULL,
        note TEXT
    )",
];

const SEED: &[&str] = &[
    "INSERT INTO countries (id, name) VALUES (1, 'Norway'), (2, 'Chile')",
    "INSERT INTO users (id, country_id, name, email, is_admin, settings, deleted_at) VALUES
        (1, 1, 'alice', 'alice@example.com', 1, '{\"theme\":\"dark\"}', NULL),
        (2, 1, 'bob', 'bob@example.com', 0, NULL, NULL),
        (3, 2, 'carol', 'carol@example.com', 0, NULL, '2024-01-01 00:00:00')",
    "INSERT INTO profiles (id, user_id, bio) VALUES (1, 1, 'writes things')",
    "INSERT INTO posts (id, user_id, title, views) VALUES
        (1, 1, 'First', 10),
        (2, 1, 'Second', 50),
        (3, 2, 'Third', 5),
        (4, 3, 'Ghost', 7)",
    "INSERT INTO comments (id, post_id, body) VALUES (1, 1, 'nice'), (2, 1, 'meh'), (3, 3, 'ok')",
    "INSERT INTO roles (id, name) VALUES (1, 'admin'), (2, 'editor')",
    "INSERT INTO role_user (user_id, role_id, assigned_by) VALUES
        (1, 1, 'root'),
        (1, 2, 'root'),
        (2, 2, 'alice')",
    "INSERT INTO images (id, imageable_type, imageable_id, url) VALUES
        (1, 'User', 1, 'alice.png'),
        (2, 'post', 1, 'first.png'),
        (3, NULL, NULL, 'orphan.png')",
    "INSERT INTO tags (id, name) VALUES (1, 'rust'), (2, 'sql')",
    "INSERT INTO taggables (tag_id, taggable_type, taggable_id) VALUES
        (1, 'post', 1),
        (2, 'post', 1),
        (2, 'post', 3)",
    "INSERT INTO audit_logs (id, user_id, action) VALUES
        (1, 1, 'login'),
        (2, 1, 'logout'),
        (3, 2, 'login')",
    "INSERT INTO labels (id, audit_log_id, name) VALUES
        (1, NULL, 'security'),
        (2, NULL, 'billing')",
];

pub struct Fixture {
    pub dir: TempDir,
    pub store: TheoriaStore,
}

pub fn registry() -> Registry {
    Registry::builder()
        .model(
            ModelBuilder::read_only("User")
                .soft_deletes()
                .cast("is_admin", Cast::Boolean)
                .cast("settings", Cast::Json)
                .accessor("display_name", |user: &dyn Attributes| {
                    Value::from(format!("{} <{}>", user.get_raw("name"), user.get_raw("email")))
                })
                .append("display_name")
                .hidden(["email"])
                .scope("admins", |query, _| query.where_eq("users.is_admin", 1))
                .scope("named", |query, args| {
                    query.where_eq("users.name", args.first().cloned().unwrap_or(Value::Null))
                })
                .relation("posts", RelationDecl::has_many("Post"))
                .relation("profile", RelationDecl::has_one("Profile"))
                .relation(
                    "roles",
                    RelationDecl::belongs_to_many("Role").with_pivot(["assigned_by"]),
                )
                .relation("country", RelationDecl::belongs_to("Country"))
                .relation("images", RelationDecl::morph_many("Image", "imageable"))
                .relation("audit_logs", RelationDecl::has_many("AuditLog")),
        )
        .model(
            ModelBuilder::read_only("Profile").relation("user", RelationDecl::belongs_to("User")),
        )
        .model(
            ModelBuilder::read_only("Post")
                .morph_alias("post")
                .cast("views", Cast::Integer)
                .scope("popular", |query, args| {
                    query.where_op(
                        "posts.views",
                        Op::Gt,
                        args.first().cloned().unwrap_or(Value::Int(0)),
                    )
                })
                .relation("author", RelationDecl::belongs_to("User").foreign_key("user_id"))
                .relation("comments", RelationDecl::has_many("Comment"))
                .relation("images", RelationDecl::morph_many("Image", "imageable"))
                .relation("tags", RelationDecl::morph_to_many("Tag", "taggable")),
        )
        .model(
            ModelBuilder::read_only("Comment").relation("post", RelationDecl::belongs_to("Post")),
        )
        .model(
            ModelBuilder::read_only("Role")
                .relation("users", RelationDecl::belongs_to_many("User")),
        )
        .model(
            ModelBuilder::read_only("Country")
                .relation("users", RelationDecl::has_many("User"))
                .relation("posts", RelationDecl::has_many_through("Post", "User"))
                .relation(
                    "all_posts",
                    RelationDecl::has_many_through("Post", "User").with_trashed_parents(),
                ),
        )
        .model(ModelBuilder::read_only("Image").relation("imageable", RelationDecl::morph_to()))
        .model(
            ModelBuilder::read_only("Tag")
                .relation("posts", RelationDecl::morphed_by_many("Post", "taggable")),
        )
        .model(
            ModelBuilder::native("AuditLog")
                .timestamps()
                .relation("user", RelationDecl::belongs_to("User"))
                .relation("labels", RelationDecl::has_many("Label"))
                .relation(
                    "flags",
                    RelationDecl::belongs_to_many("Label").with_pivot(["note"]),
                ),
        )
        .model(
            ModelBuilder::native("Label")
                .relation("audit_log", RelationDecl::belongs_to("AuditLog")),
        )
        .build()
        .expect("registry")
}

pub async fn fixture() -> Fixture {
    let dir = tempdir().expect("tempdir");
    let store = TheoriaStore::open(dir.path(), registry()).await.expect("open store");
    for sql in SCHEMA.iter().chain(SEED) {
        store
            .connection()
            .execute_unprepared(sql)
            .await
            .expect("fixture sql");
    }
    Fixture { dir, store }
}

pub fn attrs<const N: usize>(pairs: [(&str, Value); N]) -> IndexMap<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

pub async fn count_rows(store: &TheoriaStore, table: &str) -> i64 {
    let row = store
        .connection()
        .query_one_raw(sea_orm::Statement::from_string(
            store.connection().get_database_backend(),
            format!("SELECT COUNT(*) AS total FROM {table}"),
        ))
        .await
        .expect("count")
        .expect("row");
    row.try_get::<i64>("", "total").expect("total")
}
