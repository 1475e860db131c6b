//! Full read requests against an in-memory SQLite database.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tessera_application::{
    CompiledStatement, DriverRow, EngineConfig, PermissionCatalog, QueryEngine, RelationalDriver,
    RelationalTransaction, SqlDialect, StatementExecutor,
};
use tessera_core::{AppError, AppResult};
use tessera_domain::{
    Accountability, FieldAllowList, Filter, Limit, NestedNode, NodeQuery, PermissionAction,
    PermissionRule, Policy, QueryNode, QueryTree, Role, SortField,
};
use tokio::sync::Mutex;

use crate::{
    InMemoryPermissionRepository, PolicyAttachment, SqliteRelationalDriver, StaticSchemaProvider,
};

const PUBLISHED: [i64; 3] = [1, 3, 6];

fn schema_document() -> String {
    json!({
        "collections": [
            {
                "name": "authors",
                "primary_key": "id",
                "fields": [
                    {"name": "id", "field_type": "integer"},
                    {"name": "name", "field_type": "string"},
                    {"name": "articles", "field_type": "alias"}
                ]
            },
            {
                "name": "articles",
                "primary_key": "id",
                "fields": [
                    {"name": "id", "field_type": "integer"},
                    {"name": "title", "field_type": "string"},
                    {"name": "body", "field_type": "text"},
                    {"name": "status", "field_type": "string"},
                    {"name": "rating", "field_type": "float"},
                    {"name": "owner", "field_type": "string"},
                    {"name": "author", "field_type": "integer"}
                ]
            }
        ],
        "relations": [
            {
                "kind": "many_to_one",
                "collection": "articles",
                "field": "author",
                "related_collection": "authors",
                "related_field": "id"
            },
            {
                "kind": "one_to_many",
                "collection": "authors",
                "field": "articles",
                "related_collection": "articles",
                "related_field": "author"
            }
        ]
    })
    .to_string()
}

async fn seeded_pool() -> SqlitePool {
    let pool = match SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
    {
        Ok(pool) => pool,
        Err(error) => panic!("failed to open in-memory sqlite database: {error}"),
    };

    for statement in [
        r#"
        CREATE TABLE authors (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE articles (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            body TEXT,
            status TEXT NOT NULL,
            rating REAL,
            owner TEXT,
            author INTEGER REFERENCES authors (id)
        )
        "#,
        r#"
        INSERT INTO authors (id, name) VALUES (1, 'Ada'), (2, 'Grace')
        "#,
        r#"
        INSERT INTO articles (id, title, body, status, rating, owner, author)
        VALUES
            (1, 'Ada 1', 'body 1', 'published', 4.5, 'u-1', 1),
            (2, 'Ada 2', 'body 2', 'draft', 3.0, 'u-1', 1),
            (3, 'Ada 3', 'body 3', 'published', 2.0, 'u-2', 1),
            (4, 'Ada 4', 'body 4', 'draft', 5.0, 'u-2', 1),
            (5, 'Ada 5', 'body 5', 'draft', 1.0, 'u-2', 1),
            (6, 'Grace 1', 'body 6', 'published', 4.0, 'u-1', 2),
            (7, 'Grace 2', 'body 7', 'draft', 2.5, 'u-2', 2),
            (8, 'Grace 3', 'body 8', 'draft', 3.5, 'u-2', 2)
        "#,
    ] {
        let setup = sqlx::query(statement).execute(&pool).await;
        assert!(setup.is_ok());
    }

    pool
}

fn rule(collection: &str, fields: &[&str], filter: Option<Value>) -> PermissionRule {
    let rule = PermissionRule::new("editors", collection, PermissionAction::Read)
        .with_fields(FieldAllowList::from_fields(Some(fields.to_vec())));
    match filter {
        Some(filter) => rule.with_filter(parse_filter(&filter)),
        None => rule,
    }
}

fn parse_filter(filter: &Value) -> Filter {
    Filter::from_json(filter).unwrap_or_else(|_| unreachable!())
}

async fn editor_repository(rules: Vec<PermissionRule>) -> InMemoryPermissionRepository {
    let repository = InMemoryPermissionRepository::new();
    repository
        .save_role(Role::new("editor", None).unwrap_or_else(|_| unreachable!()))
        .await;
    repository
        .save_policy(Policy::new("editors", "Editors").unwrap_or_else(|_| unreachable!()))
        .await;
    repository
        .attach_policy(PolicyAttachment::Role("editor".to_owned()), "editors")
        .await;
    for rule in rules {
        repository.save_rule(rule).await;
    }
    repository
}

fn editor() -> Accountability {
    Accountability::for_user("u-9", Some("editor".to_owned()))
}

fn admin() -> Accountability {
    Accountability::for_user("root", None).with_admin(true)
}

fn engine(
    repository: InMemoryPermissionRepository,
    driver: Arc<dyn RelationalDriver>,
    config: EngineConfig,
) -> QueryEngine {
    let schema =
        StaticSchemaProvider::from_json(&schema_document()).unwrap_or_else(|_| unreachable!());
    QueryEngine::new(
        Arc::new(PermissionCatalog::new(Arc::new(repository))),
        Arc::new(schema),
        driver,
        config,
    )
}

async fn sqlite_engine(repository: InMemoryPermissionRepository) -> QueryEngine {
    let driver = SqliteRelationalDriver::new(seeded_pool().await);
    engine(repository, Arc::new(driver), EngineConfig::default())
}

fn articles(fields: &[&str]) -> QueryTree {
    QueryTree::new(
        "articles",
        fields.iter().copied().map(QueryNode::field).collect(),
    )
}

fn filtered(filter: Value) -> NodeQuery {
    NodeQuery {
        filter: Some(parse_filter(&filter)),
        ..NodeQuery::default()
    }
}

fn ids(items: &[Value]) -> Vec<i64> {
    items
        .iter()
        .filter_map(|item| item.get("id").and_then(Value::as_i64))
        .collect()
}

#[tokio::test]
async fn published_articles_expose_only_granted_fields() {
    let repository = editor_repository(vec![rule(
        "articles",
        &["id", "title"],
        Some(json!({"status": {"_eq": "published"}})),
    )])
    .await;
    let engine = sqlite_engine(repository).await;

    let result = engine
        .run_query(
            &articles(&["id", "title", "body"]).with_query(filtered(json!({}))),
            &editor(),
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(
        result.items,
        vec![
            json!({"id": 1, "title": "Ada 1"}),
            json!({"id": 3, "title": "Ada 3"}),
            json!({"id": 6, "title": "Grace 1"}),
        ]
    );
}

#[tokio::test]
async fn nested_articles_are_limited_to_readable_rows() {
    let repository = editor_repository(vec![
        rule("authors", &["id", "name", "articles"], None),
        rule(
            "articles",
            &["id", "title"],
            Some(json!({"status": {"_eq": "published"}})),
        ),
    ])
    .await;
    let engine = sqlite_engine(repository).await;
    let tree = QueryTree::new(
        "authors",
        vec![
            QueryNode::field("name"),
            QueryNode::OneToMany(NestedNode {
                field: "articles".to_owned(),
                alias: None,
                children: vec![QueryNode::field("title")],
                query: NodeQuery::default(),
            }),
        ],
    )
    .with_query(filtered(json!({"id": {"_eq": 1}})));

    let result = engine
        .run_query(&tree, &editor())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(
        result.items,
        vec![json!({
            "name": "Ada",
            "articles": [{"title": "Ada 1"}, {"title": "Ada 3"}]
        })]
    );
}

#[tokio::test]
async fn current_user_rules_match_owned_rows_and_nothing_for_anonymous_callers() {
    let repository = InMemoryPermissionRepository::new();
    repository
        .save_policy(Policy::new("owners", "Owners").unwrap_or_else(|_| unreachable!()))
        .await;
    repository
        .attach_policy(PolicyAttachment::User("u-1".to_owned()), "owners")
        .await;
    repository
        .attach_policy(PolicyAttachment::Public, "owners")
        .await;
    repository
        .save_rule(
            PermissionRule::new("owners", "articles", PermissionAction::Read)
                .with_fields(FieldAllowList::from_fields(Some(["id", "title"])))
                .with_filter(parse_filter(&json!({"owner": {"_eq": "$CURRENT_USER"}}))),
        )
        .await;
    let engine = sqlite_engine(repository).await;

    let owned = engine
        .run_query(&articles(&["id"]), &Accountability::for_user("u-1", None))
        .await
        .unwrap_or_else(|_| unreachable!());
    let anonymous = engine
        .run_query(&articles(&["id"]), &Accountability::anonymous())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(ids(&owned.items), vec![1, 2, 6]);
    assert!(anonymous.items.is_empty());
}

#[tokio::test]
async fn rows_carry_only_fields_of_the_rules_they_satisfy() {
    let repository = editor_repository(vec![
        rule(
            "articles",
            &["id", "title"],
            Some(json!({"status": {"_eq": "published"}})),
        ),
        rule(
            "articles",
            &["id", "body"],
            Some(json!({"status": {"_eq": "draft"}})),
        ),
    ])
    .await;
    let engine = sqlite_engine(repository).await;

    let result = engine
        .run_query(&articles(&["id", "title", "body"]), &editor())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(result.items.len(), 8);
    for item in &result.items {
        let Some(id) = item.get("id").and_then(Value::as_i64) else {
            panic!("every row should carry its id");
        };
        if PUBLISHED.contains(&id) {
            assert!(item.get("title").is_some());
            assert!(item.get("body").is_none());
        } else {
            assert!(item.get("title").is_none());
            assert!(item.get("body").is_some());
        }
    }
}

struct CountingDriver {
    inner: SqliteRelationalDriver,
    fetched: Mutex<Vec<usize>>,
}

#[async_trait]
impl StatementExecutor for CountingDriver {
    async fn execute(&self, statement: &CompiledStatement) -> AppResult<Vec<DriverRow>> {
        let rows = self.inner.execute(statement).await?;
        self.fetched.lock().await.push(rows.len());
        Ok(rows)
    }
}

#[async_trait]
impl RelationalDriver for CountingDriver {
    fn dialect(&self) -> &dyn SqlDialect {
        self.inner.dialect()
    }

    async fn begin_transaction(&self) -> AppResult<Box<dyn RelationalTransaction>> {
        self.inner.begin_transaction().await
    }
}

#[tokio::test]
async fn child_rows_are_bounded_by_parents_times_limit() {
    let driver = Arc::new(CountingDriver {
        inner: SqliteRelationalDriver::new(seeded_pool().await),
        fetched: Mutex::new(Vec::new()),
    });
    let engine = engine(
        InMemoryPermissionRepository::new(),
        Arc::clone(&driver) as Arc<dyn RelationalDriver>,
        EngineConfig::default(),
    );
    let tree = QueryTree::new(
        "authors",
        vec![
            QueryNode::field("id"),
            QueryNode::OneToMany(NestedNode {
                field: "articles".to_owned(),
                alias: None,
                children: vec![QueryNode::field("id")],
                query: NodeQuery {
                    limit: Some(Limit::Rows(2)),
                    ..NodeQuery::default()
                },
            }),
        ],
    );

    let result = engine
        .run_query(&tree, &admin())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(
        result.items,
        vec![
            json!({"id": 1, "articles": [{"id": 1}, {"id": 2}]}),
            json!({"id": 2, "articles": [{"id": 6}, {"id": 7}]}),
        ]
    );
    assert_eq!(*driver.fetched.lock().await, vec![2, 4]);
}

#[tokio::test]
async fn relations_used_only_in_filters_respect_related_permissions() {
    let repository = editor_repository(vec![
        rule(
            "authors",
            &["id", "name"],
            Some(json!({"name": {"_neq": "Grace"}})),
        ),
        rule("articles", &["id", "title", "author"], None),
    ])
    .await;
    let engine = sqlite_engine(repository).await;
    let by_author = |name: &str| {
        articles(&["id"]).with_query(filtered(json!({"author": {"name": {"_eq": name}}})))
    };

    let visible = engine
        .run_query(&by_author("Ada"), &editor())
        .await
        .unwrap_or_else(|_| unreachable!());
    let hidden = engine
        .run_query(&by_author("Grace"), &editor())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(ids(&visible.items), vec![1, 2, 3, 4, 5]);
    assert!(hidden.items.is_empty());
}

#[tokio::test]
async fn filtering_through_an_unreadable_relation_is_forbidden() {
    let repository =
        editor_repository(vec![rule("articles", &["id", "title", "author"], None)]).await;
    let engine = sqlite_engine(repository).await;

    let result = engine
        .run_query(
            &articles(&["id"]).with_query(filtered(json!({"author": {"name": {"_eq": "Ada"}}}))),
            &editor(),
        )
        .await;

    assert!(matches!(result, Err(AppError::Forbidden(_))));
}

#[tokio::test]
async fn foreign_keys_only_reveal_readable_related_rows() {
    let repository = editor_repository(vec![
        rule("authors", &["id"], Some(json!({"name": {"_eq": "Ada"}}))),
        rule("articles", &["id", "author"], None),
    ])
    .await;
    let engine = sqlite_engine(repository).await;

    let result = engine
        .run_query(
            &articles(&["id", "author"]).with_query(filtered(json!({"id": {"_in": [1, 6]}}))),
            &editor(),
        )
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(
        result.items,
        vec![
            json!({"id": 1, "author": 1}),
            json!({"id": 6, "author": null}),
        ]
    );
}

#[tokio::test]
async fn foreign_keys_are_null_without_related_rules() {
    let repository = editor_repository(vec![rule("articles", &["id", "author"], None)]).await;
    let engine = sqlite_engine(repository).await;

    let result = engine
        .run_query(&articles(&["id", "author"]), &editor())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(result.items.len(), 8);
    assert!(result.items.iter().all(|item| item.get("author") == Some(&Value::Null)));
}

#[tokio::test]
async fn caller_filters_only_see_fields_granted_on_each_row() {
    let repository = editor_repository(vec![
        rule(
            "articles",
            &["id", "title"],
            Some(json!({"status": {"_eq": "published"}})),
        ),
        rule(
            "articles",
            &["id", "body"],
            Some(json!({"status": {"_eq": "draft"}})),
        ),
    ])
    .await;
    let engine = sqlite_engine(repository).await;
    let by_body =
        |body: &str| articles(&["id"]).with_query(filtered(json!({"body": {"_eq": body}})));

    let published = engine
        .run_query(&by_body("body 1"), &editor())
        .await
        .unwrap_or_else(|_| unreachable!());
    let draft = engine
        .run_query(&by_body("body 2"), &editor())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert!(published.items.is_empty());
    assert_eq!(ids(&draft.items), vec![2]);
}

#[tokio::test]
async fn sorting_by_a_field_hidden_on_some_rows_orders_them_as_null() {
    let repository = editor_repository(vec![
        rule(
            "articles",
            &["id", "rating"],
            Some(json!({"status": {"_eq": "published"}})),
        ),
        rule(
            "articles",
            &["id"],
            Some(json!({"status": {"_eq": "draft"}})),
        ),
    ])
    .await;
    let engine = sqlite_engine(repository).await;
    let tree = articles(&["id"]).with_query(NodeQuery {
        sort: vec![SortField::parse_transport("-rating").unwrap_or_else(|_| unreachable!())],
        ..NodeQuery::default()
    });

    let result = engine
        .run_query(&tree, &editor())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(ids(&result.items), vec![1, 6, 3, 2, 4, 5, 7, 8]);
}

#[tokio::test]
async fn foreign_key_conditions_do_not_reveal_hidden_links() {
    let repository = editor_repository(vec![
        rule("authors", &["id"], Some(json!({"name": {"_eq": "Ada"}}))),
        rule("articles", &["id", "author"], None),
    ])
    .await;
    let engine = sqlite_engine(repository).await;
    let by_author = |author: i64| {
        articles(&["id", "author"]).with_query(filtered(json!({"author": {"_eq": author}})))
    };

    let readable = engine
        .run_query(&by_author(1), &editor())
        .await
        .unwrap_or_else(|_| unreachable!());
    let hidden = engine
        .run_query(&by_author(2), &editor())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(ids(&readable.items), vec![1, 2, 3, 4, 5]);
    assert!(hidden.items.is_empty());
}

fn authors_with(children: NodeQuery) -> QueryTree {
    QueryTree::new(
        "authors",
        vec![
            QueryNode::field("id"),
            QueryNode::OneToMany(NestedNode {
                field: "articles".to_owned(),
                alias: None,
                children: vec![QueryNode::field("id")],
                query: children,
            }),
        ],
    )
}

async fn single_row_engine() -> QueryEngine {
    let driver = SqliteRelationalDriver::new(seeded_pool().await);
    engine(
        InMemoryPermissionRepository::new(),
        Arc::new(driver),
        EngineConfig {
            default_limit: 1,
            ..EngineConfig::default()
        },
    )
}

#[tokio::test]
async fn unlimited_nested_levels_return_every_child() {
    let engine = single_row_engine().await;
    let unlimited = authors_with(NodeQuery {
        limit: Some(Limit::Unlimited),
        ..NodeQuery::default()
    })
    .with_query(NodeQuery {
        limit: Some(Limit::Unlimited),
        ..NodeQuery::default()
    });
    let keys = QueryTree::new(
        "authors",
        vec![QueryNode::field("id"), QueryNode::field("articles")],
    )
    .with_query(filtered(json!({"id": {"_eq": 1}})));

    let nested = engine
        .run_query(&unlimited, &admin())
        .await
        .unwrap_or_else(|_| unreachable!());
    let listed = engine
        .run_query(&keys, &admin())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(
        nested.items,
        vec![
            json!({"id": 1, "articles": [{"id": 1}, {"id": 2}, {"id": 3}, {"id": 4}, {"id": 5}]}),
            json!({"id": 2, "articles": [{"id": 6}, {"id": 7}, {"id": 8}]}),
        ]
    );
    assert_eq!(listed.items, vec![json!({"id": 1, "articles": [1, 2, 3, 4, 5]})]);
}

#[tokio::test]
async fn nested_pages_skip_whole_limits_per_parent() {
    let engine = single_row_engine().await;
    let tree = authors_with(NodeQuery {
        limit: Some(Limit::Rows(2)),
        page: Some(2),
        ..NodeQuery::default()
    })
    .with_query(NodeQuery {
        limit: Some(Limit::Rows(2)),
        ..NodeQuery::default()
    });

    let result = engine
        .run_query(&tree, &admin())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(
        result.items,
        vec![
            json!({"id": 1, "articles": [{"id": 3}, {"id": 4}]}),
            json!({"id": 2, "articles": [{"id": 8}]}),
        ]
    );
}

#[tokio::test]
async fn snapshot_reads_return_the_same_rows() {
    let repository = editor_repository(vec![rule(
        "articles",
        &["id"],
        Some(json!({"status": {"_eq": "published"}})),
    )])
    .await;
    let driver = SqliteRelationalDriver::new(seeded_pool().await);
    let engine = engine(
        repository,
        Arc::new(driver),
        EngineConfig {
            snapshot_consistency: true,
            ..EngineConfig::default()
        },
    );

    let result = engine
        .run_query(&articles(&["id"]), &editor())
        .await
        .unwrap_or_else(|_| unreachable!());

    assert_eq!(ids(&result.items), PUBLISHED.to_vec());
}

fn caller_filter() -> impl Strategy<Value = serde_json::Value> {
    let leaf = prop_oneof![
        prop_oneof![Just("published"), Just("draft"), Just("archived")]
            .prop_map(|status| json!({"status": {"_eq": status}})),
        prop_oneof![Just("published"), Just("draft")]
            .prop_map(|status| json!({"status": {"_neq": status}})),
        (0_u8..=10).prop_map(|rating| json!({"rating": {"_gte": f64::from(rating) / 2.0}})),
        (1_i64..=8).prop_map(|id| json!({"id": {"_neq": id}})),
    ];
    leaf.prop_recursive(2, 8, 3, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 1..3)
                .prop_map(|filters| json!({"_or": filters})),
            proptest::collection::vec(inner, 1..3).prop_map(|filters| json!({"_and": filters})),
        ]
    })
}

async fn published_only_ids(filter: Value) -> Vec<Value> {
    let repository = editor_repository(vec![rule(
        "articles",
        &["id", "status", "rating"],
        Some(json!({"status": {"_eq": "published"}})),
    )])
    .await;
    let engine = sqlite_engine(repository).await;

    engine
        .run_query(
            &articles(&["id", "status"]).with_query(filtered(filter)),
            &editor(),
        )
        .await
        .unwrap_or_else(|_| unreachable!())
        .items
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn caller_filters_never_widen_the_permission_filter(filter in caller_filter()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap_or_else(|_| unreachable!());
        let items = runtime.block_on(published_only_ids(filter));

        let published: BTreeSet<i64> = PUBLISHED.into_iter().collect();
        for item in &items {
            prop_assert_eq!(item.get("status"), Some(&json!("published")));
            let id = item.get("id").and_then(Value::as_i64);
            prop_assert!(id.is_some_and(|id| published.contains(&id)));
        }
    }
}
