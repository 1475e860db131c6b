use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tessera_core::AppResult;
use tokio::sync::Mutex;
use tessera_domain::{
    Accountability, CollectionSchema, FieldAllowList, FieldDefinition, FieldFunction,
    FieldSpecial, FieldType, Filter, PermissionAction, PermissionRule, Policy, Relation, Role, SchemaOverview,
};

use crate::query_plan::{LevelAccess, PlannedField, PlannedLevel};
use crate::{
    ColumnKind, CompiledStatement, DriverRow, PermissionCatalog, PermissionRepository,
    RelationalDriver, RelationalTransaction, SqlDialect, StatementExecutor,
};

/// Repository serving a fixed rule list.
pub(crate) struct StaticRules {
    pub(crate) rules: Vec<PermissionRule>,
}

#[async_trait]
impl PermissionRepository for StaticRules {
    async fn find_role(&self, _role_id: &str) -> AppResult<Option<Role>> {
        Ok(None)
    }

    /// Signed-in users hold every policy the rules mention.
    async fn list_policies_for_subject(
        &self,
        _roles: &[String],
        user: Option<&str>,
    ) -> AppResult<Vec<Policy>> {
        if user.is_none() {
            return Ok(Vec::new());
        }
        let mut ids = self
            .rules
            .iter()
            .map(|rule| rule.policy().to_owned())
            .collect::<Vec<_>>();
        ids.sort();
        ids.dedup();
        ids.into_iter().map(|id| Policy::new(id.clone(), id)).collect()
    }

    async fn list_permission_rules(
        &self,
        policies: &[String],
        collection: &str,
        action: PermissionAction,
    ) -> AppResult<Vec<PermissionRule>> {
        Ok(self
            .rules
            .iter()
            .filter(|rule| {
                policies.iter().any(|policy| policy == rule.policy())
                    && rule.collection() == collection
                    && rule.action() == action
            })
            .cloned()
            .collect())
    }
}

pub(crate) fn catalog(rules: Vec<PermissionRule>) -> PermissionCatalog {
    PermissionCatalog::new(Arc::new(StaticRules { rules }))
}

/// Editor `u-1` holding the `editors` policy.
pub(crate) fn editor() -> Accountability {
    Accountability::for_user("u-1", None).with_policies(vec!["editors".to_owned()])
}

pub(crate) fn admin() -> Accountability {
    Accountability::for_user("root", None).with_admin(true)
}

pub(crate) fn read(collection: &str, fields: &[&str]) -> PermissionRule {
    PermissionRule::new("editors", collection, PermissionAction::Read)
        .with_fields(FieldAllowList::from_fields(Some(fields.to_vec())))
}

pub(crate) fn read_where(collection: &str, fields: &[&str], filter: Value) -> PermissionRule {
    read(collection, fields).with_filter(parse_filter(filter))
}

pub(crate) fn parse_filter(value: Value) -> Filter {
    Filter::from_json(&value).unwrap_or_else(|_| unreachable!())
}

fn field(name: &str, field_type: FieldType) -> FieldDefinition {
    FieldDefinition::new(name, field_type).unwrap_or_else(|_| unreachable!())
}

fn collection(name: &str, fields: Vec<FieldDefinition>) -> CollectionSchema {
    CollectionSchema::new(name, "id", fields).unwrap_or_else(|_| unreachable!())
}

/// Authors with articles, polymorphic notes and a system user collection.
pub(crate) fn blog_schema() -> SchemaOverview {
    let collections = vec![
        collection(
            "authors",
            vec![
                field("id", FieldType::Integer),
                field("name", FieldType::String),
                field("email", FieldType::String),
                field("secret", FieldType::String).with_special(FieldSpecial::Conceal),
                field("articles", FieldType::Alias),
            ],
        ),
        collection(
            "articles",
            vec![
                field("id", FieldType::Integer),
                field("title", FieldType::String),
                field("body", FieldType::Text),
                field("status", FieldType::String),
                field("rating", FieldType::Float),
                field("published_on", FieldType::Date),
                field("author", FieldType::Integer),
                field("editor", FieldType::String),
            ],
        ),
        collection(
            "notes",
            vec![
                field("id", FieldType::Integer),
                field("text", FieldType::Text),
                field("item", FieldType::String),
                field("collection", FieldType::String),
            ],
        ),
        collection(
            "system_users",
            vec![
                field("id", FieldType::String),
                field("team", FieldType::String),
            ],
        )
        .with_system(true),
    ];
    let relations = vec![
        Relation::many_to_one("articles", "author", "authors", "id"),
        Relation::one_to_many("authors", "articles", "articles", "author"),
        Relation::many_to_one("articles", "editor", "system_users", "id"),
        Relation::any_to_one(
            "notes",
            "item",
            "collection",
            vec!["articles".to_owned(), "authors".to_owned()],
        ),
    ];

    SchemaOverview::new(collections, relations).unwrap_or_else(|_| unreachable!())
}

/// Unfiltered level keyed by an integer `id` with plain column outputs.
pub(crate) fn planned_level(collection: &str, fields: &[(&str, ColumnKind)]) -> PlannedLevel {
    PlannedLevel {
        collection: collection.to_owned(),
        primary_key: "id".to_owned(),
        primary_key_kind: ColumnKind::Integer,
        fields: fields
            .iter()
            .map(|(name, kind)| PlannedField::Column {
                output_key: (*name).to_owned(),
                field: (*name).to_owned(),
                kind: *kind,
                concealed: false,
            })
            .collect(),
        relations: Vec::new(),
        filter: None,
        sort: Vec::new(),
        limit: Some(100),
        offset: 0,
        access: LevelAccess::unrestricted(),
    }
}

/// Dialect with `?N` placeholders and `part(expr)` date functions.
#[derive(Debug)]
pub(crate) struct NumberedDialect;

impl SqlDialect for NumberedDialect {
    fn name(&self) -> &'static str {
        "numbered"
    }

    fn placeholder(&self, position: usize, _kind: Option<ColumnKind>) -> String {
        format!("?{position}")
    }

    fn date_part(&self, function: FieldFunction, expression: &str) -> String {
        format!("{}({expression})", function.as_str())
    }
}

type Script = Arc<dyn Fn(&CompiledStatement) -> AppResult<Vec<Vec<Value>>> + Send + Sync>;

/// Driver answering statements with positional rows from a script.
///
/// Rows are zipped with the statement's output columns. Executed SQL and
/// transaction boundaries are recorded in order.
pub(crate) struct ScriptedDriver {
    script: Script,
    log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedDriver {
    pub(crate) fn new(
        script: impl Fn(&CompiledStatement) -> AppResult<Vec<Vec<Value>>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Arc::new(script),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Everything recorded so far.
    pub(crate) async fn log(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }

    /// Executed statements only.
    pub(crate) async fn executed(&self) -> Vec<String> {
        self.log()
            .await
            .into_iter()
            .filter(|entry| entry.starts_with("SELECT"))
            .collect()
    }
}

async fn run_script(
    script: &Script,
    log: &Mutex<Vec<String>>,
    statement: &CompiledStatement,
) -> AppResult<Vec<DriverRow>> {
    log.lock().await.push(statement.sql.clone());
    let rows = script(statement)?;
    Ok(rows
        .into_iter()
        .map(|values| {
            statement
                .columns
                .iter()
                .map(|column| column.name.clone())
                .zip(values)
                .collect()
        })
        .collect())
}

#[async_trait]
impl StatementExecutor for ScriptedDriver {
    async fn execute(&self, statement: &CompiledStatement) -> AppResult<Vec<DriverRow>> {
        run_script(&self.script, &self.log, statement).await
    }
}

#[async_trait]
impl RelationalDriver for ScriptedDriver {
    fn dialect(&self) -> &dyn SqlDialect {
        &NumberedDialect
    }

    async fn begin_transaction(&self) -> AppResult<Box<dyn RelationalTransaction>> {
        self.log.lock().await.push("BEGIN".to_owned());
        Ok(Box::new(ScriptedTransaction {
            script: Arc::clone(&self.script),
            log: Arc::clone(&self.log),
        }))
    }
}

struct ScriptedTransaction {
    script: Script,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl StatementExecutor for ScriptedTransaction {
    async fn execute(&self, statement: &CompiledStatement) -> AppResult<Vec<DriverRow>> {
        run_script(&self.script, &self.log, statement).await
    }
}

#[async_trait]
impl RelationalTransaction for ScriptedTransaction {
    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.log.lock().await.push("COMMIT".to_owned());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        self.log.lock().await.push("ROLLBACK".to_owned());
        Ok(())
    }
}
