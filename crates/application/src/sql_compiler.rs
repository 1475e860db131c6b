use serde_json::Value;
use tessera_core::{AppError, AppResult};

use crate::query_plan::{PlannedField, PlannedLevel, RelationStrategy};
use crate::{ColumnKind, CompiledStatement, OutputColumn, SqlDialect, SqlValue};

mod filter;

/// Result-set alias of the foreign key in deferred statements.
pub const PARENT_COLUMN: &str = "__parent";

const ROW_NUMBER_COLUMN: &str = "__rn";

/// Statement for one level together with the columns that rebuild records.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledLevel {
    /// Parameterized statement.
    pub statement: CompiledStatement,
    /// Column layout of the level's records.
    pub layout: RecordLayout,
}

/// Where the parts of one record sit in a result row.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordLayout {
    /// Primary key column.
    pub key: String,
    /// Output fields.
    pub values: Vec<ValueColumn>,
    /// Access case flags, in case order.
    pub flags: Vec<String>,
    /// Relations joined into the same row.
    pub inline: Vec<InlineLayout>,
}

/// Output field column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueColumn {
    /// Key in the output row.
    pub output_key: String,
    /// Result-set column.
    pub column: String,
    /// Masks non-null values.
    pub concealed: bool,
}

/// Relation joined into the parent row.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineLayout {
    /// Output key of the relation.
    pub output_key: String,
    /// Joined columns.
    pub shape: InlineShape,
}

/// Joined relation columns.
#[derive(Debug, Clone, PartialEq)]
pub enum InlineShape {
    /// Many-to-one.
    Joined(RecordLayout),
    /// Any-to-one.
    Polymorphic {
        /// Raw foreign key column.
        key: String,
        /// Target collection column.
        collection: String,
        /// Layout per requested collection.
        branches: Vec<(String, RecordLayout)>,
    },
}

/// Compiles planned levels into parameterized SQL for one dialect.
#[derive(Clone, Copy)]
pub struct SqlCompiler<'d> {
    dialect: &'d dyn SqlDialect,
}

impl<'d> SqlCompiler<'d> {
    /// Creates a compiler.
    #[must_use]
    pub fn new(dialect: &'d dyn SqlDialect) -> Self {
        Self { dialect }
    }

    /// Compiles the root level with its joins, filter, order and page.
    pub fn compile_root(&self, level: &PlannedLevel) -> AppResult<CompiledLevel> {
        let mut builder = SqlBuilder::new(self.dialect);
        let alias = builder.alias("t");
        let layout = builder.select_level(level, &alias)?;

        let condition = match &level.filter {
            Some(filter) => Some(builder.filter(filter, &alias)?),
            None => None,
        };
        let order = builder.order_by(level, &alias)?;
        let limit = builder.bind(
            SqlValue::Integer(level.limit.map_or(i64::MAX, to_i64)),
            Some(ColumnKind::Integer),
        );
        let offset = builder.bind(SqlValue::Integer(to_i64(level.offset)), Some(ColumnKind::Integer));

        let mut sql = format!(
            "SELECT {} FROM {} AS {}{}",
            builder.select.join(", "),
            builder.quote(&level.collection),
            builder.quote(&alias),
            builder.joins.concat()
        );
        if let Some(condition) = condition {
            sql.push_str(" WHERE ");
            sql.push_str(&condition);
        }
        sql.push_str(&format!(" ORDER BY {order} LIMIT {limit} OFFSET {offset}"));

        Ok(builder.finish(sql, layout))
    }

    /// Compiles a deferred one-to-many level for a batch of parent keys.
    ///
    /// Per-parent offset and limit are applied with a row number window
    /// partitioned by the foreign key.
    pub fn compile_children(
        &self,
        level: &PlannedLevel,
        foreign_key: &str,
        foreign_key_kind: ColumnKind,
        parent_keys: &[Value],
    ) -> AppResult<CompiledLevel> {
        let mut builder = SqlBuilder::new(self.dialect);
        let alias = builder.alias("t");
        let layout = builder.select_level(level, &alias)?;

        let foreign_key_column = builder.column(&alias, foreign_key);
        builder.select_as(foreign_key_column.clone(), foreign_key_kind, PARENT_COLUMN);

        let keys = parent_keys
            .iter()
            .filter(|key| !key.is_null())
            .map(|key| builder.bind_literal(key, foreign_key_kind))
            .collect::<Vec<_>>();
        let mut conditions = vec![if keys.is_empty() {
            "1 = 0".to_owned()
        } else {
            format!("{foreign_key_column} IN ({})", keys.join(", "))
        }];
        if let Some(filter) = &level.filter {
            conditions.push(builder.filter(filter, &alias)?);
        }

        let order = builder.order_by(level, &alias)?;
        let lower = builder.bind(SqlValue::Integer(to_i64(level.offset)), Some(ColumnKind::Integer));
        let upper = level.limit.map(|limit| {
            builder.bind(
                SqlValue::Integer(to_i64(level.offset.saturating_add(limit))),
                Some(ColumnKind::Integer),
            )
        });

        let window = builder.alias("w");
        let window_alias = builder.quote(&window);
        let row_number = builder.column(&window, ROW_NUMBER_COLUMN);
        let parent = builder.column(&window, PARENT_COLUMN);
        let outer = builder
            .columns
            .iter()
            .map(|column| builder.column(&window, &column.name))
            .collect::<Vec<_>>()
            .join(", ");

        let mut page = format!("{row_number} > {lower}");
        if let Some(upper) = upper {
            page.push_str(&format!(" AND {row_number} <= {upper}"));
        }

        let sql = format!(
            "SELECT {outer} FROM (SELECT {}, ROW_NUMBER() OVER (PARTITION BY {foreign_key_column} ORDER BY {order}) AS {} FROM {} AS {}{} WHERE {}) AS {window_alias} WHERE {page} ORDER BY {parent}, {row_number}",
            builder.select.join(", "),
            builder.quote(ROW_NUMBER_COLUMN),
            builder.quote(&level.collection),
            builder.quote(&alias),
            builder.joins.concat(),
            conditions.join(" AND "),
        );

        Ok(builder.finish(sql, layout))
    }
}

struct SqlBuilder<'d> {
    dialect: &'d dyn SqlDialect,
    params: Vec<SqlValue>,
    columns: Vec<OutputColumn>,
    select: Vec<String>,
    joins: Vec<String>,
    aliases: usize,
}

impl<'d> SqlBuilder<'d> {
    fn new(dialect: &'d dyn SqlDialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
            columns: Vec::new(),
            select: Vec::new(),
            joins: Vec::new(),
            aliases: 0,
        }
    }

    fn finish(self, sql: String, layout: RecordLayout) -> CompiledLevel {
        CompiledLevel {
            statement: CompiledStatement {
                sql,
                params: self.params,
                columns: self.columns,
            },
            layout,
        }
    }

    fn alias(&mut self, prefix: &str) -> String {
        let alias = format!("{prefix}{}", self.aliases);
        self.aliases += 1;
        alias
    }

    fn quote(&self, identifier: &str) -> String {
        self.dialect.quote_identifier(identifier)
    }

    fn column(&self, alias: &str, field: &str) -> String {
        format!("{}.{}", self.quote(alias), self.quote(field))
    }

    fn bind(&mut self, value: SqlValue, kind: Option<ColumnKind>) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len(), kind)
    }

    fn bind_literal(&mut self, value: &Value, kind: ColumnKind) -> String {
        self.bind(coerce_literal(value, kind), Some(kind))
    }

    fn select(&mut self, expression: String, kind: ColumnKind) -> String {
        let name = format!("c{}", self.columns.len());
        self.select_as(expression, kind, &name);
        name
    }

    fn select_as(&mut self, expression: String, kind: ColumnKind, name: &str) {
        let rendered = self.dialect.select_column(&expression, kind);
        self.select
            .push(format!("{rendered} AS {}", self.quote(name)));
        self.columns.push(OutputColumn {
            name: name.to_owned(),
            kind,
        });
    }

    fn select_level(&mut self, level: &PlannedLevel, alias: &str) -> AppResult<RecordLayout> {
        let key = self.select(self.column(alias, &level.primary_key), level.primary_key_kind);

        let mut values = Vec::with_capacity(level.fields.len());
        for field in &level.fields {
            let (column, concealed) = match field {
                PlannedField::Column {
                    field,
                    kind,
                    concealed,
                    ..
                } => (self.select(self.column(alias, field), *kind), *concealed),
                PlannedField::Function {
                    function, field, ..
                } => {
                    let expression = self
                        .dialect
                        .date_part(*function, &self.column(alias, field));
                    (self.select(expression, ColumnKind::Integer), false)
                }
            };
            values.push(ValueColumn {
                output_key: field.output_key().to_owned(),
                column,
                concealed,
            });
        }

        let mut flags = Vec::with_capacity(level.access.cases.len());
        for case in &level.access.cases {
            let condition = self.filter(&case.filter, alias)?;
            flags.push(self.select(
                format!("CASE WHEN {condition} THEN 1 ELSE 0 END"),
                ColumnKind::Flag,
            ));
        }

        let mut inline = Vec::new();
        for relation in &level.relations {
            let shape = match &relation.strategy {
                RelationStrategy::Joined {
                    foreign_key,
                    level: related,
                } => InlineShape::Joined(self.join(related, alias, foreign_key)?),
                RelationStrategy::Polymorphic {
                    foreign_key,
                    collection_field,
                    branches,
                } => {
                    let raw_key = self.dialect.cast_to_text(&self.column(alias, foreign_key));
                    let key = self.select(raw_key, ColumnKind::Text);
                    let collection =
                        self.select(self.column(alias, collection_field), ColumnKind::Text);
                    let mut layouts = Vec::with_capacity(branches.len());
                    for branch in branches {
                        let layout = self.join_branch(
                            &branch.level,
                            alias,
                            foreign_key,
                            collection_field,
                        )?;
                        layouts.push((branch.collection.clone(), layout));
                    }
                    InlineShape::Polymorphic {
                        key,
                        collection,
                        branches: layouts,
                    }
                }
                RelationStrategy::Deferred { .. } => continue,
            };
            inline.push(InlineLayout {
                output_key: relation.output_key.clone(),
                shape,
            });
        }

        Ok(RecordLayout {
            key,
            values,
            flags,
            inline,
        })
    }

    fn join(
        &mut self,
        level: &PlannedLevel,
        parent: &str,
        foreign_key: &str,
    ) -> AppResult<RecordLayout> {
        let alias = self.alias("t");
        let condition = format!(
            "{} = {}",
            self.column(&alias, &level.primary_key),
            self.column(parent, foreign_key)
        );
        self.push_join(level, &alias, condition)?;
        self.select_level(level, &alias)
    }

    fn join_branch(
        &mut self,
        level: &PlannedLevel,
        parent: &str,
        foreign_key: &str,
        collection_field: &str,
    ) -> AppResult<RecordLayout> {
        let alias = self.alias("t");
        let collection = self.bind(
            SqlValue::Text(level.collection.clone()),
            Some(ColumnKind::Text),
        );
        let condition = format!(
            "{} = {collection} AND {} = {}",
            self.column(parent, collection_field),
            self.dialect.cast_to_text(&self.column(&alias, &level.primary_key)),
            self.dialect.cast_to_text(&self.column(parent, foreign_key)),
        );
        self.push_join(level, &alias, condition)?;
        self.select_level(level, &alias)
    }

    fn push_join(&mut self, level: &PlannedLevel, alias: &str, mut condition: String) -> AppResult<()> {
        if let Some(filter) = &level.filter {
            condition.push_str(" AND ");
            condition.push_str(&self.filter(filter, alias)?);
        }
        let join = format!(
            " LEFT JOIN {} AS {} ON {condition}",
            self.quote(&level.collection),
            self.quote(alias)
        );
        self.joins.push(join);
        Ok(())
    }

    fn order_by(&mut self, level: &PlannedLevel, alias: &str) -> AppResult<String> {
        let mut keys = Vec::with_capacity(level.sort.len() + 1);
        for sort in &level.sort {
            let column = self.column(alias, &sort.field);
            let expression = match &sort.visible_when {
                Some(filter) => {
                    let condition = self.filter(filter, alias)?;
                    format!("CASE WHEN {condition} THEN {column} END")
                }
                None => column,
            };
            keys.push(format!("{expression} {}", sort.direction.as_sql()));
        }
        if !level.sort.iter().any(|sort| sort.field == level.primary_key) {
            keys.push(format!("{} ASC", self.column(alias, &level.primary_key)));
        }
        Ok(keys.join(", "))
    }
}

/// Converts a JSON operand to a parameter of the column's kind.
fn coerce_literal(value: &Value, kind: ColumnKind) -> SqlValue {
    match (value, kind) {
        (Value::Null, _) => SqlValue::Null,
        (Value::Bool(flag), ColumnKind::Boolean | ColumnKind::Flag) => SqlValue::Bool(*flag),
        (Value::Bool(flag), ColumnKind::Integer | ColumnKind::Float) => {
            SqlValue::Integer(i64::from(*flag))
        }
        (Value::Number(number), ColumnKind::Integer) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Float(number.as_f64().unwrap_or_default()),
        },
        (Value::Number(number), ColumnKind::Float) => {
            SqlValue::Float(number.as_f64().unwrap_or_default())
        }
        (Value::Number(number), ColumnKind::Boolean) => {
            SqlValue::Bool(number.as_f64().is_some_and(|value| value != 0.0))
        }
        (Value::String(text), ColumnKind::Integer) => match text.trim().parse::<i64>() {
            Ok(integer) => SqlValue::Integer(integer),
            Err(_) => match text.trim().parse::<f64>() {
                Ok(float) => SqlValue::Float(float),
                Err(_) => SqlValue::Text(text.clone()),
            },
        },
        (Value::String(text), ColumnKind::Float) => match text.trim().parse::<f64>() {
            Ok(float) => SqlValue::Float(float),
            Err(_) => SqlValue::Text(text.clone()),
        },
        (Value::String(text), ColumnKind::Boolean) => match text.as_str() {
            "true" | "1" => SqlValue::Bool(true),
            "false" | "0" => SqlValue::Bool(false),
            _ => SqlValue::Text(text.clone()),
        },
        (Value::String(text), _) => SqlValue::Text(text.clone()),
        (Value::Array(_) | Value::Object(_), ColumnKind::Json) => SqlValue::Json(value.clone()),
        (other, _) => SqlValue::Text(other.to_string()),
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn literal_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for character in text.chars() {
        if matches!(character, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(character);
    }
    escaped
}

fn invalid_operand(operator: &str) -> AppError {
    AppError::Internal(format!(
        "operand of '{operator}' was not validated before compilation"
    ))
}
